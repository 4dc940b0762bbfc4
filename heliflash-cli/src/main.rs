//! heliflash CLI - command-line driver for the CAN-bus bootloader
//! flashing protocol engine.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};

use clap::{Parser, Subcommand};
use env_logger::Env;
use heliflash::{Dictionary, Error, Listener, SerialFrameTransport, TransactionKind};
use log::error;

mod commands;

/// heliflash - a host-side programmer for CAN-bus bootloader firmware
/// flashing.
#[derive(Parser)]
#[command(name = "heliflash")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Adapter device to open (serial path, e.g. /dev/ttyUSB0).
    #[arg(env = "HELIFLASH_DEVICE")]
    transport_device: String,

    /// canDB dictionary JSON path. Repeatable; later files override
    /// earlier ones where symbol names collide.
    #[arg(short = 'j', long = "json", required = true, env = "HELIFLASH_JSON")]
    json: Vec<PathBuf>,

    /// Optional terminal UI mirror path. Accepted for compatibility and
    /// otherwise ignored.
    #[arg(short = 't', long = "terminal")]
    terminal: Option<PathBuf>,

    /// Reclaim a target stuck in a non-`Ready` bootloader state instead
    /// of refusing to proceed.
    #[arg(long)]
    force: bool,

    /// Suppress informational output; errors still print.
    #[arg(short, long)]
    quiet: bool,

    /// Verbose output level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

/// Available subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Enumerate targets currently observed on the bus.
    List,
    /// Flash application firmware onto a target.
    Flash {
        /// Target unit name (AMS, PDL, STW, DRTF).
        #[arg(short, long)]
        unit: String,
        /// Path to the Intel-HEX firmware image.
        #[arg(short = 'x', long)]
        hex: PathBuf,
    },
    /// Flash a new bootloader image onto a target.
    UpdateBootloader {
        /// Target unit name (AMS, PDL, STW, DRTF).
        #[arg(short, long)]
        unit: String,
        /// Path to the Intel-HEX bootloader image.
        #[arg(short = 'x', long)]
        hex: PathBuf,
    },
    /// Point a target's bootloader vector table at an address.
    SetVectorTable {
        /// Target unit name (AMS, PDL, STW, DRTF).
        #[arg(short, long)]
        unit: String,
        /// Address, as `0x`-prefixed hex or decimal.
        #[arg(long)]
        address: String,
    },
    /// Request bootloader entry on a target.
    Enter {
        /// Target unit name (AMS, PDL, STW, DRTF).
        #[arg(short, long)]
        unit: String,
    },
    /// Request a target exit bootloader mode back to application firmware.
    Exit {
        /// Target unit name (AMS, PDL, STW, DRTF).
        #[arg(short, long)]
        unit: String,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_level = match (cli.quiet, cli.verbose) {
        (true, _) => "error",
        (false, 0) => "info",
        (false, 1) => "debug",
        (false, _) => "trace",
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level)).init();

    ctrlc::set_handler(heliflash::set_interrupt_flag).expect("failed to install Ctrl-C handler");

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            exit_code_for(&err)
        },
    }
}

/// Maps the error taxonomy to the documented exit codes: 1 for user
/// error (bad arguments, a refusing or busy peer), 3 for a protocol or
/// handshake failure, 0 on success.
fn exit_code_for(err: &Error) -> ExitCode {
    match err {
        Error::ProtocolTimeout(_) | Error::TransactionAborted | Error::CommandRejected(_) => ExitCode::from(3),
        _ => ExitCode::from(1),
    }
}

fn run(cli: &Cli) -> heliflash::Result<()> {
    if cli.terminal.is_some() {
        log::debug!("terminal mirror path accepted but not implemented");
    }

    let dictionary = Arc::new(Dictionary::load(&cli.json)?);
    let transport = Arc::new(Mutex::new(SerialFrameTransport::open(&cli.transport_device)?));
    let listener = Arc::new(Listener::new(dictionary.clone()));
    listener.spawn_ping_cycler(transport.clone());

    let cancel = heliflash::cancel_context_from_global();

    match &cli.command {
        Commands::List => commands::list::run(&transport, &listener, cli.quiet),
        Commands::Flash { unit, hex } => commands::flash::run(
            transport,
            dictionary,
            listener,
            cancel,
            unit,
            hex,
            cli.force,
            cli.quiet,
            TransactionKind::FlashApplication,
        ),
        Commands::UpdateBootloader { unit, hex } => commands::flash::run(
            transport,
            dictionary,
            listener,
            cancel,
            unit,
            hex,
            cli.force,
            cli.quiet,
            TransactionKind::UpdateBootloader,
        ),
        Commands::SetVectorTable { unit, address } => {
            commands::vector_table::run(transport, dictionary, listener, cancel, unit, address, cli.force, cli.quiet)
        },
        Commands::Enter { unit } => {
            commands::entry::enter(transport, dictionary, listener, cancel, unit, cli.force, cli.quiet)
        },
        Commands::Exit { unit } => {
            commands::entry::exit(transport, dictionary, listener, cancel, unit, cli.force, cli.quiet)
        },
    }
}
