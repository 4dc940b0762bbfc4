//! `flash` and `update-bootloader`: run a full flashing transaction
//! against one target.

use std::path::Path;
use std::sync::{Arc, Mutex};

use console::style;
use heliflash::{CancelContext, Dictionary, Listener, ProtocolEngine, Result, SerialFrameTransport, TransactionKind};
use indicatif::{ProgressBar, ProgressStyle};

use super::parse_target;

#[allow(clippy::too_many_arguments)]
pub(crate) fn run(
    transport: Arc<Mutex<SerialFrameTransport>>,
    dictionary: Arc<Dictionary>,
    listener: Arc<Listener>,
    cancel: CancelContext,
    unit: &str,
    hex_path: &Path,
    force: bool,
    quiet: bool,
    kind: TransactionKind,
) -> Result<()> {
    let target = parse_target(unit)?;
    let text = std::fs::read_to_string(hex_path)?;
    let firmware = heliflash::hex::load(&text)?;

    if !quiet {
        eprintln!(
            "{} {} loaded: {} bytes, entry {:#010x}",
            style("loaded").cyan(),
            hex_path.display(),
            firmware.length,
            firmware.entry_point
        );
    }

    let pb = if quiet {
        ProgressBar::hidden()
    } else {
        let pb = ProgressBar::new(u64::from(firmware.length));
        pb.set_style(
            ProgressStyle::with_template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                .expect("progress template is valid")
                .progress_chars("=> "),
        );
        pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
        pb
    };

    listener.pause();
    let mut engine = ProtocolEngine::new(transport, dictionary, listener.clone(), target, force, cancel);
    let result = engine.run_flash(&firmware, kind, &mut |phase, current, total| {
        pb.set_message(phase.to_string());
        if total > 0 {
            pb.set_length(total);
            pb.set_position(current);
        }
    });
    listener.resume();
    result?;
    pb.finish_with_message("done");

    if !quiet {
        eprintln!("{} {target} flashed", style("done").green());
    }
    Ok(())
}
