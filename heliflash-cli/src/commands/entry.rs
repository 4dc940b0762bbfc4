//! `enter` and `exit`: request bootloader entry or exit without running a
//! flashing transaction.

use std::sync::{Arc, Mutex};

use console::style;
use heliflash::{CancelContext, Dictionary, Listener, ProtocolEngine, Result, SerialFrameTransport};

use super::parse_target;

pub(crate) fn enter(
    transport: Arc<Mutex<SerialFrameTransport>>,
    dictionary: Arc<Dictionary>,
    listener: Arc<Listener>,
    cancel: CancelContext,
    unit: &str,
    force: bool,
    quiet: bool,
) -> Result<()> {
    let target = parse_target(unit)?;
    listener.pause();
    let mut engine = ProtocolEngine::new(transport, dictionary, listener.clone(), target, force, cancel);
    let result = engine.enter_bootloader();
    listener.resume();
    result?;

    if !quiet {
        eprintln!("{} {target} in bootloader", style("done").green());
    }
    Ok(())
}

pub(crate) fn exit(
    transport: Arc<Mutex<SerialFrameTransport>>,
    dictionary: Arc<Dictionary>,
    listener: Arc<Listener>,
    cancel: CancelContext,
    unit: &str,
    force: bool,
    quiet: bool,
) -> Result<()> {
    let target = parse_target(unit)?;
    listener.pause();
    let mut engine = ProtocolEngine::new(transport, dictionary, listener.clone(), target, force, cancel);
    let result = engine.exit_bootloader();
    listener.resume();
    result?;

    if !quiet {
        eprintln!("{} {target} returned to application", style("done").green());
    }
    Ok(())
}
