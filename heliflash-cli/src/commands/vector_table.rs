//! `set-vector-table`: point the bootloader's vector table register at a
//! given address without running a full flash transaction.

use std::sync::{Arc, Mutex};

use console::style;
use heliflash::{CancelContext, Dictionary, Listener, ProtocolEngine, Result, SerialFrameTransport};

use super::{parse_address, parse_target};

pub(crate) fn run(
    transport: Arc<Mutex<SerialFrameTransport>>,
    dictionary: Arc<Dictionary>,
    listener: Arc<Listener>,
    cancel: CancelContext,
    unit: &str,
    address: &str,
    force: bool,
    quiet: bool,
) -> Result<()> {
    let target = parse_target(unit)?;
    let address = parse_address(address)?;

    listener.pause();
    let mut engine = ProtocolEngine::new(transport, dictionary, listener.clone(), target, force, cancel);
    let result = engine.run_set_vector_table(address);
    listener.resume();
    result?;

    if !quiet {
        eprintln!("{} {target} vector table set to {address:#010x}", style("done").green());
    }
    Ok(())
}
