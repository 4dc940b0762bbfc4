//! # heliflash
//!
//! A host-side programmer for CAN-bus bootloader firmware flashing.
//!
//! This crate drives a proprietary CAN-level bootloader protocol against
//! embedded control units (ECUs): discovering which units are in
//! bootloader mode, negotiating a flashing transaction, erasing and
//! writing flash pages, and handing control back to the new firmware.
//! It provides:
//!
//! - Intel-HEX firmware loading ([`hex`])
//! - a bit-packed CAN message codec ([`codec`])
//! - a typed façade over the CAN symbol dictionary ([`dictionary`])
//! - a bus listener maintaining a live view of every ECU ([`listener`])
//! - the flashing protocol engine itself ([`engine`])
//! - an abstract Frame Transport, plus a serial-line binding ([`transport`])
//!
//! ## Supported Platforms
//!
//! - **Native** (default): Linux, macOS, Windows via the `serialport` crate
//!
//! ## Cancellation Model
//!
//! Long-running operations (locating a target, streaming a flash image)
//! can be cancelled via the [`CancelContext`] mechanism. This allows the
//! embedding application (e.g. the CLI) to signal interruption (e.g.
//! Ctrl-C) and have the operation stop gracefully.
//!
//! ### Quick Start
//!
//! ```ignore
//! use heliflash::{CancelContext, cancel_context_from_global};
//!
//! // Option 1: use the global interrupt flag (set by the CLI on Ctrl-C)
//! let cancel = cancel_context_from_global();
//!
//! // Option 2: a custom cancel context
//! use std::sync::atomic::{AtomicBool, Ordering};
//! let flag = AtomicBool::new(false);
//! let cancel = CancelContext::new(move || flag.load(Ordering::SeqCst));
//!
//! // Option 3: no cancellation (always returns "not cancelled")
//! let cancel = CancelContext::none();
//! ```
//!
//! ## Features
//!
//! - `native` (default): native serial port support, via [`transport::SerialFrameTransport`]

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub mod codec;
pub mod dictionary;
pub mod engine;
pub mod error;
pub mod hex;
pub mod listener;
pub mod transport;
pub mod types;

/// Global interrupt flag for CLI-to-library communication.
///
/// This is set by the CLI when Ctrl-C is received, and checked by
/// [`cancel_context_from_global`] during long-running operations.
static INTERRUPT_FLAG: AtomicBool = AtomicBool::new(false);

/// Explicit cancellation context for long-running library operations.
///
/// Unlike the global interrupt checker, this is explicitly passed through
/// the call chain, making it testable and composable. The Protocol
/// Engine checks it at each state transition in its `run_flash` loop, and
/// it is the single cooperative cancel path for an engine instance that
/// would otherwise busy-wait on a patient peer indefinitely.
#[derive(Clone, Default)]
pub struct CancelContext {
    checker: Option<Arc<dyn Fn() -> bool + Send + Sync>>,
}

impl CancelContext {
    /// Create a new cancel context with the given checker function.
    #[must_use]
    pub fn new<F>(checker: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        Self { checker: Some(Arc::new(checker)) }
    }

    /// Create a no-op cancel context (always returns "not cancelled").
    #[must_use]
    pub fn none() -> Self {
        Self { checker: None }
    }

    /// Returns true if cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.checker.as_ref().is_some_and(|c| c())
    }

    /// Check and return an Interrupted error if cancelled.
    pub fn check(&self) -> crate::Result<()> {
        if self.is_cancelled() {
            return Err(crate::Error::Io(std::io::Error::new(std::io::ErrorKind::Interrupted, "operation cancelled")));
        }
        Ok(())
    }
}

/// Bridge from a global interrupt checker to a `CancelContext`.
impl From<fn() -> bool> for CancelContext {
    fn from(checker: fn() -> bool) -> Self {
        Self::new(checker)
    }
}

/// Create a `CancelContext` that bridges to the global interrupt flag.
///
/// Used by the CLI to hand the engine a cancel path wired up to its
/// Ctrl-C handler without threading a flag through every call site.
#[must_use]
pub fn cancel_context_from_global() -> CancelContext {
    CancelContext::new(|| INTERRUPT_FLAG.load(Ordering::SeqCst))
}

/// Set the global interrupt flag (for the CLI to call on Ctrl-C).
pub fn set_interrupt_flag() {
    INTERRUPT_FLAG.store(true, Ordering::SeqCst);
}

/// Clear the global interrupt flag.
pub fn clear_interrupt_flag() {
    INTERRUPT_FLAG.store(false, Ordering::SeqCst);
}

/// Returns whether interruption was requested.
#[must_use]
pub fn is_interrupted_requested() -> bool {
    INTERRUPT_FLAG.load(Ordering::SeqCst)
}

#[cfg(test)]
pub(crate) fn test_set_interrupted(value: bool) {
    INTERRUPT_FLAG.store(value, Ordering::SeqCst);
}

pub use dictionary::{Dictionary, MessageId, ResolvedMessage};
pub use engine::{ProtocolEngine, TransactionKind};
pub use error::{Error, Result};
pub use listener::{Listener, ListenerEvent};
#[cfg(feature = "native")]
pub use transport::SerialFrameTransport;
pub use transport::{AdapterEvent, BitrateSetting, CanFrame, FrameTransport, IdKind};
pub use types::{
    ApplicationData, BootState, Command, EntryReason, Firmware, HandshakeResponse, MemoryBlock, Register, Target,
    TargetBootloaderData, TargetSoftwareBuild, WriteResult, TRANSACTION_MAGIC,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupt_checker_default_false() {
        test_set_interrupted(false);
        assert!(!is_interrupted_requested());
    }

    #[test]
    fn test_interrupt_checker_toggle_true_false() {
        test_set_interrupted(true);
        assert!(is_interrupted_requested());

        test_set_interrupted(false);
        assert!(!is_interrupted_requested());
    }

    #[test]
    fn cancel_context_none_never_cancels() {
        let cancel = CancelContext::none();
        assert!(!cancel.is_cancelled());
        assert!(cancel.check().is_ok());
    }

    #[test]
    fn cancel_context_reports_cancellation() {
        let cancel = CancelContext::new(|| true);
        assert!(cancel.is_cancelled());
        assert!(cancel.check().is_err());
    }
}
