//! Error types for heliflash.

use thiserror::Error;

/// Result type for heliflash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for heliflash operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The adapter device is unreachable, or frame-sync with it was lost.
    /// Fatal at start; unrecoverable mid-transaction.
    #[error("transport error: {0}")]
    Transport(String),

    /// I/O error underlying a transport binding (serial port, file).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serial port error from the concrete Frame Transport binding.
    #[cfg(feature = "native")]
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Malformed CAN payload: bad multiplex selector, or a value outside
    /// its declared range where range is strictly required.
    #[error("codec error: {0}")]
    Codec(String),

    /// Malformed Intel-HEX input: bad checksum, missing/duplicate EOF,
    /// missing entry point, or a record with an inconsistent length.
    #[error("hex error: {0}")]
    Hex(String),

    /// A logical memory block is not covered by any physical flash page
    /// reported by the bootloader.
    #[error("coverage gap: logical block at {address:#010x} is not covered by any physical page")]
    CoverageGap {
        /// Address of the uncovered logical block.
        address: u32,
    },

    /// Five handshake/ack retries were exhausted without a matching reply.
    #[error("protocol timeout waiting for {0}")]
    ProtocolTimeout(String),

    /// The peer declined an entry or exit request.
    #[error("peer refused: {0}")]
    PeerRefused(String),

    /// The peer returned a non-`OK` response to a `StartTransactionFlashing`/
    /// `StartBootloaderUpdate` command handshake. Fatal, and distinct from
    /// `PeerRefused`: this terminates the engine at exit code 3, the same
    /// bucket as a handshake/protocol timeout.
    #[error("command rejected: {0}")]
    CommandRejected(String),

    /// The peer sent `AbortTransaction` mid-stream.
    #[error("transaction aborted by peer")]
    TransactionAborted,

    /// The target is bootloader-active but not `Ready`, and `--force` was
    /// not given to forcibly reclaim it.
    #[error("peer busy: target is not in Ready state")]
    BusyPeer,

    /// The Symbol Dictionary is missing a symbol the engine requires, or
    /// the symbol's shape (bit width/position) does not match what the
    /// engine expects.
    #[error("dictionary error: {0}")]
    Dictionary(String),

    /// canDB JSON could not be parsed.
    #[error("invalid canDB JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// A requested device or port could not be found.
    #[error("device not found")]
    DeviceNotFound,

    /// Operation not supported on this target/build.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// A CLI argument did not name a recognized value (e.g. an unknown
    /// target). Maps to exit code 1 at the CLI boundary.
    #[error("usage error: {0}")]
    Usage(String),
}
