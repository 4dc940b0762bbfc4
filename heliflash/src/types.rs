//! Canonical identifiers and the firmware data model.
//!
//! Everything in this module is pure data: no I/O, no protocol logic. The
//! [`Target`] enumerator, the `BootState`/`Command`/`HandshakeResponse`
//! variants and the [`Firmware`]/[`MemoryBlock`] pair are shared by the
//! codec, the HEX loader, the listener and the protocol engine.

use std::time::Instant;

/// One addressable ECU on the bus. Domain-closed: a real deployment adds
/// variants here, it does not grow a runtime registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Target {
    /// Anti-lock braking / stability unit.
    Ams,
    /// Pedal / drivetrain controller.
    Pdl,
    /// Steering unit.
    Stw,
    /// Drivetrain/traction-force controller.
    Drtf,
}

impl Target {
    /// All targets the engine and listener know about, in a stable order.
    pub const ALL: [Target; 4] = [Target::Ams, Target::Pdl, Target::Stw, Target::Drtf];

    /// Short name used in logs and the CLI.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Target::Ams => "AMS",
            Target::Pdl => "PDL",
            Target::Stw => "STW",
            Target::Drtf => "DRTF",
        }
    }

    /// Parse a target from its short name (case-insensitive).
    #[must_use]
    pub fn parse(s: &str) -> Option<Target> {
        Target::ALL.into_iter().find(|t| t.name().eq_ignore_ascii_case(s))
    }

    /// Numeric wire value used in the `target` field of every message.
    #[must_use]
    pub fn to_wire(self) -> u64 {
        Target::ALL.iter().position(|t| *t == self).expect("Target::ALL is exhaustive") as u64
    }

    /// Resolve a target from its numeric wire value.
    #[must_use]
    pub fn from_wire(value: u64) -> Option<Target> {
        Target::ALL.get(value as usize).copied()
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// State reported by a bootloader-active target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootState {
    /// Application firmware is running; the bootloader is not in control.
    FirmwareActive,
    /// Bootloader is idle and will accept a new transaction.
    Ready,
    /// Bootloader is erasing flash pages.
    Erasing,
    /// Bootloader is receiving a data stream.
    Receiving,
    /// Bootloader is verifying a completed write.
    Verifying,
    /// Bootloader update is pending on next reset.
    BLpending,
    /// Application firmware reported itself running (mirrors `PingResponse`).
    FirmwareRunning,
    /// State bits did not match a known value.
    Unknown,
}

/// The register named in a `Handshake`/`HandshakeAck` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Register {
    /// Transaction-magic framing sentinel.
    TransactionMagic,
    /// The command field of a `Handshake`.
    Command,
    /// Number of physical flash blocks about to be reported.
    NumPhysicalMemoryBlocks,
    /// Start address of one physical flash block.
    PhysicalBlockStart,
    /// Length of one physical flash block.
    PhysicalBlockLength,
    /// Number of logical memory blocks about to be sent.
    NumLogicalMemoryBlocks,
    /// Start address of one logical memory block.
    LogicalBlockStart,
    /// Length of one logical memory block.
    LogicalBlockLength,
    /// Number of physical blocks that will be erased.
    NumPhysicalBlocksToErase,
    /// Address of one physical block to erase.
    PhysicalBlockToErase,
    /// Total firmware byte size about to stream.
    FirmwareSize,
    /// Computed firmware checksum.
    Checksum,
    /// Address of the interrupt/vector table.
    InterruptVector,
    /// Firmware entry point.
    EntryPoint,
}

impl Register {
    /// Every register, in a stable wire order.
    pub const ALL: [Register; 14] = [
        Register::TransactionMagic,
        Register::Command,
        Register::NumPhysicalMemoryBlocks,
        Register::PhysicalBlockStart,
        Register::PhysicalBlockLength,
        Register::NumLogicalMemoryBlocks,
        Register::LogicalBlockStart,
        Register::LogicalBlockLength,
        Register::NumPhysicalBlocksToErase,
        Register::PhysicalBlockToErase,
        Register::FirmwareSize,
        Register::Checksum,
        Register::InterruptVector,
        Register::EntryPoint,
    ];

    /// Numeric wire value for this register.
    #[must_use]
    pub fn to_wire(self) -> u64 {
        Register::ALL.iter().position(|r| *r == self).expect("Register::ALL is exhaustive") as u64
    }

    /// Resolve a register from its numeric wire value.
    #[must_use]
    pub fn from_wire(value: u64) -> Option<Register> {
        Register::ALL.get(value as usize).copied()
    }
}

/// The command carried by a `Handshake` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// No command; the handshake only carries a register/value pair.
    None,
    /// Begin a firmware-flashing transaction.
    StartTransactionFlashing,
    /// Begin a bootloader-update transaction.
    StartBootloaderUpdate,
    /// Pause the in-progress data stream.
    StallSubtransaction,
    /// Resume a previously stalled data stream.
    ResumeSubtransaction,
    /// Rewind the data stream to a given address.
    RestartFromAddress,
    /// Abort the in-progress transaction.
    AbortTransaction,
    /// Install a new interrupt vector table address without flashing.
    SetNewVectorTable,
}

impl Command {
    /// Every command, in a stable wire order.
    pub const ALL: [Command; 8] = [
        Command::None,
        Command::StartTransactionFlashing,
        Command::StartBootloaderUpdate,
        Command::StallSubtransaction,
        Command::ResumeSubtransaction,
        Command::RestartFromAddress,
        Command::AbortTransaction,
        Command::SetNewVectorTable,
    ];

    /// Numeric wire value for this command.
    #[must_use]
    pub fn to_wire(self) -> u64 {
        Command::ALL.iter().position(|c| *c == self).expect("Command::ALL is exhaustive") as u64
    }

    /// Resolve a command from its numeric wire value.
    #[must_use]
    pub fn from_wire(value: u64) -> Option<Command> {
        Command::ALL.get(value as usize).copied()
    }
}

/// The peer's response to a `Handshake`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeResponse {
    /// Accepted.
    Ok,
    /// The register received was not the one expected next.
    HandshakeSequenceError,
    /// A command was sent when `Command::None` was expected.
    CommandNotNone,
    /// The transaction-magic value did not match.
    InvalidTransactionMagic,
    /// The register named is not recognized by the peer.
    UnknownRegister,
    /// The peer is occupied by another transaction.
    Busy,
}

impl HandshakeResponse {
    /// Every response, in a stable wire order.
    pub const ALL: [HandshakeResponse; 6] = [
        HandshakeResponse::Ok,
        HandshakeResponse::HandshakeSequenceError,
        HandshakeResponse::CommandNotNone,
        HandshakeResponse::InvalidTransactionMagic,
        HandshakeResponse::UnknownRegister,
        HandshakeResponse::Busy,
    ];

    /// Numeric wire value for this response.
    #[must_use]
    pub fn to_wire(self) -> u64 {
        HandshakeResponse::ALL.iter().position(|r| *r == self).expect("HandshakeResponse::ALL is exhaustive") as u64
    }

    /// Resolve a response from its numeric wire value.
    #[must_use]
    pub fn from_wire(value: u64) -> Option<HandshakeResponse> {
        HandshakeResponse::ALL.get(value as usize).copied()
    }
}

/// Result reported for a flash write/erase operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteResult {
    /// Operation succeeded.
    Ok,
    /// A physical block failed to erase.
    EraseFailed,
    /// A flash write failed.
    FlashWriteFailed,
    /// Post-write verification failed.
    VerifyFailed,
    /// Operation was aborted.
    Aborted,
}

impl WriteResult {
    /// Every result, in a stable wire order.
    pub const ALL: [WriteResult; 5] =
        [WriteResult::Ok, WriteResult::EraseFailed, WriteResult::FlashWriteFailed, WriteResult::VerifyFailed, WriteResult::Aborted];

    /// Numeric wire value for this result.
    #[must_use]
    pub fn to_wire(self) -> u64 {
        WriteResult::ALL.iter().position(|r| *r == self).expect("WriteResult::ALL is exhaustive") as u64
    }

    /// Resolve a result from its numeric wire value. Defaults to
    /// `FlashWriteFailed` for an out-of-range value rather than panicking,
    /// since this is decoded from untrusted peer data.
    #[must_use]
    pub fn from_wire(value: u64) -> WriteResult {
        WriteResult::ALL.get(value as usize).copied().unwrap_or(WriteResult::FlashWriteFailed)
    }
}

/// A contiguous run of bytes at an address. Used for both logical blocks
/// (parsed from the hex file) and physical blocks (reported by the
/// bootloader as an erasable flash page).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryBlock {
    /// Start address of the block.
    pub address: u32,
    /// Byte contents of the block, in file/transfer order.
    pub data: Vec<u8>,
}

impl MemoryBlock {
    /// Address one past the last byte of this block.
    #[must_use]
    pub fn end(&self) -> u32 {
        self.address + self.data.len() as u32
    }
}

/// The parsed, immutable result of loading an Intel-HEX file.
#[derive(Debug, Clone)]
pub struct Firmware {
    /// Logical blocks, sorted by address, non-overlapping, each
    /// half-word aligned in length.
    pub blocks: Vec<MemoryBlock>,
    /// 32-bit entry point. LSB set selects Thumb; cleared selects ARM.
    pub entry_point: u32,
    /// Address of the first logical block.
    pub base_address: u32,
    /// Address one past the last logical block's last byte.
    pub end: u32,
    /// Byte array indexed by `absolute_address - base_address`; `None`
    /// marks a gap between logical blocks.
    pub flattened_map: Vec<Option<u8>>,
    /// Total byte count across all logical blocks (not counting gaps).
    pub length: u32,
}

impl Firmware {
    /// `true` if `entry_point`'s LSB selects the Thumb instruction set.
    #[must_use]
    pub fn is_thumb(&self) -> bool {
        self.entry_point & 1 != 0
    }
}

/// Live state of a target currently in bootloader mode.
#[derive(Debug, Clone, Copy)]
pub struct TargetBootloaderData {
    /// Bootloader-reported state.
    pub state: BootState,
    /// Flash size in KiB, as reported in the beacon.
    pub flash_size_kib: u32,
    /// Wall-clock time this entry was last refreshed.
    pub last_seen: Instant,
    /// Why the bootloader entered (e.g. requested vs. watchdog).
    pub entry_reason: EntryReason,
}

/// Why a target's bootloader became active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryReason {
    /// Host explicitly requested bootloader entry.
    Requested,
    /// Entered due to a watchdog reset.
    Watchdog,
    /// Reason not recognized.
    Unknown,
}

/// Live state of a target currently running application firmware.
#[derive(Debug, Clone, Copy)]
pub struct ApplicationData {
    /// Whether a bootloader update is pending on next reset.
    pub bl_pending: bool,
    /// Wall-clock time this entry was last refreshed.
    pub last_seen: Instant,
}

/// A software-build announcement (either bootloader or application side).
#[derive(Debug, Clone, Copy)]
pub struct TargetSoftwareBuild {
    /// Git commit SHA (first 32 bits), as a raw integer.
    pub commit_sha: u32,
    /// Whether the build tree had uncommitted changes.
    pub dirty_repo: bool,
}

/// The 32-bit value formed by packing the ASCII bytes of "Heli"
/// little-endian. Frames each sub-transaction.
pub const TRANSACTION_MAGIC: u32 = 0x696C_6548;
