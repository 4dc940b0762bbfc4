//! Protocol Engine: drives one flashing transaction against one target.
//!
//! The engine owns no transport reads directly; a background reader
//! thread classifies every inbound frame through the [`Listener`],
//! forwards it into a bounded FIFO the engine consumes, and — for the
//! handful of handshake commands that can preempt an in-flight data
//! stream — updates a set of shared atomics the streaming loop polls
//! without blocking on the FIFO.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::codec::{pack, unpack, FieldTuple, FieldValue};
use crate::dictionary::{Dictionary, MessageId, ResolvedMessage};
use crate::error::{Error, Result};
use crate::hex::map_logical_to_physical;
use crate::listener::Listener;
use crate::transport::{AdapterEvent, CanFrame, FrameTransport};
use crate::types::{Command, Firmware, HandshakeResponse, MemoryBlock, Register, Target, TRANSACTION_MAGIC};
use crate::CancelContext;

/// Handshake retry budget before a `ProtocolTimeout`.
pub const MAX_HANDSHAKE_RETRIES: u32 = 5;

/// Ping cycle period while no bootloader has answered.
pub const PING_FAST_PERIOD: Duration = crate::listener::PING_FAST_PERIOD;

/// Ping cycle period once a bootloader has been located.
pub const PING_SLOW_PERIOD: Duration = crate::listener::PING_SLOW_PERIOD;

/// Minimum offset/sent-bytes ratio the streaming loop throttles toward.
pub const STREAM_EFFICIENCY_TARGET: f64 = 0.9;

/// How long one handshake retry waits for a matching ack before resending.
const HANDSHAKE_RETRY_TIMEOUT: Duration = Duration::from_millis(500);

/// How often a stalled `wait_for_response` logs a progress line.
const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(10);

/// High-level phase of a transaction, driving [`ProtocolEngine::run_flash`]'s
/// match loop.
#[derive(Debug, Clone, Copy)]
enum EngineState {
    LocateTarget,
    RequestEntry,
    MagicOpen,
    CommandStart,
    YieldToBl,
    ReceivePhysicalMap,
    SendLogicalMap,
    ErasePages,
    StreamData,
    SendChecksum,
    SendMetadata,
    RequestExit,
    Done,
}

impl EngineState {
    fn label(self) -> &'static str {
        match self {
            EngineState::LocateTarget => "locating target",
            EngineState::RequestEntry => "requesting bootloader entry",
            EngineState::MagicOpen => "opening transaction",
            EngineState::CommandStart => "starting command",
            EngineState::YieldToBl => "yielding to bootloader",
            EngineState::ReceivePhysicalMap => "receiving physical map",
            EngineState::SendLogicalMap => "sending logical map",
            EngineState::ErasePages => "erasing pages",
            EngineState::StreamData => "streaming data",
            EngineState::SendChecksum => "sending checksum",
            EngineState::SendMetadata => "sending metadata",
            EngineState::RequestExit => "requesting exit",
            EngineState::Done => "done",
        }
    }
}

/// What kind of transaction this engine instance runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionKind {
    /// Flash application firmware.
    FlashApplication,
    /// Flash a new bootloader image.
    UpdateBootloader,
}

impl TransactionKind {
    fn start_command(self) -> Command {
        match self {
            TransactionKind::FlashApplication => Command::StartTransactionFlashing,
            TransactionKind::UpdateBootloader => Command::StartBootloaderUpdate,
        }
    }
}

/// Control signals written by the reader thread and read by the
/// streaming loop, per the concurrency model's single-writer/atomic-reader
/// rule.
#[derive(Default)]
struct StreamControl {
    stall_requested: AtomicBool,
    restart_requested: AtomicBool,
    restart_address: AtomicU32,
    abort_requested: AtomicBool,
    data_transmission_finished: AtomicBool,
    current_offset: AtomicU32,
}

/// Drives one reprogramming transaction to completion against `target`.
pub struct ProtocolEngine<T: FrameTransport + 'static> {
    transport: Arc<Mutex<T>>,
    dictionary: Arc<Dictionary>,
    listener: Arc<Listener>,
    rx: Receiver<CanFrame>,
    control: Arc<StreamControl>,
    cancel: CancelContext,
    target: Target,
    force: bool,
}

impl<T: FrameTransport + 'static> ProtocolEngine<T> {
    /// Spawn the background reader thread and build an engine addressing
    /// `target`.
    #[must_use]
    pub fn new(
        transport: Arc<Mutex<T>>,
        dictionary: Arc<Dictionary>,
        listener: Arc<Listener>,
        target: Target,
        force: bool,
        cancel: CancelContext,
    ) -> Self {
        let (tx, rx): (SyncSender<CanFrame>, Receiver<CanFrame>) = sync_channel(64);
        let control = Arc::new(StreamControl::default());

        spawn_reader(Arc::clone(&transport), Arc::clone(&listener), Arc::clone(&dictionary), tx, Arc::clone(&control));

        ProtocolEngine { transport, dictionary, listener, rx, control, cancel, target, force }
    }

    fn send_std(&self, id: u32, payload: &[u8]) -> Result<()> {
        self.transport.lock().unwrap().send_std(id as u16, payload)
    }

    fn message(&self, id: MessageId) -> ResolvedMessage {
        self.dictionary.message(id).clone()
    }

    /// Run a full flashing transaction against `firmware`, returning once
    /// the target has exited back to application firmware.
    ///
    /// `on_progress(phase, current, total)` is called once on entry to
    /// every phase, and repeatedly during `StreamData` with the bytes
    /// streamed so far against `firmware.length`; other phases report
    /// `(0, 0)` since they have no natural byte-granular measure.
    pub fn run_flash(
        &mut self,
        firmware: &Firmware,
        kind: TransactionKind,
        on_progress: &mut dyn FnMut(&str, u64, u64),
    ) -> Result<()> {
        let mut state = EngineState::LocateTarget;
        let mut physical_blocks: Vec<MemoryBlock> = Vec::new();
        let mut covering_blocks: Vec<MemoryBlock> = Vec::new();

        loop {
            self.cancel.check()?;
            on_progress(state.label(), 0, 0);
            state = match state {
                EngineState::LocateTarget => {
                    self.locate_target()?;
                    EngineState::RequestEntry
                },
                EngineState::RequestEntry => {
                    self.request_entry()?;
                    EngineState::MagicOpen
                },
                EngineState::MagicOpen => {
                    self.magic_handshake()?;
                    EngineState::CommandStart
                },
                EngineState::CommandStart => {
                    self.command_start(kind.start_command())?;
                    EngineState::YieldToBl
                },
                EngineState::YieldToBl => {
                    EngineState::ReceivePhysicalMap
                },
                EngineState::ReceivePhysicalMap => {
                    physical_blocks = self.receive_physical_map()?;
                    covering_blocks = map_logical_to_physical(firmware, &physical_blocks)?;
                    EngineState::SendLogicalMap
                },
                EngineState::SendLogicalMap => {
                    self.send_logical_map(firmware)?;
                    EngineState::ErasePages
                },
                EngineState::ErasePages => {
                    self.erase_pages(&covering_blocks)?;
                    EngineState::StreamData
                },
                EngineState::StreamData => {
                    self.stream_data(firmware, on_progress)?;
                    EngineState::SendChecksum
                },
                EngineState::SendChecksum => {
                    self.send_checksum(firmware)?;
                    EngineState::SendMetadata
                },
                EngineState::SendMetadata => {
                    self.send_metadata(firmware)?;
                    EngineState::RequestExit
                },
                EngineState::RequestExit => {
                    self.request_exit(false, true)?;
                    EngineState::Done
                },
                EngineState::Done => break,
            };
        }

        Ok(())
    }

    /// Run the short `SetVectorTable` transaction variant.
    pub fn run_set_vector_table(&mut self, address: u32) -> Result<()> {
        self.locate_target()?;
        self.magic_handshake()?;
        self.command_start_with_value(Command::SetNewVectorTable, u64::from(address))?;
        self.request_exit(false, true)?;
        Ok(())
    }

    /// Solicit bootloader entry for the target without starting a
    /// transaction: locate it, then request entry (or reclaim it from a
    /// stuck non-`Ready` bootloader state if `--force` allows it).
    pub fn enter_bootloader(&mut self) -> Result<()> {
        self.locate_target()?;
        self.request_entry()
    }

    /// Request the target leave bootloader mode and return to
    /// application firmware, without running a transaction first.
    pub fn exit_bootloader(&mut self) -> Result<()> {
        self.locate_target()?;
        self.request_exit(self.force, true)
    }

    /// Wait until the target appears in either Listener table. While
    /// waiting, directed pings are sent toward the target itself.
    fn locate_target(&mut self) -> Result<()> {
        let ping = self.message(MessageId::Ping);
        let deadline_log = Instant::now();
        let mut last_log = deadline_log;

        loop {
            self.cancel.check()?;
            if self.listener.active_bootloaders().contains_key(&self.target)
                || self.listener.aware_applications().contains_key(&self.target)
            {
                return Ok(());
            }

            let mut fields = FieldTuple::new();
            fields.insert("target".into(), FieldValue::Uint(self.target.to_wire()));
            fields.insert("request_bootloader".into(), FieldValue::Bool(false));
            let (payload, len) = pack(&ping.fields, &fields)?;
            self.send_std(ping.can_id, &payload[..len])?;

            if last_log.elapsed() >= PROGRESS_LOG_INTERVAL {
                info!("still waiting to locate {}", self.target);
                last_log = Instant::now();
            }

            std::thread::sleep(PING_FAST_PERIOD);
        }
    }

    /// If the target is application-active, solicit bootloader entry. If
    /// it is already bootloader-active but not `Ready`, reclaim it with a
    /// forced exit when `--force` allows it.
    fn request_entry(&mut self) -> Result<()> {
        if let Some(data) = self.listener.active_bootloaders().get(&self.target).copied() {
            if data.state == crate::types::BootState::Ready {
                return Ok(());
            }
            if !self.force {
                return Err(Error::BusyPeer);
            }
            warn!("{} is bootloader-active but not Ready; forcing exit", self.target);
            self.request_exit(true, false)?;
            return self.locate_target();
        }

        let ping = self.message(MessageId::Ping);
        for attempt in 0..MAX_HANDSHAKE_RETRIES {
            self.cancel.check()?;
            let mut fields = FieldTuple::new();
            fields.insert("target".into(), FieldValue::Uint(self.target.to_wire()));
            fields.insert("request_bootloader".into(), FieldValue::Bool(true));
            let (payload, len) = pack(&ping.fields, &fields)?;
            self.send_std(ping.can_id, &payload[..len])?;

            if self.wait_for_ping_response(HANDSHAKE_RETRY_TIMEOUT)?.is_some() {
                break;
            }
            debug!("entry request attempt {} for {} unanswered", attempt + 1, self.target);
            if attempt + 1 == MAX_HANDSHAKE_RETRIES {
                return Err(Error::ProtocolTimeout(format!("entry request for {}", self.target)));
            }
        }

        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            self.cancel.check()?;
            if self.listener.active_bootloaders().contains_key(&self.target) {
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        Err(Error::ProtocolTimeout(format!("bootloader entry for {}", self.target)))
    }

    fn wait_for_ping_response(&mut self, timeout: Duration) -> Result<Option<()>> {
        let ping_response = self.message(MessageId::PingResponse);
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            match self.rx.recv_timeout(remaining) {
                Ok(frame) if frame.id == ping_response.can_id => return Ok(Some(())),
                Ok(_) => continue,
                Err(RecvTimeoutError::Timeout) => return Ok(None),
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(Error::Transport("reader thread terminated".into()));
                },
            }
        }
    }

    /// Send `Handshake(TransactionMagic, None, target, 0x696C6548)` and
    /// require a matching `HandshakeAck(OK)`, retrying up to
    /// `MAX_HANDSHAKE_RETRIES` times.
    fn magic_handshake(&mut self) -> Result<()> {
        let (response, _value) =
            self.handshake_roundtrip(Register::TransactionMagic, Command::None, u64::from(TRANSACTION_MAGIC))?;
        match response {
            HandshakeResponse::Ok => Ok(()),
            HandshakeResponse::InvalidTransactionMagic => Err(Error::ProtocolTimeout("transaction magic rejected".into())),
            other => Err(Error::PeerRefused(format!("magic handshake: {other:?}"))),
        }
    }

    /// Send the `StartTransactionFlashing`/`StartBootloaderUpdate` command.
    /// A non-`OK` response here is fatal to the whole engine (exit code 3),
    /// distinct from the softer `PeerRefused` used by entry/exit requests.
    fn command_start(&mut self, command: Command) -> Result<()> {
        let (response, _value) = self.handshake_roundtrip(Register::Command, command, 0)?;
        match response {
            HandshakeResponse::Ok => Ok(()),
            other => Err(Error::CommandRejected(format!("command {command:?} rejected: {other:?}"))),
        }
    }

    fn command_start_with_value(&mut self, command: Command, value: u64) -> Result<()> {
        let (response, _value) = self.handshake_roundtrip(Register::Command, command, value)?;
        match response {
            HandshakeResponse::Ok => Ok(()),
            other => Err(Error::PeerRefused(format!("command {command:?} rejected: {other:?}"))),
        }
    }

    /// Send one `Handshake` and wait for its matching `HandshakeAck`,
    /// retrying the whole round trip up to `MAX_HANDSHAKE_RETRIES` times.
    fn handshake_roundtrip(&mut self, register: Register, command: Command, value: u64) -> Result<(HandshakeResponse, u64)> {
        let handshake = self.message(MessageId::Handshake);
        let ack = self.message(MessageId::HandshakeAck);

        for attempt in 0..MAX_HANDSHAKE_RETRIES {
            self.cancel.check()?;
            let mut fields = FieldTuple::new();
            fields.insert("register".into(), FieldValue::Uint(register.to_wire()));
            fields.insert("command".into(), FieldValue::Uint(command.to_wire()));
            fields.insert("target".into(), FieldValue::Uint(self.target.to_wire()));
            fields.insert("value".into(), FieldValue::Uint(value));
            let (payload, len) = pack(&handshake.fields, &fields)?;
            self.send_std(handshake.can_id, &payload[..len])?;

            let deadline = Instant::now() + HANDSHAKE_RETRY_TIMEOUT;
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                match self.rx.recv_timeout(remaining) {
                    Ok(frame) if frame.id == ack.can_id => {
                        let fields = unpack(&ack.fields, &frame.payload)?;
                        let got_register = uint_field(&fields, "register")?;
                        if Register::from_wire(got_register) != Some(register) {
                            continue;
                        }
                        let response = HandshakeResponse::from_wire(uint_field(&fields, "response")?)
                            .ok_or_else(|| Error::Codec("unrecognized handshake response".into()))?;
                        let value = uint_field(&fields, "value")?;
                        return Ok((response, value));
                    },
                    Ok(_) => continue,
                    Err(RecvTimeoutError::Timeout) => break,
                    Err(RecvTimeoutError::Disconnected) => {
                        return Err(Error::Transport("reader thread terminated".into()));
                    },
                }
            }
            debug!("handshake retry {} for register {:?}", attempt + 1, register);
        }

        Err(Error::ProtocolTimeout(format!("handshake on register {register:?}")))
    }

    /// Reply to one inbound `Handshake` with a `HandshakeAck`, confirming
    /// the register matched what was expected.
    fn ack_handshake(&mut self, expected: Register) -> Result<(Command, u64)> {
        let handshake = self.message(MessageId::Handshake);
        let ack = self.message(MessageId::HandshakeAck);

        loop {
            self.cancel.check()?;
            let frame = match self.rx.recv_timeout(PROGRESS_LOG_INTERVAL) {
                Ok(frame) => frame,
                Err(RecvTimeoutError::Timeout) => {
                    debug!("still waiting for peer handshake on register {expected:?}");
                    continue;
                },
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(Error::Transport("reader thread terminated".into()));
                },
            };
            if frame.id != handshake.can_id {
                continue;
            }
            let fields = unpack(&handshake.fields, &frame.payload)?;
            let register = Register::from_wire(uint_field(&fields, "register")?);
            let command = Command::from_wire(uint_field(&fields, "command")?).unwrap_or(Command::None);
            let value = uint_field(&fields, "value")?;

            let response = if register == Some(expected) { HandshakeResponse::Ok } else { HandshakeResponse::HandshakeSequenceError };

            let mut ack_fields = FieldTuple::new();
            ack_fields.insert("register".into(), FieldValue::Uint(uint_field(&fields, "register")?));
            ack_fields.insert("target".into(), FieldValue::Uint(self.target.to_wire()));
            ack_fields.insert("response".into(), FieldValue::Uint(response.to_wire()));
            ack_fields.insert("value".into(), FieldValue::Uint(value));
            let (payload, len) = pack(&ack.fields, &ack_fields)?;
            self.send_std(ack.can_id, &payload[..len])?;

            if register == Some(expected) {
                return Ok((command, value));
            }
        }
    }

    /// Receive the bootloader-driven physical memory map exchange:
    /// `CommunicationYield`, magic, `NumPhysicalMemoryBlocks`, N ×
    /// (start, length) pairs, terminal magic, then the bootloader yields
    /// back.
    fn receive_physical_map(&mut self) -> Result<Vec<MemoryBlock>> {
        let yield_msg = self.message(MessageId::CommunicationYield);
        let mut fields = FieldTuple::new();
        fields.insert("target".into(), FieldValue::Uint(self.target.to_wire()));
        let (payload, len) = pack(&yield_msg.fields, &fields)?;
        self.send_std(yield_msg.can_id, &payload[..len])?;

        self.expect_magic_from_peer()?;

        let (_cmd, count) = self.ack_handshake(Register::NumPhysicalMemoryBlocks)?;
        let mut blocks = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let (_cmd, address) = self.ack_handshake(Register::PhysicalBlockStart)?;
            let (_cmd, length) = self.ack_handshake(Register::PhysicalBlockLength)?;
            blocks.push(MemoryBlock { address: address as u32, data: vec![0u8; length as usize] });
        }

        self.expect_magic_from_peer()?;
        Ok(blocks)
    }

    /// Wait for a peer-initiated `Handshake(TransactionMagic)` and
    /// acknowledge it.
    fn expect_magic_from_peer(&mut self) -> Result<()> {
        let (_cmd, value) = self.ack_handshake(Register::TransactionMagic)?;
        if value != u64::from(TRANSACTION_MAGIC) {
            warn!("peer magic frame carried unexpected value {value:#x}");
        }
        Ok(())
    }

    fn send_logical_map(&mut self, firmware: &Firmware) -> Result<()> {
        self.magic_handshake()?;
        let count = firmware.blocks.len() as u64;
        let (response, _) = self.handshake_roundtrip(Register::NumLogicalMemoryBlocks, Command::None, count)?;
        require_ok(response, "NumLogicalMemoryBlocks")?;

        for block in &firmware.blocks {
            let (response, _) = self.handshake_roundtrip(Register::LogicalBlockStart, Command::None, u64::from(block.address))?;
            require_ok(response, "LogicalBlockStart")?;
            let (response, _) =
                self.handshake_roundtrip(Register::LogicalBlockLength, Command::None, block.data.len() as u64)?;
            require_ok(response, "LogicalBlockLength")?;
        }

        self.magic_handshake()
    }

    fn erase_pages(&mut self, covering_blocks: &[MemoryBlock]) -> Result<()> {
        self.magic_handshake()?;
        let count = covering_blocks.len() as u64;
        let (response, _) = self.handshake_roundtrip(Register::NumPhysicalBlocksToErase, Command::None, count)?;
        require_ok(response, "NumPhysicalBlocksToErase")?;

        for block in covering_blocks {
            let (response, _) = self.handshake_roundtrip(Register::PhysicalBlockToErase, Command::None, u64::from(block.address))?;
            if response != HandshakeResponse::Ok {
                warn!("erase of page {:#010x} reported {:?}", block.address, response);
            }
        }

        self.magic_handshake()
    }

    /// Stream the flattened firmware image as 32-bit words, reacting to
    /// peer-driven stall/resume/restart/abort without per-word
    /// acknowledgment.
    fn stream_data(&mut self, firmware: &Firmware, on_progress: &mut dyn FnMut(&str, u64, u64)) -> Result<()> {
        self.magic_handshake()?;
        let (response, _) = self.handshake_roundtrip(Register::FirmwareSize, Command::None, u64::from(firmware.length))?;
        require_ok(response, "FirmwareSize")?;

        let data = self.message(MessageId::Data);
        let data_ack = self.message(MessageId::DataAck);

        self.control.data_transmission_finished.store(false, Ordering::SeqCst);
        self.control.stall_requested.store(false, Ordering::SeqCst);
        self.control.restart_requested.store(false, Ordering::SeqCst);
        self.control.abort_requested.store(false, Ordering::SeqCst);
        self.control.current_offset.store(0, Ordering::SeqCst);

        let mut offset: u32 = 0;
        let mut sent_bytes: u64 = 0;
        let mut stalled_since: Option<Instant> = None;
        let mut total_stalled = Duration::ZERO;

        while !self.control.data_transmission_finished.load(Ordering::SeqCst) {
            self.cancel.check()?;

            if self.control.abort_requested.load(Ordering::SeqCst) {
                return Err(Error::TransactionAborted);
            }

            if self.control.stall_requested.load(Ordering::SeqCst) {
                if stalled_since.is_none() {
                    stalled_since = Some(Instant::now());
                }
                std::thread::sleep(Duration::from_millis(1));
                continue;
            }
            if let Some(since) = stalled_since.take() {
                total_stalled += since.elapsed();
                debug!("resumed after stalling for {:?} (total {:?})", since.elapsed(), total_stalled);
            }

            if self.control.restart_requested.swap(false, Ordering::SeqCst) {
                let absolute = self.control.restart_address.load(Ordering::SeqCst);
                offset = absolute.saturating_sub(firmware.base_address);
                self.control.current_offset.store(offset, Ordering::SeqCst);
            }

            if (offset as usize) >= firmware.flattened_map.len() {
                break;
            }

            offset = next_populated_offset(firmware, offset);
            if (offset as usize) >= firmware.flattened_map.len() {
                break;
            }

            let word = read_word(firmware, offset);
            let mut fields = FieldTuple::new();
            fields.insert("address".into(), FieldValue::Uint(u64::from(firmware.base_address + offset) >> 1));
            fields.insert("is_doubleword".into(), FieldValue::Bool(false));
            fields.insert("value".into(), FieldValue::Uint(u64::from(word)));
            let (payload, len) = pack(&data.fields, &fields)?;
            self.send_std(data.can_id, &payload[..len])?;

            offset += 4;
            sent_bytes += 4;
            self.control.current_offset.store(offset, Ordering::SeqCst);
            on_progress(EngineState::StreamData.label(), u64::from(offset), u64::from(firmware.length));

            let efficiency = f64::from(offset) / sent_bytes.max(1) as f64;
            if efficiency < STREAM_EFFICIENCY_TARGET {
                std::thread::sleep(Duration::from_micros(200));
            }

            while let Ok(frame) = self.rx.try_recv() {
                if frame.id == data_ack.can_id {
                    let fields = unpack(&data_ack.fields, &frame.payload)?;
                    let result = crate::types::WriteResult::from_wire(uint_field(&fields, "result")?);
                    if result == crate::types::WriteResult::Ok {
                        self.control.data_transmission_finished.store(true, Ordering::SeqCst);
                    } else {
                        warn!("data ack reported {result:?}");
                    }
                }
            }
        }

        self.magic_handshake()
    }

    fn send_checksum(&mut self, firmware: &Firmware) -> Result<()> {
        self.magic_handshake()?;
        let checksum = crate::hex::checksum(firmware)?;
        let (response, _) = self.handshake_roundtrip(Register::Checksum, Command::None, checksum)?;
        require_ok(response, "Checksum")?;
        self.magic_handshake()
    }

    fn send_metadata(&mut self, firmware: &Firmware) -> Result<()> {
        self.magic_handshake()?;
        let vector = firmware.blocks.first().map(|b| b.address).unwrap_or(firmware.base_address);
        let (response, _) = self.handshake_roundtrip(Register::InterruptVector, Command::None, u64::from(vector))?;
        require_ok(response, "InterruptVector")?;
        let (response, _) = self.handshake_roundtrip(Register::EntryPoint, Command::None, u64::from(firmware.entry_point))?;
        require_ok(response, "EntryPoint")?;
        self.magic_handshake()
    }

    /// Request the target leave bootloader mode (or, with `force`, abort
    /// its current transaction).
    fn request_exit(&mut self, force: bool, to_app: bool) -> Result<()> {
        let exit_req = self.message(MessageId::ExitReq);
        let exit_ack = self.message(MessageId::ExitAck);

        let mut fields = FieldTuple::new();
        fields.insert("target".into(), FieldValue::Uint(self.target.to_wire()));
        fields.insert("force".into(), FieldValue::Bool(force));
        fields.insert("to_app".into(), FieldValue::Bool(to_app));
        let (payload, len) = pack(&exit_req.fields, &fields)?;
        self.send_std(exit_req.can_id, &payload[..len])?;

        let deadline = Instant::now() + HANDSHAKE_RETRY_TIMEOUT * MAX_HANDSHAKE_RETRIES;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::ProtocolTimeout("exit request".into()));
            }
            match self.rx.recv_timeout(remaining) {
                Ok(frame) if frame.id == exit_ack.can_id => {
                    let fields = unpack(&exit_ack.fields, &frame.payload)?;
                    if bool_field(&fields, "confirmed")? {
                        return Ok(());
                    }
                    return Err(Error::PeerRefused("exit request declined".into()));
                },
                Ok(_) => continue,
                Err(RecvTimeoutError::Timeout) => return Err(Error::ProtocolTimeout("exit request".into())),
                Err(RecvTimeoutError::Disconnected) => return Err(Error::Transport("reader thread terminated".into())),
            }
        }
    }
}

fn require_ok(response: HandshakeResponse, what: &str) -> Result<()> {
    if response == HandshakeResponse::Ok {
        Ok(())
    } else {
        Err(Error::PeerRefused(format!("{what}: {response:?}")))
    }
}

fn uint_field(fields: &FieldTuple, name: &str) -> Result<u64> {
    match fields.get(name) {
        Some(FieldValue::Uint(v)) => Ok(*v),
        Some(FieldValue::Enum(v)) => Ok(u64::from(*v)),
        _ => Err(Error::Codec(format!("field '{name}' missing or wrong kind"))),
    }
}

fn bool_field(fields: &FieldTuple, name: &str) -> Result<bool> {
    match fields.get(name) {
        Some(FieldValue::Bool(v)) => Ok(*v),
        _ => Err(Error::Codec(format!("field '{name}' missing or wrong kind"))),
    }
}

/// Skip forward past any gap (sentinel `None` run) in the flattened map.
fn next_populated_offset(firmware: &Firmware, mut offset: u32) -> u32 {
    while (offset as usize) < firmware.flattened_map.len() && firmware.flattened_map[offset as usize].is_none() {
        offset += 1;
    }
    offset
}

fn read_word(firmware: &Firmware, offset: u32) -> u32 {
    let mut bytes = [0u8; 4];
    for (i, b) in bytes.iter_mut().enumerate() {
        let idx = offset as usize + i;
        *b = firmware.flattened_map.get(idx).copied().flatten().unwrap_or(0xFF);
    }
    u32::from_le_bytes(bytes)
}

/// Spawn the background reader: classifies every frame through the
/// Listener, forwards it to the engine's FIFO, and updates the shared
/// stream control atomics for the handshake commands that can preempt an
/// in-flight data stream.
fn spawn_reader<T: FrameTransport + 'static>(
    transport: Arc<Mutex<T>>,
    listener: Arc<Listener>,
    dictionary: Arc<Dictionary>,
    tx: SyncSender<CanFrame>,
    control: Arc<StreamControl>,
) {
    std::thread::spawn(move || {
        let handshake = dictionary.message(MessageId::Handshake).clone();
        loop {
            let event = {
                let mut guard = transport.lock().unwrap();
                guard.recv(Duration::from_millis(200))
            };
            let adapter_event = match event {
                Ok(Some(adapter_event)) => adapter_event,
                Ok(None) => continue,
                Err(_) => break,
            };

            if let Err(e) = listener.observe_event(&adapter_event) {
                debug!("listener failed to classify adapter event: {e}");
            }

            let frame = match adapter_event {
                AdapterEvent::Frame(frame) => frame,
                _ => continue,
            };

            if frame.id == handshake.can_id {
                if let Ok(fields) = unpack(&handshake.fields, &frame.payload) {
                    if let Ok(command_wire) = uint_field(&fields, "command") {
                        match Command::from_wire(command_wire) {
                            Some(Command::StallSubtransaction) => control.stall_requested.store(true, Ordering::SeqCst),
                            Some(Command::ResumeSubtransaction) => control.stall_requested.store(false, Ordering::SeqCst),
                            Some(Command::RestartFromAddress) => {
                                if let Ok(value) = uint_field(&fields, "value") {
                                    control.restart_address.store(value as u32, Ordering::SeqCst);
                                    control.restart_requested.store(true, Ordering::SeqCst);
                                }
                            },
                            Some(Command::AbortTransaction) => control.abort_requested.store(true, Ordering::SeqCst),
                            _ => {},
                        }
                    }
                }
            }

            if tx.send(frame).is_err() {
                break;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hex;
    use crate::transport::mock::MockTransport;
    use crate::transport::IdKind;

    fn make_engine(
        dictionary: Arc<Dictionary>,
    ) -> (ProtocolEngine<MockTransport>, Arc<Mutex<MockTransport>>, Arc<Listener>) {
        let transport = Arc::new(Mutex::new(MockTransport::default()));
        let listener = Arc::new(Listener::new(Arc::clone(&dictionary)));
        let engine = ProtocolEngine::new(Arc::clone(&transport), dictionary, Arc::clone(&listener), Target::Ams, false, CancelContext::none());
        (engine, transport, listener)
    }

    fn push_handshake_ack(transport: &Arc<Mutex<MockTransport>>, dictionary: &Dictionary, register: Register, response: HandshakeResponse, value: u64) {
        let ack = dictionary.message(MessageId::HandshakeAck);
        let mut fields = FieldTuple::new();
        fields.insert("register".into(), FieldValue::Uint(register.to_wire()));
        fields.insert("target".into(), FieldValue::Uint(Target::Ams.to_wire()));
        fields.insert("response".into(), FieldValue::Uint(response.to_wire()));
        fields.insert("value".into(), FieldValue::Uint(value));
        let (payload, len) = pack(&ack.fields, &fields).unwrap();
        transport.lock().unwrap().push_frame(ack.can_id, IdKind::Standard, payload[..len].to_vec(), 0);
    }

    #[test]
    fn magic_handshake_round_trip_accepts_ok() {
        let dictionary = Arc::new(Dictionary::test_fixture());
        let (mut engine, transport, _listener) = make_engine(Arc::clone(&dictionary));
        push_handshake_ack(&transport, &dictionary, Register::TransactionMagic, HandshakeResponse::Ok, u64::from(TRANSACTION_MAGIC));

        engine.magic_handshake().unwrap();

        let sent = &transport.lock().unwrap().sent;
        assert_eq!(sent.len(), 1);
        let handshake = dictionary.message(MessageId::Handshake);
        assert_eq!(sent[0].id, handshake.can_id);
    }

    #[test]
    fn magic_handshake_rejects_invalid_magic() {
        let dictionary = Arc::new(Dictionary::test_fixture());
        let (mut engine, transport, _listener) = make_engine(Arc::clone(&dictionary));
        push_handshake_ack(&transport, &dictionary, Register::TransactionMagic, HandshakeResponse::InvalidTransactionMagic, 0);

        let err = engine.magic_handshake().unwrap_err();
        assert!(matches!(err, Error::ProtocolTimeout(_)));
    }

    #[test]
    fn stream_data_restart_rewinds_offset() {
        let dictionary = Arc::new(Dictionary::test_fixture());
        let (mut engine, transport, _listener) = make_engine(Arc::clone(&dictionary));

        let firmware = hex::load(":020000040800F2\n:08000000DEADBEEFDEADBEEF88\n:0400000508000001EE\n:00000001FF\n").unwrap();

        push_handshake_ack(&transport, &dictionary, Register::TransactionMagic, HandshakeResponse::Ok, u64::from(TRANSACTION_MAGIC));
        push_handshake_ack(&transport, &dictionary, Register::FirmwareSize, HandshakeResponse::Ok, 0);

        let handshake = dictionary.message(MessageId::Handshake);
        let mut restart_fields = FieldTuple::new();
        restart_fields.insert("register".into(), FieldValue::Uint(Register::Command.to_wire()));
        restart_fields.insert("command".into(), FieldValue::Uint(Command::RestartFromAddress.to_wire()));
        restart_fields.insert("target".into(), FieldValue::Uint(Target::Ams.to_wire()));
        restart_fields.insert("value".into(), FieldValue::Uint(u64::from(firmware.base_address)));
        let (payload, len) = pack(&handshake.fields, &restart_fields).unwrap();
        transport.lock().unwrap().push_frame(handshake.can_id, IdKind::Standard, payload[..len].to_vec(), 0);

        let data_ack = dictionary.message(MessageId::DataAck);
        let mut ack_fields = FieldTuple::new();
        ack_fields.insert("address".into(), FieldValue::Uint(0));
        ack_fields.insert("result".into(), FieldValue::Uint(crate::types::WriteResult::Ok.to_wire()));
        let (payload, len) = pack(&data_ack.fields, &ack_fields).unwrap();
        transport.lock().unwrap().push_frame(data_ack.can_id, IdKind::Standard, payload[..len].to_vec(), 1);

        push_handshake_ack(&transport, &dictionary, Register::TransactionMagic, HandshakeResponse::Ok, u64::from(TRANSACTION_MAGIC));

        std::thread::sleep(Duration::from_millis(50));
        engine.stream_data(&firmware, &mut |_, _, _| {}).unwrap();

        assert!(engine.control.data_transmission_finished.load(Ordering::SeqCst));
    }
}
