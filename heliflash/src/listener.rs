//! Listener: passive bus observation plus the host-initiated ping cycle.
//!
//! Maintains four tables behind independent mutexes: which targets
//! currently have an active bootloader, which targets are known to be
//! running application firmware, and the latest software-build
//! announcement seen from each side. A background thread periodically
//! pings targets that have not yet announced a bootloader, at a fast
//! cadence while no acks are flowing and a slow cadence once at least one
//! bootloader has answered. A fifth cell records the adapter's negotiated
//! bit-rate, and the "acks flowing" flag is cleared by an acknowledgment
//! CAN error and set again by the next non-error event.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::codec::{pack, unpack, FieldTuple, FieldValue};
use crate::dictionary::{Dictionary, MessageId};
use crate::error::Result;
use crate::transport::{AdapterEvent, CanErrorKind, CanFrame, FrameTransport};
use crate::types::{ApplicationData, BootState, EntryReason, Target, TargetBootloaderData, TargetSoftwareBuild};

/// How often the cycler pings while no bootloader has acknowledged yet.
pub const PING_FAST_PERIOD: Duration = Duration::from_millis(50);

/// How often the cycler pings once at least one bootloader is active.
pub const PING_SLOW_PERIOD: Duration = Duration::from_secs(1);

/// Classification of one frame the listener observed.
#[derive(Debug, Clone)]
pub enum ListenerEvent {
    /// A bootloader announced its presence and state.
    BootloaderBeacon { target: Target, data: TargetBootloaderData },
    /// A target answered a host ping.
    PingResponse { target: Target, bl_pending: bool },
    /// A software-build announcement, from either side.
    SoftwareBuild { target: Target, from_bootloader: bool, build: TargetSoftwareBuild },
    /// A frame the listener does not classify further (heartbeat, error
    /// flags, config report, and the like).
    Ignored,
}

/// Shared, mutex-protected listener state.
#[derive(Default)]
struct Tables {
    active_bootloaders: Mutex<HashMap<Target, TargetBootloaderData>>,
    aware_applications: Mutex<HashMap<Target, ApplicationData>>,
    bootloader_builds: Mutex<HashMap<Target, TargetSoftwareBuild>>,
    application_builds: Mutex<HashMap<Target, TargetSoftwareBuild>>,
    negotiated_bitrate: Mutex<Option<u32>>,
}

/// Observes the bus and drives the host ping cycle.
pub struct Listener {
    tables: Arc<Tables>,
    receiving_acks: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
    dictionary: Arc<Dictionary>,
}

impl Listener {
    /// Create a listener with empty tables.
    #[must_use]
    pub fn new(dictionary: Arc<Dictionary>) -> Self {
        Listener {
            tables: Arc::new(Tables::default()),
            receiving_acks: Arc::new(AtomicBool::new(false)),
            paused: Arc::new(AtomicBool::new(false)),
            dictionary,
        }
    }

    /// Classify one received frame and fold it into the tables, returning
    /// the classification for callers (e.g. the protocol engine) that
    /// also want to react to it directly.
    pub fn observe(&self, frame: &CanFrame) -> Result<ListenerEvent> {
        let event = self.classify(frame)?;
        self.receiving_acks.store(true, Ordering::SeqCst);
        match &event {
            ListenerEvent::BootloaderBeacon { target, data } => {
                self.tables.active_bootloaders.lock().unwrap().insert(*target, *data);
                self.tables.aware_applications.lock().unwrap().remove(target);
            },
            ListenerEvent::PingResponse { target, bl_pending } => {
                self.tables.active_bootloaders.lock().unwrap().remove(target);
                self.tables
                    .aware_applications
                    .lock()
                    .unwrap()
                    .insert(*target, ApplicationData { bl_pending: *bl_pending, last_seen: Instant::now() });
            },
            ListenerEvent::SoftwareBuild { target, from_bootloader, build } => {
                let table = if *from_bootloader { &self.tables.bootloader_builds } else { &self.tables.application_builds };
                table.lock().unwrap().insert(*target, *build);
            },
            ListenerEvent::Ignored => {},
        }
        Ok(event)
    }

    /// Classify a non-frame adapter event: clears the "acks flowing" flag
    /// on an acknowledgment CAN error, and records the adapter's
    /// negotiated bit-rate from a `Config` report. A received `Frame` is
    /// routed to [`Self::observe`]; everything else is `Ignored`.
    pub fn observe_event(&self, event: &AdapterEvent) -> Result<ListenerEvent> {
        match event {
            AdapterEvent::Frame(frame) => self.observe(frame),
            AdapterEvent::Error { kind: CanErrorKind::Acknowledgment, .. } => {
                self.receiving_acks.store(false, Ordering::SeqCst);
                Ok(ListenerEvent::Ignored)
            },
            AdapterEvent::Config { bitrate, .. } => {
                *self.tables.negotiated_bitrate.lock().unwrap() = Some(*bitrate);
                Ok(ListenerEvent::Ignored)
            },
            _ => Ok(ListenerEvent::Ignored),
        }
    }

    fn classify(&self, frame: &CanFrame) -> Result<ListenerEvent> {
        let beacon = self.dictionary.message(MessageId::Beacon);
        let ping_response = self.dictionary.message(MessageId::PingResponse);
        let software_build = self.dictionary.message(MessageId::SoftwareBuild);

        if frame.id == beacon.can_id {
            let fields = unpack(&beacon.fields, &frame.payload)?;
            return Ok(ListenerEvent::BootloaderBeacon {
                target: target_from_fields(&fields)?,
                data: TargetBootloaderData {
                    state: boot_state_from_u64(uint_field(&fields, "state")?),
                    flash_size_kib: uint_field(&fields, "flash_size")? as u32,
                    last_seen: Instant::now(),
                    entry_reason: entry_reason_from_u64(uint_field(&fields, "entry_reason")?),
                },
            });
        }

        if frame.id == ping_response.can_id {
            let fields = unpack(&ping_response.fields, &frame.payload)?;
            return Ok(ListenerEvent::PingResponse {
                target: target_from_fields(&fields)?,
                bl_pending: bool_field(&fields, "bootloader_pending")?,
            });
        }

        if frame.id == software_build.can_id {
            let fields = unpack(&software_build.fields, &frame.payload)?;
            let target = target_from_fields(&fields)?;
            return Ok(ListenerEvent::SoftwareBuild {
                target,
                from_bootloader: self.tables.active_bootloaders.lock().unwrap().contains_key(&target),
                build: TargetSoftwareBuild {
                    commit_sha: uint_field(&fields, "commit_sha")? as u32,
                    dirty_repo: bool_field(&fields, "dirty_repo")?,
                },
            });
        }

        Ok(ListenerEvent::Ignored)
    }

    /// Targets currently known to have an active bootloader.
    #[must_use]
    pub fn active_bootloaders(&self) -> HashMap<Target, TargetBootloaderData> {
        self.tables.active_bootloaders.lock().unwrap().clone()
    }

    /// Targets currently known to be running application firmware.
    #[must_use]
    pub fn aware_applications(&self) -> HashMap<Target, ApplicationData> {
        self.tables.aware_applications.lock().unwrap().clone()
    }

    /// Latest software-build announcement seen from each target's
    /// bootloader side.
    #[must_use]
    pub fn bootloader_builds(&self) -> HashMap<Target, TargetSoftwareBuild> {
        self.tables.bootloader_builds.lock().unwrap().clone()
    }

    /// Latest software-build announcement seen from each target's
    /// application side.
    #[must_use]
    pub fn application_builds(&self) -> HashMap<Target, TargetSoftwareBuild> {
        self.tables.application_builds.lock().unwrap().clone()
    }

    /// The adapter's last-reported negotiated bit-rate, if any `Config`
    /// event has been observed yet.
    #[must_use]
    pub fn negotiated_bitrate(&self) -> Option<u32> {
        *self.tables.negotiated_bitrate.lock().unwrap()
    }

    /// Pause the ping cycler without tearing down its thread.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    /// Resume a previously paused ping cycler.
    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    /// Spawn the ping cycler thread, driving pings out over `transport`.
    /// The thread runs until the process exits; there is no join handle
    /// because the cycler's lifetime matches the host process's.
    pub fn spawn_ping_cycler<T: FrameTransport + 'static>(&self, transport: Arc<Mutex<T>>) {
        let tables = Arc::clone(&self.tables);
        let receiving_acks = Arc::clone(&self.receiving_acks);
        let paused = Arc::clone(&self.paused);
        let dictionary = Arc::clone(&self.dictionary);

        std::thread::spawn(move || {
            let ping = dictionary.message(MessageId::Ping);
            loop {
                let period =
                    if receiving_acks.load(Ordering::SeqCst) { PING_SLOW_PERIOD } else { PING_FAST_PERIOD };
                std::thread::sleep(period);

                if paused.load(Ordering::SeqCst) {
                    continue;
                }

                let active = tables.active_bootloaders.lock().unwrap().keys().copied().collect::<Vec<_>>();
                for target in Target::ALL {
                    if active.contains(&target) {
                        continue;
                    }
                    let mut fields = FieldTuple::new();
                    fields.insert("target".to_string(), FieldValue::Uint(target.to_wire()));
                    fields.insert("request_bootloader".to_string(), FieldValue::Bool(false));
                    if let Ok((payload, len)) = pack(&ping.fields, &fields) {
                        let mut guard = transport.lock().unwrap();
                        let _ = guard.send_std(ping.can_id as u16, &payload[..len]);
                    }
                }
            }
        });
    }
}

fn target_from_fields(fields: &FieldTuple) -> Result<Target> {
    let ordinal = uint_field(fields, "target")?;
    Target::from_wire(ordinal).ok_or_else(|| crate::error::Error::Codec(format!("target ordinal {ordinal} out of range")))
}

fn uint_field(fields: &FieldTuple, name: &str) -> Result<u64> {
    match fields.get(name) {
        Some(FieldValue::Uint(v)) => Ok(*v),
        Some(FieldValue::Enum(v)) => Ok(u64::from(*v)),
        _ => Err(crate::error::Error::Codec(format!("field '{name}' missing or wrong kind"))),
    }
}

fn bool_field(fields: &FieldTuple, name: &str) -> Result<bool> {
    match fields.get(name) {
        Some(FieldValue::Bool(v)) => Ok(*v),
        _ => Err(crate::error::Error::Codec(format!("field '{name}' missing or wrong kind"))),
    }
}

fn boot_state_from_u64(raw: u64) -> BootState {
    match raw {
        0 => BootState::FirmwareActive,
        1 => BootState::Ready,
        2 => BootState::Erasing,
        3 => BootState::Receiving,
        4 => BootState::Verifying,
        5 => BootState::BLpending,
        6 => BootState::FirmwareRunning,
        _ => BootState::Unknown,
    }
}

fn entry_reason_from_u64(raw: u64) -> EntryReason {
    match raw {
        0 => EntryReason::Requested,
        1 => EntryReason::Watchdog,
        _ => EntryReason::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::IdKind;

    fn frame_for(dict: &Dictionary, id: MessageId, fields: &FieldTuple) -> CanFrame {
        let resolved = dict.message(id);
        let (payload, len) = pack(&resolved.fields, fields).unwrap();
        CanFrame { id: resolved.can_id, id_kind: IdKind::Standard, payload: payload[..len].to_vec(), timestamp_us: 0 }
    }

    #[test]
    fn beacon_populates_active_bootloaders_and_clears_application_entry() {
        let dict = Arc::new(Dictionary::test_fixture());
        let listener = Listener::new(Arc::clone(&dict));

        let mut fields = FieldTuple::new();
        fields.insert("target".into(), FieldValue::Uint(0));
        fields.insert("bootloader_pending".into(), FieldValue::Bool(false));
        let ping_resp = frame_for(&dict, MessageId::PingResponse, &fields);
        listener.observe(&ping_resp).unwrap();
        assert!(listener.aware_applications().contains_key(&Target::Ams));

        let mut fields = FieldTuple::new();
        fields.insert("target".into(), FieldValue::Uint(0));
        fields.insert("state".into(), FieldValue::Uint(1));
        fields.insert("flash_size".into(), FieldValue::Uint(512));
        fields.insert("entry_reason".into(), FieldValue::Uint(0));
        let beacon = frame_for(&dict, MessageId::Beacon, &fields);
        listener.observe(&beacon).unwrap();

        assert!(listener.active_bootloaders().contains_key(&Target::Ams));
        assert!(!listener.aware_applications().contains_key(&Target::Ams));
    }

    #[test]
    fn ping_response_clears_active_bootloader_entry() {
        let dict = Arc::new(Dictionary::test_fixture());
        let listener = Listener::new(Arc::clone(&dict));

        let mut fields = FieldTuple::new();
        fields.insert("target".into(), FieldValue::Uint(1));
        fields.insert("state".into(), FieldValue::Uint(1));
        fields.insert("flash_size".into(), FieldValue::Uint(256));
        fields.insert("entry_reason".into(), FieldValue::Uint(0));
        let beacon = frame_for(&dict, MessageId::Beacon, &fields);
        listener.observe(&beacon).unwrap();
        assert!(listener.active_bootloaders().contains_key(&Target::Pdl));

        let mut fields = FieldTuple::new();
        fields.insert("target".into(), FieldValue::Uint(1));
        fields.insert("bootloader_pending".into(), FieldValue::Bool(true));
        let ping_resp = frame_for(&dict, MessageId::PingResponse, &fields);
        listener.observe(&ping_resp).unwrap();

        assert!(!listener.active_bootloaders().contains_key(&Target::Pdl));
        let apps = listener.aware_applications();
        assert!(apps.get(&Target::Pdl).unwrap().bl_pending);
    }

    #[test]
    fn unrecognized_frame_is_ignored() {
        let dict = Arc::new(Dictionary::test_fixture());
        let listener = Listener::new(Arc::clone(&dict));
        let frame = CanFrame { id: 0x7FF, id_kind: IdKind::Standard, payload: vec![0; 8], timestamp_us: 0 };
        assert!(matches!(listener.observe(&frame).unwrap(), ListenerEvent::Ignored));
    }

    #[test]
    fn pause_and_resume_toggle_flag_without_panicking() {
        let dict = Arc::new(Dictionary::test_fixture());
        let listener = Listener::new(dict);
        listener.pause();
        listener.resume();
    }

    #[test]
    fn config_event_records_negotiated_bitrate() {
        let dict = Arc::new(Dictionary::test_fixture());
        let listener = Listener::new(dict);
        assert_eq!(listener.negotiated_bitrate(), None);

        let event = AdapterEvent::Config { bitrate: 500_000, silent: false, loopback: false, forward: true };
        listener.observe_event(&event).unwrap();
        assert_eq!(listener.negotiated_bitrate(), Some(500_000));
    }

    #[test]
    fn acknowledgment_error_clears_receiving_acks_until_next_frame() {
        let dict = Arc::new(Dictionary::test_fixture());
        let listener = Listener::new(Arc::clone(&dict));

        let mut fields = FieldTuple::new();
        fields.insert("target".into(), FieldValue::Uint(0));
        fields.insert("bootloader_pending".into(), FieldValue::Bool(false));
        let ping_resp = frame_for(&dict, MessageId::PingResponse, &fields);
        listener.observe(&ping_resp).unwrap();
        assert!(listener.receiving_acks.load(Ordering::SeqCst));

        let error = AdapterEvent::Error { tec: 0, rec: 0, kind: CanErrorKind::Acknowledgment, timestamp_us: 0 };
        listener.observe_event(&error).unwrap();
        assert!(!listener.receiving_acks.load(Ordering::SeqCst));

        listener.observe_event(&AdapterEvent::Frame(ping_resp)).unwrap();
        assert!(listener.receiving_acks.load(Ordering::SeqCst));
    }
}
