//! Frame Transport: the abstract boundary to the CAN-USB adapter.
//!
//! Generalizes this lineage's byte-stream `Port`/`ConnectionPort`
//! abstraction one level up: the unit of I/O here is a discrete CAN frame
//! or adapter event, not a byte. [`SerialFrameTransport`] binds the trait
//! to a length-prefixed framing over a blocking serial line, which is the
//! concrete binding the reference adapter uses.

use std::time::Duration;

use crate::error::Result;

/// Whether a frame carries an 11-bit standard or 29-bit extended CAN id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdKind {
    /// 11-bit standard identifier.
    Standard,
    /// 29-bit extended identifier.
    Extended,
}

/// One received CAN frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanFrame {
    /// CAN identifier.
    pub id: u32,
    /// Standard vs. extended identifier.
    pub id_kind: IdKind,
    /// Up to 8 payload bytes.
    pub payload: Vec<u8>,
    /// Adapter-assigned timestamp, in microseconds, monotonically
    /// increasing for the lifetime of the connection.
    pub timestamp_us: u64,
}

/// Sub-kind of an adapter-reported CAN error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanErrorKind {
    /// An acknowledgement slot on the bus went unanswered.
    Acknowledgment,
    /// Bus entered a passive or bus-off state.
    BusState,
    /// Any other reported error condition.
    Other,
}

/// Desired adapter bit-rate configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitrateSetting {
    /// Let the adapter auto-detect the bus bit-rate.
    Auto,
    /// Force a specific bit-rate, in bits per second.
    Manual(u32),
}

/// An event delivered by the Frame Transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterEvent {
    /// A received CAN frame.
    Frame(CanFrame),
    /// A CAN bus error condition.
    Error {
        /// Transmit error counter.
        tec: u8,
        /// Receive error counter.
        rec: u8,
        /// Error sub-kind.
        kind: CanErrorKind,
        /// Adapter timestamp, in microseconds.
        timestamp_us: u64,
    },
    /// Raw adapter error-flag bits, in response to `query_error_flags`.
    ErrorFlags(u32),
    /// Frame counters, informational only.
    Counters {
        /// Frames received since connection.
        rx: u64,
        /// Frames transmitted since connection.
        tx: u64,
    },
    /// The adapter's current negotiated configuration.
    Config {
        /// Bus bit-rate, in bits per second.
        bitrate: u32,
        /// Whether the adapter is in silent (listen-only) mode.
        silent: bool,
        /// Whether the adapter is in internal loopback mode.
        loopback: bool,
        /// Whether received frames are being forwarded to the host.
        forward: bool,
    },
    /// Adapter firmware/hardware version information.
    Version {
        /// Protocol version.
        protocol: u8,
        /// Adapter software version.
        sw: u8,
        /// Adapter hardware version.
        hw: u8,
        /// Hardware revision.
        hw_rev: u8,
    },
    /// A human-readable interface identifier string.
    InterfaceId(String),
    /// Periodic adapter liveness marker.
    Heartbeat,
}

/// A bidirectional channel delivering discrete CAN frames and
/// error/heartbeat/config notifications, and accepting outbound frames
/// and control commands.
pub trait FrameTransport: Send {
    /// Transmit a standard (11-bit id) frame.
    fn send_std(&mut self, id: u16, data: &[u8]) -> Result<()>;

    /// Transmit an extended (29-bit id) frame.
    fn send_ext(&mut self, id: u32, data: &[u8]) -> Result<()>;

    /// Put the adapter into (or take it out of) silent/listen-only mode.
    fn set_silent(&mut self, silent: bool) -> Result<()>;

    /// Enable or disable forwarding received frames to the host.
    fn set_forward_rx(&mut self, forward: bool) -> Result<()>;

    /// Request a bit-rate change.
    fn set_bitrate(&mut self, bitrate: BitrateSetting) -> Result<()>;

    /// Ask the adapter to report its current error flags.
    fn query_error_flags(&mut self) -> Result<()>;

    /// Ask the adapter to report its current configuration.
    fn query_config(&mut self) -> Result<()>;

    /// Reset the adapter.
    fn reset(&mut self) -> Result<()>;

    /// Block for up to `timeout` waiting for the next event. Returns
    /// `Ok(None)` on a timeout with nothing received.
    fn recv(&mut self, timeout: Duration) -> Result<Option<AdapterEvent>>;
}

/// The 24-byte sync frame written (and re-read) to resynchronize framing
/// with the reference adapter after a reset.
pub const SYNC_FRAME: [u8; 24] = [0xAA; 24];

#[cfg(feature = "native")]
pub mod serial {
    //! A concrete [`super::FrameTransport`] binding over a blocking
    //! serial line, using a simple length-prefixed byte framing at
    //! 115200 bps.

    use std::io::{Read, Write};
    use std::time::{Duration, Instant};

    use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

    use super::{AdapterEvent, BitrateSetting, CanErrorKind, CanFrame, IdKind, SYNC_FRAME};
    use crate::error::{Error, Result};

    const BAUD_RATE: u32 = 115_200;

    /// Wire-level command tags sent to the adapter.
    #[repr(u8)]
    enum Command {
        SendStd = 0x01,
        SendExt = 0x02,
        SetSilent = 0x03,
        SetForwardRx = 0x04,
        SetBitrateAuto = 0x05,
        SetBitrateManual = 0x06,
        QueryErrorFlags = 0x07,
        QueryConfig = 0x08,
        Reset = 0x09,
    }

    /// Wire-level event tags received from the adapter.
    #[repr(u8)]
    enum EventTag {
        FrameStd = 0x81,
        FrameExt = 0x82,
        Error = 0x83,
        ErrorFlags = 0x84,
        Counters = 0x85,
        Config = 0x86,
        Version = 0x87,
        InterfaceId = 0x88,
        Heartbeat = 0x89,
    }

    /// A serial-line Frame Transport binding.
    pub struct SerialFrameTransport {
        port: Box<dyn serialport::SerialPort>,
    }

    impl SerialFrameTransport {
        /// Open the named serial device and perform the adapter's
        /// sync-frame handshake.
        pub fn open(device: &str) -> Result<Self> {
            let mut port = serialport::new(device, BAUD_RATE)
                .timeout(Duration::from_millis(200))
                .open()?;

            port.write_all(&SYNC_FRAME)?;
            Self::resync(port.as_mut())?;

            Ok(Self { port })
        }

        fn resync(port: &mut dyn serialport::SerialPort) -> Result<()> {
            let deadline = Instant::now() + Duration::from_secs(2);
            let mut run = 0usize;
            let mut byte = [0u8; 1];
            while Instant::now() < deadline {
                match port.read(&mut byte) {
                    Ok(1) if byte[0] == 0xAA => {
                        run += 1;
                        if run >= SYNC_FRAME.len() {
                            return Ok(());
                        }
                    },
                    Ok(_) => run = 0,
                    Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {},
                    Err(e) => return Err(Error::Io(e)),
                }
            }
            Err(Error::Transport("timed out waiting for adapter sync frame".into()))
        }

        fn write_command(&mut self, tag: Command, payload: &[u8]) -> Result<()> {
            let mut frame = Vec::with_capacity(payload.len() + 2);
            frame.push(tag as u8);
            frame.push(payload.len() as u8);
            frame.extend_from_slice(payload);
            self.port.write_all(&frame)?;
            Ok(())
        }

        fn send_frame(&mut self, id: u32, id_kind: IdKind, data: &[u8]) -> Result<()> {
            if data.len() > 8 {
                return Err(Error::Transport("CAN payload longer than 8 bytes".into()));
            }
            let mut payload = Vec::with_capacity(5 + data.len());
            payload.write_u32::<LittleEndian>(id)?;
            payload.push(data.len() as u8);
            payload.extend_from_slice(data);

            let tag = match id_kind {
                IdKind::Standard => Command::SendStd,
                IdKind::Extended => Command::SendExt,
            };
            self.write_command(tag, &payload)
        }
    }

    impl super::FrameTransport for SerialFrameTransport {
        fn send_std(&mut self, id: u16, data: &[u8]) -> Result<()> {
            self.send_frame(u32::from(id), IdKind::Standard, data)
        }

        fn send_ext(&mut self, id: u32, data: &[u8]) -> Result<()> {
            self.send_frame(id, IdKind::Extended, data)
        }

        fn set_silent(&mut self, silent: bool) -> Result<()> {
            self.write_command(Command::SetSilent, &[u8::from(silent)])
        }

        fn set_forward_rx(&mut self, forward: bool) -> Result<()> {
            self.write_command(Command::SetForwardRx, &[u8::from(forward)])
        }

        fn set_bitrate(&mut self, bitrate: BitrateSetting) -> Result<()> {
            match bitrate {
                BitrateSetting::Auto => self.write_command(Command::SetBitrateAuto, &[]),
                BitrateSetting::Manual(rate) => {
                    let mut payload = Vec::with_capacity(4);
                    payload.write_u32::<LittleEndian>(rate)?;
                    self.write_command(Command::SetBitrateManual, &payload)
                },
            }
        }

        fn query_error_flags(&mut self) -> Result<()> {
            self.write_command(Command::QueryErrorFlags, &[])
        }

        fn query_config(&mut self) -> Result<()> {
            self.write_command(Command::QueryConfig, &[])
        }

        fn reset(&mut self) -> Result<()> {
            self.write_command(Command::Reset, &[])?;
            Self::resync(self.port.as_mut())
        }

        fn recv(&mut self, timeout: Duration) -> Result<Option<AdapterEvent>> {
            self.port.set_timeout(timeout)?;
            let mut tag_byte = [0u8; 1];
            match self.port.read(&mut tag_byte) {
                Ok(0) => Ok(None),
                Ok(_) => Ok(Some(self.read_event(tag_byte[0])?)),
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(None),
                Err(e) => Err(Error::Io(e)),
            }
        }
    }

    impl SerialFrameTransport {
        fn read_event(&mut self, tag: u8) -> Result<AdapterEvent> {
            let mut len_byte = [0u8; 1];
            self.port.read_exact(&mut len_byte)?;
            let mut body = vec![0u8; len_byte[0] as usize];
            self.port.read_exact(&mut body)?;
            let mut cursor = std::io::Cursor::new(body);

            let event = if tag == EventTag::FrameStd as u8 || tag == EventTag::FrameExt as u8 {
                let id = cursor.read_u32::<LittleEndian>()?;
                let len = cursor.read_u8()? as usize;
                let mut payload = vec![0u8; len];
                cursor.read_exact(&mut payload)?;
                let timestamp_us = cursor.read_u64::<LittleEndian>()?;
                let id_kind = if tag == EventTag::FrameStd as u8 { IdKind::Standard } else { IdKind::Extended };
                AdapterEvent::Frame(CanFrame { id, id_kind, payload, timestamp_us })
            } else if tag == EventTag::Error as u8 {
                let tec = cursor.read_u8()?;
                let rec = cursor.read_u8()?;
                let kind_byte = cursor.read_u8()?;
                let kind = match kind_byte {
                    0 => CanErrorKind::Acknowledgment,
                    1 => CanErrorKind::BusState,
                    _ => CanErrorKind::Other,
                };
                let timestamp_us = cursor.read_u64::<LittleEndian>()?;
                AdapterEvent::Error { tec, rec, kind, timestamp_us }
            } else if tag == EventTag::ErrorFlags as u8 {
                AdapterEvent::ErrorFlags(cursor.read_u32::<LittleEndian>()?)
            } else if tag == EventTag::Counters as u8 {
                let rx = cursor.read_u64::<LittleEndian>()?;
                let tx = cursor.read_u64::<LittleEndian>()?;
                AdapterEvent::Counters { rx, tx }
            } else if tag == EventTag::Config as u8 {
                let bitrate = cursor.read_u32::<LittleEndian>()?;
                let flags = cursor.read_u8()?;
                AdapterEvent::Config {
                    bitrate,
                    silent: flags & 0x01 != 0,
                    loopback: flags & 0x02 != 0,
                    forward: flags & 0x04 != 0,
                }
            } else if tag == EventTag::Version as u8 {
                AdapterEvent::Version {
                    protocol: cursor.read_u8()?,
                    sw: cursor.read_u8()?,
                    hw: cursor.read_u8()?,
                    hw_rev: cursor.read_u8()?,
                }
            } else if tag == EventTag::InterfaceId as u8 {
                let bytes = cursor.into_inner();
                AdapterEvent::InterfaceId(String::from_utf8_lossy(&bytes).into_owned())
            } else if tag == EventTag::Heartbeat as u8 {
                AdapterEvent::Heartbeat
            } else {
                return Err(Error::Transport(format!("unknown adapter event tag {tag:#04x}")));
            };

            Ok(event)
        }
    }
}

#[cfg(feature = "native")]
pub use serial::SerialFrameTransport;

/// An in-memory, scripted [`FrameTransport`] used by engine/listener
/// tests: outbound frames are recorded, and a pre-loaded queue of events
/// is handed back on `recv`.
#[cfg(test)]
pub mod mock {
    use std::collections::VecDeque;
    use std::time::Duration;

    use super::{AdapterEvent, BitrateSetting, CanFrame, FrameTransport, IdKind};
    use crate::error::Result;

    /// One outbound frame recorded by [`MockTransport`].
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct SentFrame {
        /// CAN identifier sent.
        pub id: u32,
        /// Standard vs. extended.
        pub id_kind: IdKind,
        /// Payload bytes sent.
        pub data: Vec<u8>,
    }

    /// A scripted transport: `recv()` drains `inbound`; every `send_*`
    /// call is appended to `sent`.
    #[derive(Default)]
    pub struct MockTransport {
        /// Events returned in order by successive `recv()` calls.
        pub inbound: VecDeque<AdapterEvent>,
        /// Frames sent via `send_std`/`send_ext`, in call order.
        pub sent: Vec<SentFrame>,
    }

    impl MockTransport {
        /// Push a frame to be returned by a future `recv()` call.
        pub fn push_frame(&mut self, id: u32, id_kind: IdKind, payload: Vec<u8>, timestamp_us: u64) {
            self.inbound
                .push_back(AdapterEvent::Frame(CanFrame { id, id_kind, payload, timestamp_us }));
        }
    }

    impl FrameTransport for MockTransport {
        fn send_std(&mut self, id: u16, data: &[u8]) -> Result<()> {
            self.sent.push(SentFrame { id: u32::from(id), id_kind: IdKind::Standard, data: data.to_vec() });
            Ok(())
        }

        fn send_ext(&mut self, id: u32, data: &[u8]) -> Result<()> {
            self.sent.push(SentFrame { id, id_kind: IdKind::Extended, data: data.to_vec() });
            Ok(())
        }

        fn set_silent(&mut self, _silent: bool) -> Result<()> {
            Ok(())
        }

        fn set_forward_rx(&mut self, _forward: bool) -> Result<()> {
            Ok(())
        }

        fn set_bitrate(&mut self, _bitrate: BitrateSetting) -> Result<()> {
            Ok(())
        }

        fn query_error_flags(&mut self) -> Result<()> {
            Ok(())
        }

        fn query_config(&mut self) -> Result<()> {
            Ok(())
        }

        fn reset(&mut self) -> Result<()> {
            Ok(())
        }

        fn recv(&mut self, _timeout: Duration) -> Result<Option<AdapterEvent>> {
            Ok(self.inbound.pop_front())
        }
    }
}
