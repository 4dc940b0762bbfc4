//! Symbol Dictionary façade.
//!
//! The canDB JSON format itself (a versioned dictionary of packages to
//! units to message/field/enum descriptors) is an external collaborator:
//! its grammar and the bulk of its contents are out of scope here. This
//! module loads just enough of it — the shape of the handful of messages
//! the Protocol Engine and Listener actually speak — validates it once at
//! startup, and thereafter hands out compact [`MessageId`] handles rather
//! than string lookups, per the "fail fast at startup, not mid-flash"
//! re-architecture this tool's dynamic-symbol-lookup predecessor needed.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::codec::{FieldDef, FieldKind, FieldLayout, MessageDef};
use crate::error::{Error, Result};

/// A compact handle for one message this tool speaks, replacing the
/// string-keyed `Bootloader::Beacon`-style lookups of the dictionary's
/// source format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageId {
    /// `ECU -> host`: bootloader presence/state announcement.
    Beacon,
    /// `host -> ECU`: presence/entry solicitation.
    Ping,
    /// `ECU -> host`: reply to `Ping`.
    PingResponse,
    /// Broadcast commit/dirty-flag announcement.
    SoftwareBuild,
    /// `either`: one step of the protocol dialog.
    Handshake,
    /// `either`: acknowledgement of a `Handshake`.
    HandshakeAck,
    /// `host -> ECU`: one streamed data word.
    Data,
    /// `ECU -> host`: acknowledgement of accumulated `Data` frames.
    DataAck,
    /// `host -> ECU`: request to leave bootloader mode.
    ExitReq,
    /// `ECU -> host`: reply to `ExitReq`.
    ExitAck,
    /// `either`: hands conversational control to the other side.
    CommunicationYield,
}

impl MessageId {
    /// Every message name the engine/listener reference. Used to drive
    /// dictionary validation at load time.
    pub const ALL: [MessageId; 11] = [
        MessageId::Beacon,
        MessageId::Ping,
        MessageId::PingResponse,
        MessageId::SoftwareBuild,
        MessageId::Handshake,
        MessageId::HandshakeAck,
        MessageId::Data,
        MessageId::DataAck,
        MessageId::ExitReq,
        MessageId::ExitAck,
        MessageId::CommunicationYield,
    ];

    fn canonical_name(self) -> &'static str {
        match self {
            MessageId::Beacon => "Beacon",
            MessageId::Ping => "Ping",
            MessageId::PingResponse => "PingResponse",
            MessageId::SoftwareBuild => "SoftwareBuild",
            MessageId::Handshake => "Handshake",
            MessageId::HandshakeAck => "HandshakeAck",
            MessageId::Data => "Data",
            MessageId::DataAck => "DataAck",
            MessageId::ExitReq => "ExitReq",
            MessageId::ExitAck => "ExitAck",
            MessageId::CommunicationYield => "CommunicationYield",
        }
    }
}

/// One resolved message: its base CAN identifier and field layout.
#[derive(Debug, Clone)]
pub struct ResolvedMessage {
    /// Base CAN identifier (combined with the target's offset for
    /// per-target messages, at the caller's discretion).
    pub can_id: u32,
    /// Field layout used by [`crate::codec::pack`]/[`crate::codec::unpack`].
    pub fields: MessageDef,
}

/// A validated, loaded canDB dictionary, narrowed to the symbols this
/// tool uses.
#[derive(Debug, Clone)]
pub struct Dictionary {
    messages: HashMap<MessageId, ResolvedMessage>,
}

#[derive(Debug, Deserialize)]
struct RawRoot {
    version: u32,
    packages: HashMap<String, RawPackage>,
}

#[derive(Debug, Deserialize)]
struct RawPackage {
    units: HashMap<String, RawUnit>,
}

#[derive(Debug, Deserialize)]
struct RawUnit {
    messages: HashMap<String, RawMessage>,
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    id: u32,
    fields: HashMap<String, RawField>,
}

#[derive(Debug, Deserialize)]
struct RawField {
    #[serde(rename = "type")]
    ty: String,
    pos_offset: u32,
    bits: u32,
    #[serde(default = "default_factor")]
    factor: f64,
    #[serde(default)]
    offset: f64,
}

fn default_factor() -> f64 {
    1.0
}

impl Dictionary {
    /// Load and validate a dictionary from one or more canDB JSON files.
    /// Later files override messages of the same name from earlier ones.
    pub fn load(paths: &[impl AsRef<Path>]) -> Result<Dictionary> {
        let mut raw_messages: HashMap<String, RawMessage> = HashMap::new();

        for path in paths {
            let text = std::fs::read_to_string(path)?;
            let root: RawRoot = serde_json::from_str(&text)?;
            if root.version != 2 {
                return Err(Error::Dictionary(format!(
                    "unsupported canDB version {} in {}",
                    root.version,
                    path.as_ref().display()
                )));
            }
            for package in root.packages.into_values() {
                for unit in package.units.into_values() {
                    raw_messages.extend(unit.messages);
                }
            }
        }

        Self::from_raw(raw_messages)
    }

    /// Build directly from an in-memory JSON-shaped map, primarily for
    /// tests that do not want to write a canDB file to disk.
    fn from_raw(raw_messages: HashMap<String, RawMessage>) -> Result<Dictionary> {
        let mut messages = HashMap::new();

        for id in MessageId::ALL {
            let name = id.canonical_name();
            let raw = raw_messages
                .get(name)
                .ok_or_else(|| Error::Dictionary(format!("dictionary is missing required message '{name}'")))?;

            let mut fields = Vec::with_capacity(raw.fields.len());
            for (field_name, raw_field) in &raw.fields {
                let kind = match raw_field.ty.as_str() {
                    "uint" => FieldKind::Uint { factor: raw_field.factor, offset: raw_field.offset },
                    "int" => FieldKind::Int { factor: raw_field.factor, offset: raw_field.offset },
                    "bool" => FieldKind::Bool,
                    "enum" => FieldKind::Enum,
                    other => {
                        return Err(Error::Dictionary(format!(
                            "message '{name}' field '{field_name}' has unsupported type '{other}'"
                        )));
                    },
                };
                fields.push(FieldDef {
                    name: field_name.clone(),
                    layout: FieldLayout { pos_offset: raw_field.pos_offset, bits: raw_field.bits },
                    kind,
                });
            }
            fields.sort_by_key(|f| f.layout.pos_offset);

            messages.insert(id, ResolvedMessage { can_id: raw.id, fields });
        }

        Ok(Dictionary { messages })
    }

    /// Look up a resolved message by its compact handle. Infallible once
    /// the dictionary has passed [`Dictionary::load`]'s validation.
    #[must_use]
    pub fn message(&self, id: MessageId) -> &ResolvedMessage {
        self.messages
            .get(&id)
            .expect("MessageId::ALL is validated exhaustively at load time")
    }

    /// A minimal hand-built dictionary covering every message the engine
    /// and listener reference, for use in tests that should not depend on
    /// a real canDB file.
    #[cfg(test)]
    #[must_use]
    pub fn test_fixture() -> Dictionary {
        use std::collections::HashMap as Map;

        fn uint(pos: u32, bits: u32) -> RawField {
            RawField { ty: "uint".into(), pos_offset: pos, bits, factor: default_factor(), offset: 0.0 }
        }
        fn boolean(pos: u32) -> RawField {
            RawField { ty: "bool".into(), pos_offset: pos, bits: 1, factor: default_factor(), offset: 0.0 }
        }

        let mut raw = Map::new();
        raw.insert(
            "Beacon".to_string(),
            RawMessage {
                id: 0x100,
                fields: Map::from([
                    ("target".to_string(), uint(0, 4)),
                    ("state".to_string(), uint(4, 4)),
                    ("flash_size".to_string(), uint(8, 16)),
                    ("entry_reason".to_string(), uint(24, 4)),
                ]),
            },
        );
        raw.insert(
            "Ping".to_string(),
            RawMessage {
                id: 0x110,
                fields: Map::from([
                    ("target".to_string(), uint(0, 4)),
                    ("request_bootloader".to_string(), boolean(4)),
                ]),
            },
        );
        raw.insert(
            "PingResponse".to_string(),
            RawMessage {
                id: 0x120,
                fields: Map::from([
                    ("target".to_string(), uint(0, 4)),
                    ("bootloader_pending".to_string(), boolean(4)),
                ]),
            },
        );
        raw.insert(
            "SoftwareBuild".to_string(),
            RawMessage {
                id: 0x130,
                fields: Map::from([
                    ("target".to_string(), uint(0, 4)),
                    ("commit_sha".to_string(), uint(8, 32)),
                    ("dirty_repo".to_string(), boolean(40)),
                ]),
            },
        );
        raw.insert(
            "Handshake".to_string(),
            RawMessage {
                id: 0x140,
                fields: Map::from([
                    ("register".to_string(), uint(0, 8)),
                    ("command".to_string(), uint(8, 8)),
                    ("target".to_string(), uint(16, 4)),
                    ("value".to_string(), uint(32, 32)),
                ]),
            },
        );
        raw.insert(
            "HandshakeAck".to_string(),
            RawMessage {
                id: 0x150,
                fields: Map::from([
                    ("register".to_string(), uint(0, 8)),
                    ("target".to_string(), uint(16, 4)),
                    ("response".to_string(), uint(20, 4)),
                    ("value".to_string(), uint(32, 32)),
                ]),
            },
        );
        raw.insert(
            "Data".to_string(),
            RawMessage {
                id: 0x160,
                fields: Map::from([
                    ("address".to_string(), uint(0, 24)),
                    ("is_doubleword".to_string(), boolean(24)),
                    ("value".to_string(), uint(32, 32)),
                ]),
            },
        );
        raw.insert(
            "DataAck".to_string(),
            RawMessage {
                id: 0x170,
                fields: Map::from([
                    ("address".to_string(), uint(0, 24)),
                    ("result".to_string(), uint(24, 4)),
                ]),
            },
        );
        raw.insert(
            "ExitReq".to_string(),
            RawMessage {
                id: 0x180,
                fields: Map::from([
                    ("target".to_string(), uint(0, 4)),
                    ("force".to_string(), boolean(4)),
                    ("to_app".to_string(), boolean(5)),
                ]),
            },
        );
        raw.insert(
            "ExitAck".to_string(),
            RawMessage {
                id: 0x190,
                fields: Map::from([
                    ("target".to_string(), uint(0, 4)),
                    ("confirmed".to_string(), boolean(4)),
                ]),
            },
        );
        raw.insert(
            "CommunicationYield".to_string(),
            RawMessage { id: 0x1A0, fields: Map::from([("target".to_string(), uint(0, 4))]) },
        );

        Dictionary::from_raw(raw).expect("hand-built fixture is internally consistent")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixture_resolves_every_required_message() {
        let dict = Dictionary::test_fixture();
        for id in MessageId::ALL {
            let resolved = dict.message(id);
            assert!(!resolved.fields.is_empty());
        }
    }

    #[test]
    fn missing_message_fails_validation() {
        let raw = HashMap::new();
        let err = Dictionary::from_raw(raw).unwrap_err();
        assert!(matches!(err, Error::Dictionary(_)));
    }
}
