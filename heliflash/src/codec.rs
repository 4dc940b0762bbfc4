//! Message Codec: packs and unpacks CAN payload bytes against a typed
//! field layout.
//!
//! A [`MessageDef`] is an ordered list of [`FieldDef`]s, each naming its
//! bit position (`pos_offset`, counted in bits from the LSB of payload
//! byte 0) and width (`bits`). [`pack`] writes a [`FieldValue`] map into
//! an 8-byte payload; [`unpack`] is the reverse. Multiplexed fields
//! recurse into one of several nested field lists chosen by a selector
//! value.

use std::collections::BTreeMap;

use crate::error::{Error, Result};

/// Maximum CAN payload length this codec operates on.
pub const MAX_PAYLOAD_LEN: usize = 8;

/// The declared shape of one field: where it lives and how wide it is.
#[derive(Debug, Clone, Copy)]
pub struct FieldLayout {
    /// Bit offset from the LSB of payload byte 0.
    pub pos_offset: u32,
    /// Width in bits.
    pub bits: u32,
}

/// One case of a multiplexed field: the selector value that activates it,
/// plus the field list decoded/encoded when that selector is seen.
#[derive(Debug, Clone)]
pub struct MultiplexCase {
    /// Selector value that selects this case.
    pub selector: u32,
    /// Fields present when this case is selected.
    pub fields: Vec<FieldDef>,
}

/// The type and numeric interpretation of one field.
#[derive(Debug, Clone)]
pub enum FieldKind {
    /// Unsigned integer. Physical value = raw * factor + offset.
    Uint {
        /// Scale applied to the raw integer.
        factor: f64,
        /// Additive offset applied after scaling.
        offset: f64,
    },
    /// Signed (two's complement, sign-extended from `bits`) integer.
    Int {
        /// Scale applied to the raw integer.
        factor: f64,
        /// Additive offset applied after scaling.
        offset: f64,
    },
    /// Single-bit boolean.
    Bool,
    /// Enumerator, sized to hold the enum's declared min/max raw value.
    Enum,
    /// One of several nested field lists, chosen by this field's own
    /// decoded value (the field's own `layout`/`kind` describe the
    /// selector itself, typically `Uint`/`Enum`).
    Multiplex {
        /// The cases this selector may choose between.
        cases: Vec<MultiplexCase>,
    },
    /// `count` back-to-back repetitions of `item`.
    Array {
        /// Per-element layout/kind, excluding `pos_offset` (computed per
        /// repetition as `base.pos_offset + i * item_bits`).
        item: Box<FieldKind>,
        /// Width in bits of one element.
        item_bits: u32,
        /// Number of repetitions.
        count: u32,
    },
}

/// One named field in a [`MessageDef`].
#[derive(Debug, Clone)]
pub struct FieldDef {
    /// Field name, used as the key in [`FieldValue`] maps.
    pub name: String,
    /// Bit position and width.
    pub layout: FieldLayout,
    /// Type and numeric interpretation.
    pub kind: FieldKind,
}

/// An ordered list of fields describing one CAN message's payload.
pub type MessageDef = Vec<FieldDef>;

/// A decoded or to-be-encoded field value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// Decoded unsigned value (raw, pre-factor/offset applied as f64).
    Uint(u64),
    /// Decoded signed value.
    Int(i64),
    /// Decoded boolean.
    Bool(bool),
    /// Decoded enumerator raw value.
    Enum(u32),
    /// Decoded array elements.
    Array(Vec<FieldValue>),
    /// Decoded multiplexed submessage: the selector's raw value, plus the
    /// chosen case's decoded fields.
    Multiplex(u32, BTreeMap<String, FieldValue>),
}

/// A fully decoded/encodable message: field name -> value.
pub type FieldTuple = BTreeMap<String, FieldValue>;

/// Build a little-endian integer from the bytes covering `[pos_offset,
/// pos_offset + bits)`, shift right by the sub-byte offset, and mask to
/// `bits`.
fn extract_bits(payload: &[u8], pos_offset: u32, bits: u32) -> Result<u64> {
    if bits == 0 || bits > 64 {
        return Err(Error::Codec(format!("field width {bits} out of range")));
    }
    let start_byte = (pos_offset / 8) as usize;
    let end_byte = ((pos_offset + bits) as usize).div_ceil(8);
    if end_byte > payload.len() {
        return Err(Error::Codec(format!(
            "field at bit {pos_offset} width {bits} extends past {}-byte payload",
            payload.len()
        )));
    }

    let mut acc: u128 = 0;
    for (i, b) in payload[start_byte..end_byte].iter().enumerate() {
        acc |= u128::from(*b) << (8 * i);
    }
    let sub_offset = pos_offset % 8;
    let mask: u128 = if bits >= 128 { u128::MAX } else { (1u128 << bits) - 1 };
    Ok(((acc >> sub_offset) & mask) as u64)
}

/// Shift `value` left by the sub-byte offset and OR it into the bytes
/// covering `[pos_offset, pos_offset + bits)`. Fails if that window
/// would write past the payload length.
fn insert_bits(payload: &mut [u8], pos_offset: u32, bits: u32, value: u64) -> Result<()> {
    if bits == 0 || bits > 64 {
        return Err(Error::Codec(format!("field width {bits} out of range")));
    }
    let start_byte = (pos_offset / 8) as usize;
    let end_byte = ((pos_offset + bits) as usize).div_ceil(8);
    if end_byte > payload.len() {
        return Err(Error::Codec(format!(
            "field at bit {pos_offset} width {bits} would write past {}-byte payload",
            payload.len()
        )));
    }

    let mask: u128 = if bits >= 128 { u128::MAX } else { (1u128 << bits) - 1 };
    let sub_offset = pos_offset % 8;
    let shifted_value = (u128::from(value) & mask) << sub_offset;
    let shifted_mask = mask << sub_offset;

    for (i, byte) in payload[start_byte..end_byte].iter_mut().enumerate() {
        let byte_mask = ((shifted_mask >> (8 * i)) & 0xFF) as u8;
        let byte_val = ((shifted_value >> (8 * i)) & 0xFF) as u8;
        *byte = (*byte & !byte_mask) | (byte_val & byte_mask);
    }
    Ok(())
}

fn sign_extend(raw: u64, bits: u32) -> i64 {
    if bits >= 64 {
        return raw as i64;
    }
    let shift = 64 - bits;
    ((raw << shift) as i64) >> shift
}

/// Pack a field tuple into an 8-byte CAN payload.
///
/// Returns the payload bytes and the number of bytes actually touched
/// (the highest byte index written to, plus one; at least 1).
pub fn pack(def: &MessageDef, values: &FieldTuple) -> Result<([u8; MAX_PAYLOAD_LEN], usize)> {
    let mut payload = [0u8; MAX_PAYLOAD_LEN];
    let mut used_len = 1usize;
    pack_fields(def, values, &mut payload, &mut used_len)?;
    Ok((payload, used_len))
}

fn pack_fields(
    def: &[FieldDef],
    values: &FieldTuple,
    payload: &mut [u8; MAX_PAYLOAD_LEN],
    used_len: &mut usize,
) -> Result<()> {
    for field in def {
        let value = values
            .get(&field.name)
            .ok_or_else(|| Error::Codec(format!("missing value for field '{}'", field.name)))?;
        pack_one(field, value, payload, used_len)?;
    }
    Ok(())
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn pack_one(
    field: &FieldDef,
    value: &FieldValue,
    payload: &mut [u8; MAX_PAYLOAD_LEN],
    used_len: &mut usize,
) -> Result<()> {
    let layout = field.layout;
    match (&field.kind, value) {
        (FieldKind::Uint { factor, offset }, FieldValue::Uint(physical)) => {
            let raw = physical_to_raw(*physical as f64, *factor, *offset, &field.name)?;
            check_unsigned_range(raw, layout.bits, &field.name)?;
            insert_bits(payload, layout.pos_offset, layout.bits, raw)?;
        },
        (FieldKind::Int { factor, offset }, FieldValue::Int(physical)) => {
            let raw_signed = physical_to_raw(*physical as f64, *factor, *offset, &field.name)? as i64;
            check_signed_range(raw_signed, layout.bits, &field.name)?;
            let raw = (raw_signed as u64) & mask_for(layout.bits);
            insert_bits(payload, layout.pos_offset, layout.bits, raw)?;
        },
        (FieldKind::Bool, FieldValue::Bool(b)) => {
            insert_bits(payload, layout.pos_offset, layout.bits, u64::from(*b))?;
        },
        (FieldKind::Enum, FieldValue::Enum(e)) => {
            check_unsigned_range(u64::from(*e), layout.bits, &field.name)?;
            insert_bits(payload, layout.pos_offset, layout.bits, u64::from(*e))?;
        },
        (FieldKind::Array { item, item_bits, count }, FieldValue::Array(elements)) => {
            if elements.len() as u32 != *count {
                return Err(Error::Codec(format!(
                    "array field '{}' expects {count} elements, got {}",
                    field.name,
                    elements.len()
                )));
            }
            for (i, element) in elements.iter().enumerate() {
                let element_field = FieldDef {
                    name: field.name.clone(),
                    layout: FieldLayout {
                        pos_offset: layout.pos_offset + i as u32 * item_bits,
                        bits: *item_bits,
                    },
                    kind: (**item).clone(),
                };
                pack_one(&element_field, element, payload, used_len)?;
            }
        },
        (FieldKind::Multiplex { cases }, FieldValue::Multiplex(selector, sub_values)) => {
            check_unsigned_range(u64::from(*selector), layout.bits, &field.name)?;
            insert_bits(payload, layout.pos_offset, layout.bits, u64::from(*selector))?;
            let case = cases
                .iter()
                .find(|c| c.selector == *selector)
                .ok_or_else(|| {
                    Error::Codec(format!(
                        "multiplex selector {selector} for field '{}' has no declared case",
                        field.name
                    ))
                })?;
            pack_fields(&case.fields, sub_values, payload, used_len)?;
        },
        _ => {
            return Err(Error::Codec(format!(
                "value type for field '{}' does not match its declared kind",
                field.name
            )));
        },
    }

    let touched = ((layout.pos_offset + layout.bits) as usize).div_ceil(8);
    *used_len = (*used_len).max(touched).min(MAX_PAYLOAD_LEN);
    Ok(())
}

fn mask_for(bits: u32) -> u64 {
    if bits >= 64 { u64::MAX } else { (1u64 << bits) - 1 }
}

fn physical_to_raw(physical: f64, factor: f64, offset: f64, field_name: &str) -> Result<f64> {
    if factor == 0.0 {
        return Err(Error::Codec(format!("field '{field_name}' has a zero factor")));
    }
    Ok(((physical - offset) / factor).round())
}

fn check_unsigned_range(raw: u64, bits: u32, field_name: &str) -> Result<()> {
    if raw > mask_for(bits) {
        return Err(Error::Codec(format!(
            "value {raw} is out of range for {bits}-bit field '{field_name}'"
        )));
    }
    Ok(())
}

fn check_signed_range(raw: i64, bits: u32, field_name: &str) -> Result<()> {
    let half = 1i64 << (bits - 1);
    if raw < -half || raw >= half {
        return Err(Error::Codec(format!(
            "value {raw} is out of range for {bits}-bit signed field '{field_name}'"
        )));
    }
    Ok(())
}

/// Unpack an 8-byte (or shorter) CAN payload into a field tuple.
///
/// A decoded value outside its declared range is not itself fatal (the
/// Listener tolerates stale/garbled frames); it is still returned. A
/// multiplex selector outside its declared cases is a hard decode error.
pub fn unpack(def: &MessageDef, payload: &[u8]) -> Result<FieldTuple> {
    let mut out = FieldTuple::new();
    unpack_fields(def, payload, &mut out)?;
    Ok(out)
}

fn unpack_fields(def: &[FieldDef], payload: &[u8], out: &mut FieldTuple) -> Result<()> {
    for field in def {
        let value = unpack_one(field, payload)?;
        out.insert(field.name.clone(), value);
    }
    Ok(())
}

fn unpack_one(field: &FieldDef, payload: &[u8]) -> Result<FieldValue> {
    let layout = field.layout;
    match &field.kind {
        FieldKind::Uint { factor, offset } => {
            let raw = extract_bits(payload, layout.pos_offset, layout.bits)?;
            let physical = raw as f64 * factor + offset;
            Ok(FieldValue::Uint(physical as u64))
        },
        FieldKind::Int { factor, offset } => {
            let raw = extract_bits(payload, layout.pos_offset, layout.bits)?;
            let signed = sign_extend(raw, layout.bits);
            let physical = signed as f64 * factor + offset;
            Ok(FieldValue::Int(physical as i64))
        },
        FieldKind::Bool => {
            let raw = extract_bits(payload, layout.pos_offset, layout.bits)?;
            Ok(FieldValue::Bool(raw != 0))
        },
        FieldKind::Enum => {
            let raw = extract_bits(payload, layout.pos_offset, layout.bits)?;
            Ok(FieldValue::Enum(raw as u32))
        },
        FieldKind::Array { item, item_bits, count } => {
            let mut elements = Vec::with_capacity(*count as usize);
            for i in 0..*count {
                let element_field = FieldDef {
                    name: field.name.clone(),
                    layout: FieldLayout {
                        pos_offset: layout.pos_offset + i * item_bits,
                        bits: *item_bits,
                    },
                    kind: (**item).clone(),
                };
                elements.push(unpack_one(&element_field, payload)?);
            }
            Ok(FieldValue::Array(elements))
        },
        FieldKind::Multiplex { cases } => {
            let selector = extract_bits(payload, layout.pos_offset, layout.bits)? as u32;
            let case = cases.iter().find(|c| c.selector == selector).ok_or_else(|| {
                Error::Codec(format!(
                    "multiplex selector {selector} for field '{}' has no declared case",
                    field.name
                ))
            })?;
            let mut sub_values = BTreeMap::new();
            unpack_fields(&case.fields, payload, &mut sub_values)?;
            Ok(FieldValue::Multiplex(selector, sub_values))
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uint_field(name: &str, pos_offset: u32, bits: u32) -> FieldDef {
        FieldDef {
            name: name.to_string(),
            layout: FieldLayout { pos_offset, bits },
            kind: FieldKind::Uint { factor: 1.0, offset: 0.0 },
        }
    }

    #[test]
    fn round_trips_simple_uint_field() {
        let def = vec![uint_field("target", 0, 4), uint_field("state", 4, 4)];
        let mut values = FieldTuple::new();
        values.insert("target".into(), FieldValue::Uint(3));
        values.insert("state".into(), FieldValue::Uint(9));

        let (payload, len) = pack(&def, &values).unwrap();
        assert_eq!(len, 1);
        assert_eq!(payload[0], 3 | (9 << 4));

        let decoded = unpack(&def, &payload).unwrap();
        assert_eq!(decoded, values);
    }

    #[test]
    fn packs_signed_field_with_sign_extension() {
        let def = vec![FieldDef {
            name: "delta".into(),
            layout: FieldLayout { pos_offset: 0, bits: 8 },
            kind: FieldKind::Int { factor: 1.0, offset: 0.0 },
        }];
        let mut values = FieldTuple::new();
        values.insert("delta".into(), FieldValue::Int(-5));

        let (payload, _) = pack(&def, &values).unwrap();
        assert_eq!(payload[0] as i8, -5);

        let decoded = unpack(&def, &payload).unwrap();
        assert_eq!(decoded.get("delta"), Some(&FieldValue::Int(-5)));
    }

    #[test]
    fn rejects_out_of_range_pack() {
        let def = vec![uint_field("small", 0, 3)];
        let mut values = FieldTuple::new();
        values.insert("small".into(), FieldValue::Uint(8));
        assert!(pack(&def, &values).is_err());
    }

    #[test]
    fn crosses_byte_boundary_correctly() {
        let def = vec![uint_field("wide", 4, 12)];
        let mut values = FieldTuple::new();
        values.insert("wide".into(), FieldValue::Uint(0xABC));

        let (payload, len) = pack(&def, &values).unwrap();
        assert_eq!(len, 2);
        let decoded = unpack(&def, &payload).unwrap();
        assert_eq!(decoded.get("wide"), Some(&FieldValue::Uint(0xABC)));
    }

    #[test]
    fn insert_bits_does_not_clobber_neighbor_fields() {
        let def = vec![uint_field("lo", 0, 4), uint_field("hi", 4, 4)];
        let mut values = FieldTuple::new();
        values.insert("lo".into(), FieldValue::Uint(0xF));
        values.insert("hi".into(), FieldValue::Uint(0x0));
        let (payload, _) = pack(&def, &values).unwrap();
        assert_eq!(payload[0], 0x0F);
    }

    #[test]
    fn multiplex_selects_case_by_selector_value() {
        let def = vec![FieldDef {
            name: "mux".into(),
            layout: FieldLayout { pos_offset: 0, bits: 2 },
            kind: FieldKind::Multiplex {
                cases: vec![
                    MultiplexCase { selector: 0, fields: vec![uint_field("a", 2, 4)] },
                    MultiplexCase { selector: 1, fields: vec![uint_field("b", 2, 4)] },
                ],
            },
        }];

        let mut sub = BTreeMap::new();
        sub.insert("b".to_string(), FieldValue::Uint(7));
        let mut values = FieldTuple::new();
        values.insert("mux".into(), FieldValue::Multiplex(1, sub.clone()));

        let (payload, _) = pack(&def, &values).unwrap();
        let decoded = unpack(&def, &payload).unwrap();
        assert_eq!(decoded.get("mux"), Some(&FieldValue::Multiplex(1, sub)));
    }

    #[test]
    fn multiplex_selector_out_of_range_is_a_hard_decode_error() {
        let def = vec![FieldDef {
            name: "mux".into(),
            layout: FieldLayout { pos_offset: 0, bits: 2 },
            kind: FieldKind::Multiplex {
                cases: vec![MultiplexCase { selector: 0, fields: vec![] }],
            },
        }];
        // selector bits = 3, but only case 0 is declared.
        let payload = [0b0000_0011u8, 0, 0, 0, 0, 0, 0, 0];
        assert!(unpack(&def, &payload).is_err());
    }

    #[test]
    fn array_field_round_trips() {
        let def = vec![FieldDef {
            name: "blocks".into(),
            layout: FieldLayout { pos_offset: 0, bits: 4 },
            kind: FieldKind::Array {
                item: Box::new(FieldKind::Uint { factor: 1.0, offset: 0.0 }),
                item_bits: 4,
                count: 3,
            },
        }];
        let mut values = FieldTuple::new();
        values.insert(
            "blocks".into(),
            FieldValue::Array(vec![FieldValue::Uint(1), FieldValue::Uint(2), FieldValue::Uint(3)]),
        );
        let (payload, _) = pack(&def, &values).unwrap();
        let decoded = unpack(&def, &payload).unwrap();
        assert_eq!(decoded, values);
    }

    #[test]
    fn rejects_field_extending_past_payload() {
        let def = vec![uint_field("huge", 60, 16)];
        let payload = [0u8; MAX_PAYLOAD_LEN];
        assert!(unpack(&def, &payload).is_err());
    }
}
