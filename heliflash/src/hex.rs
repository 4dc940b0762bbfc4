//! Intel-HEX firmware loader.
//!
//! Turns a `:LLAAAATT<data>CC`-formatted hex file into a [`Firmware`]: an
//! ordered, non-overlapping list of logical [`MemoryBlock`]s plus a
//! program entry point, a flattened byte image with gaps marked empty,
//! and a checksum suitable for the bootloader's own verification.

use crate::error::{Error, Result};
use crate::types::{Firmware, MemoryBlock};

/// One parsed line of an Intel-HEX file.
#[derive(Debug, Clone, PartialEq, Eq)]
struct HexRecord {
    address: u16,
    kind: RecordKind,
    data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordKind {
    Data,
    Eof,
    ExtendedSegmentAddress,
    StartSegmentAddress,
    ExtendedLinearAddress,
    StartLinearAddress,
}

impl RecordKind {
    fn from_byte(b: u8) -> Result<Self> {
        Ok(match b {
            0 => Self::Data,
            1 => Self::Eof,
            2 => Self::ExtendedSegmentAddress,
            3 => Self::StartSegmentAddress,
            4 => Self::ExtendedLinearAddress,
            5 => Self::StartLinearAddress,
            other => return Err(Error::Hex(format!("unknown record type {other}"))),
        })
    }
}

fn hex_byte(s: &[u8]) -> Result<u8> {
    let text = std::str::from_utf8(s).map_err(|_| Error::Hex("non-ASCII hex digit".into()))?;
    u8::from_str_radix(text, 16).map_err(|e| Error::Hex(format!("invalid hex digit: {e}")))
}

fn parse_line(line: &str) -> Result<HexRecord> {
    let line = line.trim_end();
    let bytes = line.as_bytes();
    if bytes.first() != Some(&b':') {
        return Err(Error::Hex("record does not start with ':'".into()));
    }
    let body = &bytes[1..];
    if body.len() % 2 != 0 || body.len() < 8 {
        return Err(Error::Hex("record has an odd or too-short field length".into()));
    }

    let mut raw = Vec::with_capacity(body.len() / 2);
    for chunk in body.chunks(2) {
        raw.push(hex_byte(chunk)?);
    }

    let length = raw[0] as usize;
    if raw.len() != length + 5 {
        return Err(Error::Hex(format!(
            "declared length {length} does not match record size {}",
            raw.len() - 5
        )));
    }

    let checksum_sum: u32 = raw.iter().map(|b| u32::from(*b)).sum();
    if checksum_sum % 256 != 0 {
        return Err(Error::Hex("record checksum mismatch".into()));
    }

    let address = u16::from_be_bytes([raw[1], raw[2]]);
    let kind = RecordKind::from_byte(raw[3])?;
    let data = raw[4..4 + length].to_vec();

    match kind {
        RecordKind::Eof if length != 0 => {
            return Err(Error::Hex("EOF record must carry no data".into()));
        },
        RecordKind::ExtendedSegmentAddress | RecordKind::ExtendedLinearAddress if length != 2 => {
            return Err(Error::Hex("extended address record must carry 2 bytes".into()));
        },
        RecordKind::StartSegmentAddress | RecordKind::StartLinearAddress if length != 4 => {
            return Err(Error::Hex("start address record must carry 4 bytes".into()));
        },
        _ => {},
    }

    Ok(HexRecord { address, kind, data })
}

struct OpenBlock {
    address: u32,
    data: Vec<u8>,
}

impl OpenBlock {
    fn end(&self) -> u32 {
        self.address + self.data.len() as u32
    }

    fn close(self) -> MemoryBlock {
        let mut data = self.data;
        if data.len() % 2 != 0 {
            data.push(0xFF);
        }
        MemoryBlock { address: self.address, data }
    }
}

/// Parse an Intel-HEX file's text into a [`Firmware`].
pub fn load(text: &str) -> Result<Firmware> {
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let records: Vec<HexRecord> = lines.iter().map(|l| parse_line(l)).collect::<Result<_>>()?;

    if records.is_empty() {
        return Err(Error::Hex("no records found".into()));
    }
    let (last, rest) = records.split_last().expect("checked non-empty");
    if last.kind != RecordKind::Eof {
        return Err(Error::Hex("final record is not EOF".into()));
    }
    if rest.iter().any(|r| r.kind == RecordKind::Eof) {
        return Err(Error::Hex("duplicate EOF record".into()));
    }

    let mut base_address: u32 = 0;
    let mut current: Option<OpenBlock> = None;
    let mut blocks = Vec::new();
    let mut entry_point: Option<u32> = None;

    for record in rest {
        match record.kind {
            RecordKind::ExtendedSegmentAddress => {
                let v = u32::from(u16::from_be_bytes([record.data[0], record.data[1]]));
                base_address = v << 4;
            },
            RecordKind::ExtendedLinearAddress => {
                let v = u32::from(u16::from_be_bytes([record.data[0], record.data[1]]));
                base_address = v << 16;
            },
            RecordKind::StartSegmentAddress | RecordKind::StartLinearAddress => {
                if record.kind == RecordKind::StartSegmentAddress {
                    log::warn!(
                        "hex file uses experimental StartSegmentAddressRecord (type 3); treating it identically to StartLinearAddressRecord (type 5)"
                    );
                }
                let v = u32::from_be_bytes([
                    record.data[0],
                    record.data[1],
                    record.data[2],
                    record.data[3],
                ]);
                entry_point = Some(v);
            },
            RecordKind::Data => {
                let absolute_address = base_address + u32::from(record.address);
                match &mut current {
                    None => {
                        current = Some(OpenBlock { address: absolute_address, data: record.data.clone() });
                    },
                    Some(block) if block.end() == absolute_address => {
                        block.data.extend_from_slice(&record.data);
                    },
                    Some(_) => {
                        let finished = current.take().expect("checked Some").close();
                        blocks.push(finished);
                        current = Some(OpenBlock { address: absolute_address, data: record.data.clone() });
                    },
                }
            },
            RecordKind::Eof => unreachable!("EOF filtered out above"),
        }
    }

    if let Some(block) = current.take() {
        blocks.push(block.close());
    }

    if blocks.is_empty() {
        return Err(Error::Hex("no Data records found".into()));
    }
    let entry_point = entry_point.ok_or_else(|| Error::Hex("no entry point record found".into()))?;

    build_firmware(blocks, entry_point)
}

fn build_firmware(mut blocks: Vec<MemoryBlock>, entry_point: u32) -> Result<Firmware> {
    blocks.sort_by_key(|b| b.address);

    for window in blocks.windows(2) {
        let [a, b] = window else { unreachable!() };
        if a.end() > b.address {
            return Err(Error::Hex(format!(
                "overlapping logical blocks at {:#010x} and {:#010x}",
                a.address, b.address
            )));
        }
    }

    let base_address = blocks.first().expect("non-empty").address;
    let end = blocks.last().expect("non-empty").end();
    let length: u32 = blocks.iter().map(|b| b.data.len() as u32).sum();

    let mut flattened_map: Vec<Option<u8>> = vec![None; (end - base_address) as usize];
    for block in &blocks {
        let start = (block.address - base_address) as usize;
        for (i, byte) in block.data.iter().enumerate() {
            flattened_map[start + i] = Some(*byte);
        }
    }

    Ok(Firmware { blocks, entry_point, base_address, end, flattened_map, length })
}

/// Compute the bootloader-verification checksum: every block interpreted
/// as little-endian half-words, all summed into one unbounded integer.
/// Every block must have even length.
pub fn checksum(firmware: &Firmware) -> Result<u64> {
    let mut sum: u64 = 0;
    for block in &firmware.blocks {
        if block.data.len() % 2 != 0 {
            return Err(Error::Hex(format!(
                "block at {:#010x} has odd length {}",
                block.address,
                block.data.len()
            )));
        }
        for halfword in block.data.chunks_exact(2) {
            sum += u64::from(u16::from_le_bytes([halfword[0], halfword[1]]));
        }
    }
    Ok(sum)
}

/// Re-serialize a flattened map back into `MemoryBlock`s by detecting
/// runs of non-sentinel bytes. Used to verify the flatten/unflatten
/// round trip.
#[must_use]
pub fn unflatten(base_address: u32, flattened_map: &[Option<u8>]) -> Vec<MemoryBlock> {
    let mut blocks = Vec::new();
    let mut current: Option<(u32, Vec<u8>)> = None;

    for (i, byte) in flattened_map.iter().enumerate() {
        match (byte, &mut current) {
            (Some(b), Some((_, data))) => data.push(*b),
            (Some(b), None) => current = Some((base_address + i as u32, vec![*b])),
            (None, Some(_)) => {
                let (address, data) = current.take().expect("checked Some");
                blocks.push(MemoryBlock { address, data });
            },
            (None, None) => {},
        }
    }
    if let Some((address, data)) = current {
        blocks.push(MemoryBlock { address, data });
    }
    blocks
}

/// Return the ordered sublist of `physical_pages` that overlap any
/// logical block in `firmware`. Fails with [`Error::CoverageGap`] if a
/// logical block has a byte that no physical page covers. A physical
/// page that ends exactly at the start of a logical block does not
/// count as covering it.
pub fn map_logical_to_physical(
    firmware: &Firmware,
    physical_pages: &[MemoryBlock],
) -> Result<Vec<MemoryBlock>> {
    let mut covering = Vec::new();

    for block in &firmware.blocks {
        let block_start = block.address;
        let block_end = block.end();

        let mut overlapping: Vec<&MemoryBlock> = physical_pages
            .iter()
            .filter(|page| page.address < block_end && page.end() > block_start)
            .collect();
        overlapping.sort_by_key(|p| p.address);

        let mut cursor = block_start;
        for page in &overlapping {
            if page.address > cursor {
                break;
            }
            cursor = cursor.max(page.end());
            if !covering.iter().any(|p: &MemoryBlock| p.address == page.address) {
                covering.push((*page).clone());
            }
        }

        if cursor < block_end {
            return Err(Error::CoverageGap { address: block_start });
        }
    }

    covering.sort_by_key(|p| p.address);
    Ok(covering)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL_HEX: &str = ":020000040800F2\n:04000000DEADBEEFC4\n:0400000508000001EE\n:00000001FF\n";

    #[test]
    fn parses_minimal_example_from_the_scenario() {
        let fw = load(MINIMAL_HEX).unwrap();
        assert_eq!(fw.blocks.len(), 1);
        assert_eq!(fw.blocks[0].address, 0x0800_0000);
        assert_eq!(fw.blocks[0].data, vec![0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(fw.entry_point, 0x0800_0001);
        assert!(fw.is_thumb());
        assert_eq!(fw.length, 4);

        let sum = checksum(&fw).unwrap();
        assert_eq!(sum, 0xADDE + 0xEFBE);
    }

    #[test]
    fn rejects_missing_eof() {
        let bad = ":04000000DEADBEEFC4\n";
        assert!(load(bad).is_err());
    }

    #[test]
    fn rejects_bad_checksum() {
        let bad = ":020000040800F3\n:04000000DEADBEEFC4\n:0400000508000001EE\n:00000001FF\n";
        assert!(load(bad).is_err());
    }

    #[test]
    fn pads_odd_length_block_to_even_with_0xff() {
        // Single odd-length (3-byte) data record closed immediately by EOF.
        let hex = ":03000000AABBCCCC\n:0400000508000001EE\n:00000001FF\n";
        let fw = load(hex).unwrap();
        assert_eq!(fw.blocks[0].data, vec![0xAA, 0xBB, 0xCC, 0xFF]);
    }

    #[test]
    fn flattened_map_round_trips_through_unflatten() {
        let fw = load(MINIMAL_HEX).unwrap();
        let recovered = unflatten(fw.base_address, &fw.flattened_map);
        assert_eq!(recovered, fw.blocks);
    }

    #[test]
    fn checksum_changes_when_any_byte_changes() {
        let fw = load(MINIMAL_HEX).unwrap();
        let original = checksum(&fw).unwrap();
        let mut mutated = fw.clone();
        mutated.blocks[0].data[0] ^= 0xFF;
        let changed = checksum(&mutated).unwrap();
        assert_ne!(original, changed);
    }

    #[test]
    fn physical_page_ending_at_block_start_does_not_cover_it() {
        let fw = load(MINIMAL_HEX).unwrap();
        let pages = vec![MemoryBlock { address: 0x07FF_FFFC, data: vec![0; 4] }];
        assert!(matches!(
            map_logical_to_physical(&fw, &pages),
            Err(Error::CoverageGap { .. })
        ));
    }

    #[test]
    fn physical_page_fully_covering_block_is_returned() {
        let fw = load(MINIMAL_HEX).unwrap();
        let pages = vec![MemoryBlock { address: 0x0800_0000, data: vec![0; 16] }];
        let mapped = map_logical_to_physical(&fw, &pages).unwrap();
        assert_eq!(mapped.len(), 1);
        assert_eq!(mapped[0].address, 0x0800_0000);
    }
}
