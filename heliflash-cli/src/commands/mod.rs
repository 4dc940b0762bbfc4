//! Subcommand implementations. Each module owns one CLI verb and talks to
//! `heliflash` only through the library's public API.

pub(crate) mod entry;
pub(crate) mod flash;
pub(crate) mod list;
pub(crate) mod vector_table;

use heliflash::Error;

/// Parse a CLI-supplied address, accepting either `0x`-prefixed hex or
/// plain decimal.
pub(crate) fn parse_address(s: &str) -> heliflash::Result<u32> {
    let trimmed = s.trim();
    let parsed = if let Some(hex) = trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16)
    } else {
        trimmed.parse::<u32>()
    };
    parsed.map_err(|e| Error::Usage(format!("invalid address '{trimmed}': {e}")))
}

/// Resolve a `-u` argument to a [`heliflash::Target`], with a CLI-friendly
/// error listing the recognized names.
pub(crate) fn parse_target(s: &str) -> heliflash::Result<heliflash::Target> {
    heliflash::Target::parse(s).ok_or_else(|| {
        let names: Vec<&str> = heliflash::Target::ALL.iter().map(|t| t.name()).collect();
        Error::Usage(format!("unknown unit '{s}', expected one of: {}", names.join(", ")))
    })
}
