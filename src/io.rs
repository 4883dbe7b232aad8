//! File I/O for the CLI: raw binary dumps, a minimal S-record reader, and the hex-dump renderer
//! behind the `dump`/`dump16`/`dump8` verbs.

use std::fs;
use std::path::Path;

use crate::error::{Error, Result};

pub fn read_raw_file(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| Error::BadParam(format!("reading {}: {}", path.display(), e)))
}

pub fn write_raw_file(path: &Path, data: &[u8]) -> Result<()> {
    fs::write(path, data)
        .map_err(|e| Error::BadParam(format!("writing {}: {}", path.display(), e)))
}

/// One data record (S1/S2/S3) parsed out of an S-record file: a base address and its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrecBlock {
    pub address: u32,
    pub data: Vec<u8>,
}

/// Parses an ASCII Motorola S-record file into its data blocks, validating every record's
/// checksum. Header, count, and termination records (S0, S5, S7, S8, S9) are recognized and
/// skipped; only S1/S2/S3 contribute data.
pub fn parse_srec(text: &str) -> Result<Vec<SrecBlock>> {
    let mut blocks = Vec::new();

    for (lineno, raw_line) in text.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }
        let line_no = lineno + 1;
        if !line.starts_with('S') || line.len() < 4 {
            return Err(Error::Protocol(format!("line {}: not an S-record", line_no)));
        }
        let kind = line.as_bytes()[1];
        let bytes = decode_hex(&line[2..]).map_err(|e| Error::Protocol(format!("line {}: {}", line_no, e)))?;

        let count = *bytes
            .first()
            .ok_or_else(|| Error::Protocol(format!("line {}: record too short", line_no)))? as usize;
        if bytes.len() != count + 1 {
            return Err(Error::Protocol(format!(
                "line {}: byte count {} doesn't match record length",
                line_no, count
            )));
        }

        let checksum = *bytes.last().unwrap();
        let computed = !bytes[..bytes.len() - 1].iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
        if checksum != computed {
            return Err(Error::Protocol(format!(
                "line {}: checksum mismatch (expected {:#04x}, got {:#04x})",
                line_no, computed, checksum
            )));
        }

        let addr_len = match kind {
            b'0' | b'1' | b'5' | b'9' => 2,
            b'2' | b'8' => 3,
            b'3' | b'7' => 4,
            other => {
                return Err(Error::Protocol(format!(
                    "line {}: unknown record type S{}",
                    line_no, other as char
                )))
            }
        };
        let payload = &bytes[1..bytes.len() - 1];
        if payload.len() < addr_len {
            return Err(Error::Protocol(format!(
                "line {}: record shorter than its address field",
                line_no
            )));
        }
        let mut address: u32 = 0;
        for &b in &payload[..addr_len] {
            address = (address << 8) | b as u32;
        }
        let data = payload[addr_len..].to_vec();

        if matches!(kind, b'1' | b'2' | b'3') {
            blocks.push(SrecBlock { address, data });
        }
    }

    Ok(blocks)
}

fn decode_hex(s: &str) -> std::result::Result<Vec<u8>, String> {
    if s.len() % 2 != 0 {
        return Err("odd number of hex digits".into());
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(|e| e.to_string()))
        .collect()
}

fn padded_le(group: &[u8], width: usize) -> Vec<u8> {
    let mut v = group.to_vec();
    v.resize(width, 0);
    v
}

/// Renders `data` (read starting at `base_addr`) as a hex dump, 16 bytes per line, grouped into
/// `unit`-byte elements (4 for `dump`, 2 for `dump16`, 1 for `dump8`).
pub fn hex_dump(base_addr: u32, data: &[u8], unit: usize) -> String {
    let mut out = String::new();
    for (row, chunk) in data.chunks(16).enumerate() {
        out.push_str(&format!("{:08x}:", base_addr as usize + row * 16));
        for group in chunk.chunks(unit) {
            out.push(' ');
            match unit {
                4 => out.push_str(&format!("{:08x}", crate::endian::read_u32_le(&padded_le(group, 4)))),
                2 => out.push_str(&format!("{:04x}", crate::endian::read_u16_le(&padded_le(group, 2)))),
                _ => out.push_str(&format!("{:02x}", group[0])),
            }
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_srec_single_data_record() {
        // S1 record: address 0x0000, payload "Hello, world!", correct trailing checksum.
        let line = "S110000048656C6C6F2C20776F726C642166";
        let blocks = parse_srec(line).unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].address, 0x0000);
        assert_eq!(blocks[0].data, b"Hello, world!");
    }

    #[test]
    fn parse_srec_rejects_bad_checksum() {
        let line = "S110000048656C6C6F2C20776F726C642100";
        assert!(parse_srec(line).is_err());
    }

    #[test]
    fn parse_srec_skips_header_and_termination_records() {
        let text = "S0030000FC\nS9030000FC\n";
        let blocks = parse_srec(text).unwrap();
        assert!(blocks.is_empty());
    }

    #[test]
    fn hex_dump_groups_by_unit_width() {
        let data = [0x01, 0x02, 0x03, 0x04];
        let dump = hex_dump(0x0800_0000, &data, 4);
        assert!(dump.contains("08000000:"));
        assert!(dump.contains("04030201"));
    }
}
