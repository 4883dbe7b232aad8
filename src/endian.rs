//! Centralized endianness helpers.
//!
//! Every multi-byte field on the wire is little-endian except the version field returned by
//! `GET_VERSION`, which is big-endian. Keeping the conversions here means call sites never
//! inline `to_le_bytes`/`from_le_bytes` by hand.

use byteorder::{ByteOrder, BigEndian, LittleEndian};

pub fn read_u16_le(buf: &[u8]) -> u16 {
    LittleEndian::read_u16(buf)
}

pub fn read_u32_le(buf: &[u8]) -> u32 {
    LittleEndian::read_u32(buf)
}

pub fn read_u16_be(buf: &[u8]) -> u16 {
    BigEndian::read_u16(buf)
}

pub fn write_u32_le(buf: &mut [u8], value: u32) {
    LittleEndian::write_u32(buf, value)
}

pub fn push_u32_le(buf: &mut Vec<u8>, value: u32) {
    let mut tmp = [0u8; 4];
    write_u32_le(&mut tmp, value);
    buf.extend_from_slice(&tmp);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn le_round_trip_is_an_involution() {
        let value = 0xdead_beefu32;
        let mut buf = [0u8; 4];
        write_u32_le(&mut buf, value);
        assert_eq!(read_u32_le(&buf), value);
    }

    #[test]
    fn be_u16_matches_get_version_layout() {
        // stlink version 2, jtag version 28, swim version 0 -> 0x2700 (see stlink.rs decode)
        let buf = [0x27, 0x00];
        assert_eq!(read_u16_be(&buf), 0x2700);
    }
}
