//! Hex codec for the ASCII protocol: integers, byte arrays and strings.
//!
//! All protocol numbers travel as hex characters. Integers are parsed
//! big-endian (high nybble first) because that is how GDB sends them;
//! fixed-width values such as register contents are emitted in the
//! target's byte order.

use byteorder::{BigEndian, ByteOrder, LittleEndian};

use buffer::Buffer;

use std::cmp;

/// Decodes a single hex character. Non-hex input decodes to 0; garbage is
/// caught at the framing layer by the packet checksum, not here.
pub fn decode_nybble(ch: u8) -> u8 {
    match ch {
        b'0'..=b'9' => ch - b'0',
        b'a'..=b'f' => ch - b'a' + 10,
        b'A'..=b'F' => ch - b'A' + 10,
        _ => 0,
    }
}

/// Decodes a pair of hex characters into one byte.
pub fn decode_byte(hi: u8, lo: u8) -> u8 {
    decode_nybble(hi) << 4 | decode_nybble(lo)
}

/// Encodes the low 4 bits of `n` as a hex character.
pub fn encode_nybble(n: u8) -> u8 {
    match n & 0xf {
        n @ 0..=9 => b'0' + n,
        n => b'a' + n - 10,
    }
}

/// Consumes hex characters up to and including `sep`, accumulating them
/// big-endian into an integer. Stops early if the buffer drains first.
pub fn decode_uint_until(sep: u8, packet: &mut Buffer) -> u64 {
    let mut value = 0;
    while let Some(ch) = packet.read_u8() {
        if ch == sep {
            break;
        }
        value = value << 4 | u64::from(decode_nybble(ch));
    }
    value
}

/// Like `decode_uint_until`, terminated by the end of the buffer.
pub fn decode_uint(packet: &mut Buffer) -> u64 {
    let mut value = 0;
    while let Some(ch) = packet.read_u8() {
        value = value << 4 | u64::from(decode_nybble(ch));
    }
    value
}

/// Decodes hex character pairs until the buffer drains. A trailing
/// unpaired character is kept as the high nybble of a final byte.
pub fn decode_bytes(packet: &mut Buffer) -> Vec<u8> {
    let mut out = Vec::with_capacity(packet.read_available() / 2);
    while let Some(hi) = packet.read_u8() {
        match packet.read_u8() {
            Some(lo) => out.push(decode_byte(hi, lo)),
            None => out.push(decode_nybble(hi) << 4),
        }
    }
    out
}

/// Encodes `n` as `width` bytes of hex, low byte first when
/// `little_endian` is set.
///
/// A `width` of 0 selects the minimal form instead: most significant
/// digit first with leading zeros trimmed, as used for thread ids.
pub fn encode_uint(n: u64, width: usize, out: &mut Buffer, little_endian: bool) {
    if width == 0 {
        let mut seen_nonzero = false;
        for shift in (0..16).rev() {
            let nybble = (n >> (shift * 4) & 0xf) as u8;
            if nybble != 0 {
                seen_nonzero = true;
            }
            if seen_nonzero {
                out.write_u8(encode_nybble(nybble));
            }
        }
        if !seen_nonzero {
            out.write_u8(b'0');
        }
        return;
    }

    let width = cmp::min(width, 8);
    let mut raw = [0; 8];
    if little_endian {
        LittleEndian::write_u64(&mut raw, n);
        encode_bytes(&raw[..width], out);
    } else {
        BigEndian::write_u64(&mut raw, n);
        encode_bytes(&raw[8 - width..], out);
    }
}

/// Encodes each byte as two hex characters.
pub fn encode_bytes(data: &[u8], out: &mut Buffer) {
    for &byte in data {
        out.write_u8(encode_nybble(byte >> 4));
        out.write_u8(encode_nybble(byte));
    }
}

/// Encodes the UTF-8 bytes of `s` as hex characters.
pub fn encode_str(s: &str, out: &mut Buffer) {
    encode_bytes(s.as_bytes(), out);
}

#[cfg(test)]
mod tests {
    use super::*;
    use buffer::Buffer;

    fn encoded(n: u64, width: usize, little_endian: bool) -> String {
        let mut buf = Buffer::new();
        encode_uint(n, width, &mut buf, little_endian);
        buf.get_string()
    }

    #[test]
    fn nybbles() {
        assert_eq!(decode_nybble(b'0'), 0);
        assert_eq!(decode_nybble(b'a'), 10);
        assert_eq!(decode_nybble(b'F'), 15);
        assert_eq!(decode_nybble(b'x'), 0);
        assert_eq!(encode_nybble(0xe), b'e');
        assert_eq!(decode_byte(b'7', b'f'), 0x7f);
    }

    #[test]
    fn uint_widths_and_orders() {
        assert_eq!(encoded(0x0150, 2, true), "5001");
        assert_eq!(encoded(0x0150, 2, false), "0150");
        assert_eq!(encoded(0x12, 1, true), "12");
        assert_eq!(encoded(0, 8, true), "0000000000000000");
    }

    #[test]
    fn uint_minimal_form() {
        assert_eq!(encoded(1, 0, true), "1");
        assert_eq!(encoded(0, 0, true), "0");
        assert_eq!(encoded(0x150, 0, true), "150");
    }

    #[test]
    fn uint_big_endian_round_trip() {
        for &n in &[0u64, 1, 0x1f, 0x0150, 0xfffe, 0xdead_beef] {
            let mut buf = Buffer::new();
            encode_uint(n, 8, &mut buf, false);
            assert_eq!(decode_uint(&mut buf), n);
        }
    }

    #[test]
    fn uint_until_separator() {
        let mut packet = Buffer::from_vec(b"0100,4".to_vec());
        assert_eq!(decode_uint_until(b',', &mut packet), 0x0100);
        assert_eq!(decode_uint(&mut packet), 4);
        assert_eq!(packet.read_available(), 0);
    }

    #[test]
    fn uint_until_tolerates_missing_separator() {
        let mut packet = Buffer::from_vec(b"ff".to_vec());
        assert_eq!(decode_uint_until(b',', &mut packet), 0xff);
    }

    #[test]
    fn byte_arrays() {
        let mut packet = Buffer::from_vec(b"00c35001".to_vec());
        assert_eq!(decode_bytes(&mut packet), vec![0x00, 0xc3, 0x50, 0x01]);

        // Trailing unpaired nybble pads as the high half.
        let mut packet = Buffer::from_vec(b"abc".to_vec());
        assert_eq!(decode_bytes(&mut packet), vec![0xab, 0xc0]);
    }

    #[test]
    fn strings() {
        let mut buf = Buffer::new();
        encode_str("help", &mut buf);
        assert_eq!(buf.get_string(), "68656c70");

        let mut packet = Buffer::from_vec(buf.get_data());
        assert_eq!(decode_bytes(&mut packet), b"help");
    }
}
