//! Byte-level helpers shared by the wire protocol and the CDF codec

/// Byte order of a multi-byte integer field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Endianness {
    #[default]
    Big,
    Little,
}

pub fn pack_u16(v: u16, order: Endianness) -> [u8; 2] {
    match order {
        Endianness::Big => v.to_be_bytes(),
        Endianness::Little => v.to_le_bytes(),
    }
}

pub fn unpack_u16(b: [u8; 2], order: Endianness) -> u16 {
    match order {
        Endianness::Big => u16::from_be_bytes(b),
        Endianness::Little => u16::from_le_bytes(b),
    }
}

pub fn pack_u16_be(v: u16) -> [u8; 2] {
    pack_u16(v, Endianness::Big)
}

pub fn unpack_u16_be(b: [u8; 2]) -> u16 {
    unpack_u16(b, Endianness::Big)
}

pub fn pack_u16_le(v: u16) -> [u8; 2] {
    pack_u16(v, Endianness::Little)
}

pub fn unpack_u16_le(b: [u8; 2]) -> u16 {
    unpack_u16(b, Endianness::Little)
}

/// Read a big-endian u16 at `offset`, or None if the slice is too short
pub fn read_u16_be(buf: &[u8], offset: usize) -> Option<u16> {
    let b = buf.get(offset..offset.checked_add(2)?)?;
    Some(u16::from_be_bytes([b[0], b[1]]))
}

/// Read a big-endian u32 at `offset`, or None if the slice is too short
pub fn read_u32_be(buf: &[u8], offset: usize) -> Option<u32> {
    let b = buf.get(offset..offset.checked_add(4)?)?;
    Some(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}

/// Overwrite two bytes at `offset` with `v` in big-endian order.
///
/// Panics if the buffer is too short; callers patch fixed template offsets.
pub fn write_u16_be_at(buf: &mut [u8], offset: usize, v: u16) {
    buf[offset..offset + 2].copy_from_slice(&v.to_be_bytes());
}

/// Encode a string as UTF-16LE, optionally followed by a 0x0000 terminator
pub fn encode_utf16le(s: &str, terminator: bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(s.len() * 2 + 2);
    for unit in s.encode_utf16() {
        out.extend_from_slice(&unit.to_le_bytes());
    }
    if terminator {
        out.extend_from_slice(&[0, 0]);
    }
    out
}

/// Decode UTF-16LE bytes, stopping at the first 0x0000 unit.
///
/// A trailing odd byte is ignored; unpaired surrogates become U+FFFD.
pub fn decode_utf16le(data: &[u8]) -> String {
    let units: Vec<u16> = data
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .take_while(|&u| u != 0)
        .collect();
    String::from_utf16_lossy(&units)
}

/// Bounds-checked sub-slice
pub fn sub_slice(data: &[u8], offset: usize, len: usize) -> Option<&[u8]> {
    data.get(offset..offset.checked_add(len)?)
}

/// Concatenate byte slices into a fresh buffer
pub fn concat(parts: &[&[u8]]) -> Vec<u8> {
    let total = parts.iter().map(|p| p.len()).sum();
    let mut out = Vec::with_capacity(total);
    for p in parts {
        out.extend_from_slice(p);
    }
    out
}

/// Classic 16-bytes-per-row hex dump with an ASCII gutter
pub fn hex_dump(data: &[u8]) -> String {
    const WIDTH: usize = 16;
    if data.is_empty() {
        return "[empty]".to_string();
    }
    let mut out = String::with_capacity(data.len() * 4 + data.len() / WIDTH * 4);
    for row in data.chunks(WIDTH) {
        for b in row {
            out.push_str(&format!("{:02x} ", b));
        }
        for _ in row.len()..WIDTH {
            out.push_str("   ");
        }
        out.push_str(" |");
        for &b in row {
            out.push(if (0x20..0x7f).contains(&b) { b as char } else { '.' });
        }
        out.push_str("|\n");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_u16_round_trip_all_values() {
        for n in 0..=u16::MAX {
            assert_eq!(unpack_u16_be(pack_u16_be(n)), n);
            assert_eq!(unpack_u16_le(pack_u16_le(n)), n);
        }
        assert_eq!(pack_u16_be(0x1234), [0x12, 0x34]);
        assert_eq!(pack_u16_le(0x1234), [0x34, 0x12]);
    }

    #[test]
    fn test_read_helpers_bounds() {
        let buf = [0x00, 0x01, 0x02, 0x03, 0x04];
        assert_eq!(read_u16_be(&buf, 3), Some(0x0304));
        assert_eq!(read_u16_be(&buf, 4), None);
        assert_eq!(read_u32_be(&buf, 1), Some(0x01020304));
        assert_eq!(read_u32_be(&buf, 2), None);
        assert_eq!(read_u16_be(&buf, usize::MAX), None);
    }

    #[test]
    fn test_utf16le_path_encoding() {
        let bytes = encode_utf16le("/c*", true);
        assert_eq!(bytes, vec![0x2f, 0x00, 0x63, 0x00, 0x2a, 0x00, 0x00, 0x00]);
        assert_eq!(decode_utf16le(&bytes), "/c*");
        assert_eq!(encode_utf16le("ab", false).len(), 4);
        assert_eq!(decode_utf16le(&encode_utf16le("Ünïcode", false)), "Ünïcode");
    }

    #[test]
    fn test_hex_dump_layout() {
        assert_eq!(hex_dump(&[]), "[empty]");
        let dump = hex_dump(b"AB\x00");
        assert!(dump.starts_with("41 42 00 "));
        assert!(dump.ends_with(" |AB.|\n"));
        let two_rows = hex_dump(&[0u8; 17]);
        assert_eq!(two_rows.lines().count(), 2);
    }

    #[test]
    fn test_concat_and_sub_slice() {
        let joined = concat(&[&[1, 2], &[], &[3]]);
        assert_eq!(joined, vec![1, 2, 3]);
        assert_eq!(sub_slice(&joined, 1, 2), Some(&[2u8, 3][..]));
        assert_eq!(sub_slice(&joined, 2, 2), None);
    }
}
