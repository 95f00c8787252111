//! Big-endian USB/IP header primitives and little-endian USB descriptor
//! primitives, plus the fixed-size NUL-padded string fields used in both.

use byteorder::{BigEndian, LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

/// Writes `text` into a fixed-size NUL-padded byte field, as used for
/// `Device::path` and `Device::busID`. Truncates if `text` is longer than
/// `len` (the USB/IP wire format has no escape for that case).
pub fn write_fixed_str<W: Write>(w: &mut W, text: &str, len: usize) -> io::Result<()> {
    let bytes = text.as_bytes();
    let mut buf = vec![0u8; len];
    let n = bytes.len().min(len);
    buf[..n].copy_from_slice(&bytes[..n]);
    w.write_all(&buf)
}

/// Reads a fixed-size NUL-padded byte field back into a `String`, trimming
/// at the first NUL.
pub fn read_fixed_str<R: Read>(r: &mut R, len: usize) -> io::Result<String> {
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    Ok(String::from_utf8_lossy(&buf[..end]).into_owned())
}

pub fn write_u8<W: Write>(w: &mut W, v: u8) -> io::Result<()> {
    w.write_u8(v)
}
pub fn read_u8<R: Read>(r: &mut R) -> io::Result<u8> {
    r.read_u8()
}

pub fn write_u16_be<W: Write>(w: &mut W, v: u16) -> io::Result<()> {
    w.write_u16::<BigEndian>(v)
}
pub fn read_u16_be<R: Read>(r: &mut R) -> io::Result<u16> {
    r.read_u16::<BigEndian>()
}

pub fn write_u32_be<W: Write>(w: &mut W, v: u32) -> io::Result<()> {
    w.write_u32::<BigEndian>(v)
}
pub fn read_u32_be<R: Read>(r: &mut R) -> io::Result<u32> {
    r.read_u32::<BigEndian>()
}

pub fn write_i32_be<W: Write>(w: &mut W, v: i32) -> io::Result<()> {
    w.write_i32::<BigEndian>(v)
}
pub fn read_i32_be<R: Read>(r: &mut R) -> io::Result<i32> {
    r.read_i32::<BigEndian>()
}

pub fn write_u16_le<W: Write>(w: &mut W, v: u16) -> io::Result<()> {
    w.write_u16::<LittleEndian>(v)
}
pub fn read_u16_le<R: Read>(r: &mut R) -> io::Result<u16> {
    r.read_u16::<LittleEndian>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_str_round_trips_and_pads() {
        let mut buf = Vec::new();
        write_fixed_str(&mut buf, "1-1", 32).unwrap();
        assert_eq!(buf.len(), 32);
        let mut cursor = &buf[..];
        let out = read_fixed_str(&mut cursor, 32).unwrap();
        assert_eq!(out, "1-1");
    }

    #[test]
    fn fixed_str_truncates_when_too_long() {
        let mut buf = Vec::new();
        write_fixed_str(&mut buf, "this-string-is-longer-than-four", 4).unwrap();
        assert_eq!(buf.len(), 4);
    }

    #[test]
    fn be_le_round_trip() {
        let mut buf = Vec::new();
        write_u32_be(&mut buf, 0x0111_8005).unwrap();
        let mut cursor = &buf[..];
        assert_eq!(read_u32_be(&mut cursor).unwrap(), 0x0111_8005);

        let mut buf = Vec::new();
        write_u16_le(&mut buf, 0x1234).unwrap();
        assert_eq!(buf, [0x34, 0x12]);
    }
}
