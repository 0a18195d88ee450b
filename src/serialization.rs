//! Little-endian field codecs shared by the stylesheet blob and the section store.

use std::io::{self, Read, Write};

/// Upper bound for any length-prefixed string read back from disk.
pub(crate) const MAX_STORED_STRING: usize = 64 * 1024;

pub(crate) fn write_u8<W: Write>(out: &mut W, value: u8) -> io::Result<()> {
    out.write_all(&[value])
}

pub(crate) fn read_u8<R: Read>(input: &mut R) -> io::Result<u8> {
    let mut buf = [0u8; 1];
    input.read_exact(&mut buf)?;
    Ok(buf[0])
}

pub(crate) fn write_bool<W: Write>(out: &mut W, value: bool) -> io::Result<()> {
    write_u8(out, if value { 1 } else { 0 })
}

pub(crate) fn read_bool<R: Read>(input: &mut R) -> io::Result<bool> {
    Ok(read_u8(input)? != 0)
}

pub(crate) fn write_u16<W: Write>(out: &mut W, value: u16) -> io::Result<()> {
    out.write_all(&value.to_le_bytes())
}

pub(crate) fn read_u16<R: Read>(input: &mut R) -> io::Result<u16> {
    let mut buf = [0u8; 2];
    input.read_exact(&mut buf)?;
    Ok(u16::from_le_bytes(buf))
}

pub(crate) fn write_i16<W: Write>(out: &mut W, value: i16) -> io::Result<()> {
    out.write_all(&value.to_le_bytes())
}

pub(crate) fn read_i16<R: Read>(input: &mut R) -> io::Result<i16> {
    let mut buf = [0u8; 2];
    input.read_exact(&mut buf)?;
    Ok(i16::from_le_bytes(buf))
}

pub(crate) fn write_u32<W: Write>(out: &mut W, value: u32) -> io::Result<()> {
    out.write_all(&value.to_le_bytes())
}

pub(crate) fn read_u32<R: Read>(input: &mut R) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    input.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

pub(crate) fn write_i32<W: Write>(out: &mut W, value: i32) -> io::Result<()> {
    out.write_all(&value.to_le_bytes())
}

pub(crate) fn read_i32<R: Read>(input: &mut R) -> io::Result<i32> {
    let mut buf = [0u8; 4];
    input.read_exact(&mut buf)?;
    Ok(i32::from_le_bytes(buf))
}

pub(crate) fn write_f32<W: Write>(out: &mut W, value: f32) -> io::Result<()> {
    write_u32(out, value.to_bits())
}

pub(crate) fn read_f32<R: Read>(input: &mut R) -> io::Result<f32> {
    Ok(f32::from_bits(read_u32(input)?))
}

/// `u32` byte length followed by UTF-8 bytes.
pub(crate) fn write_string<W: Write>(out: &mut W, value: &str) -> io::Result<()> {
    let bytes = value.as_bytes();
    write_u32(out, bytes.len() as u32)?;
    out.write_all(bytes)
}

pub(crate) fn read_string<R: Read>(input: &mut R) -> io::Result<String> {
    let len = read_u32(input)? as usize;
    read_string_body(input, len)
}

/// `u16` byte length followed by UTF-8 bytes.
pub(crate) fn write_short_string<W: Write>(out: &mut W, value: &str) -> io::Result<()> {
    let bytes = value.as_bytes();
    let len = bytes.len().min(u16::MAX as usize);
    write_u16(out, len as u16)?;
    out.write_all(&bytes[..len])
}

pub(crate) fn read_short_string<R: Read>(input: &mut R) -> io::Result<String> {
    let len = read_u16(input)? as usize;
    read_string_body(input, len)
}

fn read_string_body<R: Read>(input: &mut R, len: usize) -> io::Result<String> {
    if len > MAX_STORED_STRING {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("stored string length {} exceeds {}", len, MAX_STORED_STRING),
        ));
    }
    let mut buf = vec![0u8; len];
    input.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn integers_are_little_endian() {
        let mut out = Vec::new();
        write_u16(&mut out, 0x0102).unwrap();
        write_u32(&mut out, 0x0304_0506).unwrap();
        assert_eq!(out, vec![0x02, 0x01, 0x06, 0x05, 0x04, 0x03]);
    }

    #[test]
    fn oversized_string_length_is_rejected_without_allocating() {
        let mut out = Vec::new();
        write_u32(&mut out, u32::MAX).unwrap();
        let err = read_string(&mut Cursor::new(out)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn invalid_utf8_is_invalid_data() {
        let mut out = Vec::new();
        write_u16(&mut out, 2).unwrap();
        out.extend_from_slice(&[0xff, 0xfe]);
        let err = read_short_string(&mut Cursor::new(out)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
