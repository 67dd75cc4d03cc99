//! Primitive readers and writers shared by the protocol structures.
//!
//! TDS strings are UTF-16LE with a character-count prefix: `B_VARCHAR` uses
//! one byte, `US_VARCHAR` two. Readers fail with
//! [`ProtocolError::UnexpectedEof`] instead of returning partial values.

use bytes::{Buf, BufMut};

use crate::error::ProtocolError;

fn ensure(src: &impl Buf, needed: usize) -> Result<(), ProtocolError> {
    if src.remaining() < needed {
        Err(ProtocolError::UnexpectedEof)
    } else {
        Ok(())
    }
}

/// Read one byte.
pub fn read_u8(src: &mut impl Buf) -> Result<u8, ProtocolError> {
    ensure(src, 1)?;
    Ok(src.get_u8())
}

/// Read a little-endian `u16`.
pub fn read_u16_le(src: &mut impl Buf) -> Result<u16, ProtocolError> {
    ensure(src, 2)?;
    Ok(src.get_u16_le())
}

/// Read a little-endian `u32`.
pub fn read_u32_le(src: &mut impl Buf) -> Result<u32, ProtocolError> {
    ensure(src, 4)?;
    Ok(src.get_u32_le())
}

/// Read a little-endian `i32`.
pub fn read_i32_le(src: &mut impl Buf) -> Result<i32, ProtocolError> {
    ensure(src, 4)?;
    Ok(src.get_i32_le())
}

/// Read a little-endian `u64`.
pub fn read_u64_le(src: &mut impl Buf) -> Result<u64, ProtocolError> {
    ensure(src, 8)?;
    Ok(src.get_u64_le())
}

/// Read `len` raw bytes.
pub fn read_bytes(src: &mut impl Buf, len: usize) -> Result<Vec<u8>, ProtocolError> {
    ensure(src, len)?;
    let mut out = vec![0u8; len];
    src.copy_to_slice(&mut out);
    Ok(out)
}

/// Read a UTF-16LE string of `char_count` code units.
pub fn read_utf16_string(src: &mut impl Buf, char_count: usize) -> Result<String, ProtocolError> {
    ensure(src, char_count * 2)?;
    let units: Vec<u16> = (0..char_count).map(|_| src.get_u16_le()).collect();
    String::from_utf16(&units).map_err(|e| ProtocolError::StringEncoding(e.to_string()))
}

/// Read a `B_VARCHAR`.
pub fn read_b_varchar(src: &mut impl Buf) -> Result<String, ProtocolError> {
    let len = read_u8(src)? as usize;
    read_utf16_string(src, len)
}

/// Read a `US_VARCHAR`.
pub fn read_us_varchar(src: &mut impl Buf) -> Result<String, ProtocolError> {
    let len = read_u16_le(src)? as usize;
    read_utf16_string(src, len)
}

/// Read a `B_VARBYTE` (one-byte length, raw bytes).
pub fn read_b_varbyte(src: &mut impl Buf) -> Result<Vec<u8>, ProtocolError> {
    let len = read_u8(src)? as usize;
    read_bytes(src, len)
}

/// Write a UTF-16LE string without a length prefix.
pub fn write_utf16_string(dst: &mut impl BufMut, s: &str) {
    for unit in s.encode_utf16() {
        dst.put_u16_le(unit);
    }
}

/// Write a `B_VARCHAR`.
pub fn write_b_varchar(dst: &mut impl BufMut, s: &str) -> Result<(), ProtocolError> {
    let len = s.encode_utf16().count();
    let prefix = u8::try_from(len).map_err(|_| ProtocolError::TooLong {
        field: "B_VARCHAR",
        len,
        max: u8::MAX as usize,
    })?;
    dst.put_u8(prefix);
    write_utf16_string(dst, s);
    Ok(())
}

/// Write a `US_VARCHAR`.
pub fn write_us_varchar(dst: &mut impl BufMut, s: &str) -> Result<(), ProtocolError> {
    let len = s.encode_utf16().count();
    let prefix = u16::try_from(len).map_err(|_| ProtocolError::TooLong {
        field: "US_VARCHAR",
        len,
        max: u16::MAX as usize,
    })?;
    dst.put_u16_le(prefix);
    write_utf16_string(dst, s);
    Ok(())
}

/// Byte length of a string once UTF-16 encoded.
#[must_use]
pub fn utf16_byte_len(s: &str) -> usize {
    s.encode_utf16().count() * 2
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_b_varchar_layout() {
        let mut buf = BytesMut::new();
        write_b_varchar(&mut buf, "ab").unwrap();
        assert_eq!(&buf[..], &[0x02, b'a', 0x00, b'b', 0x00]);

        let mut cursor = buf.freeze();
        assert_eq!(read_b_varchar(&mut cursor).unwrap(), "ab");
    }

    #[test]
    fn test_us_varchar_non_ascii() {
        let original = "Grüße, 世界";
        let mut buf = BytesMut::new();
        write_us_varchar(&mut buf, original).unwrap();

        let mut cursor = buf.freeze();
        assert_eq!(read_us_varchar(&mut cursor).unwrap(), original);
    }

    #[test]
    fn test_b_varchar_too_long() {
        let long = "x".repeat(256);
        let mut buf = BytesMut::new();
        assert!(matches!(
            write_b_varchar(&mut buf, &long),
            Err(ProtocolError::TooLong { len: 256, .. })
        ));
    }

    #[test]
    fn test_truncated_string() {
        let mut cursor: &[u8] = &[0x03, b'a', 0x00];
        assert_eq!(read_b_varchar(&mut cursor), Err(ProtocolError::UnexpectedEof));
    }

    #[test]
    fn test_utf16_byte_len() {
        assert_eq!(utf16_byte_len("Hello"), 10);
        assert_eq!(utf16_byte_len("世界"), 4);
    }
}
