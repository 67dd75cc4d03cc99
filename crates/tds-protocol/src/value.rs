//! Raw column value reader.
//!
//! Splits a ROW / NBCROW / RETURNVALUE value off the token stream using the
//! column's [`Metadata`], without interpreting it. `None` is SQL NULL.
//! Typed decoding is left to codec functions such as
//! [`crate::temporal::decode_time`].

use bytes::{Buf, Bytes, BytesMut};

use crate::codec::{read_u8, read_u16_le, read_u32_le, read_u64_le};
use crate::error::ProtocolError;
use crate::metadata::Metadata;
use crate::types::TypeId;

const PLP_NULL: u64 = 0xFFFF_FFFF_FFFF_FFFF;
const CHARBIN_NULL: u16 = 0xFFFF;

fn take(src: &mut impl Buf, len: usize) -> Result<Bytes, ProtocolError> {
    if src.remaining() < len {
        return Err(ProtocolError::UnexpectedEof);
    }
    Ok(src.copy_to_bytes(len))
}

/// Read one column value.
pub fn read_value(src: &mut impl Buf, metadata: &Metadata) -> Result<Option<Bytes>, ProtocolError> {
    if let Some(size) = metadata.type_id.fixed_size() {
        if metadata.type_id == TypeId::Null {
            return Ok(None);
        }
        return take(src, size).map(Some);
    }

    if metadata.is_plp() {
        return read_plp(src);
    }

    match metadata.type_id {
        TypeId::VarChar
        | TypeId::Char
        | TypeId::NVarChar
        | TypeId::NChar
        | TypeId::VarBinary
        | TypeId::Binary => {
            let len = read_u16_le(src)?;
            if len == CHARBIN_NULL {
                Ok(None)
            } else {
                take(src, len as usize).map(Some)
            }
        }
        TypeId::Text | TypeId::NText | TypeId::Image => {
            let pointer_len = read_u8(src)? as usize;
            if pointer_len == 0 {
                return Ok(None);
            }
            // text pointer and timestamp
            take(src, pointer_len + 8)?;
            let len = read_u32_le(src)? as usize;
            take(src, len).map(Some)
        }
        TypeId::Variant => {
            let len = read_u32_le(src)? as usize;
            if len == 0 {
                Ok(None)
            } else {
                take(src, len).map(Some)
            }
        }
        _ => {
            let len = read_u8(src)? as usize;
            if len == 0 {
                Ok(None)
            } else {
                take(src, len).map(Some)
            }
        }
    }
}

/// Read a partially length-prefixed value into one buffer.
pub fn read_plp(src: &mut impl Buf) -> Result<Option<Bytes>, ProtocolError> {
    let total = read_u64_le(src)?;
    if total == PLP_NULL {
        return Ok(None);
    }
    let mut out = BytesMut::new();
    loop {
        let chunk = read_u32_le(src)? as usize;
        if chunk == 0 {
            break;
        }
        out.extend_from_slice(&take(src, chunk)?);
    }
    Ok(Some(out.freeze()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::metadata::read_type_info;
    use crate::metadata::ColumnFlags;
    use bytes::BufMut;

    fn metadata(type_info: &[u8]) -> Metadata {
        let mut src = &type_info[1..];
        let mut m = Metadata {
            user_type: 0,
            flags: ColumnFlags::NULLABLE,
            type_id: TypeId::from_u8(type_info[0]).unwrap(),
            collation: None,
            precision: None,
            scale: None,
            data_length: None,
            schema: None,
            udt_info: None,
        };
        read_type_info(&mut src, &mut m).unwrap();
        m
    }

    #[test]
    fn test_fixed_int() {
        let m = metadata(&[TypeId::Int as u8]);
        let mut src: &[u8] = &[1, 0, 0, 0, 9];
        assert_eq!(read_value(&mut src, &m).unwrap().unwrap().as_ref(), &[1, 0, 0, 0]);
        assert_eq!(src, &[9]);
    }

    #[test]
    fn test_intn_null() {
        let m = metadata(&[TypeId::IntN as u8, 4]);
        let mut src: &[u8] = &[0];
        assert_eq!(read_value(&mut src, &m).unwrap(), None);
    }

    #[test]
    fn test_nvarchar_null_and_value() {
        let m = metadata(&[TypeId::NVarChar as u8, 20, 0, 0x09, 0x04, 0xD0, 0x00, 0x34]);
        let mut src: &[u8] = &[0xFF, 0xFF, 2, 0, b'a', 0];
        assert_eq!(read_value(&mut src, &m).unwrap(), None);
        assert_eq!(read_value(&mut src, &m).unwrap().unwrap().as_ref(), &[b'a', 0]);
    }

    #[test]
    fn test_plp_chunks() {
        let m = metadata(&[TypeId::VarBinary as u8, 0xFF, 0xFF]);
        let mut buf = BytesMut::new();
        buf.put_u64_le(3);
        buf.put_u32_le(2);
        buf.put_slice(&[1, 2]);
        buf.put_u32_le(1);
        buf.put_slice(&[3]);
        buf.put_u32_le(0);
        let mut src = buf.freeze();
        assert_eq!(read_value(&mut src, &m).unwrap().unwrap().as_ref(), &[1, 2, 3]);
    }

    #[test]
    fn test_truncated_value() {
        let m = metadata(&[TypeId::BigInt as u8]);
        let mut src: &[u8] = &[1, 2];
        assert_eq!(read_value(&mut src, &m), Err(ProtocolError::UnexpectedEof));
    }
}
