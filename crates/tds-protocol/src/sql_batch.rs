//! SQL batch request encoding (packet type 0x01).
//!
//! From TDS 7.2 on, every batch, RPC and transaction manager request starts
//! with an ALL_HEADERS section carrying the current transaction descriptor.

use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::write_utf16_string;
use crate::version::TdsVersion;

/// Size of the ALL_HEADERS section written by [`write_all_headers`].
pub const ALL_HEADERS_LEN: usize = 22;

const TRANSACTION_DESCRIPTOR_HEADER: u16 = 0x0002;

/// Write ALL_HEADERS with a single transaction descriptor header.
///
/// `descriptor` is the value from the last BeginTransaction ENVCHANGE, or 0
/// in auto-commit mode. Nothing is written before TDS 7.2.
pub fn write_all_headers(dst: &mut impl BufMut, descriptor: u64, version: TdsVersion) {
    if !version.supports_transaction_descriptors() {
        return;
    }
    dst.put_u32_le(ALL_HEADERS_LEN as u32);
    dst.put_u32_le(18);
    dst.put_u16_le(TRANSACTION_DESCRIPTOR_HEADER);
    dst.put_u64_le(descriptor);
    // Outstanding request count; always 1 without MARS.
    dst.put_u32_le(1);
}

/// Encode a SQL batch payload.
#[must_use]
pub fn encode_sql_batch(sql: &str, descriptor: u64, version: TdsVersion) -> Bytes {
    let mut buf = BytesMut::with_capacity(ALL_HEADERS_LEN + sql.len() * 2);
    write_all_headers(&mut buf, descriptor, version);
    write_utf16_string(&mut buf, sql);
    buf.freeze()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_with_descriptor() {
        let payload = encode_sql_batch("SELECT 1", 0x0807_0605_0403_0201, TdsVersion::V7_4);

        assert_eq!(&payload[0..4], &22u32.to_le_bytes());
        assert_eq!(&payload[4..8], &18u32.to_le_bytes());
        assert_eq!(&payload[8..10], &[0x02, 0x00]);
        assert_eq!(&payload[10..18], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&payload[18..22], &1u32.to_le_bytes());
        assert_eq!(payload.len(), 22 + 16);
        assert_eq!(&payload[22..24], &[b'S', 0]);
    }

    #[test]
    fn test_legacy_batch_has_no_headers() {
        let payload = encode_sql_batch("GO", 0, TdsVersion::V7_1);
        assert_eq!(payload.as_ref(), &[b'G', 0, b'O', 0]);
    }
}
