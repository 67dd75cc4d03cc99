//! TIME and DATETIME2 wire codec.
//!
//! Both types store the time of day as a count of `10^-scale` second units
//! since midnight, in 3, 4 or 5 little-endian bytes depending on the scale.
//! DATETIME2 follows it with a 3-byte count of days since 0001-01-01.
//! Encoding rounds half up to the column's scale.

use bytes::{Buf, BufMut};
use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, Timelike};

use crate::error::ProtocolError;
use crate::types::TypeId;

/// Largest scale SQL Server accepts for TIME and DATETIME2.
pub const MAX_SCALE: u8 = 7;

const NANOS_PER_SECOND: u128 = 1_000_000_000;

/// Width in bytes of the time part for `scale`.
pub fn time_length(scale: u8) -> Result<usize, ProtocolError> {
    match scale {
        0..=2 => Ok(3),
        3 | 4 => Ok(4),
        5..=7 => Ok(5),
        _ => Err(ProtocolError::InvalidScale(scale)),
    }
}

/// Width in bytes of a DATETIME2 value for `scale`.
pub fn datetime2_length(scale: u8) -> Result<usize, ProtocolError> {
    Ok(time_length(scale)? + 3)
}

/// TYPE_INFO for a TIME parameter.
#[must_use]
pub const fn time_type_info(scale: u8) -> [u8; 2] {
    [TypeId::Time as u8, scale]
}

/// TYPE_INFO for a DATETIME2 parameter.
#[must_use]
pub const fn datetime2_type_info(scale: u8) -> [u8; 2] {
    [TypeId::DateTime2 as u8, scale]
}

fn ticks_for(time: &NaiveTime, scale: u8) -> u64 {
    let nanos = u128::from(time.num_seconds_from_midnight()) * NANOS_PER_SECOND
        + u128::from(time.nanosecond());
    let scaled = nanos * 10u128.pow(u32::from(scale));
    ((scaled + NANOS_PER_SECOND / 2) / NANOS_PER_SECOND) as u64
}

fn write_uint_le(dst: &mut impl BufMut, value: u64, width: usize) {
    dst.put_slice(&value.to_le_bytes()[..width]);
}

fn read_uint_le(src: &mut impl Buf, width: usize) -> Result<u64, ProtocolError> {
    if src.remaining() < width {
        return Err(ProtocolError::UnexpectedEof);
    }
    let mut bytes = [0u8; 8];
    src.copy_to_slice(&mut bytes[..width]);
    Ok(u64::from_le_bytes(bytes))
}

/// Write the time part of `time` at `scale`, without a length prefix.
pub fn encode_time(time: &NaiveTime, scale: u8, dst: &mut impl BufMut) -> Result<(), ProtocolError> {
    let width = time_length(scale)?;
    write_uint_le(dst, ticks_for(time, scale), width);
    Ok(())
}

/// Read a time part written at `scale`.
pub fn decode_time(src: &mut impl Buf, scale: u8) -> Result<NaiveTime, ProtocolError> {
    let width = time_length(scale)?;
    let ticks = u128::from(read_uint_le(src, width)?);
    let nanos = ticks * NANOS_PER_SECOND / 10u128.pow(u32::from(scale));
    let secs = u32::try_from(nanos / NANOS_PER_SECOND).map_err(|_| ProtocolError::ValueOutOfRange("time"))?;
    let frac = (nanos % NANOS_PER_SECOND) as u32;
    NaiveTime::from_num_seconds_from_midnight_opt(secs, frac)
        .ok_or(ProtocolError::ValueOutOfRange("time"))
}

/// Write a DATE as days since 0001-01-01.
pub fn encode_date(date: &NaiveDate, dst: &mut impl BufMut) -> Result<(), ProtocolError> {
    let days = u64::try_from(date.num_days_from_ce() - 1)
        .map_err(|_| ProtocolError::ValueOutOfRange("date"))?;
    write_uint_le(dst, days, 3);
    Ok(())
}

/// Read a DATE.
pub fn decode_date(src: &mut impl Buf) -> Result<NaiveDate, ProtocolError> {
    let days = read_uint_le(src, 3)? as i32;
    NaiveDate::from_num_days_from_ce_opt(days + 1).ok_or(ProtocolError::ValueOutOfRange("date"))
}

/// Write a DATETIME2 at `scale`, without a length prefix.
pub fn encode_datetime2(
    value: &NaiveDateTime,
    scale: u8,
    dst: &mut impl BufMut,
) -> Result<(), ProtocolError> {
    encode_time(&value.time(), scale, dst)?;
    encode_date(&value.date(), dst)
}

/// Read a DATETIME2 written at `scale`.
pub fn decode_datetime2(src: &mut impl Buf, scale: u8) -> Result<NaiveDateTime, ProtocolError> {
    let time = decode_time(src, scale)?;
    let date = decode_date(src)?;
    Ok(date.and_time(time))
}

/// Write a nullable TIME parameter value with its length byte.
pub fn write_time_param(
    time: Option<&NaiveTime>,
    scale: u8,
    dst: &mut impl BufMut,
) -> Result<(), ProtocolError> {
    match time {
        None => dst.put_u8(0),
        Some(time) => {
            dst.put_u8(time_length(scale)? as u8);
            encode_time(time, scale, dst)?;
        }
    }
    Ok(())
}

/// Write a nullable DATETIME2 parameter value with its length byte.
pub fn write_datetime2_param(
    value: Option<&NaiveDateTime>,
    scale: u8,
    dst: &mut impl BufMut,
) -> Result<(), ProtocolError> {
    match value {
        None => dst.put_u8(0),
        Some(value) => {
            dst.put_u8(datetime2_length(scale)? as u8);
            encode_datetime2(value, scale, dst)?;
        }
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_widths() {
        let widths: Vec<usize> = (0..=7).map(|s| time_length(s).unwrap()).collect();
        assert_eq!(widths, vec![3, 3, 3, 4, 4, 5, 5, 5]);
        assert_eq!(datetime2_length(0).unwrap(), 6);
        assert_eq!(datetime2_length(4).unwrap(), 7);
        assert_eq!(datetime2_length(7).unwrap(), 8);
        assert_eq!(time_length(8), Err(ProtocolError::InvalidScale(8)));
    }

    #[test]
    fn test_encode_time_scale_3() {
        let time = NaiveTime::from_hms_milli_opt(1, 2, 3, 456).unwrap();
        let mut buf = BytesMut::new();
        encode_time(&time, 3, &mut buf).unwrap();
        // 3_723_456 ms
        assert_eq!(&buf[..], &3_723_456u32.to_le_bytes());
    }

    #[test]
    fn test_encode_rounds_half_up() {
        let time = NaiveTime::from_hms_milli_opt(0, 0, 1, 500).unwrap();
        let mut buf = BytesMut::new();
        encode_time(&time, 0, &mut buf).unwrap();
        assert_eq!(&buf[..], &[2, 0, 0]);
    }

    #[test]
    fn test_encode_time_scale_7_uses_nanoseconds() {
        let time = NaiveTime::from_hms_nano_opt(0, 0, 1, 234_567_800).unwrap();
        let mut buf = BytesMut::new();
        encode_time(&time, 7, &mut buf).unwrap();
        assert_eq!(buf.len(), 5);
        assert_eq!(&buf[..], &[0x4E, 0x61, 0xBC, 0x00, 0x00]);
    }

    #[test]
    fn test_datetime2_epoch_and_date_part() {
        let value = NaiveDate::from_ymd_opt(1, 1, 2)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let mut buf = BytesMut::new();
        encode_datetime2(&value, 0, &mut buf).unwrap();
        assert_eq!(&buf[..], &[0, 0, 0, 1, 0, 0]);

        let decoded = decode_datetime2(&mut buf.freeze(), 0).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn test_null_param() {
        let mut buf = BytesMut::new();
        write_datetime2_param(None, 7, &mut buf).unwrap();
        assert_eq!(&buf[..], &[0x00]);
        assert_eq!(datetime2_type_info(7), [0x2A, 7]);
        assert_eq!(time_type_info(3), [0x29, 3]);
    }

    #[test]
    fn test_invalid_scale_rejected() {
        let time = NaiveTime::from_hms_opt(0, 0, 0).unwrap();
        let mut buf = BytesMut::new();
        assert!(write_time_param(Some(&time), 9, &mut buf).is_err());
    }
}
