//! TIME and DATETIME2 parameters survive encode, TYPE_INFO parse and decode
//! within half a unit of the chosen scale.

#![allow(clippy::unwrap_used)]

use bytes::{Buf, BufMut, BytesMut};
use chrono::{NaiveDate, NaiveTime, Timelike};
use proptest::prelude::*;
use tds_protocol::temporal::{
    datetime2_type_info, decode_datetime2, decode_time, time_type_info, write_datetime2_param,
    write_time_param,
};
use tds_protocol::{TdsVersion, read_metadata, read_value};

fn half_unit_ns(scale: u8) -> i64 {
    5 * 10i64.pow(8 - u32::from(scale))
}

fn column_prefix(type_info: [u8; 2]) -> BytesMut {
    let mut buf = BytesMut::new();
    buf.put_u32_le(0);
    buf.put_u16_le(0x0001);
    buf.put_slice(&type_info);
    buf
}

proptest! {
    #[test]
    fn time_roundtrip(secs in 0u32..86_399, nanos in 0u32..1_000_000_000, scale in 0u8..=7) {
        let time = NaiveTime::from_num_seconds_from_midnight_opt(secs, nanos).unwrap();

        let mut buf = column_prefix(time_type_info(scale));
        write_time_param(Some(&time), scale, &mut buf).unwrap();
        let mut src = buf.freeze();

        let metadata = read_metadata(&mut src, TdsVersion::V7_4).unwrap();
        prop_assert_eq!(metadata.scale, Some(scale));
        let mut raw = read_value(&mut src, &metadata).unwrap().unwrap();
        prop_assert!(!src.has_remaining());

        let decoded = decode_time(&mut raw, scale).unwrap();
        let diff = (decoded - time).num_nanoseconds().unwrap().abs();
        prop_assert!(diff <= half_unit_ns(scale), "diff {} at scale {}", diff, scale);
    }

    #[test]
    fn datetime2_roundtrip(
        days in 0i32..3_652_000,
        secs in 0u32..86_399,
        nanos in 0u32..1_000_000_000,
        scale in 0u8..=7,
    ) {
        let date = NaiveDate::from_num_days_from_ce_opt(days + 1).unwrap();
        let value = date.and_time(NaiveTime::from_num_seconds_from_midnight_opt(secs, nanos).unwrap());

        let mut buf = column_prefix(datetime2_type_info(scale));
        write_datetime2_param(Some(&value), scale, &mut buf).unwrap();
        let mut src = buf.freeze();

        let metadata = read_metadata(&mut src, TdsVersion::V7_4).unwrap();
        let mut raw = read_value(&mut src, &metadata).unwrap().unwrap();
        let decoded = decode_datetime2(&mut raw, scale).unwrap();

        prop_assert_eq!(decoded.date(), value.date());
        let diff = (decoded - value).num_nanoseconds().unwrap().abs();
        prop_assert!(diff <= half_unit_ns(scale));
    }
}

#[test]
fn null_time_parameter_reads_back_as_null() {
    let mut buf = column_prefix(time_type_info(7));
    write_time_param(None, 7, &mut buf).unwrap();
    let mut src = buf.freeze();

    let metadata = read_metadata(&mut src, TdsVersion::V7_4).unwrap();
    assert!(read_value(&mut src, &metadata).unwrap().is_none());
}

#[test]
fn whole_seconds_are_exact_at_scale_zero() {
    let time = NaiveTime::from_hms_opt(23, 59, 58).unwrap();
    let mut buf = column_prefix(time_type_info(0));
    write_time_param(Some(&time), 0, &mut buf).unwrap();
    let mut src = buf.freeze();

    let metadata = read_metadata(&mut src, TdsVersion::V7_4).unwrap();
    let mut raw = read_value(&mut src, &metadata).unwrap().unwrap();
    assert_eq!(raw.len(), 3);
    assert_eq!(decode_time(&mut raw, 0).unwrap().num_seconds_from_midnight(), 86_398);
}
