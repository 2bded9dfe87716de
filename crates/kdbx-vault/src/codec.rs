//! Primitive byte codecs shared by both file formats.
//!
//! Everything on the wire is little-endian. KDB timestamps are the packed
//! 5-byte structure of KeePass 1.x; KDBX 4 timestamps are seconds since
//! 0001-01-01T00:00:00Z.

use byteorder::{ByteOrder, LittleEndian};
use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Timelike, Utc};
use uuid::Uuid;

use crate::error::{Error, Result};

pub fn read_u16(buf: &[u8]) -> u16 {
    LittleEndian::read_u16(buf)
}

pub fn read_u32(buf: &[u8]) -> u32 {
    LittleEndian::read_u32(buf)
}

pub fn read_u64(buf: &[u8]) -> u64 {
    LittleEndian::read_u64(buf)
}

pub fn write_u16(value: u16) -> [u8; 2] {
    value.to_le_bytes()
}

pub fn write_u32(value: u32) -> [u8; 4] {
    value.to_le_bytes()
}

pub fn write_u64(value: u64) -> [u8; 8] {
    value.to_le_bytes()
}

/// Take `len` bytes from the front of `buf`, advancing it.
pub fn take<'a>(buf: &mut &'a [u8], len: usize) -> Result<&'a [u8]> {
    if buf.len() < len {
        return Err(Error::malformed(format!(
            "need {} bytes, {} available",
            len,
            buf.len()
        )));
    }
    let (head, tail) = buf.split_at(len);
    *buf = tail;
    Ok(head)
}

pub fn uuid_from_bytes(bytes: &[u8]) -> Result<Uuid> {
    let arr: [u8; 16] = bytes
        .try_into()
        .map_err(|_| Error::malformed("UUID field is not 16 bytes"))?;
    Ok(Uuid::from_bytes(arr))
}

pub fn uuid_to_bytes(uuid: &Uuid) -> [u8; 16] {
    *uuid.as_bytes()
}

/// Zero-terminated string, as stored in KDB string fields.
pub fn read_cstring(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

pub fn write_cstring(value: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(value.len() + 1);
    out.extend_from_slice(value.as_bytes());
    out.push(0);
    out
}

/// KDB "never expires" marker: 2999-12-28 23:59:59.
pub fn kdb_never_expire() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2999, 12, 28, 23, 59, 59).unwrap()
}

/// Unpack the KDB 5-byte packed date.
///
/// Layout: year (12 bits), month (4), day (5), hour (5), minute (6),
/// second (6). Out-of-range components are clamped to a safe epoch
/// instead of failing the whole import.
pub fn unpack_kdb_date(buf: &[u8; 5]) -> DateTime<Utc> {
    let dw1 = buf[0] as u32;
    let dw2 = buf[1] as u32;
    let dw3 = buf[2] as u32;
    let dw4 = buf[3] as u32;
    let dw5 = buf[4] as u32;

    let year = (dw1 << 6) | (dw2 >> 2);
    let month = ((dw2 & 0x03) << 2) | (dw3 >> 6);
    let day = (dw3 >> 1) & 0x1F;
    let hour = ((dw3 & 0x01) << 4) | (dw4 >> 4);
    let minute = ((dw4 & 0x0F) << 2) | (dw5 >> 6);
    let second = dw5 & 0x3F;

    Utc.with_ymd_and_hms(year as i32, month, day, hour, minute, second)
        .single()
        .unwrap_or_else(|| Utc.with_ymd_and_hms(2004, 1, 1, 0, 0, 0).unwrap())
}

/// Pack a timestamp into the KDB 5-byte date structure.
pub fn pack_kdb_date(time: &DateTime<Utc>) -> [u8; 5] {
    let year = time.year().clamp(0, 0xFFF) as u32;
    let month = time.month();
    let day = time.day();
    let hour = time.hour();
    let minute = time.minute();
    let second = time.second();

    [
        ((year >> 6) & 0x3F) as u8,
        (((year & 0x3F) << 2) | ((month >> 2) & 0x03)) as u8,
        (((month & 0x03) << 6) | ((day & 0x1F) << 1) | ((hour >> 4) & 0x01)) as u8,
        (((hour & 0x0F) << 4) | ((minute >> 2) & 0x0F)) as u8,
        (((minute & 0x03) << 6) | (second & 0x3F)) as u8,
    ]
}

/// Base of the .NET tick epoch used by KDBX 4 binary timestamps.
fn dotnet_epoch() -> DateTime<Utc> {
    let date = NaiveDate::from_ymd_opt(1, 1, 1).unwrap();
    Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0).unwrap())
}

/// Seconds since 0001-01-01 → timestamp, clamped into chrono's range.
pub fn datetime_from_epoch_seconds(seconds: i64) -> DateTime<Utc> {
    dotnet_epoch()
        .checked_add_signed(chrono::Duration::seconds(seconds))
        .unwrap_or_else(|| Utc.with_ymd_and_hms(2004, 1, 1, 0, 0, 0).unwrap())
}

pub fn datetime_to_epoch_seconds(time: &DateTime<Utc>) -> i64 {
    time.signed_duration_since(dotnet_epoch()).num_seconds()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kdb_date_round_trip() {
        let time = Utc.with_ymd_and_hms(2021, 7, 14, 13, 37, 42).unwrap();
        let packed = pack_kdb_date(&time);
        assert_eq!(unpack_kdb_date(&packed), time);
    }

    #[test]
    fn kdb_date_garbage_clamps() {
        // month 15, day 31: invalid, must clamp instead of panicking
        let time = unpack_kdb_date(&[0xFF; 5]);
        assert_eq!(time.year(), 2004);
    }

    #[test]
    fn epoch_seconds_round_trip() {
        let time = Utc.with_ymd_and_hms(2023, 2, 28, 8, 0, 1).unwrap();
        let secs = datetime_to_epoch_seconds(&time);
        assert_eq!(datetime_from_epoch_seconds(secs), time);
    }

    #[test]
    fn take_reports_truncation() {
        let data = [1u8, 2, 3];
        let mut cursor = &data[..];
        assert!(take(&mut cursor, 2).is_ok());
        assert!(take(&mut cursor, 2).is_err());
    }

    #[test]
    fn cstring_round_trip() {
        let bytes = write_cstring("hello");
        assert_eq!(bytes.last(), Some(&0));
        assert_eq!(read_cstring(&bytes), "hello");
    }
}
