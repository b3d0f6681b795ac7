//! ZIP on-disk constants and little-endian field access

use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};

pub const LOCAL_HEADER_SIG: u32 = 0x0403_4B50;
pub const CENTRAL_HEADER_SIG: u32 = 0x0201_4B50;
pub const EOCD_SIG: u32 = 0x0605_4B50;
pub const ZIP64_EOCD_SIG: u32 = 0x0606_4B50;
pub const ZIP64_LOCATOR_SIG: u32 = 0x0706_4B50;

pub const LOCAL_HEADER_LEN: usize = 30;
pub const CENTRAL_HEADER_LEN: usize = 46;
pub const EOCD_LEN: usize = 22;
pub const ZIP64_LOCATOR_LEN: usize = 20;
pub const ZIP64_EOCD_LEN: usize = 56;
pub const MAX_COMMENT_LEN: usize = u16::MAX as usize;

pub const METHOD_STORED: u16 = 0;
pub const METHOD_DEFLATED: u16 = 8;

pub const FLAG_ENCRYPTED: u16 = 0x0001;
pub const FLAG_DATA_DESCRIPTOR: u16 = 0x0008;
pub const FLAG_UTF8: u16 = 0x0800;

pub const ZIP64_EXTRA_ID: u16 = 0x0001;

/// Host byte of "version made by"
pub const HOST_DOS: u8 = 0;
pub const HOST_UNIX: u8 = 3;
pub const VERSION_NEEDED: u16 = 20;
pub const VERSION_MADE_BY: u16 = ((HOST_UNIX as u16) << 8) | VERSION_NEEDED;

pub const DOS_DIRECTORY_ATTR: u32 = 0x10;

pub const S_IFMT: u32 = 0o170_000;
pub const S_IFDIR: u32 = 0o040_000;
pub const S_IFREG: u32 = 0o100_000;
pub const S_IFLNK: u32 = 0o120_000;

pub fn read_u16_le(buf: &[u8], off: usize) -> Option<u16> {
    let bytes = buf.get(off..off.checked_add(2)?)?;
    Some(u16::from_le_bytes([bytes[0], bytes[1]]))
}

pub fn read_u32_le(buf: &[u8], off: usize) -> Option<u32> {
    let bytes = buf.get(off..off.checked_add(4)?)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

pub fn read_u64_le(buf: &[u8], off: usize) -> Option<u64> {
    let bytes = buf.get(off..off.checked_add(8)?)?;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(bytes);
    Some(u64::from_le_bytes(raw))
}

/// MS-DOS date/time fields to a naive local timestamp
pub fn from_dos_datetime(date: u16, time: u16) -> Option<NaiveDateTime> {
    let year = 1980 + i32::from(date >> 9);
    let month = u32::from((date >> 5) & 0x0F);
    let day = u32::from(date & 0x1F);
    let hour = u32::from(time >> 11);
    let minute = u32::from((time >> 5) & 0x3F);
    let second = u32::from(time & 0x1F) * 2;
    NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(hour, minute, second)
}

/// Inverse of `from_dos_datetime`; clamps to the 1980..=2107 range, 2-second resolution
pub fn to_dos_datetime(ts: NaiveDateTime) -> (u16, u16) {
    let year = ts.year().clamp(1980, 2107);
    if year != ts.year() {
        // Out of range: DOS epoch
        return ((1 << 5) | 1, 0);
    }
    let date = (((year - 1980) as u16) << 9) | ((ts.month() as u16) << 5) | ts.day() as u16;
    let time = ((ts.hour() as u16) << 11) | ((ts.minute() as u16) << 5) | (ts.second() / 2) as u16;
    (date, time)
}
