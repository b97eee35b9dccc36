use std::fmt;
use std::ops::{Add, Sub};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{WalError, WalResult};

pub type TimeLineId = u32;
pub type SegNo = u64;

pub const MAXIMUM_ALIGNOF: usize = 8;
pub const DEFAULT_WAL_SEGMENT_SIZE: u64 = 16 * 1024 * 1024;
pub const MIN_WAL_SEGMENT_SIZE: u64 = 32 * 1024;
pub const MAX_WAL_SEGMENT_SIZE: u64 = 1024 * 1024 * 1024;

const LOG_ID_SPAN: u64 = 0x1_0000_0000;

#[inline]
pub const fn maxalign(len: usize) -> usize {
    (len + MAXIMUM_ALIGNOF - 1) & !(MAXIMUM_ALIGNOF - 1)
}

/// Byte position in the WAL stream. The high 32 bits are the logical log id
/// and the low 32 bits the offset inside it; ordering is plain `u64` order.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Lsn(pub u64);

impl Lsn {
    pub const INVALID: Lsn = Lsn(0);
    pub const MAX: Lsn = Lsn(u64::MAX);

    #[inline]
    pub const fn new(value: u64) -> Self {
        Lsn(value)
    }

    #[inline]
    pub const fn from_parts(log_id: u32, offset: u32) -> Self {
        Lsn(((log_id as u64) << 32) | offset as u64)
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn log_id(self) -> u32 {
        (self.0 >> 32) as u32
    }

    #[inline]
    pub const fn offset(self) -> u32 {
        self.0 as u32
    }

    #[inline]
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }

    /// Segment containing this position.
    #[inline]
    pub const fn segment(self, segment_size: u64) -> SegNo {
        self.0 / segment_size
    }

    /// Segment containing the byte just before this position. A position
    /// exactly on a segment boundary belongs to the previous segment.
    #[inline]
    pub const fn prev_segment(self, segment_size: u64) -> SegNo {
        (self.0.saturating_sub(1)) / segment_size
    }

    #[inline]
    pub const fn segment_offset(self, segment_size: u64) -> u64 {
        self.0 % segment_size
    }

    #[inline]
    pub const fn page_offset(self, page_size: usize) -> usize {
        (self.0 % page_size as u64) as usize
    }

    #[inline]
    pub const fn page_start(self, page_size: usize) -> Lsn {
        Lsn(self.0 - (self.0 % page_size as u64))
    }

    #[inline]
    pub const fn maxalign(self) -> Lsn {
        Lsn(maxalign(self.0 as usize) as u64)
    }

    pub fn checked_add(self, len: u64) -> Option<Lsn> {
        self.0.checked_add(len).map(Lsn)
    }

    pub fn saturating_sub(self, len: u64) -> Lsn {
        Lsn(self.0.saturating_sub(len))
    }
}

impl Add<u64> for Lsn {
    type Output = Lsn;

    fn add(self, rhs: u64) -> Lsn {
        Lsn(self.0 + rhs)
    }
}

impl Sub<Lsn> for Lsn {
    type Output = u64;

    fn sub(self, rhs: Lsn) -> u64 {
        self.0 - rhs.0
    }
}

impl From<u64> for Lsn {
    fn from(value: u64) -> Self {
        Lsn(value)
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.log_id(), self.offset())
    }
}

impl fmt::Debug for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for Lsn {
    type Err = WalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (hi, lo) = s
            .split_once('/')
            .ok_or_else(|| WalError::InvalidConfig(format!("invalid WAL location \"{}\"", s)))?;
        let hi = u32::from_str_radix(hi.trim(), 16)
            .map_err(|_| WalError::InvalidConfig(format!("invalid WAL location \"{}\"", s)))?;
        let lo = u32::from_str_radix(lo.trim(), 16)
            .map_err(|_| WalError::InvalidConfig(format!("invalid WAL location \"{}\"", s)))?;
        Ok(Lsn::from_parts(hi, lo))
    }
}

pub fn validate_segment_size(segment_size: u64) -> WalResult<()> {
    if !segment_size.is_power_of_two()
        || !(MIN_WAL_SEGMENT_SIZE..=MAX_WAL_SEGMENT_SIZE).contains(&segment_size)
    {
        return Err(WalError::InvalidConfig(format!(
            "WAL segment size must be a power of two between {} and {} bytes, got {}",
            MIN_WAL_SEGMENT_SIZE, MAX_WAL_SEGMENT_SIZE, segment_size
        )));
    }
    Ok(())
}

#[inline]
pub const fn segments_per_log_id(segment_size: u64) -> u64 {
    LOG_ID_SPAN / segment_size
}

#[inline]
pub const fn segment_start(segno: SegNo, segment_size: u64) -> Lsn {
    Lsn(segno * segment_size)
}

pub fn wal_file_name(tli: TimeLineId, segno: SegNo, segment_size: u64) -> String {
    let per_id = segments_per_log_id(segment_size);
    format!(
        "{:08X}{:08X}{:08X}",
        tli,
        (segno / per_id) as u32,
        (segno % per_id) as u32
    )
}

pub fn is_wal_file_name(name: &str) -> bool {
    name.len() == 24 && name.bytes().all(|b| b.is_ascii_hexdigit())
}

pub fn parse_wal_file_name(name: &str, segment_size: u64) -> Option<(TimeLineId, SegNo)> {
    if !is_wal_file_name(name) {
        return None;
    }
    let tli = u32::from_str_radix(&name[0..8], 16).ok()?;
    let log = u64::from_str_radix(&name[8..16], 16).ok()?;
    let seg = u64::from_str_radix(&name[16..24], 16).ok()?;
    let per_id = segments_per_log_id(segment_size);
    if seg >= per_id {
        return None;
    }
    Some((tli, log * per_id + seg))
}

pub fn history_file_name(tli: TimeLineId) -> String {
    format!("{:08X}.history", tli)
}

pub fn backup_history_file_name(
    tli: TimeLineId,
    start: Lsn,
    segment_size: u64,
) -> String {
    format!(
        "{}.{:08X}.backup",
        wal_file_name(tli, start.segment(segment_size), segment_size),
        start.segment_offset(segment_size) as u32
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEG_64MB: u64 = 64 * 1024 * 1024;

    #[test]
    fn parts_roundtrip_and_ordering() {
        let lsn = Lsn::from_parts(4, 0x0400_0000);
        assert_eq!(lsn.log_id(), 4);
        assert_eq!(lsn.offset(), 0x0400_0000);
        assert!(Lsn::from_parts(3, u32::MAX) < Lsn::from_parts(4, 0));
        assert_eq!(Lsn::from_parts(3, u32::MAX) + 1, Lsn::from_parts(4, 0));
        assert_eq!(lsn.to_string(), "4/4000000");
        assert_eq!("4/4000000".parse::<Lsn>().unwrap(), lsn);
    }

    #[test]
    fn segment_numbers_span_log_ids() {
        assert_eq!(segments_per_log_id(SEG_64MB), 64);
        let lsn = Lsn::from_parts(4, SEG_64MB as u32);
        assert_eq!(lsn.segment(SEG_64MB), 4 * 64 + 1);
        assert_eq!(lsn.prev_segment(SEG_64MB), 4 * 64);
        assert_eq!(segment_start(4 * 64 + 1, SEG_64MB), lsn);
    }

    #[test]
    fn file_names_roundtrip() {
        let seg = 16 * 1024 * 1024;
        let name = wal_file_name(1, 0x1FF, seg);
        assert_eq!(name, "0000000100000001000000FF");
        assert_eq!(parse_wal_file_name(&name, seg), Some((1, 0x1FF)));
        assert_eq!(parse_wal_file_name("00000001.history", seg), None);
        assert_eq!(history_file_name(3), "00000003.history");
        assert_eq!(
            backup_history_file_name(1, Lsn::from_parts(0, 0x0200_0028), seg),
            "000000010000000000000002.00000028.backup"
        );
    }

    #[test]
    fn segment_size_validation() {
        assert!(validate_segment_size(DEFAULT_WAL_SEGMENT_SIZE).is_ok());
        assert!(validate_segment_size(SEG_64MB).is_ok());
        assert!(validate_segment_size(3 * 1024 * 1024).is_err());
        assert!(validate_segment_size(4096).is_err());
    }
}
