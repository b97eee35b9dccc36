use bitflags::bitflags;
use bytes::{Buf, BufMut};

use crate::error::{WalError, WalResult};
use crate::recovery::lsn::TimeLineId;
use crate::recovery::Lsn;

pub const XLOG_BLCKSZ: usize = 8192;
pub const XLOG_PAGE_MAGIC: u16 = 0xD07E;

pub const SHORT_PAGE_HEADER_SIZE: usize = 16;
pub const LONG_PAGE_HEADER_SIZE: usize = 32;
pub const CONT_RECORD_HEADER_SIZE: usize = 8;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PageInfo: u16 {
        /// The page begins with the tail of a record started on an earlier page.
        const FIRST_IS_CONTRECORD = 0x0001;
        /// First page of a segment; carries the long header fields.
        const LONG_HEADER = 0x0002;
        /// Backup blocks on this page may be dropped by an archiver.
        const BKP_REMOVABLE = 0x0004;
    }
}

/// Extra fields only present on the first page of each segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LongHeaderFields {
    pub system_id: u64,
    pub segment_size: u32,
    pub page_size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalPageHeader {
    pub info: PageInfo,
    pub tli: TimeLineId,
    pub page_addr: Lsn,
    pub long: Option<LongHeaderFields>,
}

impl WalPageHeader {
    pub fn new(page_addr: Lsn, tli: TimeLineId, info: PageInfo) -> Self {
        Self {
            info: info - PageInfo::LONG_HEADER,
            tli,
            page_addr,
            long: None,
        }
    }

    pub fn with_long(mut self, fields: LongHeaderFields) -> Self {
        self.info |= PageInfo::LONG_HEADER;
        self.long = Some(fields);
        self
    }

    #[inline]
    pub fn size(&self) -> usize {
        if self.long.is_some() {
            LONG_PAGE_HEADER_SIZE
        } else {
            SHORT_PAGE_HEADER_SIZE
        }
    }

    #[inline]
    pub fn is_contrecord(&self) -> bool {
        self.info.contains(PageInfo::FIRST_IS_CONTRECORD)
    }

    pub fn encode_into(&self, mut buf: &mut [u8]) -> WalResult<()> {
        if buf.len() < self.size() {
            return Err(WalError::Internal(format!(
                "page header needs {} bytes, buffer has {}",
                self.size(),
                buf.len()
            )));
        }
        buf.put_u16_le(XLOG_PAGE_MAGIC);
        buf.put_u16_le(self.info.bits());
        buf.put_u32_le(self.tli);
        buf.put_u64_le(self.page_addr.as_u64());
        if let Some(long) = self.long {
            buf.put_u64_le(long.system_id);
            buf.put_u32_le(long.segment_size);
            buf.put_u32_le(long.page_size);
        }
        Ok(())
    }

    /// Parses the header at the start of a page, rejecting bad magic numbers
    /// and reserved info bits.
    pub fn decode(page: &[u8]) -> WalResult<Self> {
        if page.len() < SHORT_PAGE_HEADER_SIZE {
            return Err(WalError::Corrupt(format!(
                "page of {} bytes is too short for a header",
                page.len()
            )));
        }
        let mut cursor = page;
        let magic = cursor.get_u16_le();
        let raw_info = cursor.get_u16_le();
        let tli = cursor.get_u32_le();
        let page_addr = Lsn::new(cursor.get_u64_le());
        if magic != XLOG_PAGE_MAGIC {
            return Err(WalError::Corrupt(format!(
                "invalid magic number {:04X} in log page {}",
                magic, page_addr
            )));
        }
        let Some(info) = PageInfo::from_bits(raw_info) else {
            return Err(WalError::Corrupt(format!(
                "invalid info bits {:04X} in log page {}",
                raw_info, page_addr
            )));
        };
        let long = if info.contains(PageInfo::LONG_HEADER) {
            if page.len() < LONG_PAGE_HEADER_SIZE {
                return Err(WalError::Corrupt(format!(
                    "long page header at {} is truncated",
                    page_addr
                )));
            }
            Some(LongHeaderFields {
                system_id: cursor.get_u64_le(),
                segment_size: cursor.get_u32_le(),
                page_size: cursor.get_u32_le(),
            })
        } else {
            None
        };
        Ok(Self {
            info,
            tli,
            page_addr,
            long,
        })
    }

    /// A page that was never written is all zeros; readers treat it as the
    /// end of WAL rather than corruption.
    pub fn is_zeroed(page: &[u8]) -> bool {
        page.len() >= 2 && page[0] == 0 && page[1] == 0
    }
}

/// Header placed after the page header when a record continues from the
/// previous page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContRecordHeader {
    pub rem_len: u32,
}

impl ContRecordHeader {
    pub fn encode_into(&self, mut buf: &mut [u8]) -> WalResult<()> {
        if buf.len() < CONT_RECORD_HEADER_SIZE {
            return Err(WalError::Internal(
                "no room for continuation header".to_string(),
            ));
        }
        buf.put_u32_le(self.rem_len);
        buf.put_u32_le(0);
        Ok(())
    }

    pub fn decode(mut bytes: &[u8]) -> WalResult<Self> {
        if bytes.len() < CONT_RECORD_HEADER_SIZE {
            return Err(WalError::Corrupt(
                "continuation header truncated".to_string(),
            ));
        }
        Ok(Self {
            rem_len: bytes.get_u32_le(),
        })
    }
}

/// Builds the header a fresh ring-buffer page starts with. The first page of
/// every segment gets the long form.
pub fn header_for_page(
    page_addr: Lsn,
    tli: TimeLineId,
    system_id: u64,
    segment_size: u64,
    contrecord: bool,
) -> WalPageHeader {
    let mut info = PageInfo::empty();
    if contrecord {
        info |= PageInfo::FIRST_IS_CONTRECORD;
    }
    let header = WalPageHeader::new(page_addr, tli, info);
    if page_addr.segment_offset(segment_size) == 0 {
        header.with_long(LongHeaderFields {
            system_id,
            segment_size: segment_size as u32,
            page_size: XLOG_BLCKSZ as u32,
        })
    } else {
        header
    }
}

/// Size of the page header that occupies the start of the page at `page_addr`.
#[inline]
pub fn page_header_size(page_addr: Lsn, segment_size: u64) -> usize {
    if page_addr.segment_offset(segment_size) == 0 {
        LONG_PAGE_HEADER_SIZE
    } else {
        SHORT_PAGE_HEADER_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEG: u64 = 16 * 1024 * 1024;

    #[test]
    fn long_header_on_segment_start() {
        let mut page = vec![0u8; XLOG_BLCKSZ];
        let header = header_for_page(Lsn::new(SEG), 3, 0xABCD, SEG, false);
        assert_eq!(header.size(), LONG_PAGE_HEADER_SIZE);
        header.encode_into(&mut page).unwrap();
        let decoded = WalPageHeader::decode(&page).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(decoded.long.unwrap().system_id, 0xABCD);
    }

    #[test]
    fn short_header_with_continuation() {
        let mut page = vec![0u8; XLOG_BLCKSZ];
        let addr = Lsn::new(SEG + XLOG_BLCKSZ as u64);
        let header = header_for_page(addr, 1, 7, SEG, true);
        assert_eq!(header.size(), SHORT_PAGE_HEADER_SIZE);
        header.encode_into(&mut page).unwrap();
        ContRecordHeader { rem_len: 1234 }
            .encode_into(&mut page[SHORT_PAGE_HEADER_SIZE..])
            .unwrap();
        let decoded = WalPageHeader::decode(&page).unwrap();
        assert!(decoded.is_contrecord());
        let cont = ContRecordHeader::decode(&page[decoded.size()..]).unwrap();
        assert_eq!(cont.rem_len, 1234);
    }

    #[test]
    fn rejects_bad_magic_and_reserved_bits() {
        let mut page = vec![0u8; XLOG_BLCKSZ];
        assert!(WalPageHeader::is_zeroed(&page));
        assert!(WalPageHeader::decode(&page).is_err());

        header_for_page(Lsn::new(XLOG_BLCKSZ as u64), 1, 1, SEG, false)
            .encode_into(&mut page)
            .unwrap();
        page[2] |= 0x80;
        assert!(matches!(
            WalPageHeader::decode(&page),
            Err(WalError::Corrupt(_))
        ));
    }
}
