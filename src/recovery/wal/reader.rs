use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::sync::Arc;

use log::debug;

use crate::error::{WalError, WalResult};
use crate::recovery::lsn::{segment_start, SegNo, TimeLineId};
use crate::recovery::Lsn;

use super::codec::{decode_record, DecodedRecord, RecordHeader, MAX_RECORD_LENGTH, RECORD_HEADER_SIZE};
use super::page::{page_header_size, ContRecordHeader, WalPageHeader, CONT_RECORD_HEADER_SIZE, XLOG_BLCKSZ};
use super::storage::SegmentFileManager;

/// Somewhere WAL pages can be read from.
pub trait WalPageSource {
    /// Fills `buf` with the page starting at `page_addr`, trying the expected
    /// timelines newest first. Returns the timeline of the file the page came
    /// from, or `None` when no source has the page.
    fn read_page(
        &mut self,
        page_addr: Lsn,
        expected_tlis: &[TimeLineId],
        buf: &mut [u8],
    ) -> WalResult<Option<TimeLineId>>;

    /// Called before each record fetch starts.
    fn begin_record(&mut self) {}
}

/// Reads segments from the local WAL directory.
#[derive(Debug)]
pub struct LocalPageSource {
    segments: Arc<SegmentFileManager>,
    open: Option<(TimeLineId, SegNo, File)>,
}

impl LocalPageSource {
    pub fn new(segments: Arc<SegmentFileManager>) -> Self {
        Self {
            segments,
            open: None,
        }
    }

    pub fn segments(&self) -> &Arc<SegmentFileManager> {
        &self.segments
    }

    /// Drops the cached file handle so the next read reopens the segment.
    pub fn close(&mut self) {
        self.open = None;
    }
}

impl WalPageSource for LocalPageSource {
    fn read_page(
        &mut self,
        page_addr: Lsn,
        expected_tlis: &[TimeLineId],
        buf: &mut [u8],
    ) -> WalResult<Option<TimeLineId>> {
        let segment_size = self.segments.segment_size();
        let segno = page_addr.segment(segment_size);
        if !matches!(self.open, Some((_, open, _)) if open == segno) {
            self.open = None;
            for &tli in expected_tlis {
                if let Some(file) = self.segments.open_for_read(tli, segno)? {
                    self.open = Some((tli, segno, file));
                    break;
                }
            }
        }
        let Some((tli, _, file)) = self.open.as_ref() else {
            return Ok(None);
        };
        match file.read_exact_at(buf, page_addr.segment_offset(segment_size)) {
            Ok(()) => Ok(Some(*tli)),
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
            Err(err) => Err(WalError::Io(err)),
        }
    }
}

/// Sequential and random-access WAL record reader.
///
/// Corrupt or missing data is reported as the end of WAL (`Ok(None)`); the
/// reason is kept in [`WalReader::last_error`].
#[derive(Debug)]
pub struct WalReader<S> {
    source: S,
    segment_size: u64,
    system_id: u64,
    expected_tlis: Vec<TimeLineId>,
    page: Box<[u8]>,
    page_addr: Option<Lsn>,
    page_header: Option<WalPageHeader>,
    last_page_tli: TimeLineId,
    /// Timeline of the segment file the current page was read from.
    last_file_tli: TimeLineId,
    read_rec_ptr: Lsn,
    end_rec_ptr: Lsn,
    last_error: Option<String>,
}

impl<S: WalPageSource> WalReader<S> {
    pub fn new(source: S, segment_size: u64, system_id: u64, expected_tlis: Vec<TimeLineId>) -> Self {
        Self {
            source,
            segment_size,
            system_id,
            expected_tlis,
            page: vec![0u8; XLOG_BLCKSZ].into_boxed_slice(),
            page_addr: None,
            page_header: None,
            last_page_tli: 0,
            last_file_tli: 0,
            read_rec_ptr: Lsn::INVALID,
            end_rec_ptr: Lsn::INVALID,
            last_error: None,
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    /// Newest first.
    pub fn expected_timelines(&self) -> &[TimeLineId] {
        &self.expected_tlis
    }

    pub fn set_expected_timelines(&mut self, tlis: Vec<TimeLineId>) {
        self.expected_tlis = tlis;
        self.invalidate_page();
    }

    /// Start of the record returned last.
    pub fn read_rec_ptr(&self) -> Lsn {
        self.read_rec_ptr
    }

    /// Where the next sequential read continues.
    pub fn end_rec_ptr(&self) -> Lsn {
        self.end_rec_ptr
    }

    pub fn last_page_tli(&self) -> TimeLineId {
        self.last_page_tli
    }

    pub fn last_file_tli(&self) -> TimeLineId {
        self.last_file_tli
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn invalidate_page(&mut self) {
        self.page_addr = None;
        self.page_header = None;
    }

    /// Reads the record at `start`, or the one after the previous record when
    /// `start` is `None`. An explicit start is random access: the prev-link
    /// is not checked and the page timeline may go backwards.
    pub fn read_record(&mut self, start: Option<Lsn>) -> WalResult<Option<DecodedRecord>> {
        self.source.begin_record();
        self.last_error = None;
        let random_access = start.is_some();
        let pos = match start {
            Some(lsn) => {
                self.last_page_tli = 0;
                lsn
            }
            None => {
                if !self.end_rec_ptr.is_valid() {
                    return Err(WalError::Internal(
                        "sequential WAL read without a starting record".to_string(),
                    ));
                }
                self.next_record_start(self.end_rec_ptr)
            }
        };

        match self.read_record_at(pos, random_access) {
            Ok(Some(record)) => {
                self.read_rec_ptr = record.lsn;
                self.end_rec_ptr = record.end_lsn;
                Ok(Some(record))
            }
            Ok(None) => {
                self.invalidate_page();
                Ok(None)
            }
            Err(WalError::Corrupt(msg)) => {
                debug!("end of WAL: {}", msg);
                self.last_error = Some(msg);
                self.invalidate_page();
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    fn next_record_start(&self, pos: Lsn) -> Lsn {
        let offset = pos.page_offset(XLOG_BLCKSZ);
        let mut start = pos;
        if offset != 0 && XLOG_BLCKSZ - offset < RECORD_HEADER_SIZE {
            start = pos.page_start(XLOG_BLCKSZ) + XLOG_BLCKSZ as u64;
        }
        if start.page_offset(XLOG_BLCKSZ) == 0 {
            start = start + page_header_size(start, self.segment_size) as u64;
        }
        start
    }

    fn read_record_at(&mut self, pos: Lsn, random_access: bool) -> WalResult<Option<DecodedRecord>> {
        let offset = pos.page_offset(XLOG_BLCKSZ);
        if offset == 0 || XLOG_BLCKSZ - offset < RECORD_HEADER_SIZE {
            return Err(WalError::Corrupt(format!("invalid record offset at {}", pos)));
        }
        let mut page_addr = pos.page_start(XLOG_BLCKSZ);
        if !self.load_page(page_addr, random_access)? {
            return Ok(None);
        }
        let header_size = self.page_header.map(|h| h.size()).unwrap_or(0);
        if offset < header_size {
            return Err(WalError::Corrupt(format!("invalid record offset at {}", pos)));
        }
        if self.page_header.is_some_and(|h| h.is_contrecord()) && offset == header_size {
            return Err(WalError::Corrupt(format!("contrecord is requested by {}", pos)));
        }

        let header = RecordHeader::decode(&self.page[offset..offset + RECORD_HEADER_SIZE])?;
        if header.tot_len == 0 {
            return Err(WalError::Corrupt(format!("record with zero length at {}", pos)));
        }
        let total = header.tot_len as usize;
        if total < RECORD_HEADER_SIZE || total > MAX_RECORD_LENGTH {
            return Err(WalError::Corrupt(format!(
                "record length {} at {} is invalid",
                total, pos
            )));
        }
        if random_access {
            if header.prev >= pos {
                return Err(WalError::Corrupt(format!(
                    "record with incorrect prev-link {} at {}",
                    header.prev, pos
                )));
            }
        } else if header.prev != self.read_rec_ptr {
            return Err(WalError::Corrupt(format!(
                "record with incorrect prev-link {} at {}",
                header.prev, pos
            )));
        }

        // tot_len is unverified until the CRC check; grow only as pages arrive.
        let first = total.min(XLOG_BLCKSZ - offset);
        let mut bytes = Vec::with_capacity(first);
        bytes.extend_from_slice(&self.page[offset..offset + first]);
        let mut end = pos + first as u64;
        while bytes.len() < total {
            page_addr = page_addr + XLOG_BLCKSZ as u64;
            if !self.load_page(page_addr, random_access)? {
                return Ok(None);
            }
            let Some(page_header) = self.page_header.filter(|h| h.is_contrecord()) else {
                return Err(WalError::Corrupt(format!(
                    "there is no contrecord flag in log page {}",
                    page_addr
                )));
            };
            let cont = ContRecordHeader::decode(&self.page[page_header.size()..])?;
            let remaining = total - bytes.len();
            if cont.rem_len == 0 || cont.rem_len as usize != remaining {
                return Err(WalError::Corrupt(format!(
                    "invalid contrecord length {} in log page {}",
                    cont.rem_len, page_addr
                )));
            }
            let data_start = page_header.size() + CONT_RECORD_HEADER_SIZE;
            let n = remaining.min(XLOG_BLCKSZ - data_start);
            bytes.extend_from_slice(&self.page[data_start..data_start + n]);
            end = page_addr + (data_start + n) as u64;
        }

        let mut record = decode_record(&bytes, pos, end.maxalign())?;
        if record.is_switch() {
            record.end_lsn = segment_start(pos.segment(self.segment_size) + 1, self.segment_size);
        }
        Ok(Some(record))
    }

    /// Loads and validates a page; `Ok(false)` when no source has it.
    fn load_page(&mut self, page_addr: Lsn, random_access: bool) -> WalResult<bool> {
        if self.page_addr == Some(page_addr) {
            return Ok(true);
        }
        self.invalidate_page();
        let Some(file_tli) = self
            .source
            .read_page(page_addr, &self.expected_tlis, &mut self.page)?
        else {
            return Ok(false);
        };
        let header = WalPageHeader::decode(&self.page)?;
        self.validate_page_header(&header, page_addr, random_access)?;
        self.last_page_tli = header.tli;
        self.last_file_tli = file_tli;
        self.page_header = Some(header);
        self.page_addr = Some(page_addr);
        Ok(true)
    }

    fn validate_page_header(&self, header: &WalPageHeader, page_addr: Lsn, random_access: bool) -> WalResult<()> {
        if header.page_addr != page_addr {
            return Err(WalError::Corrupt(format!(
                "unexpected pageaddr {} in log page {}",
                header.page_addr, page_addr
            )));
        }
        let segment_first = page_addr.segment_offset(self.segment_size) == 0;
        match (segment_first, header.long) {
            (true, Some(long)) => {
                if long.system_id != self.system_id {
                    return Err(WalError::Corrupt(format!(
                        "WAL file is from different database system: WAL file database system identifier is {}, pg_control database system identifier is {}",
                        long.system_id, self.system_id
                    )));
                }
                if long.segment_size as u64 != self.segment_size {
                    return Err(WalError::Corrupt(
                        "WAL file is from different database system: incorrect XLOG_SEG_SIZE in page header".to_string(),
                    ));
                }
                if long.page_size as usize != XLOG_BLCKSZ {
                    return Err(WalError::Corrupt(
                        "WAL file is from different database system: incorrect XLOG_BLCKSZ in page header".to_string(),
                    ));
                }
            }
            (true, None) => {
                return Err(WalError::Corrupt(format!(
                    "missing long header on first page of segment at {}",
                    page_addr
                )));
            }
            (false, Some(_)) => {
                return Err(WalError::Corrupt(format!(
                    "unexpected long header in log page {}",
                    page_addr
                )));
            }
            (false, None) => {}
        }
        if !self.expected_tlis.contains(&header.tli) {
            return Err(WalError::Corrupt(format!(
                "unexpected timeline ID {} in log page {}",
                header.tli, page_addr
            )));
        }
        if !random_access && header.tli < self.last_page_tli {
            return Err(WalError::Corrupt(format!(
                "out-of-sequence timeline ID {} (after {}) in log page {}",
                header.tli, self.last_page_tli, page_addr
            )));
        }
        Ok(())
    }

    /// Image of the page at `page_addr`, used to resume insertion on the
    /// partially filled last page.
    pub fn page_image(&mut self, page_addr: Lsn) -> WalResult<Option<Vec<u8>>> {
        if !self.load_page(page_addr, true)? {
            return Ok(None);
        }
        Ok(Some(self.page.to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recovery::wal::codec::checkpoint::XLOG_NOOP;
    use crate::recovery::wal::codec::RecordInput;
    use crate::recovery::wal::page::LONG_PAGE_HEADER_SIZE;
    use crate::recovery::wal::tests::{started_manager, SEG};
    use crate::recovery::wal::InsertPermission;
    use crate::recovery::RmgrId;

    #[test]
    fn reassembles_records_spanning_pages() {
        let (_dir, wal) = started_manager();
        let mut session = wal.session(InsertPermission::Allowed);
        let big: Vec<u8> = (0..3 * XLOG_BLCKSZ).map(|i| (i % 251) as u8).collect();
        let mut input = RecordInput::new(RmgrId::Xlog, XLOG_NOOP);
        input.add_data(&big);
        let first = wal.insert(&mut session, &input).unwrap();
        let mut small = RecordInput::new(RmgrId::Xlog, XLOG_NOOP);
        small.add_data(b"tail");
        let second = wal.insert(&mut session, &small).unwrap();
        wal.flush_session(&mut session, second.end).unwrap();

        let mut reader = wal.reader();
        let record = reader.read_record(Some(first.start)).unwrap().unwrap();
        assert_eq!(record.data, big);
        assert_eq!(record.end_lsn, first.end);
        let next = reader.read_record(None).unwrap().unwrap();
        assert_eq!(next.lsn, second.start);
        assert_eq!(next.header.prev, first.start);
        assert!(reader.read_record(None).unwrap().is_none());
        assert!(reader.last_error().is_some());
    }

    #[test]
    fn switch_record_continues_in_next_segment() {
        let (_dir, wal) = started_manager();
        let mut session = wal.session(InsertPermission::Allowed);
        let mut input = RecordInput::new(RmgrId::Xlog, XLOG_NOOP);
        input.add_data(b"before");
        let before = wal.insert(&mut session, &input).unwrap();
        let next_seg = wal.switch_segment(&mut session).unwrap();
        let after = wal.insert(&mut session, &input).unwrap();
        assert_eq!(after.start, next_seg + LONG_PAGE_HEADER_SIZE as u64);
        wal.flush_session(&mut session, after.end).unwrap();

        let mut reader = wal.reader();
        reader.read_record(Some(before.start)).unwrap().unwrap();
        let switch = reader.read_record(None).unwrap().unwrap();
        assert!(switch.is_switch());
        assert_eq!(switch.end_lsn, segment_start(2, SEG));
        let record = reader.read_record(None).unwrap().unwrap();
        assert_eq!(record.lsn, after.start);
    }

    #[test]
    fn rejects_foreign_system_and_timeline() {
        let (_dir, wal) = started_manager();
        let mut session = wal.session(InsertPermission::Allowed);
        let mut input = RecordInput::new(RmgrId::Xlog, XLOG_NOOP);
        input.add_data(b"x");
        let rec = wal.insert(&mut session, &input).unwrap();
        wal.flush_session(&mut session, rec.end).unwrap();

        let source = LocalPageSource::new(Arc::clone(wal.segments()));
        let mut foreign = WalReader::new(source, SEG, wal.system_id() + 1, vec![wal.timeline()]);
        assert!(foreign.read_record(Some(rec.start)).unwrap().is_none());
        assert!(foreign.last_error().unwrap().contains("different database system"));

        // Segment exists only on timeline 1; a reader expecting 1 and 2 still
        // finds it, one expecting only 2 does not.
        let source = LocalPageSource::new(Arc::clone(wal.segments()));
        let mut both = WalReader::new(source, SEG, wal.system_id(), vec![2, 1]);
        assert!(both.read_record(Some(rec.start)).unwrap().is_some());
        let source = LocalPageSource::new(Arc::clone(wal.segments()));
        let mut other = WalReader::new(source, SEG, wal.system_id(), vec![2]);
        assert!(other.read_record(Some(rec.start)).unwrap().is_none());
    }

    #[test]
    fn torn_prev_link_ends_sequential_read() {
        let (_dir, wal) = started_manager();
        let mut session = wal.session(InsertPermission::Allowed);
        let mut input = RecordInput::new(RmgrId::Xlog, XLOG_NOOP);
        input.add_data(b"one");
        let first = wal.insert(&mut session, &input).unwrap();
        let second = wal.insert(&mut session, &input).unwrap();
        wal.flush_session(&mut session, second.end).unwrap();

        // Overwrite the second record's prev-link on disk.
        let path = wal.segments().segment_path(wal.timeline(), 1);
        let file = std::fs::OpenOptions::new().write(true).open(path).unwrap();
        let prev_offset = second.start.segment_offset(SEG) + 16;
        file.write_all_at(&0x10u64.to_le_bytes(), prev_offset).unwrap();

        let mut reader = wal.reader();
        assert!(reader.read_record(Some(first.start)).unwrap().is_some());
        assert!(reader.read_record(None).unwrap().is_none());
        assert!(reader.last_error().unwrap().contains("prev-link"));
    }

    #[test]
    fn oversized_length_ends_read_at_missing_continuation() {
        let (_dir, wal) = started_manager();
        let mut session = wal.session(InsertPermission::Allowed);
        let mut input = RecordInput::new(RmgrId::Xlog, XLOG_NOOP);
        input.add_data(b"one");
        let first = wal.insert(&mut session, &input).unwrap();
        let second = wal.insert(&mut session, &input).unwrap();
        wal.flush_session(&mut session, second.end).unwrap();

        // A garbage tot_len of the largest legal size on the last written page.
        let path = wal.segments().segment_path(wal.timeline(), 1);
        let file = std::fs::OpenOptions::new().write(true).open(path).unwrap();
        let len_offset = second.start.segment_offset(SEG);
        file.write_all_at(&(MAX_RECORD_LENGTH as u32).to_le_bytes(), len_offset).unwrap();

        let mut reader = wal.reader();
        assert!(reader.read_record(Some(first.start)).unwrap().is_some());
        assert!(reader.read_record(None).unwrap().is_none());
    }
}
