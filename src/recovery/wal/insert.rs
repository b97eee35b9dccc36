use std::sync::atomic::Ordering;
use std::time::Instant;

use log::debug;

use crate::error::{WalError, WalResult};
use crate::recovery::lsn::segment_start;
use crate::recovery::Lsn;

use super::codec::{encode_record, prepare_record, PreparedRecord, RecordInput, RECORD_HEADER_SIZE};
use super::page::{
    header_for_page, page_header_size, ContRecordHeader, PageInfo, CONT_RECORD_HEADER_SIZE,
    LONG_PAGE_HEADER_SIZE, XLOG_BLCKSZ,
};
use super::result::LsnCache;
use super::{InsertState, WalManager, WalSession};

/// Bound on scan restarts caused by concurrent redo-pointer moves.
const MAX_INSERT_ATTEMPTS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsertResult {
    /// Start of the record header.
    pub start: Lsn,
    /// First byte after the record. For a segment switch this is the start
    /// of the next segment.
    pub end: Lsn,
}

/// Outcome of re-validating the unlocked scan once the insert lock is held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanOutcome {
    Proceed,
    RestartScan,
}

impl WalManager {
    /// Appends one record to the WAL. The record is in the page ring when this
    /// returns, but durable only after a flush covering `end`.
    pub fn insert(&self, session: &mut WalSession, input: &RecordInput<'_>) -> WalResult<InsertResult> {
        if !self.insert_allowed(session.permission) {
            return Err(WalError::RecoveryInProgress);
        }
        self.check_crashed()?;
        if !self.inserting.load(Ordering::Acquire) {
            return Err(WalError::Internal(
                "WAL insertion has not been started".to_string(),
            ));
        }
        if session.shutdown_written {
            return Err(WalError::Fatal(
                "WAL insertion after the shutdown checkpoint".to_string(),
            ));
        }
        let check_consistency = self.check_consistency.contains(&input.rmid);

        for _ in 0..MAX_INSERT_ATTEMPTS {
            let do_page_writes = self.full_page_writes.load(Ordering::Acquire)
                || self.force_page_writes.load(Ordering::Acquire);
            let prepared = prepare_record(input, session.redo, do_page_writes, check_consistency)?;

            let mut state = self.insert.lock();
            if self.recheck(&state, session, &prepared) == ScanOutcome::RestartScan {
                drop(state);
                debug!("redo pointer moved during record assembly, rescanning buffers");
                continue;
            }

            if prepared.is_switch() {
                let start = self.next_record_start(state.curr_pos);
                if start.segment_offset(self.segment_size) == LONG_PAGE_HEADER_SIZE as u64 {
                    // Nothing has been written to this segment yet.
                    let boundary = segment_start(start.segment(self.segment_size), self.segment_size);
                    return Ok(InsertResult {
                        start: boundary,
                        end: boundary,
                    });
                }
            }

            let result = {
                let copied = self.copy_record(&mut state, &mut session.cache, &prepared);
                self.critical(copied)?
            };
            drop(state);

            if prepared.is_switch() {
                self.flush_inner(&mut session.cache, result.end)?;
                *self.last_switch.lock() = (Instant::now(), result.end);
                debug!("switched WAL segment at {}", result.start);
            }
            return Ok(result);
        }
        Err(WalError::Internal(format!(
            "could not insert WAL record after {} attempts",
            MAX_INSERT_ATTEMPTS
        )))
    }

    /// Inserts a segment-switch record. Returns the start of the next
    /// segment, or the current segment start when nothing was written to it.
    pub fn switch_segment(&self, session: &mut WalSession) -> WalResult<Lsn> {
        use super::codec::checkpoint::XLOG_SWITCH;
        use crate::recovery::RmgrId;

        let input = RecordInput::new(RmgrId::Xlog, XLOG_SWITCH);
        Ok(self.insert(session, &input)?.end)
    }

    fn recheck(&self, state: &InsertState, session: &mut WalSession, prepared: &PreparedRecord) -> ScanOutcome {
        if state.redo != session.redo {
            session.redo = state.redo;
            if prepared.stale_against(state.redo) {
                return ScanOutcome::RestartScan;
            }
        }
        if (state.force_page_writes || state.full_page_writes) && !prepared.do_page_writes {
            return ScanOutcome::RestartScan;
        }
        ScanOutcome::Proceed
    }

    /// Lays the record into the ring. Runs under the insert lock; any error
    /// here leaves shared state inconsistent.
    fn copy_record(
        &self,
        state: &mut InsertState,
        cache: &mut LsnCache,
        prepared: &PreparedRecord,
    ) -> WalResult<InsertResult> {
        let mut pos = state.curr_pos;
        let offset = pos.page_offset(XLOG_BLCKSZ);
        if offset != 0 && XLOG_BLCKSZ - offset < RECORD_HEADER_SIZE {
            pos = pos.page_start(XLOG_BLCKSZ) + XLOG_BLCKSZ as u64;
        }
        if pos.page_offset(XLOG_BLCKSZ) == 0 {
            self.advance_page(state, cache, pos, None)?;
            pos = pos + page_header_size(pos, self.segment_size) as u64;
        }
        let start = pos;
        let bytes = encode_record(prepared, state.prev_record);

        let mut written = 0usize;
        loop {
            let room = XLOG_BLCKSZ - pos.page_offset(XLOG_BLCKSZ);
            let n = room.min(bytes.len() - written);
            self.ring.write_at(pos, &bytes[written..written + n]);
            written += n;
            pos = pos + n as u64;
            if written == bytes.len() {
                break;
            }
            let remaining = (bytes.len() - written) as u32;
            self.advance_page(state, cache, pos, Some(remaining))?;
            pos = pos + (page_header_size(pos, self.segment_size) + CONT_RECORD_HEADER_SIZE) as u64;
        }

        let end = pos.maxalign();
        state.prev_record = start;
        let next = if prepared.is_switch() {
            let seg_end = segment_start(start.segment(self.segment_size) + 1, self.segment_size);
            let page_end = if end.page_offset(XLOG_BLCKSZ) == 0 {
                end
            } else {
                end.page_start(XLOG_BLCKSZ) + XLOG_BLCKSZ as u64
            };
            if page_end < seg_end {
                self.gaps.lock().push_back((page_end, seg_end));
            }
            seg_end
        } else {
            end
        };
        state.curr_pos = next;
        self.published_insert.store(next.as_u64(), Ordering::Release);
        Ok(InsertResult { start, end: next })
    }

    /// Initializes the ring page starting at `page`, first making sure the
    /// slot's previous occupant has been written out.
    fn advance_page(
        &self,
        state: &InsertState,
        cache: &mut LsnCache,
        page: Lsn,
        cont: Option<u32>,
    ) -> WalResult<()> {
        let occupant_end = self.ring.occupant_end(page);
        if occupant_end.is_valid()
            && occupant_end > cache.read_cached().write
            && occupant_end > cache.refresh(&self.shared).write
        {
            // Nobody wrote the old page yet; do it ourselves.
            let mut ws = self.write.lock();
            if ws.result.write < occupant_end {
                self.write_pages(&mut ws, occupant_end, false)?;
            }
            cache.store(ws.result);
        }

        let mut header = header_for_page(
            page,
            self.timeline(),
            self.system_id,
            self.segment_size,
            cont.is_some(),
        );
        if !state.force_page_writes {
            header.info |= PageInfo::BKP_REMOVABLE;
        }
        self.ring
            .init_page(&header, cont.map(|rem_len| ContRecordHeader { rem_len }))?;
        self.shared.note_completed_page(page);
        Ok(())
    }
}
