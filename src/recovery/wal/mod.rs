pub mod codec;
pub mod page;
pub mod reader;
pub mod storage;

mod buffer;
mod insert;
mod result;
mod writer;

use std::collections::VecDeque;
use std::fmt;
use std::fs::File;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use log::{info, warn};
use parking_lot::Mutex;

use crate::config::DatabaseOptions;
use crate::error::{WalError, WalResult};
use crate::recovery::archive::ArchiveStatus;
use crate::recovery::checkpoint::CheckpointRequests;
use crate::recovery::control_file::ControlFileManager;
use crate::recovery::lsn::{SegNo, TimeLineId};
use crate::recovery::Lsn;
use crate::utils::timestamp::TimestampTz;

use buffer::PageRing;
use codec::checkpoint::CheckpointRecord;
use page::{page_header_size, XLOG_BLCKSZ};
use result::SharedWriteResult;
use writer::WalWriterRuntime;

pub use codec::RECORD_HEADER_SIZE;
pub use insert::InsertResult;
pub use reader::{LocalPageSource, WalPageSource, WalReader};
pub use result::{LsnCache, WriteResult};
pub use storage::{SegmentFile, SegmentFileManager, XLOG_DIR};
pub use writer::WalWriterHandle;

/// Whether a session may insert WAL. Most sessions must check whether
/// recovery is still running; the startup path that writes the
/// end-of-recovery checkpoint is allowed before recovery is declared over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertPermission {
    Allowed,
    Denied,
    CheckRecovery,
}

/// Per-thread insertion context: the redo pointer and write/flush result
/// this thread last saw.
#[derive(Debug)]
pub struct WalSession {
    redo: Lsn,
    cache: LsnCache,
    permission: InsertPermission,
    shutdown_written: bool,
}

impl WalSession {
    pub fn permission(&self) -> InsertPermission {
        self.permission
    }

    pub fn cached_result(&self) -> WriteResult {
        self.cache.read_cached()
    }

    pub fn cached_redo(&self) -> Lsn {
        self.redo
    }

    /// After a shutdown checkpoint the session must not insert again.
    pub(crate) fn mark_shutdown_written(&mut self) {
        self.shutdown_written = true;
    }
}

/// Where insertion resumes after startup. `last_page` is the image of the
/// partially filled page containing `insert_pos`, if any.
#[derive(Debug, Clone, Default)]
pub struct StartPosition {
    pub insert_pos: Lsn,
    pub prev_record: Lsn,
    pub redo: Lsn,
    pub last_page: Option<Vec<u8>>,
}

#[derive(Debug)]
struct InsertState {
    /// Next byte to fill; may sit on a page boundary whose page is not yet
    /// initialized.
    curr_pos: Lsn,
    prev_record: Lsn,
    redo: Lsn,
    full_page_writes: bool,
    force_page_writes: bool,
    exclusive_backup: bool,
}

#[derive(Debug)]
struct WriterState {
    result: WriteResult,
    open: Option<(SegNo, File)>,
}

/// A checkpoint record seen during replay, kept for restartpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayedCheckpoint {
    pub lsn: Lsn,
    pub end_lsn: Lsn,
    pub checkpoint: CheckpointRecord,
    /// Every resource manager agreed replay may restart here.
    pub safe: bool,
}

#[derive(Debug, Default)]
struct ReplayState {
    /// End of the record being (or last) replayed.
    replay_end: Lsn,
    replay_end_tli: TimeLineId,
    last_replayed_end: Lsn,
    last_checkpoint: Option<ReplayedCheckpoint>,
    last_xact_time: Option<TimestampTz>,
}

/// The WAL engine: insertion state, the page ring, the writer and the
/// positions every other component reads. One instance per data directory.
pub struct WalManager {
    segment_size: u64,
    system_id: u64,
    tli: AtomicU32,
    /// Timelines the reader accepts, newest first.
    timeline_history: Mutex<Vec<TimeLineId>>,
    wal_buffers: usize,
    check_consistency: Vec<crate::recovery::RmgrId>,
    insert: Mutex<InsertState>,
    write: Mutex<WriterState>,
    shared: SharedWriteResult,
    published_insert: AtomicU64,
    full_page_writes: AtomicBool,
    force_page_writes: AtomicBool,
    ring: PageRing,
    /// Ranges skipped by segment switches, in LSN order.
    gaps: Mutex<VecDeque<(Lsn, Lsn)>>,
    segments: Arc<SegmentFileManager>,
    control: Arc<ControlFileManager>,
    archive: Option<ArchiveStatus>,
    checkpoint_requests: Arc<CheckpointRequests>,
    checkpoint_segments: u64,
    inserting: AtomicBool,
    in_recovery: AtomicBool,
    crashed: AtomicBool,
    replay: Mutex<ReplayState>,
    last_switch: Mutex<(Instant, Lsn)>,
    writer: Mutex<Option<WalWriterRuntime>>,
}

impl WalManager {
    /// Builds the engine for an existing data directory. The engine starts in
    /// recovery mode; `start_inserting` and `finish_recovery` open it for
    /// writes.
    pub fn open(
        options: &DatabaseOptions,
        data_dir: &Path,
        control: Arc<ControlFileManager>,
    ) -> WalResult<Self> {
        options.wal.validate()?;
        let snapshot = control.snapshot();
        let segment_size = snapshot.xlog_seg_size as u64;
        let archiving = options.archive.archiving_active();
        let segments = Arc::new(SegmentFileManager::new(
            data_dir.join(XLOG_DIR),
            segment_size,
            options.wal.fsync,
            archiving,
        )?);
        let archive = archiving.then(|| ArchiveStatus::new(segments.directory()));
        let tli = snapshot.checkpoint_copy.this_tli.max(1);
        Ok(Self {
            segment_size,
            system_id: snapshot.system_identifier,
            tli: AtomicU32::new(tli),
            timeline_history: Mutex::new(vec![tli]),
            wal_buffers: options.wal.wal_buffers,
            check_consistency: options.wal.consistency_checking.clone(),
            insert: Mutex::new(InsertState {
                curr_pos: Lsn::INVALID,
                prev_record: Lsn::INVALID,
                redo: snapshot.checkpoint_copy.redo,
                full_page_writes: options.wal.full_page_writes,
                force_page_writes: false,
                exclusive_backup: false,
            }),
            write: Mutex::new(WriterState {
                result: WriteResult::default(),
                open: None,
            }),
            shared: SharedWriteResult::new(WriteResult::default(), snapshot.checkpoint_copy.redo),
            published_insert: AtomicU64::new(0),
            full_page_writes: AtomicBool::new(options.wal.full_page_writes),
            force_page_writes: AtomicBool::new(false),
            ring: PageRing::new(options.wal.wal_buffers),
            gaps: Mutex::new(VecDeque::new()),
            segments,
            control,
            archive,
            checkpoint_requests: Arc::new(CheckpointRequests::new()),
            checkpoint_segments: options.checkpoint.checkpoint_segments,
            inserting: AtomicBool::new(false),
            in_recovery: AtomicBool::new(true),
            crashed: AtomicBool::new(false),
            replay: Mutex::new(ReplayState::default()),
            last_switch: Mutex::new((Instant::now(), Lsn::INVALID)),
            writer: Mutex::new(None),
        })
    }

    pub fn session(&self, permission: InsertPermission) -> WalSession {
        WalSession {
            redo: self.shared.redo(),
            cache: LsnCache::new(self.shared.result()),
            permission,
            shutdown_written: false,
        }
    }

    #[inline]
    pub fn segment_size(&self) -> u64 {
        self.segment_size
    }

    #[inline]
    pub fn system_id(&self) -> u64 {
        self.system_id
    }

    #[inline]
    pub fn timeline(&self) -> TimeLineId {
        self.tli.load(Ordering::Acquire)
    }

    /// Switches the insert timeline; `history` lists the accepted timelines
    /// newest first and must start with `tli`.
    pub(crate) fn set_timeline(&self, tli: TimeLineId, history: Vec<TimeLineId>) {
        self.tli.store(tli, Ordering::Release);
        let mut accepted = self.timeline_history.lock();
        *accepted = history;
        if accepted.first() != Some(&tli) {
            accepted.insert(0, tli);
        }
    }

    pub fn timeline_history(&self) -> Vec<TimeLineId> {
        self.timeline_history.lock().clone()
    }

    pub fn segments(&self) -> &Arc<SegmentFileManager> {
        &self.segments
    }

    pub fn control_file(&self) -> &Arc<ControlFileManager> {
        &self.control
    }

    pub fn archive_status(&self) -> Option<&ArchiveStatus> {
        self.archive.as_ref()
    }

    pub fn checkpoint_requests(&self) -> &Arc<CheckpointRequests> {
        &self.checkpoint_requests
    }

    /// Position the next record would be inserted at (possibly a page
    /// boundary).
    #[inline]
    pub fn insert_position(&self) -> Lsn {
        Lsn::new(self.published_insert.load(Ordering::Acquire))
    }

    pub fn write_result(&self) -> WriteResult {
        self.shared.result()
    }

    pub fn flushed_lsn(&self) -> Lsn {
        self.shared.result().flush
    }

    /// Redo pointer of the checkpoint in progress or last completed.
    pub fn redo_pointer(&self) -> Lsn {
        self.shared.redo()
    }

    #[inline]
    pub fn in_recovery(&self) -> bool {
        self.in_recovery.load(Ordering::Acquire)
    }

    pub fn is_crashed(&self) -> bool {
        self.crashed.load(Ordering::Acquire)
    }

    fn check_crashed(&self) -> WalResult<()> {
        if self.is_crashed() {
            return Err(WalError::Panic(
                "WAL engine stopped after a PANIC; restart required".to_string(),
            ));
        }
        Ok(())
    }

    /// Marks shared state untrustworthy when a critical section fails.
    fn critical<T>(&self, result: WalResult<T>) -> WalResult<T> {
        result.map_err(|err| {
            self.crashed.store(true, Ordering::Release);
            let err = err.into_panic();
            log::error!("{}", err);
            err
        })
    }

    fn insert_allowed(&self, permission: InsertPermission) -> bool {
        match permission {
            InsertPermission::Allowed => true,
            InsertPermission::Denied => false,
            InsertPermission::CheckRecovery => !self.in_recovery(),
        }
    }

    /// Seeds insertion state from the end of the WAL found at startup.
    pub fn start_inserting(&self, start: StartPosition) -> WalResult<()> {
        let mut state = self.insert.lock();
        let mut ws = self.write.lock();
        if let Some(image) = &start.last_page {
            if start.insert_pos.page_offset(XLOG_BLCKSZ) == 0 || image.len() != XLOG_BLCKSZ {
                return Err(WalError::Internal(format!(
                    "last WAL page image does not match insert position {}",
                    start.insert_pos
                )));
            }
            let mut page = image.clone();
            page[start.insert_pos.page_offset(XLOG_BLCKSZ)..].fill(0);
            self.ring
                .load_page(start.insert_pos.page_start(XLOG_BLCKSZ), &page);
        } else if start.insert_pos.page_offset(XLOG_BLCKSZ) != 0 {
            return Err(WalError::Internal(format!(
                "insert position {} is mid-page but no page image was supplied",
                start.insert_pos
            )));
        }

        state.curr_pos = start.insert_pos;
        state.prev_record = start.prev_record;
        state.redo = start.redo;
        ws.result = WriteResult::new(start.insert_pos, start.insert_pos);
        ws.open = None;
        self.gaps.lock().clear();
        self.shared.publish(ws.result);
        self.shared.set_redo(start.redo);
        self.shared
            .note_completed_page(start.insert_pos.page_start(XLOG_BLCKSZ));
        self.published_insert
            .store(start.insert_pos.as_u64(), Ordering::Release);
        *self.last_switch.lock() = (Instant::now(), start.insert_pos);
        self.inserting.store(true, Ordering::Release);
        info!(
            "WAL insertion resumes at {} on timeline {}",
            start.insert_pos,
            self.timeline()
        );
        Ok(())
    }

    /// Leaves recovery; sessions using `CheckRecovery` may insert afterwards.
    pub fn finish_recovery(&self) {
        self.in_recovery.store(false, Ordering::Release);
    }

    /// Where a record inserted now would start: past the page header at a
    /// page boundary, or on the next page when the header would not fit.
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

    /// Computes and publishes a new redo pointer under the insertion lock.
    /// Returns `None` when `skip_if_idle` shows nothing was inserted since the
    /// checkpoint ending there, which itself was its own redo point.
    pub(crate) fn compute_redo(&self, skip_if_idle: Option<IdleCheck>) -> Option<(Lsn, Lsn)> {
        let mut state = self.insert.lock();
        if let Some(check) = skip_if_idle {
            if state.curr_pos == check.last_checkpoint_end
                && check.last_checkpoint == check.last_redo
            {
                return None;
            }
        }
        let redo = self.next_record_start(state.curr_pos);
        state.redo = redo;
        self.shared.set_redo(redo);
        Some((redo, state.curr_pos))
    }

    pub fn full_page_writes(&self) -> bool {
        self.full_page_writes.load(Ordering::Acquire)
    }

    /// Claims the single exclusive-backup slot and forces page writes.
    pub(crate) fn begin_exclusive_backup(&self) -> WalResult<()> {
        let mut state = self.insert.lock();
        if state.exclusive_backup {
            return Err(WalError::Internal(
                "a backup is already in progress".to_string(),
            ));
        }
        state.exclusive_backup = true;
        state.force_page_writes = true;
        self.force_page_writes.store(true, Ordering::Release);
        Ok(())
    }

    pub(crate) fn end_exclusive_backup(&self) -> WalResult<()> {
        let mut state = self.insert.lock();
        if !state.exclusive_backup {
            return Err(WalError::Internal("a backup is not in progress".to_string()));
        }
        state.exclusive_backup = false;
        state.force_page_writes = false;
        self.force_page_writes.store(false, Ordering::Release);
        Ok(())
    }

    pub fn backup_in_progress(&self) -> bool {
        self.insert.lock().exclusive_backup
    }

    /// Time and position of the last segment switch, for `archive_timeout`.
    pub fn last_segment_switch(&self) -> (Instant, Lsn) {
        *self.last_switch.lock()
    }

    pub fn reader(&self) -> WalReader<LocalPageSource> {
        let source = LocalPageSource::new(Arc::clone(&self.segments));
        WalReader::new(
            source,
            self.segment_size,
            self.system_id,
            self.timeline_history(),
        )
    }

    // Replay progress, published by the startup thread.

    pub(crate) fn set_replay_end(&self, end: Lsn, tli: TimeLineId) {
        let mut replay = self.replay.lock();
        replay.replay_end = end;
        replay.replay_end_tli = tli;
    }

    pub(crate) fn note_replayed(&self, end: Lsn, xact_time: Option<TimestampTz>) {
        let mut replay = self.replay.lock();
        replay.last_replayed_end = end;
        if xact_time.is_some() {
            replay.last_xact_time = xact_time;
        }
    }

    pub fn replay_position(&self) -> Lsn {
        self.replay.lock().last_replayed_end
    }

    pub fn last_replayed_xact_time(&self) -> Option<TimestampTz> {
        self.replay.lock().last_xact_time
    }

    pub(crate) fn set_replayed_checkpoint(&self, checkpoint: ReplayedCheckpoint) {
        self.replay.lock().last_checkpoint = Some(checkpoint);
    }

    pub(crate) fn replayed_checkpoint(&self) -> Option<ReplayedCheckpoint> {
        self.replay.lock().last_checkpoint
    }

    /// During recovery a flush request instead advances the minimum recovery
    /// point, all the way to the record being replayed.
    fn update_min_recovery_point(&self, target: Lsn) -> WalResult<()> {
        let (replay_end, tli) = {
            let replay = self.replay.lock();
            (replay.replay_end, replay.replay_end_tli)
        };
        if !replay_end.is_valid() {
            return Ok(());
        }
        if target > replay_end {
            warn!(
                "xlog min recovery request {} is past current point {}",
                target, replay_end
            );
        }
        self.control.update_min_recovery_point(replay_end, tli)?;
        Ok(())
    }
}

/// Inputs for skipping a checkpoint on an idle system.
#[derive(Debug, Clone, Copy)]
pub(crate) struct IdleCheck {
    pub last_checkpoint: Lsn,
    pub last_checkpoint_end: Lsn,
    pub last_redo: Lsn,
}

impl fmt::Debug for WalManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WalManager")
            .field("timeline", &self.timeline())
            .field("insert", &self.insert_position())
            .field("result", &self.shared.result())
            .field("wal_buffers", &self.wal_buffers)
            .field("in_recovery", &self.in_recovery())
            .finish()
    }
}

impl Drop for WalManager {
    fn drop(&mut self) {
        if let Some(runtime) = self.writer.lock().take() {
            let _ = runtime.stop();
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Arc;

    use tempfile::TempDir;

    use super::*;
    use crate::recovery::control_file::{ControlFileData, ControlFileManager};
    use crate::recovery::lsn::segment_start;
    use crate::recovery::wal::page::LONG_PAGE_HEADER_SIZE;

    pub(crate) const SEG: u64 = 256 * 1024;

    /// A fresh data directory with insertion open at the start of segment 1.
    /// The engine stays in recovery mode; tests pick permissions explicitly.
    pub(crate) fn started_manager() -> (TempDir, Arc<WalManager>) {
        let dir = TempDir::new().unwrap();
        let options = DatabaseOptions::for_testing(SEG);
        let start = segment_start(1, SEG);
        let redo = start + LONG_PAGE_HEADER_SIZE as u64;
        let mut data = ControlFileData::new(0x5eed_cafe, SEG);
        data.checkpoint_copy.this_tli = 1;
        data.checkpoint_copy.redo = redo;
        let control = Arc::new(ControlFileManager::write_initial(dir.path(), data).unwrap());
        let wal = WalManager::open(&options, dir.path(), control).unwrap();
        wal.start_inserting(StartPosition {
            insert_pos: start,
            prev_record: Lsn::INVALID,
            redo,
            last_page: None,
        })
        .unwrap();
        (dir, Arc::new(wal))
    }
}
