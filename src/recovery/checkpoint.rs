use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bitflags::bitflags;
use log::{debug, info};
use parking_lot::{Condvar, Mutex};

use crate::buffer::BufferManager;
use crate::error::{WalError, WalResult};
use crate::recovery::control_file::DbState;
use crate::recovery::retention::{ReplicationSlots, Retention};
use crate::recovery::wal::codec::checkpoint::{
    CheckpointBody, CheckpointRecord, XLOG_CHECKPOINT_ONLINE, XLOG_CHECKPOINT_SHUTDOWN,
};
use crate::recovery::wal::codec::RecordInput;
use crate::recovery::wal::{IdleCheck, InsertPermission, WalManager, WalSession};
use crate::recovery::{Lsn, RmgrId};
use crate::transaction::TransactionManager;
use crate::utils::timestamp;

bitflags! {
    /// Why a checkpoint was requested and how the requester wants it run.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CheckpointFlags: u16 {
        const SHUTDOWN = 0x0001;
        const END_OF_RECOVERY = 0x0002;
        const IMMEDIATE = 0x0004;
        const FORCE = 0x0008;
        const WAIT = 0x0010;
        const CAUSE_XLOG = 0x0020;
        const CAUSE_TIME = 0x0040;
    }
}

impl CheckpointFlags {
    fn is_shutdown_like(self) -> bool {
        self.intersects(CheckpointFlags::SHUTDOWN | CheckpointFlags::END_OF_RECOVERY)
    }
}

impl fmt::Display for CheckpointFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (CheckpointFlags::SHUTDOWN, "shutdown"),
            (CheckpointFlags::END_OF_RECOVERY, "end-of-recovery"),
            (CheckpointFlags::IMMEDIATE, "immediate"),
            (CheckpointFlags::FORCE, "force"),
            (CheckpointFlags::WAIT, "wait"),
            (CheckpointFlags::CAUSE_XLOG, "xlog"),
            (CheckpointFlags::CAUSE_TIME, "time"),
        ];
        let mut first = true;
        for (flag, name) in names {
            if self.contains(flag) {
                if !first {
                    f.write_str(" ")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct RequestState {
    flags: CheckpointFlags,
    started: u64,
    done: u64,
    failed: u64,
    closed: bool,
}

/// Handshake between checkpoint requesters and the checkpointer. Requests
/// OR their flags together; waiters watch the started/done/failed counters.
#[derive(Debug, Default)]
pub struct CheckpointRequests {
    state: Mutex<RequestState>,
    changed: Condvar,
}

impl CheckpointRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Asks for a checkpoint without waiting for it.
    pub fn request(&self, flags: CheckpointFlags) {
        let mut state = self.state.lock();
        state.flags |= flags;
        self.changed.notify_all();
    }

    /// Asks for a checkpoint and blocks until one that started after the
    /// request has finished.
    pub fn request_and_wait(&self, flags: CheckpointFlags) -> WalResult<()> {
        let mut state = self.state.lock();
        let old_started = state.started;
        let old_failed = state.failed;
        state.flags |= flags | CheckpointFlags::WAIT;
        self.changed.notify_all();

        while state.started == old_started {
            if state.closed {
                return Err(WalError::Internal(
                    "checkpointer stopped before serving the request".to_string(),
                ));
            }
            self.changed.wait(&mut state);
        }
        let target = state.started;
        while state.done < target {
            self.changed.wait(&mut state);
        }
        if state.failed != old_failed {
            return Err(WalError::Internal(
                "checkpoint request failed; consult recent messages in the server log".to_string(),
            ));
        }
        Ok(())
    }

    /// Flags accumulated since the last checkpoint started.
    pub fn pending(&self) -> CheckpointFlags {
        self.state.lock().flags
    }

    /// Waits until a request arrives or `timeout` passes; returns the pending
    /// flags without consuming them.
    pub fn wait_for_request(&self, timeout: Duration) -> CheckpointFlags {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.flags.is_empty() && !state.closed {
            if self.changed.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        state.flags
    }

    /// Checkpointer side: consumes pending flags and announces a start.
    pub fn begin(&self, extra: CheckpointFlags) -> CheckpointFlags {
        let mut state = self.state.lock();
        let flags = std::mem::take(&mut state.flags) | extra;
        state.started += 1;
        self.changed.notify_all();
        flags
    }

    /// Checkpointer side: publishes the outcome of the checkpoint begun last.
    pub fn finish(&self, succeeded: bool) {
        let mut state = self.state.lock();
        if !succeeded {
            state.failed += 1;
        }
        state.done = state.started;
        self.changed.notify_all();
    }

    /// No more checkpoints will be served; waiting requesters are released.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.changed.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

/// What a completed checkpoint or restartpoint did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointOutcome {
    pub lsn: Lsn,
    pub redo: Lsn,
    pub buffers_written: usize,
    pub segments_added: usize,
    pub segments_removed: usize,
    pub segments_recycled: usize,
}

#[derive(Debug)]
struct CheckpointerState {
    session: WalSession,
    /// End of the last checkpoint record written or read at startup.
    last_checkpoint_end: Lsn,
}

/// Creates checkpoints and restartpoints. The state mutex is the checkpoint
/// lock: one checkpoint or restartpoint runs at a time.
pub struct Checkpointer {
    wal: Arc<WalManager>,
    buffers: Arc<BufferManager>,
    xacts: Arc<TransactionManager>,
    retention: Retention,
    slots: Arc<ReplicationSlots>,
    state: Mutex<CheckpointerState>,
}

impl Checkpointer {
    pub fn new(
        wal: Arc<WalManager>,
        buffers: Arc<BufferManager>,
        xacts: Arc<TransactionManager>,
        retention: Retention,
        slots: Arc<ReplicationSlots>,
    ) -> Self {
        let session = wal.session(InsertPermission::CheckRecovery);
        Self {
            wal,
            buffers,
            xacts,
            retention,
            slots,
            state: Mutex::new(CheckpointerState {
                session,
                last_checkpoint_end: Lsn::INVALID,
            }),
        }
    }

    pub fn wal(&self) -> &Arc<WalManager> {
        &self.wal
    }

    pub fn slots(&self) -> &Arc<ReplicationSlots> {
        &self.slots
    }

    /// Records where the checkpoint found at startup ends, so an idle system
    /// can skip the next checkpoint.
    pub fn set_last_checkpoint_end(&self, end: Lsn) {
        self.state.lock().last_checkpoint_end = end;
    }

    pub fn last_checkpoint_end(&self) -> Lsn {
        self.state.lock().last_checkpoint_end
    }

    /// Writes a checkpoint. Returns `None` when skipped on an idle system.
    pub fn perform_checkpoint(&self, flags: CheckpointFlags) -> WalResult<Option<CheckpointOutcome>> {
        let mut state = self.state.lock();
        let end_of_recovery = flags.contains(CheckpointFlags::END_OF_RECOVERY);
        let shutdown = flags.contains(CheckpointFlags::SHUTDOWN);
        if self.wal.in_recovery() && !end_of_recovery {
            return Err(WalError::RecoveryInProgress);
        }
        let control = self.wal.control_file();
        let before = control.snapshot();

        let idle_check = (!flags.is_shutdown_like() && !flags.contains(CheckpointFlags::FORCE))
            .then_some(IdleCheck {
                last_checkpoint: before.checkpoint,
                last_checkpoint_end: state.last_checkpoint_end,
                last_redo: before.checkpoint_copy.redo,
            });
        let Some((redo, _)) = self.wal.compute_redo(idle_check) else {
            debug!("checkpoint skipped because the system is idle");
            return Ok(None);
        };
        if shutdown {
            control.set_state(DbState::Shutdowning)?;
        }
        info!("checkpoint starting: {}", flags);

        let tli = self.wal.timeline();
        let prev_tli = if end_of_recovery {
            self.wal.timeline_history().get(1).copied().unwrap_or(tli)
        } else {
            tli
        };
        let mut record = CheckpointRecord {
            redo,
            this_tli: tli,
            prev_tli,
            full_page_writes: self.wal.full_page_writes(),
            time: timestamp::now(),
            ..CheckpointRecord::default()
        };
        self.xacts.fill_checkpoint(&mut record);

        // The expensive part runs without any WAL lock held.
        let buffers_written = self.buffers.flush_all()?;
        self.xacts.checkpoint_status()?;
        let prepared = self.xacts.prepared_entries();
        let oldest_prepared = prepared.iter().map(|p| p.prepare_lsn).min();

        let body = CheckpointBody {
            checkpoint: record,
            prepared,
        }
        .encode();
        let info = if flags.is_shutdown_like() {
            XLOG_CHECKPOINT_SHUTDOWN
        } else {
            XLOG_CHECKPOINT_ONLINE
        };
        let mut input = RecordInput::new(RmgrId::Xlog, info);
        input.add_data(&body);

        let mut eor_session;
        let session = if end_of_recovery {
            eor_session = self.wal.session(InsertPermission::Allowed);
            &mut eor_session
        } else {
            &mut state.session
        };
        let inserted = self.wal.insert(session, &input)?;
        if shutdown && inserted.start != redo {
            return Err(WalError::Panic(
                "concurrent transaction log activity while database system is shutting down".to_string(),
            ));
        }
        self.wal
            .flush_session(session, inserted.end)
            .map_err(|err| {
                if end_of_recovery {
                    WalError::Fatal(format!("could not flush end-of-recovery checkpoint: {}", err))
                } else {
                    err.into_panic()
                }
            })?;
        if shutdown {
            session.mark_shutdown_written();
        }

        control.update(self.wal.flushed_lsn(), |data| {
            if shutdown {
                data.state = DbState::Shutdowned;
            }
            data.prev_checkpoint = data.checkpoint;
            data.checkpoint = inserted.start;
            data.checkpoint_copy = record;
        })?;
        state.last_checkpoint_end = inserted.end;

        let prior_redo = before.checkpoint_copy.redo;
        let (removed, recycled) = if prior_redo.is_valid() {
            let floor = oldest_prepared.map_or(prior_redo, |lsn| lsn.min(prior_redo));
            self.remove_old_wal(floor, prior_redo, self.wal.insert_position())?
        } else {
            (0, 0)
        };
        let segments_added = if shutdown { 0 } else { self.preallocate()? };

        let outcome = CheckpointOutcome {
            lsn: inserted.start,
            redo,
            buffers_written,
            segments_added,
            segments_removed: removed,
            segments_recycled: recycled,
        };
        info!(
            "checkpoint complete: wrote {} buffers; {} transaction log file(s) added, {} removed, {} recycled; redo {} at {}",
            buffers_written, segments_added, removed, recycled, redo, inserted.start
        );
        Ok(Some(outcome))
    }

    /// Turns the last replayed checkpoint into a restart point. Skipped when
    /// not every resource manager considers it safe, or when the control file
    /// already records it.
    pub fn perform_restartpoint(&self, flags: CheckpointFlags) -> WalResult<Option<CheckpointOutcome>> {
        let _state = self.state.lock();
        if !self.wal.in_recovery() {
            debug!("skipping restartpoint, recovery has already ended");
            return Ok(None);
        }
        let Some(replayed) = self.wal.replayed_checkpoint() else {
            debug!("skipping restartpoint, no checkpoint replayed yet");
            return Ok(None);
        };
        if !replayed.safe {
            debug!(
                "skipping restartpoint at {}, a resource manager is not at a safe point",
                replayed.lsn
            );
            return Ok(None);
        }
        let control = self.wal.control_file();
        let before = control.snapshot();
        if replayed.lsn <= before.checkpoint {
            debug!("skipping restartpoint, already performed at {}", before.checkpoint);
            return Ok(None);
        }
        info!("restartpoint starting: {}", flags);

        let buffers_written = self.buffers.flush_all()?;
        self.xacts.checkpoint_status()?;

        let replayed_upto = self.wal.replay_position().max(replayed.end_lsn);
        control.update(replayed_upto, |data| {
            if data.checkpoint < replayed.lsn {
                data.prev_checkpoint = data.checkpoint;
                data.checkpoint = replayed.lsn;
                data.checkpoint_copy = replayed.checkpoint;
                if data.state == DbState::InArchiveRecovery
                    && data.min_recovery_point < replayed.end_lsn
                {
                    data.min_recovery_point = replayed.end_lsn;
                    data.min_recovery_point_tli = replayed.checkpoint.this_tli;
                }
            }
        })?;

        let prior_redo = before.checkpoint_copy.redo;
        let (removed, recycled) = if prior_redo.is_valid() {
            self.remove_old_wal(prior_redo, prior_redo, replayed_upto)?
        } else {
            (0, 0)
        };
        info!(
            "restartpoint complete: wrote {} buffers; {} removed, {} recycled; recovery restart point at {}",
            buffers_written, removed, recycled, replayed.checkpoint.redo
        );
        Ok(Some(CheckpointOutcome {
            lsn: replayed.lsn,
            redo: replayed.checkpoint.redo,
            buffers_written,
            segments_added: 0,
            segments_removed: removed,
            segments_recycled: recycled,
        }))
    }

    fn remove_old_wal(&self, floor: Lsn, prior_redo: Lsn, current: Lsn) -> WalResult<(usize, usize)> {
        let segment_size = self.wal.segment_size();
        let decision = self.retention.keep_log_seg(
            current,
            floor.segment(segment_size),
            &self.slots,
            prior_redo,
        );
        if decision.keep_old_wals {
            debug!("replication slot holds WAL from segment {}", decision.segno);
        }
        let segments = self.wal.segments();
        let archive = self.wal.archive_status();
        let counts = self.retention.remove_old_segments(
            segments,
            archive,
            self.wal.timeline(),
            decision.segno,
            current,
        )?;
        self.retention.cleanup_backup_history(segments, archive)?;
        Ok(counts)
    }

    /// Creates the next segment when the insert position is in the last
    /// quarter of the current one.
    fn preallocate(&self) -> WalResult<usize> {
        let segment_size = self.wal.segment_size();
        let insert = self.wal.insert_position();
        if insert.segment_offset(segment_size) < segment_size - segment_size / 4 {
            return Ok(0);
        }
        let next = insert.segment(segment_size) + 1;
        Ok(self.wal.segments().preallocate(self.wal.timeline(), next)? as usize)
    }
}

impl fmt::Debug for Checkpointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Checkpointer")
            .field("retention", &self.retention)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use tempfile::TempDir;

    use super::*;
    use crate::config::DatabaseOptions;
    use crate::recovery::lsn::segment_start;
    use crate::recovery::wal::tests::{started_manager, SEG};
    use crate::recovery::wal::ReplayedCheckpoint;
    use crate::storage::DiskManager;

    fn checkpointer_in_recovery() -> (TempDir, Checkpointer) {
        let (dir, wal) = started_manager();
        let options = DatabaseOptions::for_testing(SEG);
        let disk = Arc::new(DiskManager::new(dir.path(), false).unwrap());
        let buffers = Arc::new(BufferManager::new(disk, Arc::clone(&wal)));
        let xacts = Arc::new(TransactionManager::new(Arc::clone(&wal), dir.path(), false).unwrap());
        let retention = Retention::new(SEG, options.wal.keep_segments, options.checkpoint.recycle_slop());
        let slots = Arc::new(ReplicationSlots::new(0));
        (dir, Checkpointer::new(wal, buffers, xacts, retention, slots))
    }

    fn replayed_at(wal: &WalManager, lsn: Lsn, safe: bool) -> ReplayedCheckpoint {
        let mut checkpoint = wal.control_file().snapshot().checkpoint_copy;
        checkpoint.redo = lsn;
        ReplayedCheckpoint {
            lsn,
            end_lsn: lsn + 0x60,
            checkpoint,
            safe,
        }
    }

    #[test]
    fn restartpoint_follows_replayed_checkpoints() {
        let (_dir, checkpointer) = checkpointer_in_recovery();
        let wal = Arc::clone(checkpointer.wal());
        let control = Arc::clone(wal.control_file());
        let flags = CheckpointFlags::CAUSE_TIME;

        // Nothing replayed yet.
        assert_eq!(checkpointer.perform_restartpoint(flags).unwrap(), None);

        let first = segment_start(1, SEG) + 0x20;
        wal.set_replayed_checkpoint(replayed_at(&wal, first, false));
        assert_eq!(checkpointer.perform_restartpoint(flags).unwrap(), None);
        assert!(!control.snapshot().checkpoint.is_valid());

        wal.set_replayed_checkpoint(replayed_at(&wal, first, true));
        let outcome = checkpointer.perform_restartpoint(flags).unwrap().unwrap();
        assert_eq!(outcome.lsn, first);
        assert_eq!(outcome.redo, first);
        assert_eq!(outcome.segments_added, 0);
        let data = control.snapshot();
        assert_eq!(data.checkpoint, first);
        assert_eq!(data.checkpoint_copy.redo, first);
        assert!(!data.prev_checkpoint.is_valid());

        // The control file already records it.
        assert_eq!(checkpointer.perform_restartpoint(flags).unwrap(), None);
        assert_eq!(control.snapshot().checkpoint, first);

        let second = segment_start(1, SEG) + 0x400;
        wal.set_replayed_checkpoint(replayed_at(&wal, second, true));
        let outcome = checkpointer.perform_restartpoint(flags).unwrap().unwrap();
        assert_eq!(outcome.lsn, second);
        let data = control.snapshot();
        assert_eq!(data.checkpoint, second);
        assert_eq!(data.prev_checkpoint, first);

        // Once recovery ends, restartpoints stop.
        wal.finish_recovery();
        wal.set_replayed_checkpoint(replayed_at(&wal, second + 0x400, true));
        assert_eq!(checkpointer.perform_restartpoint(flags).unwrap(), None);
        assert_eq!(control.snapshot().checkpoint, second);
    }

    #[test]
    fn flags_accumulate_and_display() {
        let requests = CheckpointRequests::new();
        requests.request(CheckpointFlags::CAUSE_XLOG);
        requests.request(CheckpointFlags::IMMEDIATE);
        assert_eq!(
            requests.pending(),
            CheckpointFlags::CAUSE_XLOG | CheckpointFlags::IMMEDIATE
        );
        let taken = requests.begin(CheckpointFlags::empty());
        assert_eq!(taken.to_string(), "immediate xlog");
        assert!(requests.pending().is_empty());
    }

    #[test]
    fn waiter_sees_completion_and_failure() {
        let requests = Arc::new(CheckpointRequests::new());
        let server = {
            let requests = Arc::clone(&requests);
            thread::spawn(move || {
                for outcome in [true, false] {
                    let flags = requests.wait_for_request(Duration::from_secs(5));
                    assert!(flags.contains(CheckpointFlags::WAIT));
                    requests.begin(CheckpointFlags::empty());
                    requests.finish(outcome);
                }
            })
        };
        requests.request_and_wait(CheckpointFlags::FORCE).unwrap();
        assert!(requests.request_and_wait(CheckpointFlags::FORCE).is_err());
        server.join().unwrap();
    }

    #[test]
    fn closing_releases_waiters() {
        let requests = Arc::new(CheckpointRequests::new());
        let waiter = {
            let requests = Arc::clone(&requests);
            thread::spawn(move || requests.request_and_wait(CheckpointFlags::FORCE))
        };
        while requests.pending().is_empty() {
            thread::yield_now();
        }
        requests.close();
        assert!(waiter.join().unwrap().is_err());
    }

    #[test]
    fn wait_for_request_times_out() {
        let requests = CheckpointRequests::new();
        assert!(requests
            .wait_for_request(Duration::from_millis(10))
            .is_empty());
    }
}
