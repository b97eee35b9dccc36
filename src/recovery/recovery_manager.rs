use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info, warn};

use crate::buffer::BufferManager;
use crate::config::{RecoveryConfig, RecoveryTarget, TargetTimeline, RECOVERY_CONFIG_FILE, RECOVERY_DONE_FILE};
use crate::error::{WalError, WalResult};
use crate::recovery::archive::{archive_for_recovery, run_end_command, ArchiveStatus};
use crate::recovery::backup::{BackupLabel, BACKUP_LABEL_FILE, BACKUP_LABEL_OLD};
use crate::recovery::checkpoint::{CheckpointFlags, Checkpointer};
use crate::recovery::control_file::DbState;
use crate::recovery::lsn::{wal_file_name, TimeLineId};
use crate::recovery::redo::RedoExecutor;
use crate::recovery::resource_manager::all_safe_restartpoint;
use crate::recovery::source::{remove_restore_scratch, PromoteSignal, RecoverySource, WalStream};
use crate::recovery::timeline::{
    exists_timeline_history, find_newest_timeline, read_timeline_history, write_timeline_history,
};
use crate::recovery::wal::codec::checkpoint::{
    decode_backup_end, CheckpointBody, XLOG_BACKUP_END, XLOG_CHECKPOINT_ONLINE,
    XLOG_CHECKPOINT_SHUTDOWN,
};
use crate::recovery::wal::codec::DecodedRecord;
use crate::recovery::wal::page::XLOG_BLCKSZ;
use crate::recovery::wal::{ReplayedCheckpoint, StartPosition, WalReader};
use crate::recovery::{Lsn, RmgrId, WalManager};
use crate::transaction::xact::{xact_outcome, TwoPhaseFileHeader, XactOutcome, XLOG_XACT_PREPARE};
use crate::transaction::TransactionManager;
use crate::utils::timestamp::format_timestamptz;

/// What startup did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoverySummary {
    /// Checkpoint record startup began from.
    pub checkpoint: Lsn,
    pub redo_start: Lsn,
    /// Whether any WAL was replayed.
    pub performed_recovery: bool,
    pub archive_recovery: bool,
    pub records_replayed: usize,
    /// Where insertion resumed.
    pub end_of_wal: Lsn,
    pub timeline: TimeLineId,
    /// Set when archive recovery branched off a new timeline.
    pub new_timeline: Option<TimeLineId>,
    pub stop_reason: Option<String>,
    /// Transactions left without an outcome and marked aborted.
    pub aborted_in_progress: usize,
    pub restored_prepared: usize,
}

/// Why replay stopped at a record.
#[derive(Debug, Clone, PartialEq, Eq)]
struct StopPoint {
    after: bool,
    outcome: XactOutcome,
}

impl StopPoint {
    fn reason(&self) -> String {
        format!(
            "{} transaction {}",
            if self.after { "after" } else { "before" },
            self.outcome.xid
        )
    }
}

/// Decides whether replay stops at `record`. Only commit and abort records
/// are stop candidates. A transaction id target stops at that transaction's
/// record, after it when inclusive; a time target stops before the first
/// record past the target time (at or past it when not inclusive).
fn recovery_stops_here(
    target: RecoveryTarget,
    inclusive: bool,
    record: &DecodedRecord,
) -> WalResult<Option<StopPoint>> {
    if target == RecoveryTarget::Unset {
        return Ok(None);
    }
    let Some(outcome) = xact_outcome(record)? else {
        return Ok(None);
    };
    let stop = match target {
        RecoveryTarget::Unset => None,
        RecoveryTarget::Xid(xid) => (outcome.xid == xid).then_some(StopPoint {
            after: inclusive,
            outcome,
        }),
        RecoveryTarget::Time(time) => {
            let past = if inclusive {
                outcome.time > time
            } else {
                outcome.time >= time
            };
            past.then_some(StopPoint {
                after: false,
                outcome,
            })
        }
    };
    Ok(stop)
}

/// Startup: locates the checkpoint to start from, replays WAL when needed
/// and opens the engine for writes.
pub struct RecoveryManager {
    data_dir: PathBuf,
    wal: Arc<WalManager>,
    buffers: Arc<BufferManager>,
    xacts: Arc<TransactionManager>,
    checkpointer: Arc<Checkpointer>,
    config: Option<RecoveryConfig>,
    stream: Option<Box<dyn WalStream>>,
    promote: Arc<PromoteSignal>,
    checkpoint_segments: u64,
}

impl RecoveryManager {
    pub fn new(
        data_dir: &Path,
        wal: Arc<WalManager>,
        buffers: Arc<BufferManager>,
        xacts: Arc<TransactionManager>,
        checkpointer: Arc<Checkpointer>,
    ) -> Self {
        Self {
            data_dir: data_dir.to_path_buf(),
            wal,
            buffers,
            xacts,
            checkpointer,
            config: None,
            stream: None,
            promote: Arc::new(PromoteSignal::default()),
            checkpoint_segments: 3,
        }
    }

    /// Archive recovery directives; without them startup does crash recovery.
    pub fn with_config(mut self, config: Option<RecoveryConfig>) -> Self {
        if let Some(config) = &config {
            self.promote = Arc::new(PromoteSignal::new(config.trigger_file.clone()));
        }
        self.config = config;
        self
    }

    /// Streaming upstream used in standby mode.
    pub fn with_stream(mut self, stream: Option<Box<dyn WalStream>>) -> Self {
        self.stream = stream;
        self
    }

    /// Replaces the promotion signal built by `with_config`.
    pub fn with_promote_signal(mut self, promote: Arc<PromoteSignal>) -> Self {
        self.promote = promote;
        self
    }

    /// Replay distance, in segments, between restartpoints.
    pub fn with_checkpoint_segments(mut self, segments: u64) -> Self {
        self.checkpoint_segments = segments;
        self
    }

    pub fn promote_signal(&self) -> &Arc<PromoteSignal> {
        &self.promote
    }

    fn xlog_dir(&self) -> &Path {
        self.wal.segments().directory()
    }

    /// Reads a checkpoint record, returning `None` when it is missing or not
    /// a checkpoint.
    fn read_checkpoint_record(
        reader: &mut WalReader<RecoverySource>,
        lsn: Lsn,
        which: &str,
    ) -> WalResult<Option<(DecodedRecord, CheckpointBody)>> {
        if !lsn.is_valid() {
            info!("invalid {} checkpoint link in control file", which);
            return Ok(None);
        }
        let Some(record) = reader.read_record(Some(lsn))? else {
            info!(
                "invalid {} checkpoint record at {}: {}",
                which,
                lsn,
                reader.last_error().unwrap_or("record not found")
            );
            return Ok(None);
        };
        if record.rmid != RmgrId::Xlog {
            info!("invalid resource manager ID in {} checkpoint record", which);
            return Ok(None);
        }
        let info = record.rmgr_info();
        if info != XLOG_CHECKPOINT_SHUTDOWN && info != XLOG_CHECKPOINT_ONLINE {
            info!("invalid xl_info in {} checkpoint record", which);
            return Ok(None);
        }
        match CheckpointBody::decode(&record.data) {
            Ok(body) => Ok(Some((record, body))),
            Err(err) => {
                info!("invalid length of {} checkpoint record: {}", which, err);
                Ok(None)
            }
        }
    }

    /// Re-registers the transactions the checkpoint lists as prepared by
    /// reading their prepare records.
    fn restore_prepared(&self, reader: &mut WalReader<RecoverySource>, body: &CheckpointBody) -> WalResult<usize> {
        for entry in &body.prepared {
            let record = reader.read_record(Some(entry.prepare_lsn))?.ok_or_else(|| {
                WalError::Fatal(format!(
                    "could not read two-phase state from xlog at {}",
                    entry.prepare_lsn
                ))
            })?;
            if record.rmid != RmgrId::Xact || record.rmgr_info() != XLOG_XACT_PREPARE {
                return Err(WalError::Fatal(format!(
                    "expected two-phase state data is not present in xlog at {}",
                    entry.prepare_lsn
                )));
            }
            let header = TwoPhaseFileHeader::decode(&record.data)?;
            if header.xid != entry.xid {
                return Err(WalError::Fatal(format!(
                    "two-phase state at {} belongs to transaction {}, expected {}",
                    entry.prepare_lsn, header.xid, entry.xid
                )));
            }
            self.xacts.restore_prepared(header, entry.prepare_lsn)?;
        }
        Ok(body.prepared.len())
    }

    fn resolve_target_timeline(&self, config: &RecoveryConfig, current: TimeLineId, source: &RecoverySource) -> WalResult<TimeLineId> {
        let target = match config.target_timeline {
            TargetTimeline::Current => current,
            TargetTimeline::Latest => find_newest_timeline(self.xlog_dir(), source.archive(), current)?,
            TargetTimeline::Id(tli) => {
                if tli != current && !exists_timeline_history(self.xlog_dir(), source.archive(), tli)? {
                    return Err(WalError::Fatal(format!(
                        "recovery target timeline {} does not exist",
                        tli
                    )));
                }
                tli
            }
        };
        Ok(target)
    }

    /// Runs startup to completion. On success the engine accepts inserts.
    pub fn startup(mut self) -> WalResult<RecoverySummary> {
        let control = Arc::clone(self.wal.control_file());
        let snapshot = control.snapshot();
        let segment_size = self.wal.segment_size();
        match snapshot.state {
            DbState::Shutdowned => {
                info!("database system was shut down at {}", format_timestamptz(snapshot.time))
            }
            DbState::ShutdownedInRecovery => info!(
                "database system was shut down in recovery at {}",
                format_timestamptz(snapshot.time)
            ),
            DbState::Shutdowning => info!(
                "database system shutdown was interrupted; last known up at {}",
                format_timestamptz(snapshot.time)
            ),
            DbState::InCrashRecovery | DbState::InArchiveRecovery | DbState::InStandbyMode => info!(
                "database system was interrupted while in recovery at {}; some data may have to be replayed again",
                format_timestamptz(snapshot.time)
            ),
            state => info!(
                "database system was interrupted ({}); last known up at {}",
                state,
                format_timestamptz(snapshot.time)
            ),
        }
        remove_restore_scratch(self.xlog_dir());

        let archive_recovery = self.config.is_some();
        let standby = self.config.as_ref().is_some_and(|c| c.standby_mode);
        let stream = self.stream.take();
        let source = match &self.config {
            Some(config) => RecoverySource::for_archive_recovery(
                Arc::clone(self.wal.segments()),
                archive_for_recovery(config)?,
                Some(ArchiveStatus::new(self.xlog_dir())),
                stream,
                config.standby_mode,
                config.retrieve_retry_interval,
                Arc::clone(&self.promote),
            ),
            None => RecoverySource::local(Arc::clone(self.wal.segments())),
        };

        let mut recovery_tli = snapshot.checkpoint_copy.this_tli.max(1);
        if let Some(config) = &self.config {
            recovery_tli = self.resolve_target_timeline(config, recovery_tli, &source)?;
            if recovery_tli != snapshot.checkpoint_copy.this_tli {
                info!("recovery target timeline is {}", recovery_tli);
            }
        }
        let expected_tlis = read_timeline_history(self.xlog_dir(), source.archive(), recovery_tli)?;
        self.wal.set_timeline(recovery_tli, expected_tlis.clone());
        let mut reader = WalReader::new(source, segment_size, self.wal.system_id(), expected_tlis.clone());

        // Locate the checkpoint to start from.
        let backup_label = BackupLabel::read(&self.data_dir, segment_size)?;
        let (checkpoint_lsn, checkpoint_record, body) = match &backup_label {
            Some(label) => {
                info!("starting from backup \"{}\" at {}", label.label, label.checkpoint);
                let Some((record, body)) =
                    Self::read_checkpoint_record(&mut reader, label.checkpoint, "backup")?
                else {
                    return Err(WalError::Fatal(format!(
                        "could not locate required checkpoint record at {}; remove \"{}\" if you are not restoring from a backup",
                        label.checkpoint,
                        self.data_dir.join(BACKUP_LABEL_FILE).display()
                    )));
                };
                (label.checkpoint, record, body)
            }
            None => {
                match Self::read_checkpoint_record(&mut reader, snapshot.checkpoint, "primary")? {
                    Some((record, body)) => (snapshot.checkpoint, record, body),
                    None if archive_recovery => {
                        return Err(WalError::Fatal(
                            "could not locate a valid checkpoint record".to_string(),
                        ));
                    }
                    None => {
                        let Some((record, body)) = Self::read_checkpoint_record(
                            &mut reader,
                            snapshot.prev_checkpoint,
                            "secondary",
                        )?
                        else {
                            return Err(WalError::Panic(
                                "could not locate a valid checkpoint record".to_string(),
                            ));
                        };
                        warn!("using previous checkpoint record at {}", snapshot.prev_checkpoint);
                        (snapshot.prev_checkpoint, record, body)
                    }
                }
            }
        };
        let checkpoint = body.checkpoint;
        let was_shutdown = checkpoint_record.rmgr_info() == XLOG_CHECKPOINT_SHUTDOWN;
        debug!(
            "redo record is at {}; shutdown {}; next transaction ID {}/{}; next OID {}",
            checkpoint.redo, was_shutdown, checkpoint.next_xid_epoch, checkpoint.next_xid, checkpoint.next_oid
        );
        if checkpoint.redo > checkpoint_lsn {
            return Err(WalError::Panic("invalid redo in checkpoint record".to_string()));
        }
        if archive_recovery && !expected_tlis.contains(&checkpoint.this_tli) {
            return Err(WalError::Fatal(format!(
                "requested timeline {} is not a child of this server's history",
                recovery_tli
            )));
        }

        self.xacts.reset_counters(&checkpoint);
        let restored_prepared = self.restore_prepared(&mut reader, &body)?;

        let need_replay = if checkpoint.redo < checkpoint_lsn {
            if was_shutdown {
                return Err(WalError::Panic(
                    "invalid redo record in shutdown checkpoint".to_string(),
                ));
            }
            true
        } else {
            snapshot.state != DbState::Shutdowned || archive_recovery || backup_label.is_some()
        };

        let mut summary = RecoverySummary {
            checkpoint: checkpoint_lsn,
            redo_start: checkpoint.redo,
            performed_recovery: need_replay,
            archive_recovery,
            restored_prepared,
            timeline: checkpoint.this_tli,
            end_of_wal: checkpoint_record.end_lsn,
            ..RecoverySummary::default()
        };
        let mut last_applied = (checkpoint_lsn, checkpoint_record.end_lsn, reader.last_file_tli());

        if need_replay {
            let state = if standby {
                DbState::InStandbyMode
            } else if archive_recovery {
                DbState::InArchiveRecovery
            } else {
                info!("database system was not properly shut down; automatic recovery in progress");
                DbState::InCrashRecovery
            };
            control.update(checkpoint_record.end_lsn, |data| {
                data.state = state;
                if data.checkpoint != checkpoint_lsn {
                    data.prev_checkpoint = data.checkpoint;
                    data.checkpoint = checkpoint_lsn;
                    data.checkpoint_copy = checkpoint;
                }
                if archive_recovery && data.min_recovery_point < checkpoint.redo {
                    data.min_recovery_point = checkpoint.redo;
                    data.min_recovery_point_tli = checkpoint.this_tli;
                }
                if let Some(label) = &backup_label {
                    data.backup_start_point = label.start;
                    data.backup_end_required = true;
                }
            })?;
            if backup_label.is_some() {
                let old = self.data_dir.join(BACKUP_LABEL_OLD);
                fs::rename(self.data_dir.join(BACKUP_LABEL_FILE), &old)?;
                debug!("renamed backup label to {}", old.display());
            }
            last_applied = self.replay(&mut reader, checkpoint_lsn, &checkpoint_record, &mut summary)?;
        }

        let (last_lsn, end_of_wal, end_file_tli) = last_applied;
        summary.end_of_wal = end_of_wal;
        reader.source_mut().stop_standby();
        let last_page = if end_of_wal.page_offset(XLOG_BLCKSZ) != 0 {
            let image = reader.page_image(end_of_wal.page_start(XLOG_BLCKSZ))?;
            Some(image.ok_or_else(|| {
                WalError::Fatal(format!("could not re-read last WAL page at {}", end_of_wal))
            })?)
        } else {
            None
        };

        if archive_recovery && need_replay {
            let parent_tli = self.wal.timeline();
            let new_tli = find_newest_timeline(self.xlog_dir(), reader.source().archive(), recovery_tli)? + 1;
            let switch_segment = wal_file_name(end_file_tli, end_of_wal.prev_segment(segment_size), segment_size);
            let reason = summary
                .stop_reason
                .clone()
                .unwrap_or_else(|| "no recovery target specified".to_string());
            write_timeline_history(
                self.xlog_dir(),
                reader.source().archive(),
                self.wal.archive_status(),
                new_tli,
                parent_tli,
                &switch_segment,
                &reason,
            )?;
            let offset = end_of_wal.segment_offset(segment_size);
            if offset != 0 {
                self.wal
                    .segments()
                    .copy_segment(end_file_tli, new_tli, end_of_wal.segment(segment_size), offset)?;
            }
            let mut history = vec![new_tli];
            history.extend(reader.expected_timelines().iter().copied());
            self.wal.set_timeline(new_tli, history);
            info!("selected new timeline ID: {}", new_tli);
            summary.new_timeline = Some(new_tli);

            let conf = self.data_dir.join(RECOVERY_CONFIG_FILE);
            if conf.exists() {
                let done = self.data_dir.join(RECOVERY_DONE_FILE);
                match fs::remove_file(&done) {
                    Ok(()) => {}
                    Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                    Err(err) => return Err(err.into()),
                }
                fs::rename(&conf, &done)?;
            }
            info!("archive recovery complete");
        }
        remove_restore_scratch(self.xlog_dir());

        summary.aborted_in_progress = self.xacts.abort_in_progress();
        if summary.aborted_in_progress > 0 {
            info!(
                "{} transaction(s) in progress at the crash were marked aborted",
                summary.aborted_in_progress
            );
        }

        self.wal.start_inserting(StartPosition {
            insert_pos: end_of_wal,
            prev_record: last_lsn,
            redo: control.snapshot().checkpoint_copy.redo,
            last_page,
        })?;

        if need_replay {
            self.checkpointer.perform_checkpoint(
                CheckpointFlags::END_OF_RECOVERY | CheckpointFlags::IMMEDIATE | CheckpointFlags::WAIT,
            )?;
        } else {
            self.checkpointer.set_last_checkpoint_end(checkpoint_record.end_lsn);
        }
        control.set_state(DbState::InProduction)?;
        self.wal.finish_recovery();
        summary.timeline = self.wal.timeline();

        if let Some(command) = self.config.as_ref().and_then(|c| c.end_command.as_deref()) {
            if need_replay {
                let redo = control.snapshot().checkpoint_copy.redo;
                let restart_name = wal_file_name(self.wal.timeline(), redo.segment(segment_size), segment_size);
                run_end_command(command, &restart_name)?;
            }
        }
        info!("database system is ready to accept connections");
        Ok(summary)
    }

    /// The replay loop. Returns the start, end and file timeline of the last
    /// applied record.
    fn replay(
        &self,
        reader: &mut WalReader<RecoverySource>,
        checkpoint_lsn: Lsn,
        checkpoint_record: &DecodedRecord,
        summary: &mut RecoverySummary,
    ) -> WalResult<(Lsn, Lsn, TimeLineId)> {
        let segment_size = self.wal.segment_size();
        let control = Arc::clone(self.wal.control_file());
        let target = self.config.as_ref().map_or(RecoveryTarget::Unset, |c| c.target);
        let inclusive = self.config.as_ref().map_or(true, |c| c.target_inclusive);
        let archive_recovery = self.config.is_some();
        let executor = RedoExecutor::new(
            Arc::clone(&self.wal),
            Arc::clone(&self.buffers),
            Arc::clone(&self.xacts),
        );

        let redo = summary.redo_start;
        let first = if redo < checkpoint_lsn {
            Some(reader.read_record(Some(redo))?.ok_or_else(|| {
                WalError::Panic(format!(
                    "could not find redo location {} referenced by checkpoint record",
                    redo
                ))
            })?)
        } else {
            reader.read_record(Some(checkpoint_lsn))?;
            reader.read_record(None)?
        };
        match &first {
            Some(record) => info!("redo starts at {}", record.lsn),
            None => info!("redo is not required"),
        }

        let mut replay_tli = summary.timeline;
        self.wal.set_timeline(replay_tli, reader.expected_timelines().to_vec());
        let mut last_applied = (checkpoint_lsn, checkpoint_record.end_lsn, reader.last_file_tli());
        let mut backup_start = control.snapshot().backup_start_point;
        let mut min_recovery_point = control.snapshot().min_recovery_point;
        let mut consistent = false;
        let mut last_restart_redo = control.snapshot().checkpoint_copy.redo;
        let mut next = first.map(|record| (record, reader.last_file_tli()));

        while let Some((record, file_tli)) = next.take() {
            if archive_recovery && self.promote.is_requested() {
                info!("received promote request");
                summary.stop_reason = Some("promoted".to_string());
                break;
            }
            let stop = recovery_stops_here(target, inclusive, &record)?;
            if let Some(stop) = stop.as_ref().filter(|s| !s.after) {
                info!(
                    "recovery stopping before {} of transaction {}, time {}",
                    if stop.outcome.committed { "commit" } else { "abort" },
                    stop.outcome.xid,
                    format_timestamptz(stop.outcome.time)
                );
                summary.stop_reason = Some(stop.reason());
                break;
            }

            self.wal.set_replay_end(record.end_lsn, replay_tli);
            executor.apply(&record)?;
            let xact_time = xact_outcome(&record)?.map(|o| o.time);

            if record.rmid == RmgrId::Xlog {
                match record.rmgr_info() {
                    info @ (XLOG_CHECKPOINT_SHUTDOWN | XLOG_CHECKPOINT_ONLINE) => {
                        let body = CheckpointBody::decode(&record.data)?;
                        let tli = body.checkpoint.this_tli;
                        if tli != replay_tli {
                            if info == XLOG_CHECKPOINT_ONLINE
                                || tli < replay_tli
                                || !reader.expected_timelines().contains(&tli)
                            {
                                return Err(WalError::Panic(format!(
                                    "unexpected timeline ID {} (after {}) in checkpoint record",
                                    tli, replay_tli
                                )));
                            }
                            replay_tli = tli;
                            self.wal.set_timeline(replay_tli, reader.expected_timelines().to_vec());
                        }
                        self.wal.set_replayed_checkpoint(ReplayedCheckpoint {
                            lsn: record.lsn,
                            end_lsn: record.end_lsn,
                            checkpoint: body.checkpoint,
                            safe: all_safe_restartpoint(),
                        });
                        if archive_recovery
                            && self.checkpoint_segments > 0
                            && record.lsn.segment(segment_size)
                                >= last_restart_redo.segment(segment_size) + self.checkpoint_segments
                        {
                            self.wal.note_replayed(record.end_lsn, xact_time);
                            if self
                                .checkpointer
                                .perform_restartpoint(CheckpointFlags::CAUSE_XLOG)?
                                .is_some()
                            {
                                last_restart_redo = body.checkpoint.redo;
                            }
                        }
                    }
                    XLOG_BACKUP_END => {
                        let start = decode_backup_end(&record.data)?;
                        if backup_start.is_valid() && start == backup_start {
                            info!("backup end reached at {}", record.end_lsn);
                            control.update(self.wal.flushed_lsn().max(record.end_lsn), |data| {
                                if data.min_recovery_point < record.end_lsn {
                                    data.min_recovery_point = record.end_lsn;
                                    data.min_recovery_point_tli = replay_tli;
                                }
                                data.backup_start_point = Lsn::INVALID;
                                data.backup_end_required = false;
                            })?;
                            backup_start = Lsn::INVALID;
                            min_recovery_point = min_recovery_point.max(record.end_lsn);
                        }
                    }
                    _ => {}
                }
            }

            self.wal.note_replayed(record.end_lsn, xact_time);
            summary.records_replayed += 1;
            last_applied = (record.lsn, record.end_lsn, file_tli);

            if !consistent && !backup_start.is_valid() && record.end_lsn >= min_recovery_point {
                consistent = true;
                info!("consistent recovery state reached at {}", record.end_lsn);
            }
            if let Some(stop) = stop {
                info!(
                    "recovery stopping after {} of transaction {}, time {}",
                    if stop.outcome.committed { "commit" } else { "abort" },
                    stop.outcome.xid,
                    format_timestamptz(stop.outcome.time)
                );
                summary.stop_reason = Some(stop.reason());
                break;
            }
            next = reader
                .read_record(None)?
                .map(|record| (record, reader.last_file_tli()));
        }

        let (_, end_of_wal, _) = last_applied;
        if summary.records_replayed > 0 {
            info!("redo done at {}", last_applied.0);
        }
        if let Some(time) = self.wal.last_replayed_xact_time() {
            info!("last completed transaction was at log time {}", format_timestamptz(time));
        }
        if backup_start.is_valid() || control.snapshot().backup_end_required {
            return Err(WalError::Fatal(
                "WAL ends before end of online backup".to_string(),
            ));
        }
        if end_of_wal < min_recovery_point {
            return Err(WalError::Fatal(if summary.stop_reason.is_some() {
                "requested recovery stop point is before consistent recovery point".to_string()
            } else {
                "WAL ends before consistent recovery point".to_string()
            }));
        }
        summary.timeline = replay_tli;
        Ok(last_applied)
    }
}

impl std::fmt::Debug for RecoveryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryManager")
            .field("data_dir", &self.data_dir)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
