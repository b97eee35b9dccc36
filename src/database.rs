use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use fs4::fs_std::FileExt;
use log::{debug, info, warn};

use crate::background::{self, BackgroundWorkers};
use crate::buffer::{BufferManager, RelFileNode};
use crate::config::{DatabaseOptions, RecoveryConfig};
use crate::error::{WalError, WalResult};
use crate::recovery::archive::archive_for_target;
use crate::recovery::backup::{start_backup, stop_backup};
use crate::recovery::control_file::ControlFileData;
use crate::recovery::lsn::segment_start;
use crate::recovery::retention::{ReplicationSlots, Retention};
use crate::recovery::wal::codec::checkpoint::{RestorePoint, MAX_RESTORE_POINT_NAME, XLOG_RESTORE_POINT};
use crate::recovery::wal::codec::RecordInput;
use crate::recovery::wal::StartPosition;
use crate::recovery::{
    CheckpointFlags, CheckpointOutcome, Checkpointer, ControlFileManager, DbState, InsertPermission, Lsn,
    PromoteSignal, RecoveryManager, RecoverySummary, RmgrId, WalManager, WalSession, WalStream,
};
use crate::storage::{heap_insert, DiskManager, HeapTid};
use crate::transaction::{Transaction, TransactionManager};
use crate::utils::timestamp;

/// Held with an exclusive lock while a `Database` is open on the directory.
pub const LOCK_FILE: &str = "postmaster.lock";

const DEFAULT_ARCHIVE_POLL: Duration = Duration::from_secs(1);

struct Components {
    control: Arc<ControlFileManager>,
    wal: Arc<WalManager>,
    buffers: Arc<BufferManager>,
    xacts: Arc<TransactionManager>,
    checkpointer: Arc<Checkpointer>,
}

fn build_components(options: &DatabaseOptions, data_dir: &Path, control: ControlFileManager) -> WalResult<Components> {
    let control = Arc::new(control);
    let wal = Arc::new(WalManager::open(options, data_dir, Arc::clone(&control))?);
    let disk = Arc::new(DiskManager::new(data_dir, options.wal.fsync)?);
    let buffers = Arc::new(BufferManager::new(disk, Arc::clone(&wal)));
    let xacts = Arc::new(TransactionManager::new(
        Arc::clone(&wal),
        data_dir,
        options.wal.synchronous_commit,
    )?);
    let retention = Retention::new(
        wal.segment_size(),
        options.wal.keep_segments,
        options.checkpoint.recycle_slop(),
    );
    let slots = Arc::new(ReplicationSlots::new(options.wal.max_replication_slots));
    let checkpointer = Arc::new(Checkpointer::new(
        Arc::clone(&wal),
        Arc::clone(&buffers),
        Arc::clone(&xacts),
        retention,
        slots,
    ));
    Ok(Components {
        control,
        wal,
        buffers,
        xacts,
        checkpointer,
    })
}

fn lock_data_dir(data_dir: &Path) -> WalResult<File> {
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(data_dir.join(LOCK_FILE))?;
    file.try_lock_exclusive().map_err(|err| {
        WalError::Fatal(format!(
            "lock file \"{}\" is held by another process: {}",
            data_dir.join(LOCK_FILE).display(),
            err
        ))
    })?;
    Ok(file)
}

/// An open data directory: WAL engine, buffer manager, transaction manager,
/// checkpointer and background workers.
///
/// `shutdown` writes a shutdown checkpoint. Dropping an open database without
/// it only stops the workers, which leaves the directory as after a crash.
pub struct Database {
    data_dir: PathBuf,
    control: Arc<ControlFileManager>,
    wal: Arc<WalManager>,
    buffers: Arc<BufferManager>,
    xacts: Arc<TransactionManager>,
    checkpointer: Arc<Checkpointer>,
    promote: Arc<PromoteSignal>,
    recovery: RecoverySummary,
    background_workers: BackgroundWorkers,
    _lock: File,
}

impl Database {
    /// Creates a new cluster in `data_dir`: the control file, then segment 1
    /// holding a shutdown checkpoint whose redo pointer is its own position.
    /// Returns the system identifier.
    pub fn init(options: &DatabaseOptions, data_dir: &Path) -> WalResult<u64> {
        options.wal.validate()?;
        fs::create_dir_all(data_dir)?;
        let _lock = lock_data_dir(data_dir)?;

        let now_secs = (timestamp::now() / 1_000_000).max(0) as u64;
        let system_id = (now_secs << 32) | u64::from(rand::random::<u32>());
        let control = ControlFileManager::write_initial(
            data_dir,
            ControlFileData {
                state: DbState::Startup,
                ..ControlFileData::new(system_id, options.wal.segment_size)
            },
        )?;
        let parts = build_components(options, data_dir, control)?;
        let segment_size = parts.wal.segment_size();
        parts.wal.start_inserting(StartPosition {
            insert_pos: segment_start(1, segment_size),
            prev_record: Lsn::INVALID,
            redo: Lsn::INVALID,
            last_page: None,
        })?;
        parts.wal.finish_recovery();
        parts.control.set_state(DbState::InProduction)?;
        parts
            .checkpointer
            .perform_checkpoint(CheckpointFlags::SHUTDOWN | CheckpointFlags::IMMEDIATE)?;
        info!(
            "initialized database system in {} with system identifier {}",
            data_dir.display(),
            system_id
        );
        Ok(system_id)
    }

    /// Opens an existing cluster, running crash or archive recovery first.
    /// Archive recovery is driven by `options.recovery`, or by
    /// `recovery.conf` in the data directory when that is unset.
    pub fn open(options: &DatabaseOptions, data_dir: &Path) -> WalResult<Self> {
        Self::open_with_stream(options, data_dir, None, None)
    }

    /// Like `open`, with a streaming upstream for standby mode and a
    /// promotion signal the caller can raise while startup is waiting.
    pub fn open_with_stream(
        options: &DatabaseOptions,
        data_dir: &Path,
        stream: Option<Box<dyn WalStream>>,
        promote: Option<Arc<PromoteSignal>>,
    ) -> WalResult<Self> {
        let lock = lock_data_dir(data_dir)?;
        let recovery_config = match &options.recovery {
            Some(config) => Some(config.clone()),
            None => RecoveryConfig::load(data_dir)?,
        };
        let control = ControlFileManager::read(data_dir)?;
        let parts = build_components(options, data_dir, control)?;

        let promote = promote.unwrap_or_else(|| {
            Arc::new(PromoteSignal::new(
                recovery_config.as_ref().and_then(|c| c.trigger_file.clone()),
            ))
        });
        let recovery = RecoveryManager::new(
            data_dir,
            Arc::clone(&parts.wal),
            Arc::clone(&parts.buffers),
            Arc::clone(&parts.xacts),
            Arc::clone(&parts.checkpointer),
        )
        .with_config(recovery_config)
        .with_stream(stream)
        .with_promote_signal(Arc::clone(&promote))
        .with_checkpoint_segments(options.checkpoint.checkpoint_segments)
        .startup()?;
        debug!("startup finished: {:?}", recovery);

        let mut background_workers = BackgroundWorkers::new();
        if let Some(interval) = options.wal.writer_interval {
            if let Some(handle) = parts.wal.start_background_writer(interval)? {
                background_workers.register(background::wal_writer_worker(handle, interval));
            }
        }
        if options.checkpoint.timeout.is_some() || options.archive.timeout.is_some() {
            background_workers.register_opt(background::spawn_checkpointer(
                Arc::clone(&parts.checkpointer),
                options.checkpoint.timeout,
                options.archive.timeout,
            ));
        }
        background_workers.register_opt(background::spawn_bg_writer(
            Arc::clone(&parts.buffers),
            options.buffer_pool.bgwriter_interval,
        ));
        if let (Some(status), Some(target)) = (parts.wal.archive_status(), &options.archive.target) {
            background_workers.register_opt(background::spawn_archiver(
                status.clone(),
                archive_for_target(target)?,
                options.archive.poll_interval.unwrap_or(DEFAULT_ARCHIVE_POLL),
            ));
        } else if options.archive.archiving_active() {
            warn!("archive mode enabled but no archive target is configured");
        }

        Ok(Self {
            data_dir: data_dir.to_path_buf(),
            control: parts.control,
            wal: parts.wal,
            buffers: parts.buffers,
            xacts: parts.xacts,
            checkpointer: parts.checkpointer,
            promote,
            recovery,
            background_workers,
            _lock: lock,
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn wal(&self) -> &Arc<WalManager> {
        &self.wal
    }

    pub fn buffers(&self) -> &Arc<BufferManager> {
        &self.buffers
    }

    pub fn transactions(&self) -> &Arc<TransactionManager> {
        &self.xacts
    }

    pub fn checkpointer(&self) -> &Arc<Checkpointer> {
        &self.checkpointer
    }

    pub fn control_file(&self) -> &Arc<ControlFileManager> {
        &self.control
    }

    pub fn background_workers(&self) -> &BackgroundWorkers {
        &self.background_workers
    }

    /// What startup did when this database was opened.
    pub fn recovery_summary(&self) -> &RecoverySummary {
        &self.recovery
    }

    /// A session for a normal backend.
    pub fn session(&self) -> WalSession {
        self.wal.session(InsertPermission::CheckRecovery)
    }

    pub fn begin(&self) -> Transaction {
        self.xacts.begin()
    }

    pub fn commit(&self, session: &mut WalSession, txn: &mut Transaction) -> WalResult<Lsn> {
        self.xacts.commit(session, txn)
    }

    pub fn abort(&self, session: &mut WalSession, txn: &mut Transaction) -> WalResult<Lsn> {
        self.xacts.abort(session, txn)
    }

    /// Inserts a heap tuple on behalf of `txn`.
    pub fn heap_insert(
        &self,
        session: &mut WalSession,
        txn: &mut Transaction,
        rnode: RelFileNode,
        tuple: &[u8],
    ) -> WalResult<HeapTid> {
        let tid = heap_insert(&self.buffers, &self.wal, session, txn.id(), rnode, tuple)?;
        txn.record_lsn(tid.lsn);
        Ok(tid)
    }

    /// Runs an immediate forced checkpoint in the calling thread.
    pub fn checkpoint(&self) -> WalResult<Option<CheckpointOutcome>> {
        self.checkpointer
            .perform_checkpoint(CheckpointFlags::FORCE | CheckpointFlags::IMMEDIATE | CheckpointFlags::WAIT)
    }

    /// Hands a checkpoint request to the checkpointer worker and waits for
    /// it. Without a running worker the checkpoint runs here.
    pub fn request_checkpoint(&self, flags: CheckpointFlags) -> WalResult<()> {
        if self.background_workers.is_running(background::WorkerKind::Checkpointer) {
            self.wal.checkpoint_requests().request_and_wait(flags)
        } else {
            self.checkpointer.perform_checkpoint(flags | CheckpointFlags::WAIT)?;
            Ok(())
        }
    }

    /// Forces a switch to a new segment; returns where the next segment
    /// starts.
    pub fn switch_wal(&self) -> WalResult<Lsn> {
        let mut session = self.session();
        self.wal.switch_segment(&mut session)
    }

    /// Logs a named restore point usable as a recovery target. Returns the
    /// record's end.
    pub fn create_restore_point(&self, name: &str) -> WalResult<Lsn> {
        if self.wal.in_recovery() {
            return Err(WalError::RecoveryInProgress);
        }
        if name.len() > MAX_RESTORE_POINT_NAME {
            return Err(WalError::InvalidConfig(format!(
                "value too long for restore point (maximum {} characters)",
                MAX_RESTORE_POINT_NAME
            )));
        }
        let body = RestorePoint {
            time: timestamp::now(),
            name: name.to_string(),
        }
        .encode();
        let mut input = RecordInput::new(RmgrId::Xlog, XLOG_RESTORE_POINT);
        input.add_data(&body);
        let mut session = self.session();
        let end = self.wal.insert(&mut session, &input)?.end;
        info!("restore point \"{}\" created at {}", name, end);
        Ok(end)
    }

    /// Starts an exclusive online backup; returns its start point.
    pub fn begin_backup(&self, label: &str, fast: bool) -> WalResult<Lsn> {
        start_backup(&self.checkpointer, &self.data_dir, label, fast)
    }

    /// Ends the exclusive online backup; returns its stop point.
    pub fn end_backup(&self) -> WalResult<Lsn> {
        let mut session = self.session();
        stop_backup(&self.checkpointer, &self.data_dir, &mut session)
    }

    pub fn promote_signal(&self) -> &Arc<PromoteSignal> {
        &self.promote
    }

    /// Clean shutdown: stops the workers, then writes the shutdown
    /// checkpoint.
    pub fn shutdown(mut self) -> WalResult<()> {
        self.background_workers.shutdown_all();
        self.checkpointer
            .perform_checkpoint(CheckpointFlags::SHUTDOWN | CheckpointFlags::IMMEDIATE)?;
        info!("database system is shut down");
        Ok(())
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        self.background_workers.shutdown_all();
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("data_dir", &self.data_dir)
            .field("timeline", &self.wal.timeline())
            .field("insert_position", &self.wal.insert_position())
            .finish_non_exhaustive()
    }
}
