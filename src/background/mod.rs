use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::buffer::BufferManager;
use crate::recovery::archive::{ArchiveStatus, WalArchive};
use crate::recovery::wal::WalSession;
use crate::recovery::{CheckpointFlags, Checkpointer, InsertPermission, WalManager, WalWriterHandle};

/// Longest the checkpointer sleeps when no timer is configured.
const IDLE_POLL: Duration = Duration::from_millis(500);
/// Dirty pages one background writer round may write.
const BGWRITER_LRU_MAXPAGES: usize = 100;

/// High-level categories of background workers maintained by the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum WorkerKind {
    WalWriter,
    Checkpointer,
    BackgroundWriter,
    Archiver,
}

#[derive(Debug, Clone, Copy)]
pub struct WorkerMetadata {
    pub kind: WorkerKind,
    pub interval: Option<Duration>,
}

pub struct WorkerHandle {
    metadata: WorkerMetadata,
    stop_fn: Option<Box<dyn FnOnce() + Send + 'static>>,
    join_handle: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn new(
        metadata: WorkerMetadata,
        stop_fn: impl FnOnce() + Send + 'static,
        join_handle: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            metadata,
            stop_fn: Some(Box::new(stop_fn)),
            join_handle,
        }
    }

    pub fn metadata(&self) -> WorkerMetadata {
        self.metadata
    }

    pub fn shutdown(&mut self) {
        if let Some(stop) = self.stop_fn.take() {
            stop();
        }
    }

    pub fn join(&mut self) {
        if let Some(handle) = self.join_handle.take() {
            if let Err(err) = handle.join() {
                warn!(
                    "background worker {} terminated with panic: {:?}",
                    self.metadata.kind, err
                );
            }
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.shutdown();
        self.join();
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
pub struct BackgroundWorkers {
    workers: Vec<WorkerHandle>,
}

impl BackgroundWorkers {
    pub fn new() -> Self {
        Self {
            workers: Vec::new(),
        }
    }

    pub fn register(&mut self, handle: WorkerHandle) {
        self.workers.push(handle);
    }

    pub fn register_opt(&mut self, handle: Option<WorkerHandle>) {
        if let Some(handle) = handle {
            self.register(handle);
        }
    }

    /// Stops every worker; all are signalled before any is joined.
    pub fn shutdown_all(&mut self) {
        for worker in &mut self.workers {
            worker.shutdown();
        }
        for worker in &mut self.workers {
            worker.join();
        }
        self.workers.clear();
    }

    pub fn workers(&self) -> &[WorkerHandle] {
        &self.workers
    }

    pub fn snapshot(&self) -> Vec<WorkerMetadata> {
        self.workers
            .iter()
            .map(|worker| worker.metadata())
            .collect()
    }

    pub fn is_running(&self, kind: WorkerKind) -> bool {
        self.workers.iter().any(|w| w.metadata.kind == kind)
    }
}

impl Drop for BackgroundWorkers {
    fn drop(&mut self) {
        self.shutdown_all();
    }
}

pub fn wal_writer_worker(handle: WalWriterHandle, interval: Duration) -> WorkerHandle {
    WorkerHandle::new(
        WorkerMetadata {
            kind: WorkerKind::WalWriter,
            interval: Some(interval),
        },
        move || {
            if let Err(err) = handle.stop() {
                warn!("failed to stop WAL writer: {}", err);
            }
        },
        None,
    )
}

/// Switches to a new segment when `timeout` has passed since the last
/// switch and something was written since.
fn check_archive_timeout(wal: &WalManager, session: &mut WalSession, timeout: Duration) {
    if wal.in_recovery() {
        return;
    }
    let (at, switched_at) = wal.last_segment_switch();
    if at.elapsed() < timeout || wal.insert_position() <= switched_at {
        return;
    }
    match wal.switch_segment(session) {
        Ok(lsn) => debug!("archive timeout forced a segment switch at {}", lsn),
        Err(err) => warn!("archive timeout segment switch failed: {}", err),
    }
}

/// The checkpointer loop: serves requests from `CheckpointRequests`, runs a
/// time-driven checkpoint every `timeout` and enforces `archive_timeout`.
/// In recovery it creates restartpoints instead.
pub fn spawn_checkpointer(
    checkpointer: Arc<Checkpointer>,
    timeout: Option<Duration>,
    archive_timeout: Option<Duration>,
) -> Option<WorkerHandle> {
    let wal = Arc::clone(checkpointer.wal());
    let requests = Arc::clone(wal.checkpoint_requests());
    let stop_requests = Arc::clone(&requests);

    let spawned = thread::Builder::new()
        .name("checkpointer".into())
        .spawn(move || {
            let mut session = wal.session(InsertPermission::CheckRecovery);
            let mut last_time = Instant::now();
            loop {
                let mut wait = IDLE_POLL;
                if let Some(timeout) = timeout {
                    wait = wait.min(timeout.saturating_sub(last_time.elapsed()));
                }
                if let Some(archive_timeout) = archive_timeout {
                    wait = wait.min(archive_timeout);
                }
                let pending = requests.wait_for_request(wait.max(Duration::from_millis(10)));
                if requests.is_closed() {
                    break;
                }
                let timed = timeout.is_some_and(|t| last_time.elapsed() >= t);
                if !pending.is_empty() || timed {
                    let extra = if pending.is_empty() {
                        CheckpointFlags::CAUSE_TIME
                    } else {
                        CheckpointFlags::empty()
                    };
                    let flags = requests.begin(extra);
                    let result = if wal.in_recovery() {
                        checkpointer.perform_restartpoint(flags)
                    } else {
                        checkpointer.perform_checkpoint(flags)
                    };
                    match result {
                        Ok(_) => requests.finish(true),
                        Err(err) => {
                            error!("checkpoint failed: {}", err);
                            requests.finish(false);
                        }
                    }
                    last_time = Instant::now();
                }
                if let Some(archive_timeout) = archive_timeout {
                    check_archive_timeout(&wal, &mut session, archive_timeout);
                }
            }
            debug!("checkpointer exiting");
        });
    match spawned {
        Ok(join_handle) => Some(WorkerHandle::new(
            WorkerMetadata {
                kind: WorkerKind::Checkpointer,
                interval: timeout,
            },
            move || stop_requests.close(),
            Some(join_handle),
        )),
        Err(err) => {
            warn!("failed to spawn checkpointer: {}", err);
            None
        }
    }
}

pub fn spawn_bg_writer(buffers: Arc<BufferManager>, interval: Option<Duration>) -> Option<WorkerHandle> {
    let interval = interval.filter(|i| !i.is_zero())?;
    spawn_periodic_worker(
        "bg-writer",
        WorkerKind::BackgroundWriter,
        interval,
        move || match buffers.write_some(BGWRITER_LRU_MAXPAGES) {
            Ok(0) => {}
            Ok(written) => debug!("background writer wrote {} buffers", written),
            Err(err) => warn!("background writer failed: {}", err),
        },
    )
}

/// One archiver round: hands every `.ready` file to the archive in order,
/// stopping at the first failure so segments are archived sequentially.
/// Returns how many files were archived.
pub fn archive_ready_files(status: &ArchiveStatus, archive: &dyn WalArchive) -> usize {
    let ready = match status.ready_files() {
        Ok(ready) => ready,
        Err(err) => {
            warn!("could not scan archive status directory: {}", err);
            return 0;
        }
    };
    let Some(xlog_dir) = status.status_dir().parent() else {
        return 0;
    };
    let mut archived = 0;
    for name in ready {
        let path = xlog_dir.join(&name);
        if let Err(err) = archive.archive(&name, &path) {
            warn!("archiving of file \"{}\" failed: {}", name, err);
            break;
        }
        if let Err(err) = status.mark_done(&name) {
            warn!("could not mark \"{}\" as archived: {}", name, err);
            break;
        }
        archived += 1;
    }
    archived
}

pub fn spawn_archiver(
    status: ArchiveStatus,
    archive: Box<dyn WalArchive>,
    interval: Duration,
) -> Option<WorkerHandle> {
    info!("archiver started using {:?}", archive);
    spawn_periodic_worker("archiver", WorkerKind::Archiver, interval, move || {
        let archived = archive_ready_files(&status, archive.as_ref());
        if archived > 0 {
            debug!("archived {} file(s)", archived);
        }
    })
}

fn spawn_periodic_worker<F>(
    name: &str,
    kind: WorkerKind,
    interval: Duration,
    mut tick: F,
) -> Option<WorkerHandle>
where
    F: FnMut() + Send + 'static,
{
    let stop_flag = Arc::new(AtomicBool::new(false));
    let thread_flag = Arc::clone(&stop_flag);

    match thread::Builder::new().name(name.into()).spawn(move || {
        while !thread_flag.load(Ordering::Relaxed) {
            tick();
            if thread_flag.load(Ordering::Relaxed) {
                break;
            }
            thread::sleep(interval);
        }
    }) {
        Ok(join_handle) => {
            let stop_handle = Arc::clone(&stop_flag);
            Some(WorkerHandle::new(
                WorkerMetadata {
                    kind,
                    interval: Some(interval),
                },
                move || {
                    stop_handle.store(true, Ordering::Release);
                },
                Some(join_handle),
            ))
        }
        Err(err) => {
            warn!("failed to spawn {}: {}", name, err);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recovery::archive::DirectoryArchive;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn archiver_round_archives_in_order_and_marks_done() {
        let xlog = TempDir::new().unwrap();
        let target = TempDir::new().unwrap();
        let status = ArchiveStatus::new(xlog.path());
        fs::create_dir_all(status.status_dir()).unwrap();
        let archive = DirectoryArchive::new(target.path()).unwrap();

        for name in ["000000010000000000000001", "000000010000000000000002"] {
            fs::write(xlog.path().join(name), name.as_bytes()).unwrap();
            status.notify_ready(name).unwrap();
        }
        assert_eq!(archive_ready_files(&status, &archive), 2);
        assert!(status.is_done("000000010000000000000001"));
        assert!(target.path().join("000000010000000000000002").exists());
        assert_eq!(archive_ready_files(&status, &archive), 0);
    }

    #[test]
    fn archiver_stops_at_first_failure() {
        let xlog = TempDir::new().unwrap();
        let target = TempDir::new().unwrap();
        let status = ArchiveStatus::new(xlog.path());
        fs::create_dir_all(status.status_dir()).unwrap();
        let archive = DirectoryArchive::new(target.path()).unwrap();

        // The first ready file is missing on disk, so nothing after it goes.
        status.notify_ready("000000010000000000000001").unwrap();
        fs::write(xlog.path().join("000000010000000000000002"), b"x").unwrap();
        status.notify_ready("000000010000000000000002").unwrap();
        assert_eq!(archive_ready_files(&status, &archive), 0);
        assert!(!status.is_done("000000010000000000000002"));
    }

    #[test]
    fn periodic_worker_stops_on_shutdown() {
        let ticks = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        let mut workers = BackgroundWorkers::new();
        workers.register_opt(spawn_periodic_worker(
            "test-worker",
            WorkerKind::BackgroundWriter,
            Duration::from_millis(5),
            move || {
                counter.fetch_add(1, Ordering::Relaxed);
            },
        ));
        assert!(workers.is_running(WorkerKind::BackgroundWriter));
        thread::sleep(Duration::from_millis(30));
        workers.shutdown_all();
        let seen = ticks.load(Ordering::Relaxed);
        assert!(seen >= 1);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(ticks.load(Ordering::Relaxed), seen);
        assert!(workers.snapshot().is_empty());
    }
}
