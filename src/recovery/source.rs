//! Where recovery reads WAL from. Archive recovery prefers segments restored
//! from the archive, then the local `pg_xlog` directory, then a streaming
//! upstream; crash recovery only looks locally.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bitflags::bitflags;
use log::{debug, info};

use crate::error::WalResult;
use crate::recovery::archive::{ArchiveStatus, WalArchive};
use crate::recovery::lsn::{segment_start, wal_file_name, SegNo, TimeLineId};
use crate::recovery::wal::page::XLOG_BLCKSZ;
use crate::recovery::wal::{LocalPageSource, SegmentFileManager, WalPageSource};
use crate::recovery::Lsn;
use crate::utils::latch::Latch;

/// Scratch name for a segment while it is being restored from the archive.
const RECOVERY_XLOG: &str = "RECOVERYXLOG";

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SourceMask: u8 {
        const LOCAL = 0x01;
        const ARCHIVE = 0x02;
        const STREAM = 0x04;
    }
}

/// A streaming upstream. Received WAL lands in the local `pg_xlog`
/// directory; the source only needs to know how far it reaches.
pub trait WalStream: Send + fmt::Debug {
    /// Starts (or restarts) streaming from `start` on timeline `tli`.
    fn request_streaming(&mut self, start: Lsn, tli: TimeLineId) -> WalResult<()>;

    /// End of the WAL received and written locally so far.
    fn received_upto(&self) -> Lsn;
}

/// Promotion requests reach the startup thread through this: an explicit
/// call or the appearance of the configured trigger file. Setting the latch
/// also wakes a standby waiting for WAL.
#[derive(Debug, Default)]
pub struct PromoteSignal {
    requested: AtomicBool,
    trigger_file: Option<PathBuf>,
    latch: Latch,
}

impl PromoteSignal {
    pub fn new(trigger_file: Option<PathBuf>) -> Self {
        Self {
            requested: AtomicBool::new(false),
            trigger_file,
            latch: Latch::new(),
        }
    }

    pub fn request(&self) {
        self.requested.store(true, Ordering::Release);
        self.latch.set();
    }

    /// Checks for a promotion request, consuming the trigger file if present.
    pub fn is_requested(&self) -> bool {
        if self.requested.load(Ordering::Acquire) {
            return true;
        }
        if let Some(path) = &self.trigger_file {
            if path.exists() {
                info!("trigger file found: {}", path.display());
                let _ = fs::remove_file(path);
                self.requested.store(true, Ordering::Release);
                return true;
            }
        }
        false
    }

    /// Latch a standby sleeps on between source retries; streams set it when
    /// new WAL arrives.
    pub fn latch(&self) -> &Latch {
        &self.latch
    }
}

/// Page source used by the startup thread.
pub struct RecoverySource {
    local: LocalPageSource,
    archive: Option<Box<dyn WalArchive>>,
    archive_status: Option<ArchiveStatus>,
    stream: Option<Box<dyn WalStream>>,
    allowed: SourceMask,
    failed: SourceMask,
    standby: bool,
    retry_interval: Duration,
    promote: Arc<PromoteSignal>,
    /// Segment most recently restored from the archive.
    restored: Option<SegNo>,
    /// Segment the last successful page came from, and through which source.
    current: Option<(SegNo, SourceMask)>,
    streaming_from: Option<Lsn>,
}

impl RecoverySource {
    /// Crash recovery: only the local directory.
    pub fn local(segments: Arc<SegmentFileManager>) -> Self {
        Self {
            local: LocalPageSource::new(segments),
            archive: None,
            archive_status: None,
            stream: None,
            allowed: SourceMask::LOCAL,
            failed: SourceMask::empty(),
            standby: false,
            retry_interval: Duration::from_secs(5),
            promote: Arc::new(PromoteSignal::default()),
            restored: None,
            current: None,
            streaming_from: None,
        }
    }

    /// Archive recovery, optionally in standby mode.
    pub fn for_archive_recovery(
        segments: Arc<SegmentFileManager>,
        archive: Option<Box<dyn WalArchive>>,
        archive_status: Option<ArchiveStatus>,
        stream: Option<Box<dyn WalStream>>,
        standby: bool,
        retry_interval: Duration,
        promote: Arc<PromoteSignal>,
    ) -> Self {
        let mut allowed = SourceMask::LOCAL;
        if archive.is_some() {
            allowed |= SourceMask::ARCHIVE;
        }
        if stream.is_some() && standby {
            allowed |= SourceMask::STREAM;
        }
        Self {
            archive,
            archive_status,
            stream,
            allowed,
            standby,
            retry_interval,
            promote,
            ..Self::local(segments)
        }
    }

    pub fn allowed(&self) -> SourceMask {
        self.allowed
    }

    pub fn failed(&self) -> SourceMask {
        self.failed
    }

    pub fn archive(&self) -> Option<&dyn WalArchive> {
        self.archive.as_deref()
    }

    pub fn promote_signal(&self) -> &Arc<PromoteSignal> {
        &self.promote
    }

    /// Leaves standby mode: once the available sources run dry the reader
    /// sees the end of WAL instead of waiting.
    pub fn stop_standby(&mut self) {
        self.standby = false;
        self.allowed.remove(SourceMask::STREAM);
    }

    fn segments(&self) -> &Arc<SegmentFileManager> {
        self.local.segments()
    }

    /// Restores the segment from the archive under its real name, trying the
    /// expected timelines newest first.
    fn restore_segment(&mut self, segno: SegNo, expected_tlis: &[TimeLineId]) -> WalResult<bool> {
        if self.restored == Some(segno) {
            return Ok(true);
        }
        let Some(archive) = self.archive.as_deref() else {
            return Ok(false);
        };
        let segments = Arc::clone(self.local.segments());
        let segment_size = segments.segment_size();
        let scratch = segments.directory().join(RECOVERY_XLOG);
        for &tli in expected_tlis {
            let name = wal_file_name(tli, segno, segment_size);
            if !archive.fetch(&name, &scratch)? {
                continue;
            }
            if fs::metadata(&scratch)?.len() != segment_size {
                debug!("archive file \"{}\" has wrong size, ignoring", name);
                let _ = fs::remove_file(&scratch);
                continue;
            }
            // An older local copy may be open; the restored file replaces it.
            self.local.close();
            fs::rename(&scratch, segments.segment_path(tli, segno))?;
            if let Some(status) = &self.archive_status {
                status.mark_done(&name)?;
            }
            info!("restored log file \"{}\" from archive", name);
            self.restored = Some(segno);
            return Ok(true);
        }
        Ok(false)
    }

    fn try_source(
        &mut self,
        source: SourceMask,
        page_addr: Lsn,
        expected_tlis: &[TimeLineId],
        buf: &mut [u8],
    ) -> WalResult<Option<TimeLineId>> {
        let segment_size = self.segments().segment_size();
        let segno = page_addr.segment(segment_size);
        if source == SourceMask::ARCHIVE {
            if !self.restore_segment(segno, expected_tlis)? {
                return Ok(None);
            }
        } else if source == SourceMask::STREAM {
            let Some(stream) = self.stream.as_mut() else {
                return Ok(None);
            };
            if self.streaming_from.is_none() {
                let start = segment_start(segno, segment_size);
                let tli = expected_tlis.first().copied().unwrap_or(1);
                info!("started streaming WAL from {} on timeline {}", start, tli);
                stream.request_streaming(start, tli)?;
                self.streaming_from = Some(start);
            }
            if stream.received_upto() < page_addr + XLOG_BLCKSZ as u64 {
                return Ok(None);
            }
            // The file may have grown since it was opened.
            self.local.close();
        }
        self.local.read_page(page_addr, expected_tlis, buf)
    }

    fn wait_for_more(&mut self) -> bool {
        if self.promote.is_requested() {
            return false;
        }
        let latch = self.promote.latch();
        latch.wait_timeout(self.retry_interval);
        latch.reset();
        if self.promote.is_requested() {
            return false;
        }
        self.failed = SourceMask::empty();
        self.restored = None;
        self.local.close();
        true
    }
}

impl WalPageSource for RecoverySource {
    fn read_page(
        &mut self,
        page_addr: Lsn,
        expected_tlis: &[TimeLineId],
        buf: &mut [u8],
    ) -> WalResult<Option<TimeLineId>> {
        let segno = page_addr.segment(self.segments().segment_size());
        if let Some((current, source)) = self.current {
            if current == segno && source != SourceMask::STREAM {
                if let Some(tli) = self.local.read_page(page_addr, expected_tlis, buf)? {
                    return Ok(Some(tli));
                }
            }
        }
        loop {
            for source in [SourceMask::ARCHIVE, SourceMask::LOCAL, SourceMask::STREAM] {
                if !self.allowed.contains(source) || self.failed.contains(source) {
                    continue;
                }
                if let Some(tli) = self.try_source(source, page_addr, expected_tlis, buf)? {
                    self.current = Some((segno, source));
                    return Ok(Some(tli));
                }
                debug!("WAL page {} not available from {:?}", page_addr, source);
                self.failed |= source;
            }
            if !self.standby || !self.wait_for_more() {
                return Ok(None);
            }
        }
    }

    fn begin_record(&mut self) {
        self.failed = SourceMask::empty();
    }
}

impl fmt::Debug for RecoverySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoverySource")
            .field("allowed", &self.allowed)
            .field("failed", &self.failed)
            .field("standby", &self.standby)
            .field("current", &self.current)
            .finish()
    }
}

/// Removes leftovers of an interrupted restore.
pub fn remove_restore_scratch(xlog_dir: &Path) {
    let _ = fs::remove_file(xlog_dir.join(RECOVERY_XLOG));
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Instant;

    use super::*;
    use crate::recovery::archive::DirectoryArchive;
    use tempfile::TempDir;

    const SEG: u64 = 64 * 1024;

    fn segments(dir: &TempDir) -> Arc<SegmentFileManager> {
        Arc::new(SegmentFileManager::new(dir.path().join("pg_xlog"), SEG, false, false).unwrap())
    }

    fn fill_segment(path: &Path, byte: u8) {
        fs::write(path, vec![byte; SEG as usize]).unwrap();
    }

    #[test]
    fn archive_is_preferred_over_local() {
        let dir = TempDir::new().unwrap();
        let archive_dir = TempDir::new().unwrap();
        let segments = segments(&dir);
        fill_segment(&segments.segment_path(1, 2), 0x11);
        fill_segment(&archive_dir.path().join(wal_file_name(1, 2, SEG)), 0x22);

        let archive = DirectoryArchive::new(archive_dir.path()).unwrap();
        let mut source = RecoverySource::for_archive_recovery(
            Arc::clone(&segments),
            Some(Box::new(archive)),
            None,
            None,
            false,
            Duration::from_millis(10),
            Arc::new(PromoteSignal::default()),
        );
        let mut buf = vec![0u8; XLOG_BLCKSZ];
        let tli = source
            .read_page(segment_start(2, SEG), &[1], &mut buf)
            .unwrap();
        assert_eq!(tli, Some(1));
        assert!(buf.iter().all(|b| *b == 0x22));
        assert!(!segments.directory().join(RECOVERY_XLOG).exists());
    }

    #[test]
    fn failed_sources_are_remembered_until_next_record() {
        let dir = TempDir::new().unwrap();
        let archive_dir = TempDir::new().unwrap();
        let segments = segments(&dir);
        fill_segment(&segments.segment_path(1, 3), 0x33);
        let archive = DirectoryArchive::new(archive_dir.path()).unwrap();
        let mut source = RecoverySource::for_archive_recovery(
            Arc::clone(&segments),
            Some(Box::new(archive)),
            None,
            None,
            false,
            Duration::from_millis(10),
            Arc::new(PromoteSignal::default()),
        );
        let mut buf = vec![0u8; XLOG_BLCKSZ];
        // Segment 3 only exists locally.
        assert_eq!(
            source.read_page(segment_start(3, SEG), &[1], &mut buf).unwrap(),
            Some(1)
        );
        assert_eq!(source.failed(), SourceMask::ARCHIVE);
        // Segment 4 exists nowhere: outside standby that is the end of WAL.
        assert_eq!(
            source.read_page(segment_start(4, SEG), &[1], &mut buf).unwrap(),
            None
        );
        assert_eq!(source.failed(), SourceMask::ARCHIVE | SourceMask::LOCAL);
        source.begin_record();
        assert!(source.failed().is_empty());
    }

    #[test]
    fn crash_recovery_reads_only_locally() {
        let dir = TempDir::new().unwrap();
        let segments = segments(&dir);
        let source = RecoverySource::local(segments);
        assert_eq!(source.allowed(), SourceMask::LOCAL);
        assert!(source.archive().is_none());
    }

    #[test]
    fn standby_waits_until_promoted() {
        let dir = TempDir::new().unwrap();
        let trigger = dir.path().join("promote.trigger");
        let segments = segments(&dir);
        let promote = Arc::new(PromoteSignal::new(Some(trigger.clone())));
        let mut source = RecoverySource::for_archive_recovery(
            segments,
            None,
            None,
            None,
            true,
            Duration::from_millis(20),
            Arc::clone(&promote),
        );
        let creator = thread::spawn(move || {
            thread::sleep(Duration::from_millis(60));
            fs::write(&trigger, b"").unwrap();
        });
        let started = Instant::now();
        let mut buf = vec![0u8; XLOG_BLCKSZ];
        assert_eq!(
            source.read_page(segment_start(1, SEG), &[1], &mut buf).unwrap(),
            None
        );
        assert!(started.elapsed() >= Duration::from_millis(40));
        assert!(promote.is_requested());
        creator.join().unwrap();
    }

    #[derive(Debug)]
    struct FixedStream {
        upto: Lsn,
        requested: Option<(Lsn, TimeLineId)>,
    }

    impl WalStream for FixedStream {
        fn request_streaming(&mut self, start: Lsn, tli: TimeLineId) -> WalResult<()> {
            self.requested = Some((start, tli));
            Ok(())
        }

        fn received_upto(&self) -> Lsn {
            self.upto
        }
    }

    #[test]
    fn stream_serves_only_received_pages() {
        let dir = TempDir::new().unwrap();
        let segments = segments(&dir);
        fill_segment(&segments.segment_path(2, 1), 0x44);
        let start = segment_start(1, SEG);
        let stream = FixedStream {
            upto: start + XLOG_BLCKSZ as u64,
            requested: None,
        };
        let mut source = RecoverySource::for_archive_recovery(
            Arc::clone(&segments),
            None,
            None,
            Some(Box::new(stream)),
            true,
            Duration::from_millis(10),
            Arc::new(PromoteSignal::default()),
        );
        // Local is tried before the stream; hide the file from it.
        source.allowed.remove(SourceMask::LOCAL);
        let mut buf = vec![0u8; XLOG_BLCKSZ];
        assert_eq!(source.read_page(start, &[2, 1], &mut buf).unwrap(), Some(2));

        source.promote_signal().request();
        source.begin_record();
        assert_eq!(
            source
                .read_page(start + XLOG_BLCKSZ as u64, &[2, 1], &mut buf)
                .unwrap(),
            None
        );
    }
}
