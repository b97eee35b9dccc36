use std::os::unix::fs::FileExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use log::{debug, warn};

use crate::error::{WalError, WalResult};
use crate::recovery::checkpoint::CheckpointFlags;
use crate::recovery::lsn::{wal_file_name, SegNo};
use crate::recovery::Lsn;

use super::page::XLOG_BLCKSZ;
use super::result::{LsnCache, WriteResult};
use super::{InsertPermission, WalManager, WalSession, WriterState};

impl WalManager {
    /// Writes ring pages to their segment files until `target` is written,
    /// syncing when `flush` is set or a segment fills up. Caller holds the
    /// write lock.
    pub(super) fn write_pages(&self, ws: &mut WriterState, target: Lsn, flush: bool) -> WalResult<()> {
        let mut page_buf = vec![0u8; XLOG_BLCKSZ];
        while ws.result.write < target {
            if let Some(gap_end) = self.take_gap_at(ws.result.write) {
                self.finish_segment(ws)?;
                ws.result = WriteResult::new(gap_end, gap_end);
                continue;
            }

            let page = ws.result.write.page_start(XLOG_BLCKSZ);
            if !self.ring.holds(page) {
                return Err(WalError::Panic(format!(
                    "xlog write request {} is past end of log {}",
                    target,
                    self.insert_position()
                )));
            }
            let page_end = page + XLOG_BLCKSZ as u64;
            let segno = page.segment(self.segment_size);
            self.ensure_open(ws, segno, page)?;

            self.ring.copy_page(page, &mut page_buf);
            if let Some((_, file)) = ws.open.as_ref() {
                let offset = page.segment_offset(self.segment_size);
                file.write_all_at(&page_buf, offset).map_err(|err| {
                    WalError::Panic(format!(
                        "could not write to log file {} at offset {}: {}",
                        wal_file_name(self.timeline(), segno, self.segment_size),
                        offset,
                        err
                    ))
                })?;
            }
            let upto = page_end.min(target);
            ws.result.write = upto;

            if upto == page_end && page_end.segment_offset(self.segment_size) == 0 {
                self.finish_segment(ws)?;
                ws.result.flush = ws.result.write;
            }
        }

        if flush && ws.result.flush < ws.result.write {
            if let Some((_, file)) = ws.open.as_ref() {
                self.segments.sync(file)?;
            }
            ws.result.flush = ws.result.write;
        }
        self.shared.publish(ws.result);
        Ok(())
    }

    fn take_gap_at(&self, pos: Lsn) -> Option<Lsn> {
        let mut gaps = self.gaps.lock();
        while gaps.front().is_some_and(|(_, end)| *end <= pos) {
            gaps.pop_front();
        }
        match gaps.front() {
            Some((start, end)) if *start == pos => {
                let end = *end;
                gaps.pop_front();
                Some(end)
            }
            _ => None,
        }
    }

    fn ensure_open(&self, ws: &mut WriterState, segno: SegNo, page: Lsn) -> WalResult<()> {
        if matches!(ws.open, Some((open, _)) if open == segno) {
            return Ok(());
        }
        if let Some((_, file)) = ws.open.take() {
            self.segments.sync(&file)?;
            self.segments.close(file);
        }
        let tli = self.timeline();
        let file = if page.segment_offset(self.segment_size) == 0 {
            self.segments.create_or_open(tli, segno, true)
        } else {
            self.segments.open_for_write(tli, segno)
        }
        .map_err(WalError::into_panic)?;
        ws.open = Some((segno, file));
        Ok(())
    }

    /// Completes the open segment: sync, close, hand it to the archiver, and
    /// request a checkpoint once enough segments piled up since the last redo.
    fn finish_segment(&self, ws: &mut WriterState) -> WalResult<()> {
        let Some((segno, file)) = ws.open.take() else {
            return Ok(());
        };
        self.segments.sync(&file)?;
        self.segments.close(file);
        let name = wal_file_name(self.timeline(), segno, self.segment_size);
        if let Some(archive) = &self.archive {
            if let Err(err) = archive.notify_ready(&name) {
                warn!("could not create archive status file for \"{}\": {}", name, err);
            }
        }
        if !self.in_recovery() && self.checkpoint_segments > 0 {
            let redo_seg = self.shared.redo().segment(self.segment_size);
            if segno + 1 >= redo_seg + self.checkpoint_segments {
                debug!("{} segments since redo, requesting checkpoint", self.checkpoint_segments);
                self.checkpoint_requests.request(CheckpointFlags::CAUSE_XLOG);
            }
        }
        Ok(())
    }

    /// Ensures WAL up to `target` is durable. During recovery this advances
    /// the minimum recovery point instead.
    pub fn flush(&self, target: Lsn) -> WalResult<()> {
        let mut session = self.session(InsertPermission::CheckRecovery);
        self.flush_session(&mut session, target)
    }

    pub fn flush_session(&self, session: &mut WalSession, target: Lsn) -> WalResult<()> {
        if !self.insert_allowed(session.permission) {
            return self.update_min_recovery_point(target);
        }
        self.flush_inner(&mut session.cache, target)
    }

    pub(super) fn flush_inner(&self, cache: &mut LsnCache, target: Lsn) -> WalResult<()> {
        self.check_crashed()?;
        if target <= cache.read_cached().flush || target <= cache.refresh(&self.shared).flush {
            return Ok(());
        }

        // Whoever holds the write lock flushes for everyone waiting behind it;
        // re-check once we get it.
        let mut ws = self.write.lock();
        cache.store(ws.result);
        if target <= ws.result.flush {
            return Ok(());
        }
        let inserted = self.insert_position();
        let write_target = inserted.max(ws.result.write);
        if write_target > ws.result.flush {
            let written = self.write_pages(&mut ws, write_target, true);
            self.critical(written)?;
        }
        cache.store(ws.result);
        let flushed = ws.result.flush;
        drop(ws);

        if flushed < target {
            return Err(WalError::FlushNotSatisfied {
                requested: target,
                flushed,
            });
        }
        Ok(())
    }

    /// One round of the background writer. Writes completed pages, or up to
    /// the latest asynchronous commit when one is pending. Never waits for the
    /// write lock. Returns whether anything was written.
    pub fn background_flush(&self) -> WalResult<bool> {
        if self.in_recovery() || self.is_crashed() || !self.inserting.load(Ordering::Acquire) {
            return Ok(false);
        }
        let (result, write_request, async_commit) = self.shared.snapshot();
        let mut target = write_request;
        if async_commit > result.flush {
            target = target.max(async_commit);
        }
        if target <= result.flush {
            return Ok(false);
        }
        let Some(mut ws) = self.write.try_lock() else {
            return Ok(false);
        };
        if target <= ws.result.flush {
            return Ok(false);
        }
        let written = self.write_pages(&mut ws, target, true);
        self.critical(written)?;
        Ok(true)
    }

    /// Records an asynchronous commit the background writer must flush.
    pub fn set_async_commit(&self, lsn: Lsn) {
        self.shared.set_async_commit(lsn);
    }

    pub fn start_background_writer(self: &Arc<Self>, interval: Duration) -> WalResult<Option<WalWriterHandle>> {
        if interval.is_zero() {
            return Ok(None);
        }
        let mut guard = self.writer.lock();
        if guard.is_some() {
            return Ok(None);
        }
        let runtime = WalWriterRuntime::spawn(Arc::downgrade(self), interval)?;
        *guard = Some(runtime);
        Ok(Some(WalWriterHandle::new(Arc::clone(self))))
    }

    fn stop_background_writer(&self) -> WalResult<()> {
        if let Some(runtime) = self.writer.lock().take() {
            runtime.stop()?;
        }
        Ok(())
    }
}

pub struct WalWriterHandle {
    manager: Option<Arc<WalManager>>,
}

impl WalWriterHandle {
    fn new(manager: Arc<WalManager>) -> Self {
        Self {
            manager: Some(manager),
        }
    }

    pub fn stop(mut self) -> WalResult<()> {
        match self.manager.take() {
            Some(manager) => manager.stop_background_writer(),
            None => Ok(()),
        }
    }
}

impl Drop for WalWriterHandle {
    fn drop(&mut self) {
        if let Some(manager) = self.manager.take() {
            let _ = manager.stop_background_writer();
        }
    }
}

#[derive(Debug)]
pub(super) struct WalWriterRuntime {
    stop_flag: Arc<AtomicBool>,
    thread: thread::JoinHandle<()>,
}

impl WalWriterRuntime {
    pub(super) fn spawn(target: Weak<WalManager>, interval: Duration) -> WalResult<Self> {
        let stop_flag = Arc::new(AtomicBool::new(false));
        let thread_stop = stop_flag.clone();
        let handle = thread::Builder::new()
            .name("walwriter".into())
            .spawn(move || {
                while !thread_stop.load(Ordering::Relaxed) {
                    let Some(manager) = target.upgrade() else {
                        break;
                    };
                    match manager.background_flush() {
                        Ok(_) => {}
                        Err(err) if err.is_panic() => {
                            warn!("WAL writer stopping: {}", err);
                            break;
                        }
                        Err(err) => warn!("WAL writer flush failed: {}", err),
                    }
                    drop(manager);
                    thread::sleep(interval);
                }
                if let Some(manager) = target.upgrade() {
                    let _ = manager.background_flush();
                }
            })
            .map_err(|e| WalError::Internal(format!("Failed to spawn walwriter: {}", e)))?;
        Ok(Self {
            stop_flag,
            thread: handle,
        })
    }

    pub(super) fn stop(self) -> WalResult<()> {
        self.stop_flag.store(true, Ordering::Release);
        self.thread
            .join()
            .map_err(|_| WalError::Internal("walwriter thread panicked".to_string()))
    }
}
