use parking_lot::Mutex;

use crate::recovery::Lsn;

/// How far the WAL has been handed to the kernel (`write`) and made durable
/// (`flush`). `flush <= write` always holds and neither ever moves back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteResult {
    pub write: Lsn,
    pub flush: Lsn,
}

impl WriteResult {
    pub fn new(write: Lsn, flush: Lsn) -> Self {
        debug_assert!(flush <= write);
        Self { write, flush }
    }

    /// Field-wise maximum, so stale copies can never pull a result back.
    pub fn merge(self, other: WriteResult) -> WriteResult {
        WriteResult {
            write: self.write.max(other.write),
            flush: self.flush.max(other.flush),
        }
    }
}

/// Shared progress published by the writer, guarded by the short "info"
/// lock. Readers take a copy and never hold it across I/O.
#[derive(Debug, Default)]
pub(crate) struct SharedProgress {
    pub(crate) result: WriteResult,
    /// End of the last page known to be completely filled.
    pub(crate) write_request: Lsn,
    /// Copy of the insertion redo pointer for callers outside the insert lock.
    pub(crate) redo: Lsn,
    /// Latest asynchronous commit the background writer must flush through.
    pub(crate) async_commit: Lsn,
}

#[derive(Debug, Default)]
pub(crate) struct SharedWriteResult {
    inner: Mutex<SharedProgress>,
}

impl SharedWriteResult {
    pub(crate) fn new(initial: WriteResult, redo: Lsn) -> Self {
        Self {
            inner: Mutex::new(SharedProgress {
                result: initial,
                write_request: initial.write,
                redo,
                async_commit: Lsn::INVALID,
            }),
        }
    }

    pub(crate) fn result(&self) -> WriteResult {
        self.inner.lock().result
    }

    pub(crate) fn publish(&self, result: WriteResult) -> WriteResult {
        let mut guard = self.inner.lock();
        guard.result = guard.result.merge(result);
        guard.result
    }

    pub(crate) fn note_completed_page(&self, page_end: Lsn) {
        let mut guard = self.inner.lock();
        if guard.write_request < page_end {
            guard.write_request = page_end;
        }
    }

    pub(crate) fn redo(&self) -> Lsn {
        self.inner.lock().redo
    }

    pub(crate) fn set_redo(&self, redo: Lsn) {
        self.inner.lock().redo = redo;
    }

    pub(crate) fn set_async_commit(&self, lsn: Lsn) {
        let mut guard = self.inner.lock();
        if guard.async_commit < lsn {
            guard.async_commit = lsn;
        }
    }

    pub(crate) fn snapshot(&self) -> (WriteResult, Lsn, Lsn) {
        let guard = self.inner.lock();
        (guard.result, guard.write_request, guard.async_commit)
    }
}

/// A caller-local copy of the write/flush result. `read_cached` never takes a
/// lock and may be stale; `refresh` re-reads the shared copy.
#[derive(Debug, Clone, Copy, Default)]
pub struct LsnCache {
    local: WriteResult,
}

impl LsnCache {
    pub fn new(initial: WriteResult) -> Self {
        Self { local: initial }
    }

    #[inline]
    pub fn read_cached(&self) -> WriteResult {
        self.local
    }

    pub(crate) fn refresh(&mut self, shared: &SharedWriteResult) -> WriteResult {
        self.local = self.local.merge(shared.result());
        self.local
    }

    pub(crate) fn store(&mut self, result: WriteResult) {
        self.local = self.local.merge(result);
    }
}
