//! BufferManager caches relation pages and enforces the write-ahead rule when
//! writing them back: WAL up to a page's LSN is flushed before the page.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use log::{debug, warn};
use parking_lot::lock_api::ArcRwLockWriteGuard;
use parking_lot::{Mutex, RawRwLock, RwLock};

use crate::buffer::page::{page_lsn, set_page_lsn};
use crate::buffer::{BlockNumber, BufferTag, ForkNumber, RelFileNode, PAGE_SIZE};
use crate::error::{WalError, WalResult};
use crate::recovery::{Lsn, WalManager};
use crate::storage::disk_manager::DiskManager;

#[derive(Debug)]
struct BufferDesc {
    page: Arc<RwLock<Box<[u8]>>>,
    dirty: AtomicBool,
}

impl BufferDesc {
    fn new(page: Box<[u8]>) -> Self {
        Self {
            page: Arc::new(RwLock::new(page)),
            dirty: AtomicBool::new(false),
        }
    }
}

/// Exclusive access to one cached page. The lock is held until the guard
/// drops, so a caller can modify the page, log the change and stamp the
/// record's end LSN without another writer interleaving.
pub struct PageWriteGuard {
    tag: BufferTag,
    desc: Arc<BufferDesc>,
    guard: ArcRwLockWriteGuard<RawRwLock, Box<[u8]>>,
}

impl PageWriteGuard {
    pub fn tag(&self) -> BufferTag {
        self.tag
    }

    pub fn data(&self) -> &[u8] {
        &self.guard
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.guard
    }

    pub fn lsn(&self) -> Lsn {
        page_lsn(&self.guard)
    }

    pub fn set_lsn(&mut self, lsn: Lsn) {
        set_page_lsn(&mut self.guard, lsn);
    }

    pub fn mark_dirty(&self) {
        self.desc.dirty.store(true, Ordering::Release);
    }

    pub fn is_dirty(&self) -> bool {
        self.desc.dirty.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for PageWriteGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageWriteGuard")
            .field("tag", &self.tag)
            .field("lsn", &self.lsn())
            .finish()
    }
}

#[derive(Debug)]
pub struct BufferManager {
    disk: Arc<DiskManager>,
    wal: Arc<WalManager>,
    table: DashMap<BufferTag, Arc<BufferDesc>>,
    extend_lock: Mutex<()>,
}

impl BufferManager {
    pub fn new(disk: Arc<DiskManager>, wal: Arc<WalManager>) -> Self {
        Self {
            disk,
            wal,
            table: DashMap::new(),
            extend_lock: Mutex::new(()),
        }
    }

    pub fn disk(&self) -> &Arc<DiskManager> {
        &self.disk
    }

    fn descriptor(&self, tag: BufferTag) -> WalResult<Arc<BufferDesc>> {
        if let Some(desc) = self.table.get(&tag) {
            return Ok(Arc::clone(desc.value()));
        }
        let mut page = vec![0u8; PAGE_SIZE].into_boxed_slice();
        self.disk
            .read_block(tag.rnode, tag.fork, tag.block, &mut page)?;
        let entry = self
            .table
            .entry(tag)
            .or_insert_with(|| Arc::new(BufferDesc::new(page)));
        Ok(Arc::clone(entry.value()))
    }

    pub fn lock_page(&self, tag: BufferTag) -> WalResult<PageWriteGuard> {
        let desc = self.descriptor(tag)?;
        let guard = desc.page.write_arc();
        Ok(PageWriteGuard { tag, desc, guard })
    }

    /// Copy of the current page content.
    pub fn read_page(&self, tag: BufferTag) -> WalResult<Vec<u8>> {
        let desc = self.descriptor(tag)?;
        let page = desc.page.read();
        Ok(page.to_vec())
    }

    /// Blocks in the fork, counting cached blocks not yet written out.
    pub fn nblocks(&self, rnode: RelFileNode, fork: ForkNumber) -> WalResult<BlockNumber> {
        let on_disk = self.disk.nblocks(rnode, fork)?;
        let cached = self
            .table
            .iter()
            .filter(|e| e.key().rnode == rnode && e.key().fork == fork)
            .map(|e| e.key().block + 1)
            .max()
            .unwrap_or(0);
        Ok(on_disk.max(cached))
    }

    /// Adds a zeroed block at the end of the fork and returns it locked.
    pub fn extend(&self, rnode: RelFileNode, fork: ForkNumber) -> WalResult<PageWriteGuard> {
        let _extend = self.extend_lock.lock();
        let block = self.nblocks(rnode, fork)?;
        let tag = BufferTag::new(rnode, fork, block);
        let desc = Arc::new(BufferDesc::new(vec![0u8; PAGE_SIZE].into_boxed_slice()));
        self.table.insert(tag, Arc::clone(&desc));
        let guard = desc.page.write_arc();
        Ok(PageWriteGuard { tag, desc, guard })
    }

    /// Overwrites a page with a logged image during replay.
    pub fn restore_page(&self, tag: BufferTag, image: &[u8], lsn: Lsn) -> WalResult<()> {
        if image.len() != PAGE_SIZE {
            return Err(WalError::Corrupt(format!(
                "page image for {} has {} bytes",
                tag,
                image.len()
            )));
        }
        let mut guard = self.lock_page(tag)?;
        guard.data_mut().copy_from_slice(image);
        guard.set_lsn(lsn);
        guard.mark_dirty();
        Ok(())
    }

    fn flush_desc(&self, tag: BufferTag, desc: &BufferDesc) -> WalResult<bool> {
        if !desc.dirty.load(Ordering::Acquire) {
            return Ok(false);
        }
        let page = desc.page.read();
        let lsn = page_lsn(&page);
        if lsn.is_valid() {
            match self.wal.flush(lsn) {
                Ok(()) => {}
                Err(WalError::FlushNotSatisfied { requested, flushed }) => {
                    warn!(
                        "writing {} with WAL flushed only to {} of {}",
                        tag, flushed, requested
                    );
                }
                Err(err) => return Err(err),
            }
        }
        self.disk
            .write_block(tag.rnode, tag.fork, tag.block, &page)?;
        desc.dirty.store(false, Ordering::Release);
        Ok(true)
    }

    pub fn flush_page(&self, tag: BufferTag) -> WalResult<bool> {
        let Some(desc) = self.table.get(&tag).map(|d| Arc::clone(d.value())) else {
            return Ok(false);
        };
        self.flush_desc(tag, &desc)
    }

    /// Writes every dirty page and syncs the relation files. Returns the
    /// number of pages written.
    pub fn flush_all(&self) -> WalResult<usize> {
        let mut dirty: Vec<(BufferTag, Arc<BufferDesc>)> = self
            .table
            .iter()
            .filter(|e| e.value().dirty.load(Ordering::Acquire))
            .map(|e| (*e.key(), Arc::clone(e.value())))
            .collect();
        dirty.sort_by_key(|(tag, _)| *tag);
        let mut written = 0;
        for (tag, desc) in &dirty {
            if self.flush_desc(*tag, desc)? {
                written += 1;
            }
        }
        self.disk.sync_all()?;
        debug!("flushed {} dirty buffers", written);
        Ok(written)
    }

    /// Background writer pass: writes at most `limit` dirty pages without
    /// syncing.
    pub fn write_some(&self, limit: usize) -> WalResult<usize> {
        let dirty: Vec<(BufferTag, Arc<BufferDesc>)> = self
            .table
            .iter()
            .filter(|e| e.value().dirty.load(Ordering::Acquire))
            .take(limit)
            .map(|e| (*e.key(), Arc::clone(e.value())))
            .collect();
        let mut written = 0;
        for (tag, desc) in &dirty {
            if self.flush_desc(*tag, desc)? {
                written += 1;
            }
        }
        Ok(written)
    }

    pub fn dirty_count(&self) -> usize {
        self.table
            .iter()
            .filter(|e| e.value().dirty.load(Ordering::Acquire))
            .count()
    }
}
