use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::WalResult;
use crate::recovery::Lsn;

use super::page::{ContRecordHeader, WalPageHeader, XLOG_BLCKSZ};

/// Fixed ring of WAL page buffers. The page starting at `p` lives in slot
/// `(p / XLOG_BLCKSZ) % len`; `ends[slot]` is the end LSN of the page the
/// slot currently holds, so a slot is valid for page `p` exactly when its end
/// equals `p + XLOG_BLCKSZ`.
pub(crate) struct PageRing {
    pages: Vec<Mutex<Box<[u8]>>>,
    ends: Vec<AtomicU64>,
}

impl PageRing {
    pub(crate) fn new(slots: usize) -> Self {
        Self {
            pages: (0..slots)
                .map(|_| Mutex::new(vec![0u8; XLOG_BLCKSZ].into_boxed_slice()))
                .collect(),
            ends: (0..slots).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    #[inline]
    pub(crate) fn slot_of(&self, page_start: Lsn) -> usize {
        ((page_start.as_u64() / XLOG_BLCKSZ as u64) % self.pages.len() as u64) as usize
    }

    /// End of the page the slot for `page_start` currently holds; invalid if
    /// the slot was never used.
    #[inline]
    pub(crate) fn occupant_end(&self, page_start: Lsn) -> Lsn {
        Lsn::new(self.ends[self.slot_of(page_start)].load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn holds(&self, page_start: Lsn) -> bool {
        self.occupant_end(page_start) == page_start + XLOG_BLCKSZ as u64
    }

    /// Zero-fills the slot and writes a fresh page header (and continuation
    /// header). The caller must already have made the previous occupant durable.
    pub(crate) fn init_page(
        &self,
        header: &WalPageHeader,
        cont: Option<ContRecordHeader>,
    ) -> WalResult<()> {
        let slot = self.slot_of(header.page_addr);
        {
            let mut page = self.pages[slot].lock();
            page.fill(0);
            header.encode_into(&mut page[..])?;
            if let Some(cont) = cont {
                cont.encode_into(&mut page[header.size()..])?;
            }
        }
        self.ends[slot].store(
            header.page_addr.as_u64() + XLOG_BLCKSZ as u64,
            Ordering::Release,
        );
        Ok(())
    }

    /// Loads an existing page image, used for the partially filled last page
    /// found at startup.
    pub(crate) fn load_page(&self, page_start: Lsn, image: &[u8]) {
        let slot = self.slot_of(page_start);
        self.pages[slot].lock().copy_from_slice(image);
        self.ends[slot].store(
            page_start.as_u64() + XLOG_BLCKSZ as u64,
            Ordering::Release,
        );
    }

    /// Copies bytes into the page containing `pos`; the copy must not cross
    /// the page end.
    pub(crate) fn write_at(&self, pos: Lsn, bytes: &[u8]) {
        let offset = pos.page_offset(XLOG_BLCKSZ);
        debug_assert!(offset + bytes.len() <= XLOG_BLCKSZ);
        let slot = self.slot_of(pos.page_start(XLOG_BLCKSZ));
        let mut page = self.pages[slot].lock();
        page[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    pub(crate) fn copy_page(&self, page_start: Lsn, out: &mut [u8]) {
        let slot = self.slot_of(page_start);
        out.copy_from_slice(&self.pages[slot].lock()[..]);
    }
}

impl std::fmt::Debug for PageRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageRing")
            .field("slots", &self.pages.len())
            .finish()
    }
}
