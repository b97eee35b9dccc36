pub mod wal_codec;

use std::sync::Arc;

use log::trace;

use crate::buffer::page::{
    mask_page_hint_bits, mask_page_lsn_and_checksum, mask_unused_space, page_add_item,
    page_free_space, page_init, page_is_new, OffsetNumber,
};
use crate::buffer::{BufferManager, BufferTag, ForkNumber, RelFileNode};
use crate::error::{WalError, WalResult};
use crate::recovery::lsn::maxalign;
use crate::recovery::resource_manager::{RedoContext, ResourceManager, RmgrId};
use crate::recovery::wal::codec::{BufferRef, DecodedRecord, RecordInput};
use crate::recovery::wal::WalSession;
use crate::recovery::{Lsn, WalManager};
use crate::transaction::TransactionId;

use wal_codec::{HeapInsertRecord, XLOG_HEAP_INIT_PAGE, XLOG_HEAP_INSERT, XLOG_HEAP_OPMASK};

/// Where an inserted tuple landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapTid {
    pub tag: BufferTag,
    pub offnum: OffsetNumber,
    /// End of the insert record, now the page LSN.
    pub lsn: Lsn,
}

/// Inserts a tuple into the last page of the relation, or a new page when it
/// does not fit, and logs the change. The page stays locked until its LSN is
/// stamped with the record end.
pub fn heap_insert(
    buffers: &Arc<BufferManager>,
    wal: &WalManager,
    session: &mut WalSession,
    xid: TransactionId,
    rnode: RelFileNode,
    tuple: &[u8],
) -> WalResult<HeapTid> {
    let needed = maxalign(tuple.len());
    let nblocks = buffers.nblocks(rnode, ForkNumber::Main)?;
    let mut page = None;
    if nblocks > 0 {
        let last = buffers.lock_page(BufferTag::main(rnode, nblocks - 1))?;
        if !page_is_new(last.data()) && page_free_space(last.data()) >= needed {
            page = Some(last);
        }
    }
    let (mut page, init) = match page {
        Some(page) => (page, false),
        None => {
            let mut fresh = buffers.extend(rnode, ForkNumber::Main)?;
            page_init(fresh.data_mut(), 0);
            (fresh, true)
        }
    };
    let offnum = page_add_item(page.data_mut(), tuple)?;
    page.mark_dirty();
    let tag = page.tag();

    let body = HeapInsertRecord {
        rnode,
        block: tag.block,
        offnum,
    }
    .encode();
    let info = if init {
        XLOG_HEAP_INSERT | XLOG_HEAP_INIT_PAGE
    } else {
        XLOG_HEAP_INSERT
    };
    let inserted = {
        let mut input = RecordInput::new(RmgrId::Heap, info).with_xid(xid);
        input.add_data(&body);
        let idx = input.register_buffer(BufferRef {
            tag,
            page: page.data(),
            standard_layout: true,
        })?;
        input.add_buffer_data(idx, tuple);
        wal.insert(session, &input)?
    };
    page.set_lsn(inserted.end);
    Ok(HeapTid {
        tag,
        offnum,
        lsn: inserted.end,
    })
}

#[derive(Debug, Default)]
pub struct HeapResourceManager;

impl ResourceManager for HeapResourceManager {
    fn id(&self) -> RmgrId {
        RmgrId::Heap
    }

    fn redo(&self, record: &DecodedRecord, ctx: &RedoContext<'_>) -> WalResult<()> {
        let info = record.rmgr_info();
        if info & XLOG_HEAP_OPMASK != XLOG_HEAP_INSERT {
            return Err(WalError::Corrupt(format!(
                "heap_redo: unknown op code {:02X}",
                info
            )));
        }
        let (xlrec, tuple) = HeapInsertRecord::decode(&record.data)?;
        ctx.xacts.observe_xid(record.xid());
        if record.block_restored(0) {
            return Ok(());
        }

        let tag = BufferTag::main(xlrec.rnode, xlrec.block);
        let mut page = ctx.buffers.lock_page(tag)?;
        if info & XLOG_HEAP_INIT_PAGE != 0 {
            page_init(page.data_mut(), 0);
        } else if page.lsn() >= record.end_lsn {
            trace!("heap insert at {} already applied to {}", record.lsn, tag);
            return Ok(());
        }
        if tuple.is_empty() {
            return Err(WalError::Corrupt(format!(
                "heap insert at {} carries no tuple",
                record.lsn
            )));
        }
        let offnum = page_add_item(page.data_mut(), tuple)?;
        if offnum != xlrec.offnum {
            return Err(WalError::Panic(format!(
                "heap_insert_redo: failed to add tuple to {} at offset {} (got {})",
                tag, xlrec.offnum, offnum
            )));
        }
        page.set_lsn(record.end_lsn);
        page.mark_dirty();
        Ok(())
    }

    fn identify(&self, info: u8) -> Option<&'static str> {
        match info {
            XLOG_HEAP_INSERT => Some("INSERT"),
            i if i == XLOG_HEAP_INSERT | XLOG_HEAP_INIT_PAGE => Some("INSERT+INIT"),
            _ => None,
        }
    }

    fn desc(&self, record: &DecodedRecord) -> WalResult<String> {
        let info = record.rmgr_info();
        if info & XLOG_HEAP_OPMASK != XLOG_HEAP_INSERT {
            return Ok(format!("UNKNOWN ({:02X})", info));
        }
        let (xlrec, _) = HeapInsertRecord::decode(&record.data)?;
        Ok(format!(
            "insert{}: rel {}; tid {}/{}",
            if info & XLOG_HEAP_INIT_PAGE != 0 {
                "(init)"
            } else {
                ""
            },
            xlrec.rnode,
            xlrec.block,
            xlrec.offnum
        ))
    }

    fn mask(&self, page: &mut [u8]) {
        mask_page_lsn_and_checksum(page);
        mask_page_hint_bits(page);
        mask_unused_space(page);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::page::page_get_item;
    use crate::recovery::resource_manager::describe_record;
    use crate::recovery::wal::codec::{decode_record, encode_record, prepare_record};
    use crate::recovery::wal::tests::started_manager;
    use crate::recovery::wal::InsertPermission;
    use crate::storage::disk_manager::DiskManager;

    const REL: RelFileNode = RelFileNode::new(1663, 1, 16384);

    #[test]
    fn insert_stamps_page_and_fills_pages_in_order() {
        let (dir, wal) = started_manager();
        wal.finish_recovery();
        let disk = Arc::new(DiskManager::new(dir.path(), true).unwrap());
        let buffers = Arc::new(BufferManager::new(disk, Arc::clone(&wal)));
        let mut session = wal.session(InsertPermission::CheckRecovery);

        let first = heap_insert(&buffers, &wal, &mut session, 10, REL, b"hello").unwrap();
        assert_eq!(first.tag.block, 0);
        assert_eq!(first.offnum, 1);
        let second = heap_insert(&buffers, &wal, &mut session, 10, REL, b"world").unwrap();
        assert_eq!(second.offnum, 2);
        assert!(second.lsn > first.lsn);

        let page = buffers.read_page(first.tag).unwrap();
        assert_eq!(page_get_item(&page, 2), Some(&b"world"[..]));
        assert_eq!(crate::buffer::page::page_lsn(&page), second.lsn);

        let big = vec![0xAB; 5000];
        heap_insert(&buffers, &wal, &mut session, 10, REL, &big).unwrap();
        let spilled = heap_insert(&buffers, &wal, &mut session, 10, REL, &big).unwrap();
        assert_eq!(spilled.tag.block, 1);
        assert_eq!(spilled.offnum, 1);
    }

    #[test]
    fn description_and_identify() {
        let body = HeapInsertRecord {
            rnode: REL,
            block: 4,
            offnum: 7,
        }
        .encode();
        let mut input = RecordInput::new(RmgrId::Heap, XLOG_HEAP_INSERT | XLOG_HEAP_INIT_PAGE);
        input.add_data(&body).add_data(b"tuple");
        let prepared = prepare_record(&input, Lsn::INVALID, false, false).unwrap();
        let bytes = encode_record(&prepared, Lsn::INVALID);
        let record =
            decode_record(&bytes, Lsn::new(0x3000), Lsn::new(0x3000 + bytes.len() as u64)).unwrap();
        assert_eq!(
            describe_record(&record),
            "Heap INSERT+INIT: insert(init): rel 1663/1/16384; tid 4/7"
        );
        let (_, tuple) = HeapInsertRecord::decode(&record.data).unwrap();
        assert_eq!(tuple, b"tuple");
    }
}
