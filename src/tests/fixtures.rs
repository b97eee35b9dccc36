use std::fs;
use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;

use crate::buffer::page::{page_get_item, page_item_count};
use crate::buffer::{BufferTag, ForkNumber, RelFileNode};
use crate::config::DatabaseOptions;
use crate::database::{Database, LOCK_FILE};
use crate::recovery::resource_manager::RmgrId;
use crate::recovery::timeline::read_timeline_history;
use crate::recovery::wal::codec::DecodedRecord;
use crate::recovery::wal::{LocalPageSource, SegmentFileManager, WalReader, XLOG_DIR};
use crate::recovery::{ControlFileManager, Lsn};
use crate::transaction::TransactionId;

pub const SEG: u64 = 256 * 1024;
pub const REL: RelFileNode = RelFileNode::new(1663, 1, 16384);

pub fn options() -> DatabaseOptions {
    DatabaseOptions::for_testing(SEG)
}

pub fn init_and_open(dir: &Path) -> Database {
    Database::init(&options(), dir).unwrap();
    Database::open(&options(), dir).unwrap()
}

/// Inserts `tuple` in its own transaction and commits it. Returns the xid
/// and the commit record's end.
pub fn insert_committed(db: &Database, tuple: &[u8]) -> (TransactionId, Lsn) {
    let mut session = db.session();
    let mut txn = db.begin();
    db.heap_insert(&mut session, &mut txn, REL, tuple).unwrap();
    let end = db.commit(&mut session, &mut txn).unwrap();
    (txn.id(), end)
}

/// Every tuple in `REL`, in block and item order.
pub fn heap_tuples(db: &Database) -> Vec<Vec<u8>> {
    let buffers = db.buffers();
    let nblocks = buffers.nblocks(REL, ForkNumber::Main).unwrap();
    let mut tuples = Vec::new();
    for block in 0..nblocks {
        let page = buffers.read_page(BufferTag::main(REL, block)).unwrap();
        for offnum in 1..=page_item_count(&page) {
            if let Some(item) = page_get_item(&page, offnum) {
                tuples.push(item.to_vec());
            }
        }
    }
    tuples
}

/// Copies a data directory the way a file-level backup tool would, leaving
/// the lock file behind.
pub fn copy_dir(from: &Path, to: &Path) {
    fs::create_dir_all(to).unwrap();
    for entry in fs::read_dir(from).unwrap() {
        let entry = entry.unwrap();
        let name = entry.file_name();
        if name == LOCK_FILE {
            continue;
        }
        let target = to.join(&name);
        if entry.file_type().unwrap().is_dir() {
            copy_dir(&entry.path(), &target);
        } else {
            fs::copy(entry.path(), &target).unwrap();
        }
    }
}

/// Decodes every record from the last checkpoint's redo point up to the end
/// of valid WAL in a closed data directory.
pub fn read_wal(dir: &Path) -> Vec<DecodedRecord> {
    let data = ControlFileManager::read_data(&ControlFileManager::control_path(dir)).unwrap();
    let xlog = dir.join(XLOG_DIR);
    let tli = data.checkpoint_copy.this_tli.max(1);
    let tlis = read_timeline_history(&xlog, None, tli).unwrap();
    let segments = Arc::new(SegmentFileManager::new(&xlog, SEG, false, false).unwrap());
    let mut reader = WalReader::new(LocalPageSource::new(segments), SEG, data.system_identifier, tlis);
    let mut records = Vec::new();
    let mut next = Some(data.checkpoint_copy.redo);
    while let Some(record) = reader.read_record(next.take()).unwrap() {
        records.push(record);
    }
    records
}

/// The first record of `rmid` with `info` at or after `from`.
pub fn find_record(records: &[DecodedRecord], rmid: RmgrId, info: u8, from: Lsn) -> Option<&DecodedRecord> {
    records
        .iter()
        .find(|r| r.lsn >= from && r.rmid == rmid && r.rmgr_info() == info)
}

pub fn temp_dir() -> TempDir {
    TempDir::new().unwrap()
}
