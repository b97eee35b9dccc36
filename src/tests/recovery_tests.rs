use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};

use super::fixtures::{find_record, heap_tuples, init_and_open, insert_committed, options, read_wal, temp_dir, REL, SEG};
use crate::database::Database;
use crate::recovery::lsn::wal_file_name;
use crate::recovery::resource_manager::RmgrId;
use crate::recovery::wal::page::XLOG_BLCKSZ;
use crate::recovery::wal::{RECORD_HEADER_SIZE, XLOG_DIR};
use crate::recovery::DbState;
use crate::transaction::xact::XLOG_XACT_COMMIT;
use crate::transaction::XidStatus;

#[test]
fn fresh_cluster_opens_without_replay() {
    let dir = temp_dir();
    let db = init_and_open(dir.path());
    let summary = db.recovery_summary();
    assert!(!summary.performed_recovery);
    assert_eq!(summary.records_replayed, 0);
    assert_eq!(summary.timeline, 1);
    assert_eq!(db.control_file().state(), DbState::InProduction);
    assert!(!db.wal().in_recovery());
    db.shutdown().unwrap();

    let db = Database::open(&options(), dir.path()).unwrap();
    assert!(!db.recovery_summary().performed_recovery);
    db.shutdown().unwrap();
}

#[test]
fn committed_work_survives_a_crash() {
    let dir = temp_dir();
    let db = init_and_open(dir.path());
    let (first, _) = insert_committed(&db, b"alpha");
    let (second, _) = insert_committed(&db, b"beta");
    // Dropping without shutdown leaves the directory as after a crash.
    drop(db);

    let db = Database::open(&options(), dir.path()).unwrap();
    let summary = db.recovery_summary();
    assert!(summary.performed_recovery);
    assert!(!summary.archive_recovery);
    assert!(summary.records_replayed >= 4);
    assert_eq!(heap_tuples(&db), vec![b"alpha".to_vec(), b"beta".to_vec()]);
    assert_eq!(db.transactions().status(first), Some(XidStatus::Committed));
    assert_eq!(db.transactions().status(second), Some(XidStatus::Committed));
    assert_eq!(db.control_file().state(), DbState::InProduction);

    // New transactions do not reuse replayed xids.
    let (third, _) = insert_committed(&db, b"gamma");
    assert!(third > second);
    db.shutdown().unwrap();
}

#[test]
fn transaction_running_at_crash_is_aborted() {
    let dir = temp_dir();
    let db = init_and_open(dir.path());
    let mut session = db.session();
    let mut txn = db.begin();
    db.heap_insert(&mut session, &mut txn, REL, b"unfinished").unwrap();
    db.checkpoint().unwrap();
    let xid = txn.id();
    drop(db);

    let db = Database::open(&options(), dir.path()).unwrap();
    assert!(db.recovery_summary().aborted_in_progress >= 1);
    assert_eq!(db.transactions().status(xid), Some(XidStatus::Aborted));
    db.shutdown().unwrap();
}

#[test]
fn replay_stops_at_a_corrupt_record() {
    let dir = temp_dir();
    let db = init_and_open(dir.path());
    let (first, first_end) = insert_committed(&db, b"kept");
    let (second, _) = insert_committed(&db, b"torn");
    drop(db);

    let records = read_wal(dir.path());
    let commit = find_record(&records, RmgrId::Xact, XLOG_XACT_COMMIT, first_end)
        .expect("second commit record");
    assert_eq!(commit.xid(), second);
    let damaged = commit.lsn + RECORD_HEADER_SIZE as u64;
    assert_eq!(damaged.page_start(XLOG_BLCKSZ), commit.lsn.page_start(XLOG_BLCKSZ));
    let path = dir
        .path()
        .join(XLOG_DIR)
        .join(wal_file_name(1, commit.lsn.segment(SEG), SEG));
    let mut file = OpenOptions::new().read(true).write(true).open(&path).unwrap();
    let offset = damaged.segment_offset(SEG);
    let mut byte = [0u8; 1];
    file.seek(SeekFrom::Start(offset)).unwrap();
    file.read_exact(&mut byte).unwrap();
    file.seek(SeekFrom::Start(offset)).unwrap();
    file.write_all(&[byte[0] ^ 0xFF]).unwrap();
    drop(file);

    let db = Database::open(&options(), dir.path()).unwrap();
    let summary = db.recovery_summary();
    assert!(summary.performed_recovery);
    assert!(summary.end_of_wal <= commit.lsn);
    assert!(summary.end_of_wal > first_end);
    assert_eq!(db.transactions().status(first), Some(XidStatus::Committed));
    assert_ne!(db.transactions().status(second), Some(XidStatus::Committed));

    // Inserting resumes where valid WAL ended.
    let (_, end) = insert_committed(&db, b"after");
    assert!(end > summary.end_of_wal);
    db.shutdown().unwrap();

    let db = Database::open(&options(), dir.path()).unwrap();
    assert!(!db.recovery_summary().performed_recovery);
    assert!(heap_tuples(&db).contains(&b"after".to_vec()));
    db.shutdown().unwrap();
}

#[test]
fn second_open_of_a_running_directory_is_refused() {
    let dir = temp_dir();
    let db = init_and_open(dir.path());
    let err = Database::open(&options(), dir.path()).unwrap_err();
    assert!(err.is_fatal());
    db.shutdown().unwrap();
}
