use std::fs;

use super::fixtures::{copy_dir, find_record, heap_tuples, init_and_open, insert_committed, options, read_wal, temp_dir, SEG};
use crate::database::Database;
use crate::recovery::backup::{BackupLabel, BACKUP_LABEL_FILE, BACKUP_LABEL_OLD};
use crate::recovery::lsn::backup_history_file_name;
use crate::recovery::resource_manager::RmgrId;
use crate::recovery::wal::codec::checkpoint::XLOG_BACKUP_END;
use crate::recovery::wal::XLOG_DIR;
use crate::recovery::Lsn;

#[test]
fn backup_label_lifecycle() {
    let dir = temp_dir();
    let db = init_and_open(dir.path());
    assert!(db.end_backup().is_err());

    let start = db.begin_backup("nightly", true).unwrap();
    let label = BackupLabel::read(dir.path(), SEG).unwrap().expect("backup_label");
    assert_eq!(label.start, start);
    assert_eq!(label.label, "nightly");
    assert_eq!(label.checkpoint, db.control_file().snapshot().checkpoint);
    assert!(db.wal().backup_in_progress());
    assert!(db.begin_backup("again", true).is_err());

    insert_committed(&db, b"during backup");
    let stop = db.end_backup().unwrap();
    assert!(stop > start);
    assert!(!dir.path().join(BACKUP_LABEL_FILE).exists());
    assert!(!db.wal().backup_in_progress());
    // The backup end record forces a segment switch.
    assert_eq!(db.wal().insert_position().segment_offset(SEG), 0);

    let history = dir
        .path()
        .join(XLOG_DIR)
        .join(backup_history_file_name(label.start_tli, start, SEG));
    let text = fs::read_to_string(history).unwrap();
    assert!(text.contains("LABEL: nightly"));
    assert!(text.contains(&format!("STOP WAL LOCATION: {}", stop)));
    db.shutdown().unwrap();
}

#[test]
fn base_backup_restores_with_crash_recovery() {
    let dir = temp_dir();
    let backup = temp_dir();
    let db = init_and_open(dir.path());
    insert_committed(&db, b"before backup");

    let start = db.begin_backup("base", true).unwrap();
    copy_dir(dir.path(), backup.path());
    insert_committed(&db, b"during backup");
    let stop = db.end_backup().unwrap();
    // WAL written while the copy ran ships with the backup.
    let xlog = backup.path().join(XLOG_DIR);
    fs::remove_dir_all(&xlog).unwrap();
    copy_dir(&dir.path().join(XLOG_DIR), &xlog);
    db.shutdown().unwrap();

    let records = read_wal(backup.path());
    let end_record = find_record(&records, RmgrId::Xlog, XLOG_BACKUP_END, start).expect("backup end record");
    assert!(end_record.end_lsn <= stop);

    let restored = Database::open(&options(), backup.path()).unwrap();
    let summary = restored.recovery_summary();
    assert!(summary.performed_recovery);
    assert!(!summary.archive_recovery);
    assert_eq!(summary.redo_start, start);
    assert!(!backup.path().join(BACKUP_LABEL_FILE).exists());
    assert!(backup.path().join(BACKUP_LABEL_OLD).exists());
    let control = restored.control_file().snapshot();
    assert_eq!(control.backup_start_point, Lsn::INVALID);
    assert!(!control.backup_end_required);
    assert_eq!(
        heap_tuples(&restored),
        vec![b"before backup".to_vec(), b"during backup".to_vec()]
    );
    restored.shutdown().unwrap();
}

#[test]
fn wal_ending_before_backup_end_is_fatal() {
    let dir = temp_dir();
    let backup = temp_dir();
    let db = init_and_open(dir.path());
    db.begin_backup("short", true).unwrap();
    copy_dir(dir.path(), backup.path());
    db.end_backup().unwrap();
    db.shutdown().unwrap();

    let err = Database::open(&options(), backup.path()).unwrap_err();
    assert!(err.is_fatal());
    assert!(err.to_string().contains("WAL ends before end of online backup"));
    // Still inconsistent on the next attempt.
    let err = Database::open(&options(), backup.path()).unwrap_err();
    assert!(err.to_string().contains("WAL ends before end of online backup"));
}
