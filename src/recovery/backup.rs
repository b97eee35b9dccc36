//! Exclusive online backups: `backup_label` in the data directory while the
//! backup runs, and a backup history file in `pg_xlog` once it ends.

use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use log::info;

use crate::error::{WalError, WalResult};
use crate::recovery::checkpoint::{CheckpointFlags, Checkpointer};
use crate::recovery::lsn::{backup_history_file_name, parse_wal_file_name, wal_file_name, TimeLineId};
use crate::recovery::wal::codec::checkpoint::{encode_backup_end, XLOG_BACKUP_END};
use crate::recovery::wal::codec::RecordInput;
use crate::recovery::wal::storage::write_file_durably;
use crate::recovery::wal::WalSession;
use crate::recovery::{Lsn, RmgrId};
use crate::utils::timestamp::{self, format_timestamptz};

pub const BACKUP_LABEL_FILE: &str = "backup_label";
pub const BACKUP_LABEL_OLD: &str = "backup_label.old";

/// Longest label accepted by `start_backup`.
pub const MAXPGPATH: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupLabel {
    /// Redo pointer of the checkpoint the backup started from.
    pub start: Lsn,
    pub start_tli: TimeLineId,
    pub checkpoint: Lsn,
    pub start_time: String,
    pub label: String,
}

impl BackupLabel {
    pub fn render(&self, segment_size: u64) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "START WAL LOCATION: {} (file {})",
            self.start,
            wal_file_name(self.start_tli, self.start.segment(segment_size), segment_size)
        );
        let _ = writeln!(out, "CHECKPOINT LOCATION: {}", self.checkpoint);
        out.push_str("BACKUP METHOD: pg_start_backup\n");
        out.push_str("BACKUP FROM: master\n");
        let _ = writeln!(out, "START TIME: {}", self.start_time);
        let _ = writeln!(out, "LABEL: {}", self.label);
        out
    }

    pub fn parse(text: &str, segment_size: u64) -> WalResult<Self> {
        let invalid = || WalError::Fatal(format!("invalid data in file \"{}\"", BACKUP_LABEL_FILE));
        let mut start = None;
        let mut checkpoint = None;
        let mut start_time = String::new();
        let mut label = String::new();
        for line in text.lines() {
            if let Some(rest) = line.strip_prefix("START WAL LOCATION: ") {
                let (lsn, file) = rest.split_once(" (file ").ok_or_else(invalid)?;
                let file = file.strip_suffix(')').ok_or_else(invalid)?;
                let (tli, _) = parse_wal_file_name(file, segment_size).ok_or_else(invalid)?;
                start = Some((Lsn::from_str(lsn).map_err(|_| invalid())?, tli));
            } else if let Some(rest) = line.strip_prefix("CHECKPOINT LOCATION: ") {
                checkpoint = Some(Lsn::from_str(rest).map_err(|_| invalid())?);
            } else if let Some(rest) = line.strip_prefix("START TIME: ") {
                start_time = rest.to_string();
            } else if let Some(rest) = line.strip_prefix("LABEL: ") {
                label = rest.to_string();
            }
        }
        let (start, start_tli) = start.ok_or_else(invalid)?;
        Ok(Self {
            start,
            start_tli,
            checkpoint: checkpoint.ok_or_else(invalid)?,
            start_time,
            label,
        })
    }

    /// Reads `backup_label` from the data directory, if present.
    pub fn read(data_dir: &Path, segment_size: u64) -> WalResult<Option<Self>> {
        match fs::read_to_string(data_dir.join(BACKUP_LABEL_FILE)) {
            Ok(text) => Self::parse(&text, segment_size).map(Some),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

/// Starts an exclusive backup: forces full-page writes, runs a forced
/// checkpoint and writes `backup_label`. Returns the backup start point.
pub fn start_backup(checkpointer: &Checkpointer, data_dir: &Path, label: &str, fast: bool) -> WalResult<Lsn> {
    let wal = checkpointer.wal();
    if wal.in_recovery() {
        return Err(WalError::RecoveryInProgress);
    }
    if label.len() >= MAXPGPATH {
        return Err(WalError::InvalidConfig("backup label too long".to_string()));
    }
    let label_path = data_dir.join(BACKUP_LABEL_FILE);
    if label_path.exists() {
        return Err(WalError::Internal(
            "a backup is already in progress; run stop_backup and try again".to_string(),
        ));
    }
    wal.begin_exclusive_backup()?;

    let result: WalResult<Lsn> = (|| {
        let mut flags = CheckpointFlags::FORCE | CheckpointFlags::WAIT;
        if fast {
            flags |= CheckpointFlags::IMMEDIATE;
        }
        checkpointer.perform_checkpoint(flags)?;
        let control = wal.control_file().snapshot();
        let backup = BackupLabel {
            start: control.checkpoint_copy.redo,
            start_tli: control.checkpoint_copy.this_tli,
            checkpoint: control.checkpoint,
            start_time: format_timestamptz(timestamp::now()),
            label: label.to_string(),
        };
        write_file_durably(&label_path, backup.render(wal.segment_size()).as_bytes())?;
        Ok(backup.start)
    })();
    if result.is_err() {
        let _ = wal.end_exclusive_backup();
    }
    let start = result?;
    info!("backup \"{}\" started at {}", label, start);
    Ok(start)
}

/// Ends the exclusive backup: removes `backup_label`, logs the backup end,
/// switches segments and writes the backup history file. Returns the stop
/// point.
pub fn stop_backup(checkpointer: &Checkpointer, data_dir: &Path, session: &mut WalSession) -> WalResult<Lsn> {
    let wal = checkpointer.wal();
    if wal.in_recovery() {
        return Err(WalError::RecoveryInProgress);
    }
    let segment_size = wal.segment_size();
    let backup = BackupLabel::read(data_dir, segment_size)?.ok_or_else(|| {
        WalError::NotFound("a backup is not in progress".to_string())
    })?;
    fs::remove_file(data_dir.join(BACKUP_LABEL_FILE))?;
    wal.end_exclusive_backup()?;

    let body = encode_backup_end(backup.start);
    let mut input = RecordInput::new(RmgrId::Xlog, XLOG_BACKUP_END);
    input.add_data(&body);
    let stop = wal.insert(session, &input)?.end;
    wal.switch_segment(session)?;

    let tli = wal.timeline();
    let mut history = backup.render(segment_size);
    let _ = writeln!(
        history,
        "STOP WAL LOCATION: {} (file {})",
        stop,
        wal_file_name(tli, stop.segment(segment_size), segment_size)
    );
    let _ = writeln!(history, "STOP TIME: {}", format_timestamptz(timestamp::now()));
    let name = backup_history_file_name(backup.start_tli, backup.start, segment_size);
    write_file_durably(&wal.segments().directory().join(&name), history.as_bytes())?;
    if let Some(status) = wal.archive_status() {
        status.notify_ready(&name)?;
    }
    info!("backup \"{}\" stopped at {}", backup.label, stop);
    Ok(stop)
}
