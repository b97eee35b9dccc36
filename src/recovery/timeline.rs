//! Timeline history files. `<tli>.history` lists, one line per ancestor,
//! the parent timeline id, the segment in which the branch happened and a
//! free-form reason.

use std::fs;
use std::path::Path;

use log::{debug, info};

use crate::error::{WalError, WalResult};
use crate::recovery::archive::{ArchiveStatus, WalArchive};
use crate::recovery::lsn::{history_file_name, TimeLineId};
use crate::recovery::wal::storage::write_file_durably;

/// Scratch name used for history files restored from the archive.
const RECOVERY_HISTORY: &str = "RECOVERYHISTORY";

/// One parsed line of a history file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimelineHistoryEntry {
    pub tli: TimeLineId,
    pub switch_segment: String,
    pub reason: String,
}

/// Parses history file text, checking timeline ids strictly increase and stay
/// below `target`.
pub fn parse_timeline_history(text: &str, target: TimeLineId) -> WalResult<Vec<TimelineHistoryEntry>> {
    let mut entries: Vec<TimelineHistoryEntry> = Vec::new();
    for line in text.lines() {
        let line = line.trim_start();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.splitn(3, '\t');
        let tli_field = fields.next().unwrap_or_default();
        let tli: TimeLineId = tli_field.trim().parse().map_err(|_| {
            WalError::Corrupt(format!(
                "syntax error in history file: {}; expected a numeric timeline ID",
                line
            ))
        })?;
        if let Some(last) = entries.last() {
            if tli <= last.tli {
                return Err(WalError::Corrupt(
                    "invalid data in history file: timeline IDs must be in increasing sequence"
                        .to_string(),
                ));
            }
        }
        if tli >= target {
            return Err(WalError::Corrupt(format!(
                "invalid data in history file: timeline IDs must be less than child timeline's ID {}",
                target
            )));
        }
        entries.push(TimelineHistoryEntry {
            tli,
            switch_segment: fields.next().unwrap_or_default().trim().to_string(),
            reason: fields.next().unwrap_or_default().trim().to_string(),
        });
    }
    Ok(entries)
}

/// Reads the history file text for `tli`, preferring the archive when one
/// is given. `None` when no file exists.
fn load_history_text(
    xlog_dir: &Path,
    archive: Option<&dyn WalArchive>,
    tli: TimeLineId,
) -> WalResult<Option<String>> {
    let name = history_file_name(tli);
    if let Some(archive) = archive {
        let scratch = xlog_dir.join(RECOVERY_HISTORY);
        if archive.fetch(&name, &scratch)? {
            let text = fs::read_to_string(&scratch)?;
            let _ = fs::remove_file(&scratch);
            return Ok(Some(text));
        }
    }
    match fs::read_to_string(xlog_dir.join(&name)) {
        Ok(text) => Ok(Some(text)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// The ancestry of `target`, newest first, `target` itself included.
pub fn read_timeline_history(
    xlog_dir: &Path,
    archive: Option<&dyn WalArchive>,
    target: TimeLineId,
) -> WalResult<Vec<TimeLineId>> {
    // Timeline 1 has no history file.
    if target == 1 {
        return Ok(vec![1]);
    }
    let Some(text) = load_history_text(xlog_dir, archive, target)? else {
        return Ok(vec![target]);
    };
    let entries = parse_timeline_history(&text, target)?;
    let mut result = Vec::with_capacity(entries.len() + 1);
    result.push(target);
    result.extend(entries.iter().rev().map(|e| e.tli));
    debug!("history of timeline {} is {:?}", target, result);
    Ok(result)
}

pub fn exists_timeline_history(
    xlog_dir: &Path,
    archive: Option<&dyn WalArchive>,
    tli: TimeLineId,
) -> WalResult<bool> {
    if tli == 1 {
        return Ok(false);
    }
    let name = history_file_name(tli);
    if let Some(archive) = archive {
        let scratch = xlog_dir.join(RECOVERY_HISTORY);
        if archive.fetch(&name, &scratch)? {
            let _ = fs::remove_file(&scratch);
            return Ok(true);
        }
    }
    Ok(xlog_dir.join(name).exists())
}

/// Highest timeline id reachable by probing history files upward from
/// `start`.
pub fn find_newest_timeline(
    xlog_dir: &Path,
    archive: Option<&dyn WalArchive>,
    start: TimeLineId,
) -> WalResult<TimeLineId> {
    let mut newest = start;
    let mut candidate = start + 1;
    while exists_timeline_history(xlog_dir, archive, candidate)? {
        newest = candidate;
        candidate += 1;
    }
    Ok(newest)
}

/// Writes `<new_tli>.history`: the parent's history followed by a line for
/// the parent itself. Fails if the file already exists. The file is marked
/// ready for archiving when `archive_status` is given.
pub fn write_timeline_history(
    xlog_dir: &Path,
    archive: Option<&dyn WalArchive>,
    archive_status: Option<&ArchiveStatus>,
    new_tli: TimeLineId,
    parent_tli: TimeLineId,
    switch_segment: &str,
    reason: &str,
) -> WalResult<()> {
    let name = history_file_name(new_tli);
    let path = xlog_dir.join(&name);
    if path.exists() {
        return Err(WalError::Fatal(format!(
            "timeline history file \"{}\" already exists",
            name
        )));
    }
    let mut text = if parent_tli > 1 {
        load_history_text(xlog_dir, archive, parent_tli)?.unwrap_or_default()
    } else {
        String::new()
    };
    if !text.is_empty() && !text.ends_with('\n') {
        text.push('\n');
    }
    text.push_str(&format!("{}\t{}\t{}\n", parent_tli, switch_segment, reason));
    write_file_durably(&path, text.as_bytes())?;
    if let Some(status) = archive_status {
        status.notify_ready(&name)?;
    }
    info!("wrote timeline history file {}", name);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recovery::archive::DirectoryArchive;
    use tempfile::TempDir;

    #[test]
    fn history_chain_newest_first() {
        let dir = TempDir::new().unwrap();
        let xlog = dir.path();
        write_timeline_history(xlog, None, None, 2, 1, "000000010000000000000003", "no recovery target specified").unwrap();
        write_timeline_history(xlog, None, None, 3, 2, "000000020000000000000005", "before transaction 900").unwrap();

        assert_eq!(read_timeline_history(xlog, None, 3).unwrap(), vec![3, 2, 1]);
        assert_eq!(read_timeline_history(xlog, None, 1).unwrap(), vec![1]);
        // No file for 7: the timeline stands alone.
        assert_eq!(read_timeline_history(xlog, None, 7).unwrap(), vec![7]);
        assert_eq!(find_newest_timeline(xlog, None, 1).unwrap(), 3);
        assert!(write_timeline_history(xlog, None, None, 3, 2, "x", "again").is_err());

        let text = fs::read_to_string(xlog.join(history_file_name(3))).unwrap();
        let entries = parse_timeline_history(&text, 3).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].reason, "before transaction 900");
    }

    #[test]
    fn rejects_out_of_order_ids() {
        assert!(parse_timeline_history("2\ta\tx\n1\tb\ty\n", 5).is_err());
        assert!(parse_timeline_history("1\ta\tx\n5\tb\ty\n", 5).is_err());
        assert!(parse_timeline_history("one\ta\tx\n", 5).is_err());
        let ok = parse_timeline_history("# comment\n\n1\ta\tx\n", 5).unwrap();
        assert_eq!(ok[0].tli, 1);
    }

    #[test]
    fn archive_history_is_found() {
        let dir = TempDir::new().unwrap();
        let archive_dir = TempDir::new().unwrap();
        let archive = DirectoryArchive::new(archive_dir.path()).unwrap();
        fs::write(archive_dir.path().join(history_file_name(2)), "1\tseg\treason\n").unwrap();

        assert!(exists_timeline_history(dir.path(), Some(&archive), 2).unwrap());
        assert_eq!(
            read_timeline_history(dir.path(), Some(&archive), 2).unwrap(),
            vec![2, 1]
        );
        assert_eq!(find_newest_timeline(dir.path(), Some(&archive), 1).unwrap(), 2);
        assert!(!dir.path().join(RECOVERY_HISTORY).exists());
    }
}
