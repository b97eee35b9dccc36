use std::fmt;
use std::fs::{self, File};
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use log::{debug, info, warn};

use crate::config::{ArchiveTarget, RecoveryConfig};
use crate::error::{WalError, WalResult};
use crate::recovery::wal::storage::ARCHIVE_STATUS_DIR;

const READY_SUFFIX: &str = ".ready";
const DONE_SUFFIX: &str = ".done";

/// The `.ready` / `.done` marker protocol between the server and the
/// archiver. Markers live in `pg_xlog/archive_status`.
#[derive(Debug, Clone)]
pub struct ArchiveStatus {
    xlog_dir: PathBuf,
    status_dir: PathBuf,
}

impl ArchiveStatus {
    pub fn new(xlog_dir: &Path) -> Self {
        Self {
            xlog_dir: xlog_dir.to_path_buf(),
            status_dir: xlog_dir.join(ARCHIVE_STATUS_DIR),
        }
    }

    pub fn status_dir(&self) -> &Path {
        &self.status_dir
    }

    fn marker(&self, name: &str, suffix: &str) -> PathBuf {
        self.status_dir.join(format!("{}{}", name, suffix))
    }

    /// Signals that `name` is complete and may be archived.
    pub fn notify_ready(&self, name: &str) -> WalResult<()> {
        File::create(self.marker(name, READY_SUFFIX))?;
        debug!("marked {} ready for archiving", name);
        Ok(())
    }

    /// Marks `name` archived, whether or not a `.ready` marker exists. Used
    /// by the archiver and for files restored from the archive.
    pub fn mark_done(&self, name: &str) -> WalResult<()> {
        let ready = self.marker(name, READY_SUFFIX);
        let done = self.marker(name, DONE_SUFFIX);
        match fs::rename(&ready, &done) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                File::create(&done)?;
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Whether `name` may be removed. A segment with neither marker gets its
    /// `.ready` marker recreated and is reported as not done.
    pub fn is_done(&self, name: &str) -> bool {
        if self.marker(name, DONE_SUFFIX).exists() {
            return true;
        }
        if self.marker(name, READY_SUFFIX).exists() {
            return false;
        }
        // The archiver may have renamed .ready to .done between the checks.
        if self.marker(name, DONE_SUFFIX).exists() {
            return true;
        }
        if let Err(err) = self.notify_ready(name) {
            warn!("could not create archive status file for \"{}\": {}", name, err);
        }
        false
    }

    /// Whether the archiver still has to copy `name`.
    pub fn is_busy(&self, name: &str) -> bool {
        if self.marker(name, DONE_SUFFIX).exists() {
            return false;
        }
        if self.marker(name, READY_SUFFIX).exists() {
            return true;
        }
        if self.marker(name, DONE_SUFFIX).exists() {
            return false;
        }
        // No markers: busy only while the file itself is still around.
        self.xlog_dir.join(name).exists()
    }

    /// Drops both markers for `name`.
    pub fn cleanup(&self, name: &str) {
        for suffix in [DONE_SUFFIX, READY_SUFFIX] {
            let path = self.marker(name, suffix);
            if let Err(err) = fs::remove_file(&path) {
                if err.kind() != io::ErrorKind::NotFound {
                    warn!("could not remove \"{}\": {}", path.display(), err);
                }
            }
        }
    }

    /// Files waiting to be archived: timeline history files first, then
    /// the rest oldest first.
    pub fn ready_files(&self) -> WalResult<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.status_dir)? {
            let entry = entry?;
            let file_name = entry.file_name();
            if let Some(name) = file_name.to_str().and_then(|n| n.strip_suffix(READY_SUFFIX)) {
                names.push(name.to_string());
            }
        }
        names.sort_by(|a, b| {
            (!a.ends_with(".history"), a.as_str()).cmp(&(!b.ends_with(".history"), b.as_str()))
        });
        Ok(names)
    }
}

/// Long-term WAL storage used by the archiver and by archive recovery.
pub trait WalArchive: Send + Sync + fmt::Debug {
    /// Copies the file at `path`, named `name`, into the archive.
    fn archive(&self, name: &str, path: &Path) -> WalResult<()>;

    /// Restores `name` into `dest`; `Ok(false)` when the archive lacks it.
    fn fetch(&self, name: &str, dest: &Path) -> WalResult<bool>;
}

/// An archive that is a plain directory.
#[derive(Debug, Clone)]
pub struct DirectoryArchive {
    dir: PathBuf,
}

impl DirectoryArchive {
    pub fn new(dir: impl Into<PathBuf>) -> WalResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn directory(&self) -> &Path {
        &self.dir
    }
}

impl WalArchive for DirectoryArchive {
    fn archive(&self, name: &str, path: &Path) -> WalResult<()> {
        let target = self.dir.join(name);
        let source_len = fs::metadata(path)?.len();
        if let Ok(existing) = fs::metadata(&target) {
            if existing.len() == source_len {
                debug!("{} already archived", name);
                return Ok(());
            }
        }
        let tmp = self.dir.join(format!("{}.tmp", name));
        fs::copy(path, &tmp)?;
        File::open(&tmp)?.sync_all()?;
        fs::rename(&tmp, &target)?;
        Ok(())
    }

    fn fetch(&self, name: &str, dest: &Path) -> WalResult<bool> {
        let source = self.dir.join(name);
        if !source.exists() {
            return Ok(false);
        }
        fs::copy(&source, dest)?;
        Ok(true)
    }
}

/// Archive reached through shell commands with `%p` and `%f` placeholders.
#[derive(Debug, Clone, Default)]
pub struct CommandArchive {
    archive_command: Option<String>,
    restore_command: Option<String>,
}

impl CommandArchive {
    pub fn new(archive_command: Option<String>, restore_command: Option<String>) -> Self {
        Self {
            archive_command,
            restore_command,
        }
    }

    fn expand(template: &str, path: &Path, name: &str) -> String {
        let mut out = String::with_capacity(template.len() + 64);
        let mut chars = template.chars().peekable();
        while let Some(ch) = chars.next() {
            if ch != '%' {
                out.push(ch);
                continue;
            }
            match chars.peek() {
                Some('p') => {
                    chars.next();
                    out.push_str(&path.to_string_lossy());
                }
                Some('f') => {
                    chars.next();
                    out.push_str(name);
                }
                Some('%') => {
                    chars.next();
                    out.push('%');
                }
                _ => out.push('%'),
            }
        }
        out
    }

    fn run(command: &str) -> WalResult<std::process::ExitStatus> {
        debug!("executing \"{}\"", command);
        let status = Command::new("sh").arg("-c").arg(command).status()?;
        if let Some(signal) = status.signal() {
            return Err(WalError::Fatal(format!(
                "command \"{}\" was terminated by signal {}",
                command, signal
            )));
        }
        Ok(status)
    }
}

impl WalArchive for CommandArchive {
    fn archive(&self, name: &str, path: &Path) -> WalResult<()> {
        let Some(template) = &self.archive_command else {
            return Err(WalError::InvalidConfig("no archive command configured".to_string()));
        };
        let command = Self::expand(template, path, name);
        let status = Self::run(&command)?;
        if !status.success() {
            return Err(WalError::Internal(format!(
                "archive command failed with exit code {}: {}",
                status.code().unwrap_or(-1),
                command
            )));
        }
        Ok(())
    }

    fn fetch(&self, name: &str, dest: &Path) -> WalResult<bool> {
        let Some(template) = &self.restore_command else {
            return Ok(false);
        };
        // Stale leftovers must not be mistaken for a restored file.
        if dest.exists() {
            fs::remove_file(dest)?;
        }
        let command = Self::expand(template, dest, name);
        let status = Self::run(&command)?;
        if status.success() && dest.exists() {
            info!("restored log file \"{}\" from archive", name);
            return Ok(true);
        }
        debug!(
            "could not restore file \"{}\" from archive: exit code {}",
            name,
            status.code().unwrap_or(-1)
        );
        Ok(false)
    }
}

/// Builds the archive the archiver copies completed segments into.
pub fn archive_for_target(target: &ArchiveTarget) -> WalResult<Box<dyn WalArchive>> {
    Ok(match target {
        ArchiveTarget::Directory(dir) => Box::new(DirectoryArchive::new(dir.clone())?),
        ArchiveTarget::Command(command) => {
            Box::new(CommandArchive::new(Some(command.clone()), None))
        }
    })
}

/// Builds the archive archive recovery restores from, if any.
pub fn archive_for_recovery(config: &RecoveryConfig) -> WalResult<Option<Box<dyn WalArchive>>> {
    if let Some(command) = &config.restore_command {
        return Ok(Some(Box::new(CommandArchive::new(None, Some(command.clone())))));
    }
    match &config.archive_directory {
        Some(dir) => Ok(Some(Box::new(DirectoryArchive::new(dir.clone())?))),
        None => Ok(None),
    }
}

/// Runs `recovery_end_command` once archive recovery finishes.
pub fn run_end_command(command: &str, last_restart_name: &str) -> WalResult<()> {
    let expanded = command.replace("%r", last_restart_name);
    let status = CommandArchive::run(&expanded)?;
    if !status.success() {
        warn!(
            "recovery_end_command \"{}\" failed with exit code {}",
            expanded,
            status.code().unwrap_or(-1)
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn status(dir: &TempDir) -> ArchiveStatus {
        fs::create_dir_all(dir.path().join(ARCHIVE_STATUS_DIR)).unwrap();
        ArchiveStatus::new(dir.path())
    }

    #[test]
    fn marker_protocol() {
        let dir = TempDir::new().unwrap();
        let status = status(&dir);
        let name = "000000010000000000000003";
        fs::write(dir.path().join(name), b"seg").unwrap();

        // Neither marker: the ready marker is recreated.
        assert!(!status.is_done(name));
        assert!(status.marker(name, READY_SUFFIX).exists());
        assert!(status.is_busy(name));

        status.mark_done(name).unwrap();
        assert!(status.is_done(name));
        assert!(!status.is_busy(name));
        assert!(!status.marker(name, READY_SUFFIX).exists());

        status.cleanup(name);
        assert!(!status.marker(name, DONE_SUFFIX).exists());
        fs::remove_file(dir.path().join(name)).unwrap();
        assert!(!status.is_busy(name));
    }

    #[test]
    fn ready_files_put_history_first() {
        let dir = TempDir::new().unwrap();
        let status = status(&dir);
        status.notify_ready("000000020000000000000005").unwrap();
        status.notify_ready("000000010000000000000004").unwrap();
        status.notify_ready("00000002.history").unwrap();
        status.mark_done("000000010000000000000001").unwrap();
        assert_eq!(
            status.ready_files().unwrap(),
            vec![
                "00000002.history".to_string(),
                "000000010000000000000004".to_string(),
                "000000020000000000000005".to_string(),
            ]
        );
    }

    #[test]
    fn directory_archive_round_trip() {
        let dir = TempDir::new().unwrap();
        let archive = DirectoryArchive::new(dir.path().join("archive")).unwrap();
        let src = dir.path().join("seg");
        fs::write(&src, b"payload").unwrap();
        archive.archive("seg", &src).unwrap();
        archive.archive("seg", &src).unwrap();

        let dest = dir.path().join("restored");
        assert!(archive.fetch("seg", &dest).unwrap());
        assert_eq!(fs::read(&dest).unwrap(), b"payload");
        assert!(!archive.fetch("missing", &dest).unwrap());
    }

    #[test]
    fn command_archive_expands_placeholders() {
        let dir = TempDir::new().unwrap();
        let store = dir.path().join("store");
        fs::create_dir_all(&store).unwrap();
        let archive = CommandArchive::new(
            Some(format!("cp %p {}/%f", store.display())),
            Some(format!("cp {}/%f %p", store.display())),
        );
        let src = dir.path().join("file");
        fs::write(&src, b"abc").unwrap();
        archive.archive("file", &src).unwrap();
        assert_eq!(fs::read(store.join("file")).unwrap(), b"abc");

        let dest = dir.path().join("back");
        assert!(archive.fetch("file", &dest).unwrap());
        assert!(!archive.fetch("nope", &dest).unwrap());
        assert_eq!(
            CommandArchive::expand("a %% %f %x", Path::new("/p"), "n"),
            "a % n %x"
        );
    }
}
