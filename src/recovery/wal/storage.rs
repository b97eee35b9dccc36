use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, warn};
use parking_lot::Mutex;

use crate::error::{WalError, WalResult};
use crate::recovery::lsn::{parse_wal_file_name, wal_file_name, SegNo, TimeLineId};

use super::page::XLOG_BLCKSZ;

pub const XLOG_DIR: &str = "pg_xlog";
pub const ARCHIVE_STATUS_DIR: &str = "archive_status";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentFile {
    pub tli: TimeLineId,
    pub segno: SegNo,
    pub name: String,
    pub path: PathBuf,
}

/// Mechanical lifecycle of WAL segment files: creation with zero-fill,
/// installation under the final name, opening, closing and listing. Which
/// segments to recycle or delete is decided elsewhere.
#[derive(Debug)]
pub struct SegmentFileManager {
    dir: PathBuf,
    segment_size: u64,
    fsync: bool,
    archiving: bool,
    install_lock: Mutex<()>,
    tmp_counter: AtomicU64,
}

impl SegmentFileManager {
    pub fn new(dir: impl Into<PathBuf>, segment_size: u64, fsync: bool, archiving: bool) -> WalResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(dir.join(ARCHIVE_STATUS_DIR))?;
        Ok(Self {
            dir,
            segment_size,
            fsync,
            archiving,
            install_lock: Mutex::new(()),
            tmp_counter: AtomicU64::new(0),
        })
    }

    pub fn directory(&self) -> &Path {
        &self.dir
    }

    pub fn segment_size(&self) -> u64 {
        self.segment_size
    }

    pub fn archiving(&self) -> bool {
        self.archiving
    }

    pub fn segment_path(&self, tli: TimeLineId, segno: SegNo) -> PathBuf {
        self.dir.join(wal_file_name(tli, segno, self.segment_size))
    }

    fn temp_path(&self) -> PathBuf {
        let n = self.tmp_counter.fetch_add(1, Ordering::Relaxed);
        self.dir
            .join(format!("xlogtemp.{}.{}", std::process::id(), n))
    }

    /// Opens segment `segno`, creating it first if needed. A new segment is
    /// built under a temporary name, zero-filled to full size and synced
    /// before it becomes visible under its real name.
    pub fn create_or_open(&self, tli: TimeLineId, segno: SegNo, use_existing: bool) -> WalResult<File> {
        let path = self.segment_path(tli, segno);
        if use_existing {
            match OpenOptions::new().read(true).write(true).open(&path) {
                Ok(file) => return Ok(file),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(WalError::Fatal(format!(
                        "could not open file \"{}\": {}",
                        path.display(),
                        err
                    )))
                }
            }
        }

        debug!("creating and filling new WAL file {}", path.display());
        let tmp = self.temp_path();
        self.zero_fill(&tmp)?;

        // With `use_existing`, a segment someone else installed meanwhile is
        // fine; the spare file then goes to the next free slot or away.
        let installed = self.install_segment(tli, segno, &tmp, use_existing, 0)?;
        if installed.is_none() {
            let _ = fs::remove_file(&tmp);
        }
        self.open_for_write(tli, segno)
    }

    fn zero_fill(&self, tmp: &Path) -> WalResult<()> {
        let _ = fs::remove_file(tmp);
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(tmp)?;
        let zeros = vec![0u8; XLOG_BLCKSZ];
        let mut written = 0u64;
        while written < self.segment_size {
            if let Err(err) = file.write_all(&zeros) {
                let _ = fs::remove_file(tmp);
                return Err(WalError::Fatal(format!(
                    "could not write to file \"{}\": {}",
                    tmp.display(),
                    err
                )));
            }
            written += XLOG_BLCKSZ as u64;
        }
        if self.fsync {
            file.sync_all()?;
        }
        Ok(())
    }

    /// Installs `tmp_path` as segment `target`. With `find_free`, tries up to
    /// `max_advance` later segment numbers for a free name, which is how old
    /// segments get recycled as future ones. Returns the segment number used,
    /// or `None` when no slot was free.
    pub fn install_segment(
        &self,
        tli: TimeLineId,
        target: SegNo,
        tmp_path: &Path,
        find_free: bool,
        max_advance: u64,
    ) -> WalResult<Option<SegNo>> {
        let _guard = self.install_lock.lock();
        let mut segno = target;
        let mut path = self.segment_path(tli, segno);
        if find_free {
            let mut remaining = max_advance;
            while path.exists() {
                if remaining == 0 {
                    return Ok(None);
                }
                segno += 1;
                remaining -= 1;
                path = self.segment_path(tli, segno);
            }
        } else if path.exists() {
            fs::remove_file(&path)?;
        }

        match fs::hard_link(tmp_path, &path) {
            Ok(()) => {
                if let Err(err) = fs::remove_file(tmp_path) {
                    warn!("could not remove \"{}\": {}", tmp_path.display(), err);
                }
            }
            Err(link_err) => {
                debug!(
                    "link of \"{}\" failed ({}), falling back to rename",
                    tmp_path.display(),
                    link_err
                );
                if let Err(err) = fs::rename(tmp_path, &path) {
                    warn!(
                        "could not install \"{}\" as \"{}\": {}",
                        tmp_path.display(),
                        path.display(),
                        err
                    );
                    return Ok(None);
                }
            }
        }
        Ok(Some(segno))
    }

    /// Reopens a segment the writer expects to exist; a missing file means the
    /// WAL directory was tampered with.
    pub fn open_for_write(&self, tli: TimeLineId, segno: SegNo) -> WalResult<File> {
        let path = self.segment_path(tli, segno);
        OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|err| {
                WalError::Fatal(format!(
                    "could not open file \"{}\" (log segment {}): {}",
                    path.display(),
                    wal_file_name(tli, segno, self.segment_size),
                    err
                ))
            })
    }

    /// `Ok(None)` means the segment is absent, which callers treat as "try an
    /// older timeline" or the end of available WAL.
    pub fn open_for_read(&self, tli: TimeLineId, segno: SegNo) -> WalResult<Option<File>> {
        let path = self.segment_path(tli, segno);
        match File::open(&path) {
            Ok(file) => Ok(Some(file)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(WalError::Io(err)),
        }
    }

    /// Drops a finished segment from the OS page cache unless an archiver is
    /// about to read it.
    pub fn close(&self, file: File) {
        if !self.archiving {
            advise_dontneed(&file);
        }
        drop(file);
    }

    pub fn sync(&self, file: &File) -> WalResult<()> {
        if self.fsync {
            file.sync_data()
                .map_err(|err| WalError::Panic(format!("could not fsync log file: {}", err)))?;
        }
        Ok(())
    }

    /// All WAL segment files in the directory, ordered by segment then timeline.
    pub fn list_segments(&self) -> WalResult<Vec<SegmentFile>> {
        let mut segments = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some((tli, segno)) = parse_wal_file_name(&name, self.segment_size) {
                segments.push(SegmentFile {
                    tli,
                    segno,
                    name,
                    path: entry.path(),
                });
            }
        }
        segments.sort_by_key(|s| (s.segno, s.tli));
        Ok(segments)
    }

    pub fn highest_segment(&self) -> WalResult<Option<SegNo>> {
        Ok(self.list_segments()?.iter().map(|s| s.segno).max())
    }

    /// Copies the first `upto` bytes of a segment into a new file on another
    /// timeline; the rest of the new segment is zero.
    pub fn copy_segment(
        &self,
        from_tli: TimeLineId,
        to_tli: TimeLineId,
        segno: SegNo,
        upto: u64,
    ) -> WalResult<()> {
        let Some(src) = self.open_for_read(from_tli, segno)? else {
            return Err(WalError::Fatal(format!(
                "could not open file \"{}\" to copy",
                self.segment_path(from_tli, segno).display()
            )));
        };
        let tmp = self.temp_path();
        self.zero_fill(&tmp)?;
        let dst = OpenOptions::new().write(true).open(&tmp)?;
        let mut buf = vec![0u8; XLOG_BLCKSZ];
        let mut offset = 0u64;
        while offset < upto.min(self.segment_size) {
            let n = (upto - offset).min(XLOG_BLCKSZ as u64) as usize;
            src.read_exact_at(&mut buf[..n], offset)?;
            dst.write_all_at(&buf[..n], offset)?;
            offset += n as u64;
        }
        if self.fsync {
            dst.sync_all()?;
        }
        drop(dst);
        if self.install_segment(to_tli, segno, &tmp, false, 0)?.is_none() {
            let _ = fs::remove_file(&tmp);
            return Err(WalError::Fatal(format!(
                "could not install copied segment {}",
                wal_file_name(to_tli, segno, self.segment_size)
            )));
        }
        Ok(())
    }

    /// Creates the segment ahead of need; returns whether a file was created.
    pub fn preallocate(&self, tli: TimeLineId, segno: SegNo) -> WalResult<bool> {
        if self.segment_path(tli, segno).exists() {
            return Ok(false);
        }
        let file = self.create_or_open(tli, segno, true)?;
        drop(file);
        Ok(true)
    }

    /// Renames an old segment into the first free slot at or after `target`.
    /// Returns the slot used, or `None` when the lookahead found none.
    pub fn recycle(
        &self,
        old: &SegmentFile,
        tli: TimeLineId,
        target: SegNo,
        max_advance: u64,
    ) -> WalResult<Option<SegNo>> {
        self.install_segment(tli, target, &old.path, true, max_advance)
    }

    pub fn remove(&self, segment: &SegmentFile) -> WalResult<()> {
        fs::remove_file(&segment.path).map_err(|err| {
            WalError::Internal(format!(
                "could not remove old transaction log file \"{}\": {}",
                segment.path.display(),
                err
            ))
        })
    }
}

/// Writes a small file atomically: temp file, fsync, rename.
pub fn write_file_durably(path: &Path, contents: &[u8]) -> WalResult<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp)?;
        file.write_all(contents)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(target_os = "linux")]
fn advise_dontneed(file: &File) {
    use std::os::unix::io::AsRawFd;
    // SAFETY: the descriptor is owned by `file` and stays open for the call.
    let rc = unsafe { libc::posix_fadvise(file.as_raw_fd(), 0, 0, libc::POSIX_FADV_DONTNEED) };
    if rc != 0 {
        debug!("posix_fadvise failed: {}", rc);
    }
}

#[cfg(not(target_os = "linux"))]
fn advise_dontneed(_file: &File) {}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SEG: u64 = 64 * 1024;

    fn manager(dir: &TempDir) -> SegmentFileManager {
        SegmentFileManager::new(dir.path().join(XLOG_DIR), SEG, false, false).unwrap()
    }

    #[test]
    fn create_zero_fills_and_reuses_existing() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);
        let file = mgr.create_or_open(1, 3, true).unwrap();
        assert_eq!(file.metadata().unwrap().len(), SEG);
        file.write_all_at(b"data", 0).unwrap();
        drop(file);

        let again = mgr.create_or_open(1, 3, true).unwrap();
        let mut buf = [0u8; 4];
        again.read_exact_at(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"data");

        let fresh = mgr.create_or_open(1, 3, false).unwrap();
        fresh.read_exact_at(&mut buf, 0).unwrap();
        assert_eq!(buf, [0u8; 4]);

        let leftovers: Vec<_> = fs::read_dir(mgr.directory())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("xlogtemp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn install_searches_for_free_slot() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);
        mgr.create_or_open(1, 5, true).unwrap();
        mgr.create_or_open(1, 6, true).unwrap();

        let tmp = dir.path().join("spare");
        fs::write(&tmp, b"x").unwrap();
        assert_eq!(mgr.install_segment(1, 5, &tmp, true, 1).unwrap(), None);
        assert_eq!(mgr.install_segment(1, 5, &tmp, true, 2).unwrap(), Some(7));
        assert!(!tmp.exists());
        let names: Vec<SegNo> = mgr.list_segments().unwrap().iter().map(|s| s.segno).collect();
        assert_eq!(names, vec![5, 6, 7]);
    }

    #[test]
    fn open_paths_report_missing_segments() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);
        assert!(mgr.open_for_read(1, 9).unwrap().is_none());
        assert!(matches!(mgr.open_for_write(1, 9), Err(WalError::Fatal(_))));
    }

    #[test]
    fn copy_segment_to_new_timeline() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);
        let file = mgr.create_or_open(1, 2, true).unwrap();
        file.write_all_at(&[7u8; 100], 0).unwrap();
        file.write_all_at(&[9u8; 10], 200).unwrap();
        drop(file);

        mgr.copy_segment(1, 2, 2, 150).unwrap();
        let copy = mgr.open_for_read(2, 2).unwrap().unwrap();
        assert_eq!(copy.metadata().unwrap().len(), SEG);
        let mut buf = vec![0u8; 220];
        copy.read_exact_at(&mut buf, 0).unwrap();
        assert!(buf[..100].iter().all(|b| *b == 7));
        assert!(buf[100..].iter().all(|b| *b == 0));
    }
}
