use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use log::debug;
use parking_lot::Mutex;

use crate::buffer::{BlockNumber, ForkNumber, RelFileNode, PAGE_SIZE};
use crate::error::{WalError, WalResult};

pub const BASE_DIR: &str = "base";

/// Relation fork files under `base/<db>/<rel><suffix>`, read and written a
/// block at a time.
#[derive(Debug)]
pub struct DiskManager {
    base: PathBuf,
    fsync: bool,
    files: DashMap<(RelFileNode, ForkNumber), Arc<Mutex<File>>>,
}

impl DiskManager {
    pub fn new(data_dir: &Path, fsync: bool) -> WalResult<Self> {
        let base = data_dir.join(BASE_DIR);
        fs::create_dir_all(&base)?;
        Ok(Self {
            base,
            fsync,
            files: DashMap::new(),
        })
    }

    pub fn relation_path(&self, rnode: RelFileNode, fork: ForkNumber) -> PathBuf {
        self.base
            .join(rnode.db_node.to_string())
            .join(format!("{}{}", rnode.rel_node, fork.file_suffix()))
    }

    fn file(&self, rnode: RelFileNode, fork: ForkNumber) -> WalResult<Arc<Mutex<File>>> {
        if let Some(file) = self.files.get(&(rnode, fork)) {
            return Ok(Arc::clone(file.value()));
        }
        let path = self.relation_path(rnode, fork);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let entry = self
            .files
            .entry((rnode, fork))
            .or_insert_with(|| Arc::new(Mutex::new(file)));
        Ok(Arc::clone(entry.value()))
    }

    pub fn nblocks(&self, rnode: RelFileNode, fork: ForkNumber) -> WalResult<BlockNumber> {
        let file = self.file(rnode, fork)?;
        let len = file.lock().metadata()?.len();
        Ok((len / PAGE_SIZE as u64) as BlockNumber)
    }

    /// Reads one block. Blocks past the end of the file read as zeroes; replay
    /// may reference blocks that were never written before the crash.
    pub fn read_block(
        &self,
        rnode: RelFileNode,
        fork: ForkNumber,
        block: BlockNumber,
        buf: &mut [u8],
    ) -> WalResult<()> {
        if buf.len() != PAGE_SIZE {
            return Err(WalError::Internal(format!(
                "block buffer has {} bytes, expected {}",
                buf.len(),
                PAGE_SIZE
            )));
        }
        let file = self.file(rnode, fork)?;
        let mut file = file.lock();
        file.seek(SeekFrom::Start(block as u64 * PAGE_SIZE as u64))?;
        let mut filled = 0;
        while filled < PAGE_SIZE {
            match file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
        buf[filled..].fill(0);
        Ok(())
    }

    pub fn write_block(
        &self,
        rnode: RelFileNode,
        fork: ForkNumber,
        block: BlockNumber,
        data: &[u8],
    ) -> WalResult<()> {
        let file = self.file(rnode, fork)?;
        let mut file = file.lock();
        file.seek(SeekFrom::Start(block as u64 * PAGE_SIZE as u64))?;
        file.write_all(data)?;
        Ok(())
    }

    pub fn sync_all(&self) -> WalResult<()> {
        if !self.fsync {
            return Ok(());
        }
        let files: Vec<_> = self.files.iter().map(|e| Arc::clone(e.value())).collect();
        for file in &files {
            file.lock().sync_data()?;
        }
        debug!("synced {} relation files", files.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn blocks_past_eof_read_as_zero() {
        let dir = TempDir::new().unwrap();
        let disk = DiskManager::new(dir.path(), true).unwrap();
        let rnode = RelFileNode::new(1663, 1, 16384);

        let page = vec![7u8; PAGE_SIZE];
        disk.write_block(rnode, ForkNumber::Main, 2, &page).unwrap();
        assert_eq!(disk.nblocks(rnode, ForkNumber::Main).unwrap(), 3);

        let mut buf = vec![1u8; PAGE_SIZE];
        disk.read_block(rnode, ForkNumber::Main, 0, &mut buf).unwrap();
        assert!(buf.iter().all(|b| *b == 0));
        disk.read_block(rnode, ForkNumber::Main, 9, &mut buf).unwrap();
        assert!(buf.iter().all(|b| *b == 0));
        disk.read_block(rnode, ForkNumber::Main, 2, &mut buf).unwrap();
        assert_eq!(buf, page);
        disk.sync_all().unwrap();

        assert!(disk
            .relation_path(rnode, ForkNumber::VisibilityMap)
            .ends_with("base/1/16384_vm"));
    }
}
