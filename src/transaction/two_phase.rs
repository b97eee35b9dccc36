use std::collections::BTreeMap;

use crate::error::{WalError, WalResult};
use crate::recovery::wal::codec::checkpoint::PreparedXactEntry;
use crate::recovery::Lsn;

use super::xact::{TwoPhaseFileHeader, GID_SIZE};
use super::TransactionId;

/// A transaction that has been prepared and awaits commit or abort.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedXact {
    pub header: TwoPhaseFileHeader,
    /// Start of the prepare record. WAL from here on must be retained.
    pub prepare_lsn: Lsn,
}

/// Prepared transactions keyed by xid, with gids unique among them.
#[derive(Debug, Default)]
pub struct TwoPhaseRegistry {
    entries: BTreeMap<TransactionId, PreparedXact>,
}

impl TwoPhaseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, header: TwoPhaseFileHeader, prepare_lsn: Lsn) -> WalResult<()> {
        if header.gid.len() >= GID_SIZE {
            return Err(WalError::Internal(format!(
                "transaction identifier \"{}\" is too long",
                header.gid
            )));
        }
        if self
            .entries
            .values()
            .any(|p| p.header.gid == header.gid && p.header.xid != header.xid)
        {
            return Err(WalError::Internal(format!(
                "transaction identifier \"{}\" is already in use",
                header.gid
            )));
        }
        self.entries.insert(
            header.xid,
            PreparedXact {
                header,
                prepare_lsn,
            },
        );
        Ok(())
    }

    pub fn remove(&mut self, xid: TransactionId) -> Option<PreparedXact> {
        self.entries.remove(&xid)
    }

    pub fn get(&self, xid: TransactionId) -> Option<&PreparedXact> {
        self.entries.get(&xid)
    }

    pub fn find_gid(&self, gid: &str) -> Option<&PreparedXact> {
        self.entries.values().find(|p| p.header.gid == gid)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries for the checkpoint record's prepared-transaction extension.
    pub fn entries(&self) -> Vec<PreparedXactEntry> {
        self.entries
            .values()
            .map(|p| PreparedXactEntry {
                xid: p.header.xid,
                prepare_lsn: p.prepare_lsn,
            })
            .collect()
    }

    pub fn oldest_prepare_lsn(&self) -> Option<Lsn> {
        self.entries.values().map(|p| p.prepare_lsn).min()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
