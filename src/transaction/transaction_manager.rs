use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashSet;
use log::{debug, warn};
use parking_lot::{Mutex, RwLock};

use crate::error::{WalError, WalResult};
use crate::recovery::wal::codec::checkpoint::{
    encode_next_oid, CheckpointRecord, PreparedXactEntry, XLOG_NEXTOID,
};
use crate::recovery::wal::codec::RecordInput;
use crate::recovery::wal::storage::write_file_durably;
use crate::recovery::wal::WalSession;
use crate::recovery::{Lsn, RmgrId, WalManager};
use crate::utils::timestamp;

use super::xact::{
    TwoPhaseFileHeader, XactAbort, XactCommit, XactPreparedDecision, XLOG_XACT_ABORT,
    XLOG_XACT_ABORT_PREPARED, XLOG_XACT_COMMIT, XLOG_XACT_COMMIT_PREPARED, XLOG_XACT_PREPARE,
};
use super::{
    Oid, Transaction, TransactionCounters, TransactionId, TransactionState, TwoPhaseRegistry,
    XidStatus, VAR_OID_PREFETCH,
};

pub const CLOG_DIR: &str = "pg_clog";
const CLOG_FILE: &str = "status";

/// Assigns ids, logs transaction outcomes and keeps the commit status log.
/// The same instance applies xact records during replay.
pub struct TransactionManager {
    wal: Arc<WalManager>,
    clog_path: PathBuf,
    synchronous_commit: AtomicBool,
    counters: Mutex<TransactionCounters>,
    status: RwLock<HashMap<TransactionId, XidStatus>>,
    active: DashSet<TransactionId>,
    two_phase: Mutex<TwoPhaseRegistry>,
}

impl TransactionManager {
    pub fn new(wal: Arc<WalManager>, data_dir: &Path, synchronous_commit: bool) -> WalResult<Self> {
        let clog_dir = data_dir.join(CLOG_DIR);
        fs::create_dir_all(&clog_dir)?;
        let clog_path = clog_dir.join(CLOG_FILE);
        let status = match fs::read(&clog_path) {
            Ok(bytes) => {
                let persisted: BTreeMap<TransactionId, XidStatus> = bincode::deserialize(&bytes)?;
                persisted.into_iter().collect()
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(err) => return Err(err.into()),
        };
        Ok(Self {
            wal,
            clog_path,
            synchronous_commit: AtomicBool::new(synchronous_commit),
            counters: Mutex::new(TransactionCounters::default()),
            status: RwLock::new(status),
            active: DashSet::new(),
            two_phase: Mutex::new(TwoPhaseRegistry::new()),
        })
    }

    pub fn set_synchronous_commit(&self, enabled: bool) {
        self.synchronous_commit.store(enabled, Ordering::Relaxed);
    }

    pub fn begin(&self) -> Transaction {
        let xid = self.counters.lock().assign_xid();
        self.active.insert(xid);
        self.status.write().insert(xid, XidStatus::InProgress);
        Transaction::new(xid, self.synchronous_commit.load(Ordering::Relaxed))
    }

    fn ensure_running(txn: &Transaction) -> WalResult<()> {
        match txn.state() {
            TransactionState::Running => Ok(()),
            other => Err(WalError::Internal(format!(
                "transaction {} is {:?}",
                txn.id(),
                other
            ))),
        }
    }

    /// Logs the commit. With synchronous commit the record is durable on
    /// return; otherwise the background writer flushes it later.
    pub fn commit(&self, session: &mut WalSession, txn: &mut Transaction) -> WalResult<Lsn> {
        Self::ensure_running(txn)?;
        let body = XactCommit {
            time: timestamp::now(),
        }
        .encode();
        let mut input = RecordInput::new(RmgrId::Xact, XLOG_XACT_COMMIT).with_xid(txn.id());
        input.add_data(&body);
        let inserted = self.wal.insert(session, &input)?;
        txn.record_lsn(inserted.end);

        if txn.synchronous_commit() {
            self.wal.flush_session(session, inserted.end)?;
        } else {
            self.wal.set_async_commit(inserted.end);
        }
        self.set_status(txn.id(), XidStatus::Committed);
        self.active.remove(&txn.id());
        txn.set_state(TransactionState::Committed);
        Ok(inserted.end)
    }

    /// Aborts are never flushed; a lost abort record reads as an abort anyway.
    pub fn abort(&self, session: &mut WalSession, txn: &mut Transaction) -> WalResult<Lsn> {
        Self::ensure_running(txn)?;
        let body = XactAbort {
            time: timestamp::now(),
        }
        .encode();
        let mut input = RecordInput::new(RmgrId::Xact, XLOG_XACT_ABORT).with_xid(txn.id());
        input.add_data(&body);
        let inserted = self.wal.insert(session, &input)?;
        txn.record_lsn(inserted.end);
        self.set_status(txn.id(), XidStatus::Aborted);
        self.active.remove(&txn.id());
        txn.set_state(TransactionState::Aborted);
        Ok(inserted.end)
    }

    /// First phase of two-phase commit. The prepare record is always flushed.
    pub fn prepare(
        &self,
        session: &mut WalSession,
        txn: &mut Transaction,
        gid: &str,
        database: Oid,
        owner: Oid,
    ) -> WalResult<Lsn> {
        Self::ensure_running(txn)?;
        let header = TwoPhaseFileHeader {
            xid: txn.id(),
            database,
            prepared_at: timestamp::now(),
            owner,
            gid: gid.to_string(),
            tablespace_oid_to_delete_on_commit: 0,
            tablespace_oid_to_delete_on_abort: 0,
        };
        let mut registry = self.two_phase.lock();
        if registry.find_gid(gid).is_some() {
            return Err(WalError::Internal(format!(
                "transaction identifier \"{}\" is already in use",
                gid
            )));
        }
        let body = header.encode();
        let mut input = RecordInput::new(RmgrId::Xact, XLOG_XACT_PREPARE).with_xid(txn.id());
        input.add_data(&body);
        let inserted = self.wal.insert(session, &input)?;
        self.wal.flush_session(session, inserted.end)?;
        registry.add(header, inserted.start)?;
        drop(registry);

        txn.record_lsn(inserted.end);
        self.set_status(txn.id(), XidStatus::Prepared);
        self.active.remove(&txn.id());
        txn.set_state(TransactionState::Prepared);
        Ok(inserted.start)
    }

    pub fn commit_prepared(&self, session: &mut WalSession, gid: &str) -> WalResult<Lsn> {
        self.finish_prepared(session, gid, true)
    }

    pub fn abort_prepared(&self, session: &mut WalSession, gid: &str) -> WalResult<Lsn> {
        self.finish_prepared(session, gid, false)
    }

    fn finish_prepared(&self, session: &mut WalSession, gid: &str, commit: bool) -> WalResult<Lsn> {
        let mut registry = self.two_phase.lock();
        let xid = registry
            .find_gid(gid)
            .map(|p| p.header.xid)
            .ok_or_else(|| {
                WalError::NotFound(format!("prepared transaction with identifier \"{}\"", gid))
            })?;
        let body = XactPreparedDecision {
            xid,
            time: timestamp::now(),
        }
        .encode();
        let info = if commit {
            XLOG_XACT_COMMIT_PREPARED
        } else {
            XLOG_XACT_ABORT_PREPARED
        };
        let mut input = RecordInput::new(RmgrId::Xact, info);
        input.add_data(&body);
        let inserted = self.wal.insert(session, &input)?;
        self.wal.flush_session(session, inserted.end)?;
        registry.remove(xid);
        drop(registry);
        self.set_status(
            xid,
            if commit {
                XidStatus::Committed
            } else {
                XidStatus::Aborted
            },
        );
        Ok(inserted.end)
    }

    /// Returns a fresh OID, logging a next-OID record whenever a new batch is
    /// started.
    pub fn next_oid(&self, session: &mut WalSession) -> WalResult<Oid> {
        let mut counters = self.counters.lock();
        let before = counters.clone();
        let (oid, log_upto) = counters.assign_oid(VAR_OID_PREFETCH);
        if let Some(upto) = log_upto {
            let body = encode_next_oid(upto);
            let mut input = RecordInput::new(RmgrId::Xlog, XLOG_NEXTOID);
            input.add_data(&body);
            if let Err(err) = self.wal.insert(session, &input) {
                *counters = before;
                return Err(err);
            }
        }
        Ok(oid)
    }

    pub fn next_relfilenode(&self) -> Oid {
        self.counters.lock().assign_relfilenode()
    }

    pub fn status(&self, xid: TransactionId) -> Option<XidStatus> {
        self.status.read().get(&xid).copied()
    }

    pub fn counters(&self) -> TransactionCounters {
        self.counters.lock().clone()
    }

    fn set_status(&self, xid: TransactionId, status: XidStatus) {
        self.status.write().insert(xid, status);
    }

    pub fn fill_checkpoint(&self, record: &mut CheckpointRecord) {
        let counters = self.counters.lock();
        counters.fill(record);
        record.oldest_active_xid = self
            .active
            .iter()
            .map(|xid| *xid)
            .min()
            .unwrap_or(counters.next_xid);
    }

    /// Writes the status log. WAL covering every status in it is flushed
    /// first.
    pub fn checkpoint_status(&self) -> WalResult<()> {
        let target = if self.wal.in_recovery() {
            self.wal.replay_position()
        } else {
            self.wal.insert_position()
        };
        match self.wal.flush(target) {
            Ok(()) => {}
            Err(WalError::FlushNotSatisfied { requested, flushed }) => {
                warn!(
                    "status log written with WAL flushed only to {} of {}",
                    flushed, requested
                );
            }
            Err(err) => return Err(err),
        }
        let snapshot: BTreeMap<TransactionId, XidStatus> = self
            .status
            .read()
            .iter()
            .map(|(xid, status)| (*xid, *status))
            .collect();
        let bytes = bincode::serialize(&snapshot)?;
        write_file_durably(&self.clog_path, &bytes)?;
        debug!("wrote status of {} transactions", snapshot.len());
        Ok(())
    }

    pub fn prepared_entries(&self) -> Vec<PreparedXactEntry> {
        self.two_phase.lock().entries()
    }

    pub fn prepared_count(&self) -> usize {
        self.two_phase.lock().len()
    }

    pub fn oldest_prepare_lsn(&self) -> Option<Lsn> {
        self.two_phase.lock().oldest_prepare_lsn()
    }

    pub fn prepared_gids(&self) -> Vec<String> {
        let registry = self.two_phase.lock();
        registry
            .entries()
            .iter()
            .filter_map(|e| registry.get(e.xid).map(|p| p.header.gid.clone()))
            .collect()
    }

    /// Counters from a checkpoint taken with nothing running.
    pub fn reset_counters(&self, checkpoint: &CheckpointRecord) {
        *self.counters.lock() = TransactionCounters::from_checkpoint(checkpoint);
    }

    pub fn observe_checkpoint(&self, checkpoint: &CheckpointRecord) {
        self.counters.lock().observe_checkpoint(checkpoint);
    }

    pub fn observe_next_oid(&self, oid: Oid) {
        self.counters.lock().observe_next_oid(oid);
    }

    pub fn observe_xid(&self, xid: TransactionId) {
        self.counters.lock().advance_past(xid);
    }

    pub(crate) fn replay_commit(&self, xid: TransactionId) -> WalResult<()> {
        self.observe_xid(xid);
        self.set_status(xid, XidStatus::Committed);
        Ok(())
    }

    pub(crate) fn replay_abort(&self, xid: TransactionId) -> WalResult<()> {
        self.observe_xid(xid);
        self.set_status(xid, XidStatus::Aborted);
        Ok(())
    }

    pub(crate) fn replay_prepare(&self, header: TwoPhaseFileHeader, lsn: Lsn) -> WalResult<()> {
        let xid = header.xid;
        self.observe_xid(xid);
        self.two_phase.lock().add(header, lsn)?;
        self.set_status(xid, XidStatus::Prepared);
        Ok(())
    }

    pub(crate) fn replay_finish_prepared(&self, xid: TransactionId, commit: bool) -> WalResult<()> {
        self.observe_xid(xid);
        if self.two_phase.lock().remove(xid).is_none() {
            debug!("no prepared state for transaction {} during replay", xid);
        }
        self.set_status(
            xid,
            if commit {
                XidStatus::Committed
            } else {
                XidStatus::Aborted
            },
        );
        Ok(())
    }

    /// Re-registers a transaction found prepared in a checkpoint record.
    pub(crate) fn restore_prepared(&self, header: TwoPhaseFileHeader, lsn: Lsn) -> WalResult<()> {
        debug!("recovering prepared transaction {} ({})", header.xid, header.gid);
        self.replay_prepare(header, lsn)
    }

    /// Transactions without an outcome at the end of replay were cut short by
    /// the crash.
    pub(crate) fn abort_in_progress(&self) -> usize {
        let mut status = self.status.write();
        let mut count = 0;
        for (xid, state) in status.iter_mut() {
            if *state == XidStatus::InProgress && !self.active.contains(xid) {
                *state = XidStatus::Aborted;
                count += 1;
            }
        }
        count
    }
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("counters", &*self.counters.lock())
            .field("active", &self.active.len())
            .field("prepared", &self.two_phase.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recovery::wal::tests::started_manager;
    use crate::recovery::wal::InsertPermission;

    fn manager() -> (tempfile::TempDir, Arc<WalManager>, TransactionManager) {
        let (dir, wal) = started_manager();
        wal.finish_recovery();
        let xacts = TransactionManager::new(Arc::clone(&wal), dir.path(), true).unwrap();
        (dir, wal, xacts)
    }

    #[test]
    fn commit_is_durable_and_recorded() {
        let (_dir, wal, xacts) = manager();
        let mut session = wal.session(InsertPermission::CheckRecovery);
        let mut txn = xacts.begin();
        assert_eq!(xacts.status(txn.id()), Some(XidStatus::InProgress));
        let end = xacts.commit(&mut session, &mut txn).unwrap();
        assert!(wal.flushed_lsn() >= end);
        assert_eq!(xacts.status(txn.id()), Some(XidStatus::Committed));
        assert!(xacts.commit(&mut session, &mut txn).is_err());
    }

    #[test]
    fn async_commit_registers_for_background_flush() {
        let (_dir, wal, xacts) = manager();
        let mut session = wal.session(InsertPermission::CheckRecovery);
        let mut txn = xacts.begin();
        txn.set_synchronous_commit(false);
        let end = xacts.commit(&mut session, &mut txn).unwrap();
        assert!(wal.background_flush().unwrap());
        assert!(wal.flushed_lsn() >= end);
    }

    #[test]
    fn prepare_then_commit_prepared() {
        let (_dir, wal, xacts) = manager();
        let mut session = wal.session(InsertPermission::CheckRecovery);
        let mut txn = xacts.begin();
        let lsn = xacts.prepare(&mut session, &mut txn, "gid-1", 1, 10).unwrap();
        assert_eq!(xacts.oldest_prepare_lsn(), Some(lsn));
        assert_eq!(xacts.prepared_gids(), vec!["gid-1".to_string()]);

        let mut other = xacts.begin();
        assert!(xacts.prepare(&mut session, &mut other, "gid-1", 1, 10).is_err());

        xacts.commit_prepared(&mut session, "gid-1").unwrap();
        assert!(xacts.prepared_entries().is_empty());
        assert_eq!(xacts.status(txn.id()), Some(XidStatus::Committed));
        assert!(xacts.abort_prepared(&mut session, "gid-1").is_err());
    }

    #[test]
    fn status_log_survives_reopen() {
        let (dir, wal, xacts) = manager();
        let mut session = wal.session(InsertPermission::CheckRecovery);
        let mut txn = xacts.begin();
        xacts.abort(&mut session, &mut txn).unwrap();
        xacts.checkpoint_status().unwrap();

        let reopened = TransactionManager::new(Arc::clone(&wal), dir.path(), true).unwrap();
        assert_eq!(reopened.status(txn.id()), Some(XidStatus::Aborted));
    }

    #[test]
    fn checkpoint_reports_oldest_active_xid() {
        let (_dir, wal, xacts) = manager();
        let mut session = wal.session(InsertPermission::CheckRecovery);
        let first = xacts.begin();
        let mut second = xacts.begin();
        xacts.commit(&mut session, &mut second).unwrap();

        let mut record = CheckpointRecord::default();
        xacts.fill_checkpoint(&mut record);
        assert_eq!(record.oldest_active_xid, first.id());
        assert_eq!(record.next_xid, second.id() + 1);

        assert!(xacts.next_oid(&mut session).unwrap() >= super::super::FIRST_NORMAL_OBJECT_ID);
    }
}
