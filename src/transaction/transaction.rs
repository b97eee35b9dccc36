use crate::recovery::Lsn;

use super::TransactionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Running,
    Prepared,
    Committed,
    Aborted,
}

/// Handle of a transaction started through the transaction manager.
#[derive(Debug)]
pub struct Transaction {
    id: TransactionId,
    state: TransactionState,
    synchronous_commit: bool,
    /// End of the last record this transaction wrote.
    last_lsn: Lsn,
}

impl Transaction {
    pub(super) fn new(id: TransactionId, synchronous_commit: bool) -> Self {
        Self {
            id,
            state: TransactionState::Running,
            synchronous_commit,
            last_lsn: Lsn::INVALID,
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub(super) fn set_state(&mut self, state: TransactionState) {
        self.state = state;
    }

    pub fn synchronous_commit(&self) -> bool {
        self.synchronous_commit
    }

    pub fn set_synchronous_commit(&mut self, enabled: bool) {
        self.synchronous_commit = enabled;
    }

    pub fn last_lsn(&self) -> Lsn {
        self.last_lsn
    }

    /// Remembers the end of a record written on behalf of this transaction.
    pub fn record_lsn(&mut self, end: Lsn) {
        if end > self.last_lsn {
            self.last_lsn = end;
        }
    }

    pub fn is_running(&self) -> bool {
        self.state == TransactionState::Running
    }
}
