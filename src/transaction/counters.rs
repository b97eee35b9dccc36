use crate::recovery::wal::codec::checkpoint::CheckpointRecord;

use super::{
    transaction_id_precedes, Oid, TransactionId, FIRST_NORMAL_OBJECT_ID,
    FIRST_NORMAL_TRANSACTION_ID, INVALID_TRANSACTION_ID, TEMPLATE_DB_OID,
};

/// Id generators whose state survives restarts through checkpoints and
/// next-OID records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionCounters {
    pub next_xid: TransactionId,
    pub next_xid_epoch: u32,
    pub next_oid: Oid,
    /// OIDs still covered by the last logged next-OID record.
    pub oid_count: u32,
    pub next_relfilenode: Oid,
    pub next_multi: u32,
    pub next_multi_offset: u32,
    pub oldest_xid: TransactionId,
    pub oldest_xid_db: Oid,
}

impl Default for TransactionCounters {
    fn default() -> Self {
        Self {
            next_xid: FIRST_NORMAL_TRANSACTION_ID,
            next_xid_epoch: 0,
            next_oid: FIRST_NORMAL_OBJECT_ID,
            oid_count: 0,
            next_relfilenode: FIRST_NORMAL_OBJECT_ID,
            next_multi: 1,
            next_multi_offset: 0,
            oldest_xid: FIRST_NORMAL_TRANSACTION_ID,
            oldest_xid_db: TEMPLATE_DB_OID,
        }
    }
}

impl TransactionCounters {
    pub fn from_checkpoint(cp: &CheckpointRecord) -> Self {
        Self {
            next_xid: cp.next_xid.max(FIRST_NORMAL_TRANSACTION_ID),
            next_xid_epoch: cp.next_xid_epoch,
            next_oid: cp.next_oid.max(FIRST_NORMAL_OBJECT_ID),
            oid_count: 0,
            next_relfilenode: cp.next_relfilenode.max(FIRST_NORMAL_OBJECT_ID),
            next_multi: cp.next_multi.max(1),
            next_multi_offset: cp.next_multi_offset,
            oldest_xid: cp.oldest_xid,
            oldest_xid_db: cp.oldest_xid_db,
        }
    }

    pub fn fill(&self, cp: &mut CheckpointRecord) {
        cp.next_xid = self.next_xid;
        cp.next_xid_epoch = self.next_xid_epoch;
        // OIDs in the current prefetch batch may already be in use.
        cp.next_oid = self.next_oid.wrapping_add(self.oid_count);
        cp.next_relfilenode = self.next_relfilenode;
        cp.next_multi = self.next_multi;
        cp.next_multi_offset = self.next_multi_offset;
        cp.oldest_xid = self.oldest_xid;
        cp.oldest_xid_db = self.oldest_xid_db;
    }

    /// Hands out the next xid, skipping the special ids after wraparound.
    pub fn assign_xid(&mut self) -> TransactionId {
        let xid = self.next_xid;
        self.next_xid = self.next_xid.wrapping_add(1);
        if self.next_xid < FIRST_NORMAL_TRANSACTION_ID {
            self.next_xid = FIRST_NORMAL_TRANSACTION_ID;
            self.next_xid_epoch = self.next_xid_epoch.wrapping_add(1);
        }
        xid
    }

    /// Replay saw `xid` in use; later assignments must come after it.
    pub fn advance_past(&mut self, xid: TransactionId) {
        if xid == INVALID_TRANSACTION_ID || xid < FIRST_NORMAL_TRANSACTION_ID {
            return;
        }
        if !transaction_id_precedes(xid, self.next_xid) {
            let wrapped = xid.wrapping_add(1) < xid;
            self.next_xid = xid.wrapping_add(1);
            if self.next_xid < FIRST_NORMAL_TRANSACTION_ID {
                self.next_xid = FIRST_NORMAL_TRANSACTION_ID;
            }
            if wrapped {
                self.next_xid_epoch = self.next_xid_epoch.wrapping_add(1);
            }
        }
    }

    /// Takes the next OID. Returns the value a next-OID record must log
    /// before this OID may be used, if the current batch is exhausted.
    pub fn assign_oid(&mut self, prefetch: u32) -> (Oid, Option<Oid>) {
        if self.next_oid < FIRST_NORMAL_OBJECT_ID {
            self.next_oid = FIRST_NORMAL_OBJECT_ID;
            self.oid_count = 0;
        }
        let mut log_upto = None;
        if self.oid_count == 0 {
            log_upto = Some(self.next_oid.wrapping_add(prefetch));
            self.oid_count = prefetch;
        }
        let oid = self.next_oid;
        self.next_oid = self.next_oid.wrapping_add(1);
        self.oid_count -= 1;
        (oid, log_upto)
    }

    /// Replay of a next-OID record.
    pub fn observe_next_oid(&mut self, oid: Oid) {
        self.next_oid = oid;
        self.oid_count = 0;
    }

    /// An online checkpoint's counters were sampled while other sessions ran;
    /// only move forward.
    pub fn observe_checkpoint(&mut self, cp: &CheckpointRecord) {
        if cp.next_xid_epoch > self.next_xid_epoch
            || (cp.next_xid_epoch == self.next_xid_epoch
                && transaction_id_precedes(self.next_xid, cp.next_xid))
        {
            self.next_xid = cp.next_xid;
            self.next_xid_epoch = cp.next_xid_epoch;
        }
        if self.next_relfilenode < cp.next_relfilenode {
            self.next_relfilenode = cp.next_relfilenode;
        }
        if self.next_multi < cp.next_multi {
            self.next_multi = cp.next_multi;
            self.next_multi_offset = cp.next_multi_offset;
        }
        self.oldest_xid = cp.oldest_xid;
        self.oldest_xid_db = cp.oldest_xid_db;
    }

    pub fn assign_relfilenode(&mut self) -> Oid {
        let node = self.next_relfilenode;
        self.next_relfilenode = self.next_relfilenode.wrapping_add(1).max(FIRST_NORMAL_OBJECT_ID);
        node
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xid_wraparound_bumps_epoch() {
        let mut counters = TransactionCounters {
            next_xid: u32::MAX,
            ..TransactionCounters::default()
        };
        assert_eq!(counters.assign_xid(), u32::MAX);
        assert_eq!(counters.next_xid, FIRST_NORMAL_TRANSACTION_ID);
        assert_eq!(counters.next_xid_epoch, 1);
    }

    #[test]
    fn oid_batches_are_logged_once_per_prefetch() {
        let mut counters = TransactionCounters::default();
        let (first, log) = counters.assign_oid(4);
        assert_eq!(first, FIRST_NORMAL_OBJECT_ID);
        assert_eq!(log, Some(FIRST_NORMAL_OBJECT_ID + 4));
        for _ in 0..3 {
            assert_eq!(counters.assign_oid(4).1, None);
        }
        assert_eq!(counters.assign_oid(4).1, Some(FIRST_NORMAL_OBJECT_ID + 8));

        let mut cp = CheckpointRecord::default();
        counters.fill(&mut cp);
        assert_eq!(cp.next_oid, FIRST_NORMAL_OBJECT_ID + 8);
    }

    #[test]
    fn replay_only_moves_forward() {
        let mut counters = TransactionCounters::default();
        counters.advance_past(100);
        assert_eq!(counters.next_xid, 101);
        counters.advance_past(50);
        assert_eq!(counters.next_xid, 101);

        let cp = CheckpointRecord {
            next_xid: 90,
            next_relfilenode: 20000,
            next_multi: 4,
            ..CheckpointRecord::default()
        };
        counters.observe_checkpoint(&cp);
        assert_eq!(counters.next_xid, 101);
        assert_eq!(counters.next_relfilenode, 20000);
        assert_eq!(counters.next_multi, 4);
    }
}
