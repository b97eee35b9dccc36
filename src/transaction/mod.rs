mod counters;
mod transaction;
mod transaction_manager;
pub mod two_phase;
pub mod xact;

pub use counters::TransactionCounters;
pub use transaction::{Transaction, TransactionState};
pub use transaction_manager::TransactionManager;
pub use two_phase::{PreparedXact, TwoPhaseRegistry};

use serde::{Deserialize, Serialize};

pub type TransactionId = u32;
pub type Oid = u32;

pub const INVALID_TRANSACTION_ID: TransactionId = 0;
pub const BOOTSTRAP_TRANSACTION_ID: TransactionId = 1;
pub const FROZEN_TRANSACTION_ID: TransactionId = 2;
pub const FIRST_NORMAL_TRANSACTION_ID: TransactionId = 3;

pub const INVALID_OID: Oid = 0;
/// OIDs below this are reserved for objects created at initialization.
pub const FIRST_NORMAL_OBJECT_ID: Oid = 16384;
/// OIDs handed out per logged next-OID record.
pub const VAR_OID_PREFETCH: u32 = 8192;

pub const DEFAULT_TABLESPACE_OID: Oid = 1663;
pub const TEMPLATE_DB_OID: Oid = 1;

/// Commit status of a transaction as kept in the status log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum XidStatus {
    InProgress,
    Committed,
    Aborted,
    Prepared,
}

/// Whether `a` logically precedes `b`, modulo-2^32 for normal xids.
pub fn transaction_id_precedes(a: TransactionId, b: TransactionId) -> bool {
    if a < FIRST_NORMAL_TRANSACTION_ID || b < FIRST_NORMAL_TRANSACTION_ID {
        return a < b;
    }
    (a.wrapping_sub(b) as i32) < 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precedes_wraps_around() {
        assert!(transaction_id_precedes(5, 6));
        assert!(!transaction_id_precedes(6, 5));
        assert!(transaction_id_precedes(u32::MAX - 2, 10));
        assert!(transaction_id_precedes(FROZEN_TRANSACTION_ID, 100));
    }
}
