use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use parking_lot::Mutex;
use thiserror::Error;

use crate::common::types::{Lsn, Rid, TxnId, INVALID_LSN};
use crate::storage::page::tuple::Tuple;

/// Two-phase locking transaction states.
///
/// A transaction acquires locks while GROWING. Under non-strict 2PL the
/// first unlock moves it to SHRINKING; under strict 2PL every lock is held
/// until the transaction is COMMITTED or ABORTED.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Growing,
    Shrinking,
    Committed,
    Aborted,
}

/// Errors that can occur during transaction processing
#[derive(Error, Debug)]
pub enum TransactionError {
    #[error("Transaction {0} is already committed or aborted")]
    InvalidState(TxnId),

    #[error("Failed to write to WAL: {0}")]
    LogError(String),

    #[error("Internal transaction error: {0}")]
    InternalError(String),
}

/// Kind of write a transaction performed, for commit/abort processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteType {
    Insert,
    Delete,
    Update,
}

/// One entry of a transaction's write set.
#[derive(Debug, Clone)]
pub struct WriteRecord {
    pub rid: Rid,
    pub write_type: WriteType,
    /// Pre-image for UPDATE rollback; None for INSERT/DELETE.
    pub old_tuple: Option<Tuple>,
}

/// An active transaction: its 2PL state, the rids it has locked, the writes
/// it has performed, and the LSN of its most recent log record.
pub struct Transaction {
    id: TxnId,
    state: Mutex<TransactionState>,
    prev_lsn: AtomicU64,
    shared_lock_set: Mutex<HashSet<Rid>>,
    exclusive_lock_set: Mutex<HashSet<Rid>>,
    write_set: Mutex<Vec<WriteRecord>>,
}

impl Transaction {
    pub fn new(id: TxnId) -> Self {
        Self {
            id,
            state: Mutex::new(TransactionState::Growing),
            prev_lsn: AtomicU64::new(INVALID_LSN),
            shared_lock_set: Mutex::new(HashSet::new()),
            exclusive_lock_set: Mutex::new(HashSet::new()),
            write_set: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn state(&self) -> TransactionState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: TransactionState) {
        *self.state.lock() = state;
    }

    /// LSN of the last log record this transaction appended.
    pub fn prev_lsn(&self) -> Lsn {
        self.prev_lsn.load(Ordering::SeqCst)
    }

    pub fn set_prev_lsn(&self, lsn: Lsn) {
        self.prev_lsn.store(lsn, Ordering::SeqCst);
    }

    pub fn holds_shared(&self, rid: &Rid) -> bool {
        self.shared_lock_set.lock().contains(rid)
    }

    pub fn holds_exclusive(&self, rid: &Rid) -> bool {
        self.exclusive_lock_set.lock().contains(rid)
    }

    pub fn add_shared_lock(&self, rid: Rid) {
        self.shared_lock_set.lock().insert(rid);
    }

    pub fn add_exclusive_lock(&self, rid: Rid) {
        self.exclusive_lock_set.lock().insert(rid);
    }

    pub fn remove_shared_lock(&self, rid: &Rid) -> bool {
        self.shared_lock_set.lock().remove(rid)
    }

    pub fn remove_exclusive_lock(&self, rid: &Rid) -> bool {
        self.exclusive_lock_set.lock().remove(rid)
    }

    /// Every rid this transaction currently holds a lock on.
    pub fn locked_rids(&self) -> Vec<Rid> {
        let mut rids: Vec<Rid> = self.shared_lock_set.lock().iter().copied().collect();
        rids.extend(self.exclusive_lock_set.lock().iter().copied());
        rids
    }

    pub fn lock_count(&self) -> usize {
        self.shared_lock_set.lock().len() + self.exclusive_lock_set.lock().len()
    }

    /// Remember a write for commit-time deletion apply or abort rollback.
    pub fn record_write(&self, record: WriteRecord) {
        self.write_set.lock().push(record);
    }

    /// Drain the write set, most recent first.
    pub fn take_write_set(&self) -> Vec<WriteRecord> {
        let mut writes = std::mem::take(&mut *self.write_set.lock());
        writes.reverse();
        writes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_transaction_is_growing() {
        let txn = Transaction::new(1);
        assert_eq!(txn.id(), 1);
        assert_eq!(txn.state(), TransactionState::Growing);
        assert_eq!(txn.prev_lsn(), INVALID_LSN);
        assert_eq!(txn.lock_count(), 0);
    }

    #[test]
    fn test_lock_set_bookkeeping() {
        let txn = Transaction::new(2);
        let rid = Rid::new(3, 0);

        txn.add_shared_lock(rid);
        assert!(txn.holds_shared(&rid));
        assert!(!txn.holds_exclusive(&rid));

        txn.remove_shared_lock(&rid);
        txn.add_exclusive_lock(rid);
        assert!(txn.holds_exclusive(&rid));
        assert_eq!(txn.locked_rids(), vec![rid]);
    }

    #[test]
    fn test_write_set_drains_in_reverse() {
        let txn = Transaction::new(3);
        txn.record_write(WriteRecord {
            rid: Rid::new(2, 0),
            write_type: WriteType::Insert,
            old_tuple: None,
        });
        txn.record_write(WriteRecord {
            rid: Rid::new(2, 1),
            write_type: WriteType::Delete,
            old_tuple: None,
        });

        let writes = txn.take_write_set();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0].rid, Rid::new(2, 1));
        assert_eq!(writes[1].rid, Rid::new(2, 0));
        assert!(txn.take_write_set().is_empty());
    }
}
