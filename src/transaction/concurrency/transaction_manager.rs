use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use log::debug;

use crate::common::types::Rid;
use crate::storage::buffer::BufferPoolManager;
use crate::storage::page::table_page::TablePage;
use crate::transaction::concurrency::lock_manager::LockManager;
use crate::transaction::concurrency::transaction::{
    Transaction, TransactionError, TransactionState, WriteType,
};
use crate::transaction::wal::log_manager::LogManager;
use crate::transaction::wal::log_record::LogRecord;

/// Creates transactions and drives their commit and abort protocols.
///
/// Commit applies deferred deletions, appends a COMMIT record, rides the
/// next group flush so the record is durable before locks are released, and
/// then unlocks everything. Abort rolls the write set back newest-first
/// using in-memory pre-images, appends an ABORT record, and unlocks.
pub struct TransactionManager {
    next_txn_id: AtomicU32,
    lock_manager: Arc<LockManager>,
    log_manager: Option<Arc<LogManager>>,
    buffer_pool: Arc<BufferPoolManager>,
}

impl TransactionManager {
    pub fn new(
        lock_manager: Arc<LockManager>,
        log_manager: Option<Arc<LogManager>>,
        buffer_pool: Arc<BufferPoolManager>,
    ) -> Self {
        Self {
            next_txn_id: AtomicU32::new(1),
            lock_manager,
            log_manager,
            buffer_pool,
        }
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.lock_manager
    }

    pub fn log_manager(&self) -> Option<&Arc<LogManager>> {
        self.log_manager.as_ref()
    }

    /// Start a transaction, logging its BEGIN record when logging is on.
    pub fn begin(&self) -> Result<Arc<Transaction>, TransactionError> {
        let txn_id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        let txn = Arc::new(Transaction::new(txn_id));

        if let Some(lm) = self.logging() {
            let mut record = LogRecord::new_begin(txn_id);
            let lsn = lm
                .append_log_record(&mut record)
                .map_err(|e| TransactionError::LogError(e.to_string()))?;
            txn.set_prev_lsn(lsn);
        }

        debug!("transaction {} begins", txn_id);
        Ok(txn)
    }

    /// Commit: deferred deletions become real, the commit record becomes
    /// durable, then every lock is released.
    pub fn commit(&self, txn: &Transaction) -> Result<(), TransactionError> {
        txn.set_state(TransactionState::Committed);

        // marked deletions are applied for real at commit
        for write in txn.take_write_set() {
            if write.write_type == WriteType::Delete {
                self.apply_delete(txn, write.rid)?;
            }
        }

        if let Some(lm) = self.logging() {
            let mut record = LogRecord::new_commit(txn.id(), txn.prev_lsn());
            let lsn = lm
                .append_log_record(&mut record)
                .map_err(|e| TransactionError::LogError(e.to_string()))?;
            txn.set_prev_lsn(lsn);
            // group commit: ride scheduled flush cycles until this record is
            // durable, never forcing one of our own
            while lm.persistent_lsn() < lsn && lm.is_enabled() {
                lm.flush(false)
                    .map_err(|e| TransactionError::LogError(e.to_string()))?;
            }
        }

        self.release_all_locks(txn);
        debug!("transaction {} committed", txn.id());
        Ok(())
    }

    /// Abort: undo the write set newest-first, log the ABORT, release locks.
    pub fn abort(&self, txn: &Transaction) -> Result<(), TransactionError> {
        txn.set_state(TransactionState::Aborted);

        for write in txn.take_write_set() {
            match write.write_type {
                WriteType::Insert => {
                    debug!("rollback insert at {:?}", write.rid);
                    self.apply_delete(txn, write.rid)?;
                }
                WriteType::Delete => {
                    debug!("rollback delete at {:?}", write.rid);
                    self.with_page(write.rid.page_id, |page| {
                        TablePage::rollback_delete(page, write.rid, Some(txn), self.logging())
                    })?;
                }
                WriteType::Update => {
                    debug!("rollback update at {:?}", write.rid);
                    let old_tuple = write.old_tuple.ok_or_else(|| {
                        TransactionError::InternalError(
                            "update write record without pre-image".to_string(),
                        )
                    })?;
                    self.with_page(write.rid.page_id, |page| {
                        TablePage::update_tuple(
                            page,
                            &old_tuple,
                            write.rid,
                            Some(txn),
                            None,
                            self.logging(),
                        )
                        .map(|_| ())
                    })?;
                }
            }
        }

        if let Some(lm) = self.logging() {
            let mut record = LogRecord::new_abort(txn.id(), txn.prev_lsn());
            let lsn = lm
                .append_log_record(&mut record)
                .map_err(|e| TransactionError::LogError(e.to_string()))?;
            txn.set_prev_lsn(lsn);
            while lm.persistent_lsn() < lsn && lm.is_enabled() {
                lm.flush(false)
                    .map_err(|e| TransactionError::LogError(e.to_string()))?;
            }
        }

        self.release_all_locks(txn);
        debug!("transaction {} aborted", txn.id());
        Ok(())
    }

    fn apply_delete(&self, txn: &Transaction, rid: Rid) -> Result<(), TransactionError> {
        self.with_page(rid.page_id, |page| {
            TablePage::apply_delete(page, rid, Some(txn), self.logging()).map(|_| ())
        })
    }

    fn with_page<F>(&self, page_id: u32, f: F) -> Result<(), TransactionError>
    where
        F: FnOnce(&mut crate::common::types::Page) -> Result<(), crate::storage::page::PageError>,
    {
        let page_ptr = self.buffer_pool.fetch_page(page_id).map_err(|e| {
            TransactionError::InternalError(format!("failed to fetch page {}: {}", page_id, e))
        })?;
        let result = {
            let mut page = page_ptr.write();
            f(&mut *page)
        };
        self.buffer_pool.unpin_page(page_id, true).map_err(|e| {
            TransactionError::InternalError(format!("failed to unpin page {}: {}", page_id, e))
        })?;
        result.map_err(|e| TransactionError::InternalError(e.to_string()))
    }

    fn release_all_locks(&self, txn: &Transaction) {
        for rid in txn.locked_rids() {
            self.lock_manager.unlock(txn, rid);
        }
    }

    /// The log manager, when logging is actually enabled.
    fn logging(&self) -> Option<&LogManager> {
        match &self.log_manager {
            Some(lm) if lm.is_enabled() => Some(lm.as_ref()),
            _ => None,
        }
    }
}
