use std::collections::HashMap;
use std::sync::Arc;
use log::{debug, info, warn};
use thiserror::Error;

use crate::common::types::{Lsn, TxnId, INVALID_LSN, INVALID_PAGE_ID};
use crate::storage::buffer::{BufferPoolError, BufferPoolManager};
use crate::storage::disk::{DiskManager, DiskManagerError};
use crate::storage::page::error::PageError;
use crate::storage::page::table_page::TablePage;
use crate::transaction::wal::log_record::{LogPayload, LogRecord, LogRecordType};

#[derive(Error, Debug)]
pub enum RecoveryError {
    #[error("Disk manager error: {0}")]
    DiskManagerError(#[from] DiskManagerError),

    #[error("Buffer pool error: {0}")]
    BufferPoolError(#[from] BufferPoolError),

    #[error("Page error: {0}")]
    PageError(#[from] PageError),

    #[error("Corrupt log: {0}")]
    CorruptLog(String),
}

/// ARIES-style crash recovery over the write-ahead log.
///
/// `redo` replays history forward from the start of the log, rebuilding the
/// active-transaction table and an LSN-to-file-offset map on the way. `undo`
/// then rolls back every transaction that never committed by walking its
/// prev-LSN chain backwards. Logging must be disabled while either runs.
pub struct LogRecovery {
    disk_manager: Arc<DiskManager>,
    buffer_pool: Arc<BufferPoolManager>,
    /// txn id -> LSN of its latest log record
    active_txn: HashMap<TxnId, Lsn>,
    /// lsn -> byte offset of the record in the log file
    lsn_mapping: HashMap<Lsn, u64>,
    log_buffer_size: usize,
}

impl LogRecovery {
    pub fn new(disk_manager: Arc<DiskManager>, buffer_pool: Arc<BufferPoolManager>) -> Self {
        Self::with_buffer_size(disk_manager, buffer_pool, 64 * 1024)
    }

    pub fn with_buffer_size(
        disk_manager: Arc<DiskManager>,
        buffer_pool: Arc<BufferPoolManager>,
        log_buffer_size: usize,
    ) -> Self {
        Self {
            disk_manager,
            buffer_pool,
            active_txn: HashMap::new(),
            lsn_mapping: HashMap::new(),
            log_buffer_size,
        }
    }

    /// Transactions that were alive at the end of the log, i.e. the ones
    /// `undo` will roll back.
    pub fn active_transactions(&self) -> Vec<TxnId> {
        self.active_txn.keys().copied().collect()
    }

    /// Forward pass: replay every logged change whose LSN is newer than the
    /// target page's, scanning the log in buffer-sized chunks.
    pub fn redo(&mut self) -> Result<(), RecoveryError> {
        info!("recovery: starting redo pass");
        self.active_txn.clear();
        self.lsn_mapping.clear();

        let mut buf = vec![0u8; self.log_buffer_size];
        // next file position to read from, and the number of carried-over
        // bytes sitting at the front of the buffer
        let mut file_offset = 0u64;
        let mut carry = 0usize;

        while self.disk_manager.read_log(&mut buf[carry..], file_offset)? {
            let buffer_file_start = file_offset - carry as u64;
            file_offset += (self.log_buffer_size - carry) as u64;

            let mut pos = 0usize;
            while let Some(record) = LogRecord::deserialize(&buf[pos..]) {
                self.lsn_mapping
                    .insert(record.lsn, buffer_file_start + pos as u64);
                self.active_txn.insert(record.txn_id, record.lsn);
                pos += record.size as usize;
                self.redo_record(&record)?;
            }

            if pos == 0 {
                // nothing parseable in a full buffer: truncated or corrupt
                // tail, recovery stops here
                break;
            }

            // keep the partial trailing record for the next read
            buf.copy_within(pos.., 0);
            carry = self.log_buffer_size - pos;
        }

        info!(
            "recovery: redo complete, {} transaction(s) unfinished",
            self.active_txn.len()
        );
        Ok(())
    }

    fn redo_record(&mut self, record: &LogRecord) -> Result<(), RecoveryError> {
        match record.record_type {
            LogRecordType::Begin => Ok(()),
            LogRecordType::Commit | LogRecordType::Abort => {
                self.active_txn.remove(&record.txn_id);
                Ok(())
            }
            LogRecordType::NewPage => {
                let (prev_page_id, page_id) = match &record.payload {
                    LogPayload::NewPage { prev_page_id, page_id } => (*prev_page_id, *page_id),
                    _ => return Err(RecoveryError::CorruptLog("NEWPAGE without payload".into())),
                };

                let page_ptr = self.buffer_pool.fetch_page(page_id)?;
                let need_redo = {
                    let mut page = page_ptr.write();
                    let need_redo = record.lsn > TablePage::lsn(&page);
                    if need_redo {
                        TablePage::init(&mut page, page_id, prev_page_id, None, None)?;
                        TablePage::set_lsn(&mut page, record.lsn);
                    }
                    need_redo
                };

                if need_redo && prev_page_id != INVALID_PAGE_ID {
                    let prev_ptr = self.buffer_pool.fetch_page(prev_page_id)?;
                    let changed = {
                        let mut prev = prev_ptr.write();
                        let changed = TablePage::next_page_id(&prev) != page_id;
                        TablePage::set_next_page_id(&mut prev, page_id);
                        changed
                    };
                    self.buffer_pool.unpin_page(prev_page_id, changed)?;
                }

                self.buffer_pool.unpin_page(page_id, need_redo)?;
                Ok(())
            }
            _ => self.redo_data_record(record),
        }
    }

    fn redo_data_record(&mut self, record: &LogRecord) -> Result<(), RecoveryError> {
        let rid = record
            .rid()
            .ok_or_else(|| RecoveryError::CorruptLog("data record without rid".into()))?;

        let page_ptr = self.buffer_pool.fetch_page(rid.page_id)?;
        let need_redo = {
            let mut page = page_ptr.write();
            let need_redo = record.lsn > TablePage::lsn(&page);
            if need_redo {
                debug!("redo lsn {} on page {}", record.lsn, rid.page_id);
                match (&record.record_type, &record.payload) {
                    (LogRecordType::Insert, LogPayload::TupleOp { tuple, .. }) => {
                        TablePage::insert_tuple(&mut page, tuple, None, None, None)?;
                    }
                    (LogRecordType::Update, LogPayload::Update { new_tuple, .. }) => {
                        TablePage::update_tuple(&mut page, new_tuple, rid, None, None, None)?;
                    }
                    (LogRecordType::MarkDelete, _) => {
                        TablePage::mark_delete(&mut page, rid, None, None, None)?;
                    }
                    (LogRecordType::ApplyDelete, _) => {
                        TablePage::apply_delete(&mut page, rid, None, None)?;
                    }
                    (LogRecordType::RollbackDelete, _) => {
                        TablePage::rollback_delete(&mut page, rid, None, None)?;
                    }
                    _ => {
                        return Err(RecoveryError::CorruptLog(format!(
                            "unexpected record type {:?}",
                            record.record_type
                        )))
                    }
                }
                TablePage::set_lsn(&mut page, record.lsn);
            }
            need_redo
        };

        self.buffer_pool.unpin_page(rid.page_id, need_redo)?;
        Ok(())
    }

    /// Backward pass: invert every change of each unfinished transaction,
    /// following prev-LSN chains back to their BEGIN records.
    pub fn undo(&mut self) -> Result<(), RecoveryError> {
        info!(
            "recovery: starting undo pass over {} transaction(s)",
            self.active_txn.len()
        );

        let mut buf = vec![0u8; self.log_buffer_size];
        let losers: Vec<(TxnId, Lsn)> = self.active_txn.iter().map(|(t, l)| (*t, *l)).collect();

        for (txn_id, last_lsn) in losers {
            debug!("undoing transaction {} from lsn {}", txn_id, last_lsn);
            let mut lsn = last_lsn;

            while lsn != INVALID_LSN {
                let offset = *self.lsn_mapping.get(&lsn).ok_or_else(|| {
                    RecoveryError::CorruptLog(format!("no file offset for lsn {}", lsn))
                })?;
                if !self.disk_manager.read_log(&mut buf, offset)? {
                    return Err(RecoveryError::CorruptLog(format!(
                        "log truncated at offset {}",
                        offset
                    )));
                }
                let record = LogRecord::deserialize(&buf).ok_or_else(|| {
                    RecoveryError::CorruptLog(format!("unreadable record at offset {}", offset))
                })?;
                debug_assert_eq!(record.lsn, lsn);
                lsn = record.prev_lsn;

                self.undo_record(&record)?;
            }
        }

        self.active_txn.clear();
        self.lsn_mapping.clear();
        info!("recovery: undo complete");
        Ok(())
    }

    fn undo_record(&mut self, record: &LogRecord) -> Result<(), RecoveryError> {
        match (&record.record_type, &record.payload) {
            (LogRecordType::Begin, _) => Ok(()),
            (LogRecordType::Commit, _) | (LogRecordType::Abort, _) => Err(
                RecoveryError::CorruptLog("finished transaction in undo set".into()),
            ),
            (LogRecordType::NewPage, LogPayload::NewPage { prev_page_id, page_id }) => {
                // unlink the page and give it back
                if !self.buffer_pool.delete_page(*page_id)? {
                    warn!("page {} still pinned during undo", page_id);
                    self.disk_manager.deallocate_page(*page_id);
                }
                if *prev_page_id != INVALID_PAGE_ID {
                    let prev_ptr = self.buffer_pool.fetch_page(*prev_page_id)?;
                    {
                        let mut prev = prev_ptr.write();
                        TablePage::set_next_page_id(&mut prev, INVALID_PAGE_ID);
                    }
                    self.buffer_pool.unpin_page(*prev_page_id, true)?;
                }
                Ok(())
            }
            (LogRecordType::Insert, LogPayload::TupleOp { rid, .. }) => {
                self.with_page(rid.page_id, |page| {
                    TablePage::apply_delete(page, *rid, None, None).map(|_| ())
                })
            }
            (LogRecordType::Update, LogPayload::Update { rid, old_tuple, .. }) => {
                self.with_page(rid.page_id, |page| {
                    TablePage::update_tuple(page, old_tuple, *rid, None, None, None).map(|_| ())
                })
            }
            (LogRecordType::MarkDelete, LogPayload::TupleOp { rid, .. }) => {
                self.with_page(rid.page_id, |page| {
                    TablePage::rollback_delete(page, *rid, None, None)
                })
            }
            (LogRecordType::ApplyDelete, LogPayload::TupleOp { rid, tuple }) => {
                self.with_page(rid.page_id, |page| {
                    TablePage::insert_tuple(page, tuple, None, None, None).map(|_| ())
                })
            }
            (LogRecordType::RollbackDelete, LogPayload::TupleOp { rid, .. }) => {
                self.with_page(rid.page_id, |page| {
                    TablePage::mark_delete(page, *rid, None, None, None)
                })
            }
            _ => Err(RecoveryError::CorruptLog(format!(
                "malformed record type {:?}",
                record.record_type
            ))),
        }
    }

    fn with_page<F>(&self, page_id: u32, f: F) -> Result<(), RecoveryError>
    where
        F: FnOnce(&mut crate::common::types::Page) -> Result<(), PageError>,
    {
        let page_ptr = self.buffer_pool.fetch_page(page_id)?;
        let result = {
            let mut page = page_ptr.write();
            f(&mut *page)
        };
        self.buffer_pool.unpin_page(page_id, true)?;
        result?;
        Ok(())
    }
}
