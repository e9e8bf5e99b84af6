use byteorder::{ByteOrder, LittleEndian};

use crate::common::types::{Lsn, Page, PageId, Rid, INVALID_PAGE_ID, PAGE_SIZE};
use crate::storage::page::error::PageError;
use crate::storage::page::tuple::Tuple;
use crate::transaction::concurrency::lock_manager::LockManager;
use crate::transaction::concurrency::transaction::{Transaction, TransactionState};
use crate::transaction::wal::log_manager::LogManager;
use crate::transaction::wal::log_record::LogRecord;

// Header layout (byte offsets from page start):
//   page_id @ 0 (u32)
//   lsn @ 4 (u64)
//   prev_page_id @ 12 (u32)
//   next_page_id @ 16 (u32)
//   free_space_pointer @ 20 (u32)
//   tuple_count @ 24 (u32)
// followed by the slot array of (offset: i32, size: i32) pairs growing up
// from byte 28; tuple bytes grow down from the page end. A negative slot
// size marks the tuple deleted but still occupying space.
const OFFSET_LSN: usize = 4;
const OFFSET_PREV_PAGE_ID: usize = 12;
const OFFSET_NEXT_PAGE_ID: usize = 16;
const OFFSET_FREE_SPACE_PTR: usize = 20;
const OFFSET_TUPLE_COUNT: usize = 24;
const SLOT_ARRAY_OFFSET: usize = 28;
const SLOT_SIZE: usize = 8;

/// Slotted tuple page.
///
/// Mutations append a WAL record and stamp the page LSN when a log manager
/// with logging enabled is supplied; row locks are taken through the lock
/// manager at the same points the log records are written.
pub struct TablePage;

impl TablePage {
    /// Initialize a fresh table page and, when logging, append a NEWPAGE
    /// record linking it behind `prev_page_id`.
    pub fn init(
        page: &mut Page,
        page_id: PageId,
        prev_page_id: PageId,
        txn: Option<&Transaction>,
        log_manager: Option<&LogManager>,
    ) -> Result<(), PageError> {
        LittleEndian::write_u32(&mut page.data[0..4], page_id);

        if let Some(lm) = log_manager {
            if lm.is_enabled() {
                let txn = txn.expect("logged page init requires a transaction");
                let mut record =
                    LogRecord::new_new_page(txn.id(), txn.prev_lsn(), prev_page_id, page_id);
                let lsn = lm.append_log_record(&mut record)?;
                txn.set_prev_lsn(lsn);
                Self::set_lsn(page, lsn);
            }
        }

        Self::set_prev_page_id(page, prev_page_id);
        Self::set_next_page_id(page, INVALID_PAGE_ID);
        Self::set_free_space_pointer(page, PAGE_SIZE as u32);
        Self::set_tuple_count(page, 0);
        Ok(())
    }

    /// Insert a tuple, reusing an emptied slot when one exists.
    pub fn insert_tuple(
        page: &mut Page,
        tuple: &Tuple,
        txn: Option<&Transaction>,
        lock_manager: Option<&LockManager>,
        log_manager: Option<&LogManager>,
    ) -> Result<Rid, PageError> {
        debug_assert!(!tuple.is_empty());
        if (Self::free_space(page) as usize) < tuple.len() {
            return Err(PageError::InsufficientSpace);
        }

        // Reuse the first emptied slot
        let count = Self::tuple_count(page);
        let mut slot = count;
        for i in 0..count {
            if Self::slot_len(page, i) == 0 {
                slot = i;
                break;
            }
        }

        // A brand-new slot also costs a slot array entry
        if slot == count && (Self::free_space(page) as usize) < tuple.len() + SLOT_SIZE {
            return Err(PageError::InsufficientSpace);
        }

        let fsp = Self::free_space_pointer(page) as usize - tuple.len();
        page.data[fsp..fsp + tuple.len()].copy_from_slice(&tuple.data);
        Self::set_free_space_pointer(page, fsp as u32);
        Self::set_slot_offset(page, slot, fsp as i32);
        Self::set_slot_len(page, slot, tuple.len() as i32);
        if slot == count {
            Self::set_tuple_count(page, count + 1);
        }

        let rid = Rid::new(Self::page_id(page), slot);

        if let Some(lm) = log_manager.filter(|lm| lm.is_enabled()) {
            let txn = txn.expect("logged insert requires a transaction");
            Self::acquire_exclusive(txn, lock_manager, rid)?;
            let mut record = LogRecord::new_insert(txn.id(), txn.prev_lsn(), rid, tuple.clone());
            let lsn = lm.append_log_record(&mut record)?;
            txn.set_prev_lsn(lsn);
            Self::set_lsn(page, lsn);
        }

        Ok(rid)
    }

    /// Flag a tuple deleted by flipping its slot length negative. The bytes
    /// stay in place until the deletion is applied at commit.
    pub fn mark_delete(
        page: &mut Page,
        rid: Rid,
        txn: Option<&Transaction>,
        lock_manager: Option<&LockManager>,
        log_manager: Option<&LogManager>,
    ) -> Result<(), PageError> {
        let logging = log_manager.map(|lm| lm.is_enabled()).unwrap_or(false);
        let slot = rid.slot_num;
        if slot >= Self::tuple_count(page) {
            if logging {
                if let Some(t) = txn {
                    t.set_state(TransactionState::Aborted);
                }
            }
            return Err(PageError::InvalidSlot);
        }

        let len = Self::slot_len(page, slot);
        if len <= 0 {
            if logging {
                if let Some(t) = txn {
                    t.set_state(TransactionState::Aborted);
                }
            }
            return Err(PageError::TupleNotFound);
        }

        if let Some(lm) = log_manager.filter(|lm| lm.is_enabled()) {
            let txn = txn.expect("logged delete requires a transaction");
            Self::acquire_exclusive(txn, lock_manager, rid)?;
            let mut record =
                LogRecord::new_mark_delete(txn.id(), txn.prev_lsn(), rid, Tuple::default());
            let lsn = lm.append_log_record(&mut record)?;
            txn.set_prev_lsn(lsn);
            Self::set_lsn(page, lsn);
        }

        Self::set_slot_len(page, slot, -len);
        Ok(())
    }

    /// Overwrite a tuple in place, sliding neighbouring tuple bytes to absorb
    /// the size difference. Returns the old tuple for undo.
    pub fn update_tuple(
        page: &mut Page,
        new_tuple: &Tuple,
        rid: Rid,
        txn: Option<&Transaction>,
        lock_manager: Option<&LockManager>,
        log_manager: Option<&LogManager>,
    ) -> Result<Tuple, PageError> {
        let logging = log_manager.map(|lm| lm.is_enabled()).unwrap_or(false);
        let slot = rid.slot_num;
        if slot >= Self::tuple_count(page) {
            if logging {
                if let Some(t) = txn {
                    t.set_state(TransactionState::Aborted);
                }
            }
            return Err(PageError::InvalidSlot);
        }

        let old_len = Self::slot_len(page, slot);
        if old_len <= 0 {
            if logging {
                if let Some(t) = txn {
                    t.set_state(TransactionState::Aborted);
                }
            }
            return Err(PageError::TupleNotFound);
        }
        let old_len = old_len as usize;

        if new_tuple.len() > old_len
            && (Self::free_space(page) as usize) < new_tuple.len() - old_len
        {
            return Err(PageError::InsufficientSpace);
        }

        let tuple_offset = Self::slot_offset(page, slot) as usize;
        let old_tuple = Tuple::with_rid(
            page.data[tuple_offset..tuple_offset + old_len].to_vec(),
            rid,
        );

        if let Some(lm) = log_manager.filter(|lm| lm.is_enabled()) {
            let txn = txn.expect("logged update requires a transaction");
            Self::acquire_exclusive(txn, lock_manager, rid)?;
            let mut record = LogRecord::new_update(
                txn.id(),
                txn.prev_lsn(),
                rid,
                old_tuple.clone(),
                new_tuple.clone(),
            );
            let lsn = lm.append_log_record(&mut record)?;
            txn.set_prev_lsn(lsn);
            Self::set_lsn(page, lsn);
        }

        // Slide everything between the free space pointer and this tuple by
        // the size delta, then drop the new bytes in ending where the old
        // tuple ended.
        let fsp = Self::free_space_pointer(page) as usize;
        let delta = old_len as isize - new_tuple.len() as isize;
        let new_fsp = (fsp as isize + delta) as usize;
        page.data.copy_within(fsp..tuple_offset, new_fsp);
        Self::set_free_space_pointer(page, new_fsp as u32);

        let new_offset = (tuple_offset as isize + delta) as usize;
        page.data[new_offset..new_offset + new_tuple.len()].copy_from_slice(&new_tuple.data);
        Self::set_slot_len(page, slot, new_tuple.len() as i32);

        let count = Self::tuple_count(page);
        for i in 0..count {
            if Self::slot_len(page, i) != 0 {
                let off = Self::slot_offset(page, i);
                if (off as usize) < tuple_offset + old_len {
                    Self::set_slot_offset(page, i, (off as isize + delta) as i32);
                }
            }
        }

        Ok(old_tuple)
    }

    /// Physically remove a tuple, compacting the data region and freeing the
    /// slot. Called when a deletion commits or an insert is undone; the
    /// caller must already hold the exclusive row lock when logging.
    pub fn apply_delete(
        page: &mut Page,
        rid: Rid,
        txn: Option<&Transaction>,
        log_manager: Option<&LogManager>,
    ) -> Result<Tuple, PageError> {
        let slot = rid.slot_num;
        if slot >= Self::tuple_count(page) {
            return Err(PageError::InvalidSlot);
        }

        let raw_len = Self::slot_len(page, slot);
        if raw_len == 0 {
            return Err(PageError::TupleNotFound);
        }
        // negative length: committing a marked deletion; positive: undoing an insert
        let len = raw_len.unsigned_abs() as usize;
        let tuple_offset = Self::slot_offset(page, slot) as usize;

        let deleted = Tuple::with_rid(page.data[tuple_offset..tuple_offset + len].to_vec(), rid);

        if let Some(lm) = log_manager {
            if lm.is_enabled() {
                let txn = txn.expect("logged apply-delete requires a transaction");
                debug_assert!(txn.holds_exclusive(&rid));
                let mut record =
                    LogRecord::new_apply_delete(txn.id(), txn.prev_lsn(), rid, deleted.clone());
                let lsn = lm.append_log_record(&mut record)?;
                txn.set_prev_lsn(lsn);
                Self::set_lsn(page, lsn);
            }
        }

        let fsp = Self::free_space_pointer(page) as usize;
        page.data.copy_within(fsp..tuple_offset, fsp + len);
        Self::set_free_space_pointer(page, (fsp + len) as u32);
        Self::set_slot_len(page, slot, 0);
        Self::set_slot_offset(page, slot, 0);

        let count = Self::tuple_count(page);
        for i in 0..count {
            if Self::slot_len(page, i) != 0 {
                let off = Self::slot_offset(page, i);
                if (off as usize) < tuple_offset {
                    Self::set_slot_offset(page, i, off + len as i32);
                }
            }
        }

        Ok(deleted)
    }

    /// Undo a mark-delete: flip the slot length back to positive so the
    /// tuple is visible again.
    pub fn rollback_delete(
        page: &mut Page,
        rid: Rid,
        txn: Option<&Transaction>,
        log_manager: Option<&LogManager>,
    ) -> Result<(), PageError> {
        if let Some(lm) = log_manager {
            if lm.is_enabled() {
                let txn = txn.expect("logged rollback-delete requires a transaction");
                debug_assert!(txn.holds_exclusive(&rid));
                let mut record = LogRecord::new_rollback_delete(
                    txn.id(),
                    txn.prev_lsn(),
                    rid,
                    Tuple::default(),
                );
                let lsn = lm.append_log_record(&mut record)?;
                txn.set_prev_lsn(lsn);
                Self::set_lsn(page, lsn);
            }
        }

        let slot = rid.slot_num;
        if slot >= Self::tuple_count(page) {
            return Err(PageError::InvalidSlot);
        }
        let len = Self::slot_len(page, slot);
        if len < 0 {
            Self::set_slot_len(page, slot, -len);
        }
        Ok(())
    }

    /// Read a tuple, taking a shared row lock when running under a
    /// transaction that does not already hold one.
    pub fn get_tuple(
        page: &Page,
        rid: Rid,
        txn: Option<&Transaction>,
        lock_manager: Option<&LockManager>,
    ) -> Result<Tuple, PageError> {
        let slot = rid.slot_num;
        if slot >= Self::tuple_count(page) {
            if let Some(t) = txn {
                t.set_state(TransactionState::Aborted);
            }
            return Err(PageError::InvalidSlot);
        }

        let len = Self::slot_len(page, slot);
        if len <= 0 {
            if let Some(t) = txn {
                t.set_state(TransactionState::Aborted);
            }
            return Err(PageError::TupleNotFound);
        }

        if let (Some(txn), Some(lock_manager)) = (txn, lock_manager) {
            if !txn.holds_exclusive(&rid)
                && !txn.holds_shared(&rid)
                && !lock_manager.lock_shared(txn, rid)
            {
                return Err(PageError::LockFailed);
            }
        }

        let offset = Self::slot_offset(page, slot) as usize;
        Ok(Tuple::with_rid(
            page.data[offset..offset + len as usize].to_vec(),
            rid,
        ))
    }

    /// Rid of the first live tuple on the page.
    pub fn first_tuple_rid(page: &Page) -> Option<Rid> {
        for i in 0..Self::tuple_count(page) {
            if Self::slot_len(page, i) > 0 {
                return Some(Rid::new(Self::page_id(page), i));
            }
        }
        None
    }

    /// Rid of the first live tuple after `cur` on the same page.
    pub fn next_tuple_rid(page: &Page, cur: Rid) -> Option<Rid> {
        debug_assert_eq!(cur.page_id, Self::page_id(page));
        for i in cur.slot_num + 1..Self::tuple_count(page) {
            if Self::slot_len(page, i) > 0 {
                return Some(Rid::new(Self::page_id(page), i));
            }
        }
        None
    }

    /// Take (or upgrade to) the exclusive row lock unless the transaction
    /// already holds it. A caller that guarantees the lock is held may omit
    /// the lock manager.
    fn acquire_exclusive(
        txn: &Transaction,
        lock_manager: Option<&LockManager>,
        rid: Rid,
    ) -> Result<(), PageError> {
        if txn.holds_exclusive(&rid) {
            return Ok(());
        }
        let lock_manager = lock_manager.ok_or(PageError::LockFailed)?;
        let acquired = if txn.holds_shared(&rid) {
            lock_manager.lock_upgrade(txn, rid)
        } else {
            lock_manager.lock_exclusive(txn, rid)
        };
        if acquired {
            Ok(())
        } else {
            Err(PageError::LockFailed)
        }
    }

    // header accessors

    pub fn page_id(page: &Page) -> PageId {
        LittleEndian::read_u32(&page.data[0..4])
    }

    pub fn lsn(page: &Page) -> Lsn {
        LittleEndian::read_u64(&page.data[OFFSET_LSN..OFFSET_LSN + 8])
    }

    pub fn set_lsn(page: &mut Page, lsn: Lsn) {
        LittleEndian::write_u64(&mut page.data[OFFSET_LSN..OFFSET_LSN + 8], lsn);
        page.lsn = lsn;
    }

    pub fn prev_page_id(page: &Page) -> PageId {
        LittleEndian::read_u32(&page.data[OFFSET_PREV_PAGE_ID..OFFSET_PREV_PAGE_ID + 4])
    }

    pub fn set_prev_page_id(page: &mut Page, prev: PageId) {
        LittleEndian::write_u32(&mut page.data[OFFSET_PREV_PAGE_ID..OFFSET_PREV_PAGE_ID + 4], prev);
    }

    pub fn next_page_id(page: &Page) -> PageId {
        LittleEndian::read_u32(&page.data[OFFSET_NEXT_PAGE_ID..OFFSET_NEXT_PAGE_ID + 4])
    }

    pub fn set_next_page_id(page: &mut Page, next: PageId) {
        LittleEndian::write_u32(&mut page.data[OFFSET_NEXT_PAGE_ID..OFFSET_NEXT_PAGE_ID + 4], next);
    }

    pub fn tuple_count(page: &Page) -> u32 {
        LittleEndian::read_u32(&page.data[OFFSET_TUPLE_COUNT..OFFSET_TUPLE_COUNT + 4])
    }

    /// Bytes left between the slot array and the tuple data region.
    pub fn free_space(page: &Page) -> u32 {
        Self::free_space_pointer(page)
            - (SLOT_ARRAY_OFFSET as u32)
            - Self::tuple_count(page) * SLOT_SIZE as u32
    }

    fn free_space_pointer(page: &Page) -> u32 {
        LittleEndian::read_u32(&page.data[OFFSET_FREE_SPACE_PTR..OFFSET_FREE_SPACE_PTR + 4])
    }

    fn set_free_space_pointer(page: &mut Page, fsp: u32) {
        LittleEndian::write_u32(&mut page.data[OFFSET_FREE_SPACE_PTR..OFFSET_FREE_SPACE_PTR + 4], fsp);
    }

    fn set_tuple_count(page: &mut Page, count: u32) {
        LittleEndian::write_u32(&mut page.data[OFFSET_TUPLE_COUNT..OFFSET_TUPLE_COUNT + 4], count);
    }

    fn slot_offset(page: &Page, slot: u32) -> i32 {
        let pos = SLOT_ARRAY_OFFSET + SLOT_SIZE * slot as usize;
        LittleEndian::read_i32(&page.data[pos..pos + 4])
    }

    fn slot_len(page: &Page, slot: u32) -> i32 {
        let pos = SLOT_ARRAY_OFFSET + SLOT_SIZE * slot as usize + 4;
        LittleEndian::read_i32(&page.data[pos..pos + 4])
    }

    fn set_slot_offset(page: &mut Page, slot: u32, offset: i32) {
        let pos = SLOT_ARRAY_OFFSET + SLOT_SIZE * slot as usize;
        LittleEndian::write_i32(&mut page.data[pos..pos + 4], offset);
    }

    fn set_slot_len(page: &mut Page, slot: u32, len: i32) {
        let pos = SLOT_ARRAY_OFFSET + SLOT_SIZE * slot as usize + 4;
        LittleEndian::write_i32(&mut page.data[pos..pos + 4], len);
    }
}
