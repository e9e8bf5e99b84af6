mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{create_disk_manager, create_test_files};
use karstdb::common::types::{Rid, INVALID_PAGE_ID};
use karstdb::storage::buffer::BufferPoolManager;
use karstdb::storage::page::{TablePage, Tuple};
use karstdb::transaction::concurrency::{LockManager, TransactionManager};
use karstdb::transaction::wal::{LogManager, LogManagerConfig, LogRecovery};

fn log_config() -> LogManagerConfig {
    LogManagerConfig {
        log_buffer_size: 64 * 1024,
        flush_timeout: Duration::from_millis(20),
    }
}

/// Recovery of a committed insert: the log survives the crash, the data
/// pages do not, and redo brings the tuple back.
#[test]
fn test_committed_insert_survives_crash() {
    let files = create_test_files().unwrap();
    let rid: Rid;

    // session one: insert, commit, crash without flushing any data page
    {
        let disk_manager = create_disk_manager(&files).unwrap();
        let log_manager =
            Arc::new(LogManager::with_config(disk_manager.clone(), log_config()).unwrap());
        log_manager.run_flush_thread();
        let pool = Arc::new(BufferPoolManager::new_with_wal(
            16,
            disk_manager,
            log_manager.clone(),
        ));
        let lock_manager = Arc::new(LockManager::new(true));
        let txn_manager =
            TransactionManager::new(lock_manager.clone(), Some(log_manager.clone()), pool.clone());

        let txn = txn_manager.begin().unwrap();
        let (page_ptr, page_id) = pool.new_page().unwrap();
        rid = {
            let mut page = page_ptr.write();
            TablePage::init(&mut page, page_id, INVALID_PAGE_ID, Some(&txn), Some(&log_manager))
                .unwrap();
            TablePage::insert_tuple(
                &mut page,
                &Tuple::new(b"durable".to_vec()),
                Some(&txn),
                Some(&lock_manager),
                Some(&log_manager),
            )
            .unwrap()
        };
        pool.unpin_page(page_id, true).unwrap();

        txn_manager.commit(&txn).unwrap();
        log_manager.stop_flush_thread().unwrap();
        // dropping the pool here discards every dirty page
    }

    // session two: replay the log
    {
        let disk_manager = create_disk_manager(&files).unwrap();
        let pool = Arc::new(BufferPoolManager::new(16, disk_manager.clone()));
        let mut recovery = LogRecovery::new(disk_manager, pool.clone());

        recovery.redo().unwrap();
        assert!(
            recovery.active_transactions().is_empty(),
            "a committed transaction needs no undo"
        );
        recovery.undo().unwrap();

        let page_ptr = pool.fetch_page(rid.page_id).unwrap();
        {
            let page = page_ptr.read();
            let tuple = TablePage::get_tuple(&page, rid, None, None).unwrap();
            assert_eq!(tuple.data, b"durable");
        }
        pool.unpin_page(rid.page_id, false).unwrap();
    }
}

/// An insert whose transaction never committed is undone by recovery.
#[test]
fn test_uncommitted_insert_rolled_back() {
    let files = create_test_files().unwrap();
    let rid: Rid;

    {
        let disk_manager = create_disk_manager(&files).unwrap();
        let log_manager =
            Arc::new(LogManager::with_config(disk_manager.clone(), log_config()).unwrap());
        log_manager.run_flush_thread();
        let pool = Arc::new(BufferPoolManager::new_with_wal(
            16,
            disk_manager,
            log_manager.clone(),
        ));
        let lock_manager = Arc::new(LockManager::new(true));
        let txn_manager =
            TransactionManager::new(lock_manager.clone(), Some(log_manager.clone()), pool.clone());

        let txn = txn_manager.begin().unwrap();
        let (page_ptr, page_id) = pool.new_page().unwrap();
        rid = {
            let mut page = page_ptr.write();
            TablePage::init(&mut page, page_id, INVALID_PAGE_ID, Some(&txn), Some(&log_manager))
                .unwrap();
            TablePage::insert_tuple(
                &mut page,
                &Tuple::new(b"phantom".to_vec()),
                Some(&txn),
                Some(&lock_manager),
                Some(&log_manager),
            )
            .unwrap()
        };
        pool.unpin_page(page_id, true).unwrap();

        // no commit; make sure the records themselves are on disk, then crash
        log_manager.flush(true).unwrap();
        log_manager.stop_flush_thread().unwrap();
    }

    {
        let disk_manager = create_disk_manager(&files).unwrap();
        let pool = Arc::new(BufferPoolManager::new(16, disk_manager.clone()));
        let mut recovery = LogRecovery::new(disk_manager, pool.clone());

        recovery.redo().unwrap();
        assert_eq!(recovery.active_transactions().len(), 1);
        recovery.undo().unwrap();

        let page_ptr = pool.fetch_page(rid.page_id).unwrap();
        {
            let page = page_ptr.read();
            assert!(
                TablePage::get_tuple(&page, rid, None, None).is_err(),
                "the uncommitted insert must be rolled back"
            );
        }
        pool.unpin_page(rid.page_id, false).unwrap();
    }
}

/// A committed update wins over the stale on-disk tuple.
#[test]
fn test_committed_update_recovers_new_value() {
    let files = create_test_files().unwrap();
    let rid: Rid;

    {
        let disk_manager = create_disk_manager(&files).unwrap();
        let log_manager =
            Arc::new(LogManager::with_config(disk_manager.clone(), log_config()).unwrap());
        log_manager.run_flush_thread();
        let pool = Arc::new(BufferPoolManager::new_with_wal(
            16,
            disk_manager,
            log_manager.clone(),
        ));
        let lock_manager = Arc::new(LockManager::new(true));
        let txn_manager =
            TransactionManager::new(lock_manager.clone(), Some(log_manager.clone()), pool.clone());

        let txn1 = txn_manager.begin().unwrap();
        let (page_ptr, page_id) = pool.new_page().unwrap();
        rid = {
            let mut page = page_ptr.write();
            TablePage::init(&mut page, page_id, INVALID_PAGE_ID, Some(&txn1), Some(&log_manager))
                .unwrap();
            TablePage::insert_tuple(
                &mut page,
                &Tuple::new(b"version-1".to_vec()),
                Some(&txn1),
                Some(&lock_manager),
                Some(&log_manager),
            )
            .unwrap()
        };
        pool.unpin_page(page_id, true).unwrap();
        txn_manager.commit(&txn1).unwrap();

        let txn2 = txn_manager.begin().unwrap();
        {
            let page_ptr = pool.fetch_page(page_id).unwrap();
            {
                let mut page = page_ptr.write();
                TablePage::update_tuple(
                    &mut page,
                    &Tuple::new(b"version-2".to_vec()),
                    rid,
                    Some(&txn2),
                    Some(&lock_manager),
                    Some(&log_manager),
                )
                .unwrap();
            }
            pool.unpin_page(page_id, true).unwrap();
        }
        txn_manager.commit(&txn2).unwrap();
        log_manager.stop_flush_thread().unwrap();
    }

    {
        let disk_manager = create_disk_manager(&files).unwrap();
        let pool = Arc::new(BufferPoolManager::new(16, disk_manager.clone()));
        let mut recovery = LogRecovery::new(disk_manager, pool.clone());
        recovery.redo().unwrap();
        recovery.undo().unwrap();

        let page_ptr = pool.fetch_page(rid.page_id).unwrap();
        {
            let page = page_ptr.read();
            let tuple = TablePage::get_tuple(&page, rid, None, None).unwrap();
            assert_eq!(tuple.data, b"version-2");
        }
        pool.unpin_page(rid.page_id, false).unwrap();
    }
}

/// Replaying the same log twice is harmless: page LSNs gate the redo.
#[test]
fn test_recovery_is_idempotent() {
    let files = create_test_files().unwrap();
    let rid: Rid;

    {
        let disk_manager = create_disk_manager(&files).unwrap();
        let log_manager =
            Arc::new(LogManager::with_config(disk_manager.clone(), log_config()).unwrap());
        log_manager.run_flush_thread();
        let pool = Arc::new(BufferPoolManager::new_with_wal(
            16,
            disk_manager,
            log_manager.clone(),
        ));
        let lock_manager = Arc::new(LockManager::new(true));
        let txn_manager =
            TransactionManager::new(lock_manager.clone(), Some(log_manager.clone()), pool.clone());

        let txn = txn_manager.begin().unwrap();
        let (page_ptr, page_id) = pool.new_page().unwrap();
        rid = {
            let mut page = page_ptr.write();
            TablePage::init(&mut page, page_id, INVALID_PAGE_ID, Some(&txn), Some(&log_manager))
                .unwrap();
            TablePage::insert_tuple(
                &mut page,
                &Tuple::new(b"once".to_vec()),
                Some(&txn),
                Some(&lock_manager),
                Some(&log_manager),
            )
            .unwrap()
        };
        pool.unpin_page(page_id, true).unwrap();
        txn_manager.commit(&txn).unwrap();
        log_manager.stop_flush_thread().unwrap();
    }

    let disk_manager = create_disk_manager(&files).unwrap();
    let pool = Arc::new(BufferPoolManager::new(16, disk_manager.clone()));

    for _ in 0..2 {
        let mut recovery = LogRecovery::new(disk_manager.clone(), pool.clone());
        recovery.redo().unwrap();
        recovery.undo().unwrap();
    }
    pool.flush_all_pages().unwrap();

    let page_ptr = pool.fetch_page(rid.page_id).unwrap();
    {
        let page = page_ptr.read();
        let tuple = TablePage::get_tuple(&page, rid, None, None).unwrap();
        assert_eq!(tuple.data, b"once");
        assert_eq!(TablePage::tuple_count(&page), 1);
    }
    pool.unpin_page(rid.page_id, false).unwrap();
}
