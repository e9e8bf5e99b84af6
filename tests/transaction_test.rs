mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::{create_disk_manager, create_test_files, TestFiles};
use karstdb::common::types::INVALID_PAGE_ID;
use karstdb::storage::buffer::BufferPoolManager;
use karstdb::storage::page::{TablePage, Tuple};
use karstdb::transaction::concurrency::{
    LockManager, TransactionManager, TransactionState, WriteRecord, WriteType,
};
use karstdb::transaction::wal::{LogManager, LogManagerConfig};

struct Engine {
    _files: TestFiles,
    pool: Arc<BufferPoolManager>,
    lock_manager: Arc<LockManager>,
    log_manager: Arc<LogManager>,
    txn_manager: TransactionManager,
}

fn start_engine() -> Engine {
    let files = create_test_files().unwrap();
    let disk_manager = create_disk_manager(&files).unwrap();
    let config = LogManagerConfig {
        log_buffer_size: 64 * 1024,
        flush_timeout: Duration::from_millis(20),
    };
    let log_manager = Arc::new(LogManager::with_config(disk_manager.clone(), config).unwrap());
    log_manager.run_flush_thread();

    let pool = Arc::new(BufferPoolManager::new_with_wal(
        16,
        disk_manager,
        log_manager.clone(),
    ));
    let lock_manager = Arc::new(LockManager::new(true));
    let txn_manager = TransactionManager::new(
        lock_manager.clone(),
        Some(log_manager.clone()),
        pool.clone(),
    );

    Engine {
        _files: files,
        pool,
        lock_manager,
        log_manager,
        txn_manager,
    }
}

#[test]
fn test_commit_releases_locks_and_is_durable() {
    let engine = start_engine();
    let txn = engine.txn_manager.begin().unwrap();

    let (page_ptr, page_id) = engine.pool.new_page().unwrap();
    let rid = {
        let mut page = page_ptr.write();
        TablePage::init(
            &mut page,
            page_id,
            INVALID_PAGE_ID,
            Some(&txn),
            Some(&engine.log_manager),
        )
        .unwrap();
        TablePage::insert_tuple(
            &mut page,
            &Tuple::new(b"payload".to_vec()),
            Some(&txn),
            Some(&engine.lock_manager),
            Some(&engine.log_manager),
        )
        .unwrap()
    };
    engine.pool.unpin_page(page_id, true).unwrap();

    assert!(txn.holds_exclusive(&rid));
    txn.record_write(WriteRecord {
        rid,
        write_type: WriteType::Insert,
        old_tuple: None,
    });

    engine.txn_manager.commit(&txn).unwrap();

    assert_eq!(txn.state(), TransactionState::Committed);
    assert_eq!(txn.lock_count(), 0, "strict 2PL discharges every lock at commit");
    assert!(
        engine.log_manager.persistent_lsn() >= txn.prev_lsn(),
        "the commit record must be durable before commit returns"
    );
    engine.log_manager.stop_flush_thread().unwrap();
}

#[test]
fn test_abort_rolls_back_insert() {
    let engine = start_engine();
    let txn = engine.txn_manager.begin().unwrap();

    let (page_ptr, page_id) = engine.pool.new_page().unwrap();
    let rid = {
        let mut page = page_ptr.write();
        TablePage::init(
            &mut page,
            page_id,
            INVALID_PAGE_ID,
            Some(&txn),
            Some(&engine.log_manager),
        )
        .unwrap();
        TablePage::insert_tuple(
            &mut page,
            &Tuple::new(b"ghost".to_vec()),
            Some(&txn),
            Some(&engine.lock_manager),
            Some(&engine.log_manager),
        )
        .unwrap()
    };
    engine.pool.unpin_page(page_id, true).unwrap();
    txn.record_write(WriteRecord {
        rid,
        write_type: WriteType::Insert,
        old_tuple: None,
    });

    engine.txn_manager.abort(&txn).unwrap();
    assert_eq!(txn.state(), TransactionState::Aborted);
    assert_eq!(txn.lock_count(), 0);

    // the inserted tuple is gone
    let page_ptr = engine.pool.fetch_page(page_id).unwrap();
    {
        let page = page_ptr.read();
        assert!(TablePage::get_tuple(&page, rid, None, None).is_err());
    }
    engine.pool.unpin_page(page_id, false).unwrap();
    engine.log_manager.stop_flush_thread().unwrap();
}

#[test]
fn test_abort_rolls_back_update() {
    let engine = start_engine();

    // committed base row
    let txn1 = engine.txn_manager.begin().unwrap();
    let (page_ptr, page_id) = engine.pool.new_page().unwrap();
    let rid = {
        let mut page = page_ptr.write();
        TablePage::init(
            &mut page,
            page_id,
            INVALID_PAGE_ID,
            Some(&txn1),
            Some(&engine.log_manager),
        )
        .unwrap();
        TablePage::insert_tuple(
            &mut page,
            &Tuple::new(b"original".to_vec()),
            Some(&txn1),
            Some(&engine.lock_manager),
            Some(&engine.log_manager),
        )
        .unwrap()
    };
    engine.pool.unpin_page(page_id, true).unwrap();
    engine.txn_manager.commit(&txn1).unwrap();

    // an update that never commits
    let txn2 = engine.txn_manager.begin().unwrap();
    let old = {
        let page_ptr = engine.pool.fetch_page(page_id).unwrap();
        let old = {
            let mut page = page_ptr.write();
            TablePage::update_tuple(
                &mut page,
                &Tuple::new(b"changed!".to_vec()),
                rid,
                Some(&txn2),
                Some(&engine.lock_manager),
                Some(&engine.log_manager),
            )
            .unwrap()
        };
        engine.pool.unpin_page(page_id, true).unwrap();
        old
    };
    assert_eq!(old.data, b"original");
    txn2.record_write(WriteRecord {
        rid,
        write_type: WriteType::Update,
        old_tuple: Some(old),
    });

    engine.txn_manager.abort(&txn2).unwrap();

    let page_ptr = engine.pool.fetch_page(page_id).unwrap();
    {
        let page = page_ptr.read();
        let tuple = TablePage::get_tuple(&page, rid, None, None).unwrap();
        assert_eq!(tuple.data, b"original");
    }
    engine.pool.unpin_page(page_id, false).unwrap();
    engine.log_manager.stop_flush_thread().unwrap();
}

#[test]
fn test_marked_delete_applies_at_commit() {
    let engine = start_engine();

    let txn1 = engine.txn_manager.begin().unwrap();
    let (page_ptr, page_id) = engine.pool.new_page().unwrap();
    let rid = {
        let mut page = page_ptr.write();
        TablePage::init(
            &mut page,
            page_id,
            INVALID_PAGE_ID,
            Some(&txn1),
            Some(&engine.log_manager),
        )
        .unwrap();
        TablePage::insert_tuple(
            &mut page,
            &Tuple::new(b"to-delete".to_vec()),
            Some(&txn1),
            Some(&engine.lock_manager),
            Some(&engine.log_manager),
        )
        .unwrap()
    };
    engine.pool.unpin_page(page_id, true).unwrap();
    engine.txn_manager.commit(&txn1).unwrap();

    let txn2 = engine.txn_manager.begin().unwrap();
    {
        let page_ptr = engine.pool.fetch_page(page_id).unwrap();
        {
            let mut page = page_ptr.write();
            TablePage::mark_delete(
                &mut page,
                rid,
                Some(&txn2),
                Some(&engine.lock_manager),
                Some(&engine.log_manager),
            )
            .unwrap();
        }
        engine.pool.unpin_page(page_id, true).unwrap();
    }
    txn2.record_write(WriteRecord {
        rid,
        write_type: WriteType::Delete,
        old_tuple: None,
    });
    engine.txn_manager.commit(&txn2).unwrap();

    // the slot is truly empty now
    let page_ptr = engine.pool.fetch_page(page_id).unwrap();
    {
        let page = page_ptr.read();
        assert!(TablePage::get_tuple(&page, rid, None, None).is_err());
        assert_eq!(TablePage::first_tuple_rid(&page), None);
    }
    engine.pool.unpin_page(page_id, false).unwrap();
    engine.log_manager.stop_flush_thread().unwrap();
}

#[test]
fn test_writer_blocks_reader_until_commit() {
    let engine = start_engine();

    let txn1 = engine.txn_manager.begin().unwrap();
    let (page_ptr, page_id) = engine.pool.new_page().unwrap();
    let rid = {
        let mut page = page_ptr.write();
        TablePage::init(
            &mut page,
            page_id,
            INVALID_PAGE_ID,
            Some(&txn1),
            Some(&engine.log_manager),
        )
        .unwrap();
        TablePage::insert_tuple(
            &mut page,
            &Tuple::new(b"contended".to_vec()),
            Some(&txn1),
            Some(&engine.lock_manager),
            Some(&engine.log_manager),
        )
        .unwrap()
    };
    engine.pool.unpin_page(page_id, true).unwrap();

    // a reader in another transaction blocks on the row lock
    let lock_manager = engine.lock_manager.clone();
    let txn_manager = &engine.txn_manager;
    let reader_txn = txn_manager.begin().unwrap();
    let reader = {
        let reader_txn = reader_txn.clone();
        thread::spawn(move || lock_manager.lock_shared(&reader_txn, rid))
    };

    thread::sleep(Duration::from_millis(50));
    assert!(!reader.is_finished(), "reader must wait for the writer's lock");

    engine.txn_manager.commit(&txn1).unwrap();
    assert!(reader.join().unwrap());
    assert!(reader_txn.holds_shared(&rid));
    engine.log_manager.stop_flush_thread().unwrap();
}
