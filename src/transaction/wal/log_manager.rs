use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use byteorder::{ByteOrder, LittleEndian};
use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use crate::common::types::Lsn;
use crate::storage::disk::{DiskManager, DiskManagerError};
use crate::transaction::wal::log_record::{LogRecord, HEADER_SIZE};

/// Error type for log manager operations
#[derive(Error, Debug)]
pub enum LogManagerError {
    #[error("Disk manager error: {0}")]
    DiskManagerError(#[from] DiskManagerError),

    #[error("Log record of {0} bytes exceeds the log buffer capacity")]
    BufferOverflow(usize),
}

/// Configuration for the log manager
#[derive(Debug, Clone)]
pub struct LogManagerConfig {
    /// Size of each in-memory log buffer in bytes. Must exceed the largest
    /// possible record.
    pub log_buffer_size: usize,

    /// How long the flush thread sleeps before flushing on its own.
    pub flush_timeout: Duration,
}

impl Default for LogManagerConfig {
    fn default() -> Self {
        Self {
            log_buffer_size: 64 * 1024,
            flush_timeout: Duration::from_millis(100),
        }
    }
}

struct LogState {
    /// Appenders serialize records here.
    log_buffer: Vec<u8>,
    /// Filled prefix of `log_buffer`.
    offset: usize,
    /// LSN of the most recently appended record.
    last_lsn: Lsn,
    /// Set when an appender or a forced flush wants the flusher to run now.
    need_flush: bool,
}

/// Append-only write-ahead log with a double-buffered, group-committing
/// flush path.
///
/// Appenders fill the log buffer under the latch; a background thread wakes
/// on a size trigger or a timeout, swaps the log buffer with its own flush
/// buffer, and writes the swapped-out bytes without holding the latch.
/// `flush(false)` waits for the next flush cycle (group commit);
/// `flush(true)` triggers one and waits for it to complete.
pub struct LogManager {
    disk_manager: Arc<DiskManager>,
    config: LogManagerConfig,
    inner: Mutex<LogState>,
    /// Wakes the flush thread.
    cv_flush: Condvar,
    /// Wakes appenders and committers after a flush completes.
    cv_append: Condvar,
    next_lsn: AtomicU64,
    /// Records at or below this LSN are durable.
    persistent_lsn: AtomicU64,
    enabled: AtomicBool,
    flush_thread: Mutex<Option<JoinHandle<()>>>,
}

impl LogManager {
    pub fn new(disk_manager: Arc<DiskManager>) -> Result<Self, LogManagerError> {
        Self::with_config(disk_manager, LogManagerConfig::default())
    }

    pub fn with_config(
        disk_manager: Arc<DiskManager>,
        config: LogManagerConfig,
    ) -> Result<Self, LogManagerError> {
        // Resume LSN assignment after whatever is already in the log file
        let max_lsn = Self::scan_max_lsn(&disk_manager)?;

        Ok(Self {
            disk_manager,
            inner: Mutex::new(LogState {
                log_buffer: vec![0u8; config.log_buffer_size],
                offset: 0,
                last_lsn: max_lsn,
                need_flush: false,
            }),
            config,
            cv_flush: Condvar::new(),
            cv_append: Condvar::new(),
            next_lsn: AtomicU64::new(max_lsn + 1),
            persistent_lsn: AtomicU64::new(max_lsn),
            enabled: AtomicBool::new(false),
            flush_thread: Mutex::new(None),
        })
    }

    /// Walk the existing log file's record headers to find the highest LSN.
    fn scan_max_lsn(disk_manager: &DiskManager) -> Result<Lsn, LogManagerError> {
        let mut max_lsn = 0;
        let mut offset = 0u64;
        let mut header = [0u8; HEADER_SIZE];

        while disk_manager.read_log(&mut header, offset)? {
            let size = LittleEndian::read_u32(&header[0..4]);
            if (size as usize) < HEADER_SIZE {
                break;
            }
            let lsn = LittleEndian::read_u64(&header[4..12]);
            if lsn > max_lsn {
                max_lsn = lsn;
            }
            offset += size as u64;
        }

        Ok(max_lsn)
    }

    /// Whether logging is on, i.e. the flush thread is running.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// LSN the next appended record will receive.
    pub fn next_lsn(&self) -> Lsn {
        self.next_lsn.load(Ordering::SeqCst)
    }

    /// Highest LSN known to be durable on disk.
    pub fn persistent_lsn(&self) -> Lsn {
        self.persistent_lsn.load(Ordering::SeqCst)
    }

    /// Append a record, stamping its LSN. Blocks while the log buffer has no
    /// room, waking the flusher to make space.
    pub fn append_log_record(&self, record: &mut LogRecord) -> Result<Lsn, LogManagerError> {
        let size = record.size as usize;
        if size > self.config.log_buffer_size {
            return Err(LogManagerError::BufferOverflow(size));
        }

        let mut state = self.inner.lock();
        while state.offset + size >= self.config.log_buffer_size {
            state.need_flush = true;
            self.cv_flush.notify_one();
            if self.is_enabled() {
                self.cv_append.wait(&mut state);
            } else {
                // no flush thread to hand off to; write out synchronously
                self.flush_locked(&mut state)?;
            }
        }

        record.lsn = self.next_lsn.fetch_add(1, Ordering::SeqCst);
        let offset = state.offset;
        record.serialize_into(&mut state.log_buffer[offset..offset + size]);
        state.offset += size;
        state.last_lsn = record.lsn;

        Ok(record.lsn)
    }

    /// Spawn the background flush thread and enable logging.
    pub fn run_flush_thread(self: &Arc<Self>) {
        if self.enabled.swap(true, Ordering::SeqCst) {
            return;
        }

        let lm = Arc::clone(self);
        let handle = std::thread::spawn(move || {
            // The flush buffer lives on this thread; swapping it with the
            // log buffer under the latch is the double-buffer handoff.
            let mut flush_buffer = vec![0u8; lm.config.log_buffer_size];

            while lm.enabled.load(Ordering::SeqCst) {
                let (flush_size, last_lsn) = {
                    let mut state = lm.inner.lock();
                    if !state.need_flush {
                        let _ = lm.cv_flush.wait_for(&mut state, lm.config.flush_timeout);
                    }
                    if state.offset == 0 {
                        state.need_flush = false;
                        lm.cv_append.notify_all();
                        continue;
                    }
                    std::mem::swap(&mut state.log_buffer, &mut flush_buffer);
                    let flush_size = std::mem::replace(&mut state.offset, 0);
                    (flush_size, state.last_lsn)
                };

                if let Err(e) = lm.disk_manager.write_log(&flush_buffer[..flush_size]) {
                    log::error!("WAL flush failed: {}", e);
                }
                lm.persistent_lsn.store(last_lsn, Ordering::SeqCst);

                {
                    let mut state = lm.inner.lock();
                    state.need_flush = false;
                }
                lm.cv_append.notify_all();
            }
        });

        *self.flush_thread.lock() = Some(handle);
        log::debug!("WAL flush thread started");
    }

    /// Disable logging, stop the flush thread, and drain whatever is left in
    /// the log buffer to disk.
    pub fn stop_flush_thread(&self) -> Result<(), LogManagerError> {
        if !self.enabled.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        self.cv_flush.notify_one();
        if let Some(handle) = self.flush_thread.lock().take() {
            let _ = handle.join();
        }

        let mut state = self.inner.lock();
        self.flush_locked(&mut state)?;
        log::debug!("WAL flush thread stopped");
        Ok(())
    }

    /// Flush coordination for committers and the buffer pool.
    ///
    /// With `force`, trigger a flush and wait until it completes, so every
    /// record appended so far is durable. Without it, wait for the next
    /// scheduled flush cycle; that is the group-commit path.
    pub fn flush(&self, force: bool) -> Result<(), LogManagerError> {
        let mut state = self.inner.lock();
        if force {
            let target = state.last_lsn;
            if self.is_enabled() {
                // wait on the durability horizon itself, not the flag: the
                // flusher may be mid-write when we arrive
                while self.persistent_lsn() < target {
                    state.need_flush = true;
                    self.cv_flush.notify_one();
                    self.cv_append.wait(&mut state);
                }
            } else {
                self.flush_locked(&mut state)?;
            }
        } else if self.is_enabled() {
            self.cv_append.wait(&mut state);
        }
        Ok(())
    }

    /// Synchronous write-out path used when no flush thread is running.
    fn flush_locked(&self, state: &mut LogState) -> Result<(), LogManagerError> {
        if state.offset > 0 {
            self.disk_manager.write_log(&state.log_buffer[..state.offset])?;
            self.persistent_lsn.store(state.last_lsn, Ordering::SeqCst);
            state.offset = 0;
        }
        state.need_flush = false;
        self.cv_append.notify_all();
        Ok(())
    }
}

impl Drop for LogManager {
    fn drop(&mut self) {
        let _ = self.stop_flush_thread();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::disk::DiskManager;
    use crate::transaction::wal::log_record::{LogRecord, LogRecordType};
    use tempfile::NamedTempFile;

    fn test_log_manager(config: LogManagerConfig) -> (Arc<LogManager>, NamedTempFile, NamedTempFile) {
        let db = NamedTempFile::new().unwrap();
        let log = NamedTempFile::new().unwrap();
        let dm = Arc::new(DiskManager::new(db.path(), log.path()).unwrap());
        let lm = Arc::new(LogManager::with_config(dm, config).unwrap());
        (lm, db, log)
    }

    #[test]
    fn test_lsns_are_sequential() {
        let (lm, _db, _log) = test_log_manager(LogManagerConfig::default());

        let mut begin = LogRecord::new_begin(1);
        let lsn1 = lm.append_log_record(&mut begin).unwrap();
        let mut commit = LogRecord::new_commit(1, lsn1);
        let lsn2 = lm.append_log_record(&mut commit).unwrap();

        assert_eq!(lsn1, 1);
        assert_eq!(lsn2, 2);
        assert_eq!(lm.next_lsn(), 3);
    }

    #[test]
    fn test_force_flush_advances_persistent_lsn() {
        let (lm, _db, _log) = test_log_manager(LogManagerConfig::default());
        lm.run_flush_thread();

        let mut record = LogRecord::new_begin(1);
        let lsn = lm.append_log_record(&mut record).unwrap();
        assert!(lm.persistent_lsn() < lsn);

        lm.flush(true).unwrap();
        assert!(lm.persistent_lsn() >= lsn);

        lm.stop_flush_thread().unwrap();
    }

    #[test]
    fn test_stop_flush_thread_drains_buffer() {
        let (lm, _db, log) = test_log_manager(LogManagerConfig {
            log_buffer_size: 4096,
            flush_timeout: Duration::from_secs(60), // never fires on its own
        });
        lm.run_flush_thread();

        let mut record = LogRecord::new_begin(1);
        let lsn = lm.append_log_record(&mut record).unwrap();
        lm.stop_flush_thread().unwrap();

        assert_eq!(lm.persistent_lsn(), lsn);
        assert!(log.path().metadata().unwrap().len() >= HEADER_SIZE as u64);
    }

    #[test]
    fn test_buffer_full_triggers_flush() {
        let (lm, _db, _log) = test_log_manager(LogManagerConfig {
            log_buffer_size: 128, // a few headers' worth
            flush_timeout: Duration::from_millis(20),
        });
        lm.run_flush_thread();

        // appending far more than one buffer's worth must not deadlock
        let mut last = 0;
        for _ in 0..50 {
            let mut record = LogRecord::new_begin(7);
            last = lm.append_log_record(&mut record).unwrap();
        }
        lm.flush(true).unwrap();
        assert!(lm.persistent_lsn() >= last);

        lm.stop_flush_thread().unwrap();
    }

    #[test]
    fn test_oversized_record_rejected() {
        let (lm, _db, _log) = test_log_manager(LogManagerConfig {
            log_buffer_size: 64,
            flush_timeout: Duration::from_millis(20),
        });

        let mut record = LogRecord::new_insert(
            1,
            0,
            crate::common::types::Rid::new(2, 0),
            crate::storage::page::tuple::Tuple::new(vec![0u8; 256]),
        );
        assert!(matches!(
            lm.append_log_record(&mut record),
            Err(LogManagerError::BufferOverflow(_))
        ));
    }

    #[test]
    fn test_next_lsn_resumes_from_existing_log() {
        let db = NamedTempFile::new().unwrap();
        let log = NamedTempFile::new().unwrap();

        {
            let dm = Arc::new(DiskManager::new(db.path(), log.path()).unwrap());
            let lm = Arc::new(LogManager::new(dm).unwrap());
            let mut record = LogRecord::new_begin(1);
            lm.append_log_record(&mut record).unwrap();
            let mut record = LogRecord::new_commit(1, 1);
            assert_eq!(record.record_type, LogRecordType::Commit);
            lm.append_log_record(&mut record).unwrap();
            lm.flush(true).unwrap();
        }

        // a fresh manager over the same file continues the sequence
        let dm = Arc::new(DiskManager::new(db.path(), log.path()).unwrap());
        let lm = Arc::new(LogManager::new(dm).unwrap());
        assert_eq!(lm.next_lsn(), 3);
        assert_eq!(lm.persistent_lsn(), 2);
    }
}
