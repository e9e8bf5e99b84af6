use std::fs::{File, OpenOptions};
use std::io::{Read, Write, Seek, SeekFrom};
use std::path::Path;
use parking_lot::Mutex;
use thiserror::Error;

use crate::common::types::{Page, PageId, INVALID_PAGE_ID, PAGE_SIZE};

#[derive(Error, Debug)]
pub enum DiskManagerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Invalid page ID: {0}")]
    InvalidPageId(PageId),
}

/// DiskManager handles the actual disk I/O for the page file and the log file.
///
/// Pages are numbered from 1; page 1 is reserved for the header page and is
/// pre-allocated when a fresh database file is created.
pub struct DiskManager {
    db_file: Mutex<File>,
    log_file: Mutex<File>,
}

impl DiskManager {
    /// Open (or create) the database page file and its write-ahead log file.
    pub fn new(db_path: impl AsRef<Path>, log_path: impl AsRef<Path>) -> Result<Self, DiskManagerError> {
        let mut db_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(db_path)?;

        let log_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(log_path)?;

        // Reserve page 1 for the header page on a fresh file
        if db_file.metadata()?.len() == 0 {
            let zeros = [0u8; PAGE_SIZE];
            db_file.write_all(&zeros)?;
            db_file.flush()?;
        }

        Ok(Self {
            db_file: Mutex::new(db_file),
            log_file: Mutex::new(log_file),
        })
    }

    /// Read a page from disk
    pub fn read_page(&self, page_id: PageId, page: &mut Page) -> Result<(), DiskManagerError> {
        if page_id == INVALID_PAGE_ID {
            return Err(DiskManagerError::InvalidPageId(page_id));
        }

        let offset = self.page_offset(page_id);
        let mut buffer = [0u8; PAGE_SIZE];

        {
            let mut file = self.db_file.lock();
            let file_size = file.metadata()?.len();

            // Pages past the end of the file read back as zeroes
            if offset as u64 >= file_size {
                page.data.fill(0);
                page.page_id = page_id;
                page.lsn = 0;
                return Ok(());
            }

            file.seek(SeekFrom::Start(offset as u64))?;
            file.read_exact(&mut buffer)?;
        }

        page.data.copy_from_slice(&buffer);
        page.page_id = page_id;
        page.lsn = 0;

        Ok(())
    }

    /// Write a page to disk
    pub fn write_page(&self, page: &Page) -> Result<(), DiskManagerError> {
        if page.page_id == INVALID_PAGE_ID {
            return Err(DiskManagerError::InvalidPageId(page.page_id));
        }

        let offset = self.page_offset(page.page_id);

        let mut file = self.db_file.lock();
        file.seek(SeekFrom::Start(offset as u64))?;
        file.write_all(&page.data)?;
        file.flush()?;

        Ok(())
    }

    /// Allocate a new page on disk and return its ID
    pub fn allocate_page(&self) -> Result<PageId, DiskManagerError> {
        let mut file = self.db_file.lock();

        let file_size = file.metadata()?.len();
        let new_page_id = (file_size / PAGE_SIZE as u64) as PageId + 1;

        // Extend the file with a zeroed page
        file.seek(SeekFrom::End(0))?;
        let zeros = [0u8; PAGE_SIZE];
        file.write_all(&zeros)?;
        file.flush()?;

        Ok(new_page_id)
    }

    /// Release a page on disk. The file is not shrunk; the page becomes
    /// garbage until a compaction pass reclaims it.
    pub fn deallocate_page(&self, _page_id: PageId) {}

    /// Append a chunk of serialized log records to the log file and sync it.
    pub fn write_log(&self, data: &[u8]) -> Result<(), DiskManagerError> {
        if data.is_empty() {
            return Ok(());
        }
        let mut file = self.log_file.lock();
        file.seek(SeekFrom::End(0))?;
        file.write_all(data)?;
        file.sync_data()?;
        Ok(())
    }

    /// Read up to `buf.len()` bytes of the log starting at `offset`.
    ///
    /// Returns false once `offset` is at or past the end of the log. A short
    /// tail is zero-padded so a partial trailing record deserializes as
    /// corrupt rather than as garbage.
    pub fn read_log(&self, buf: &mut [u8], offset: u64) -> Result<bool, DiskManagerError> {
        let mut file = self.log_file.lock();
        let file_size = file.metadata()?.len();
        if offset >= file_size {
            return Ok(false);
        }

        file.seek(SeekFrom::Start(offset))?;
        let available = ((file_size - offset) as usize).min(buf.len());
        file.read_exact(&mut buf[..available])?;
        buf[available..].fill(0);

        Ok(true)
    }

    /// Current size of the log file in bytes.
    pub fn log_size(&self) -> Result<u64, DiskManagerError> {
        Ok(self.log_file.lock().metadata()?.len())
    }

    fn page_offset(&self, page_id: PageId) -> usize {
        (page_id as usize - 1) * PAGE_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn test_disk_manager() -> (DiskManager, NamedTempFile, NamedTempFile) {
        let db = NamedTempFile::new().unwrap();
        let log = NamedTempFile::new().unwrap();
        let dm = DiskManager::new(db.path(), log.path()).unwrap();
        (dm, db, log)
    }

    #[test]
    fn test_page_round_trip() {
        let (dm, _db, _log) = test_disk_manager();

        let pid = dm.allocate_page().unwrap();
        assert_eq!(pid, 2); // page 1 is the reserved header page

        let mut page = Page::new(pid);
        page.data[0..5].copy_from_slice(b"Hello");
        dm.write_page(&page).unwrap();

        let mut read_back = Page::new(INVALID_PAGE_ID);
        dm.read_page(pid, &mut read_back).unwrap();
        assert_eq!(&read_back.data[0..5], b"Hello");
        assert_eq!(read_back.page_id, pid);
    }

    #[test]
    fn test_read_past_end_is_zeroed() {
        let (dm, _db, _log) = test_disk_manager();
        let mut page = Page::new(INVALID_PAGE_ID);
        dm.read_page(99, &mut page).unwrap();
        assert!(page.data.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_log_round_trip() {
        let (dm, _db, _log) = test_disk_manager();

        dm.write_log(b"record-one").unwrap();
        dm.write_log(b"record-two").unwrap();

        let mut buf = vec![0u8; 20];
        assert!(dm.read_log(&mut buf, 0).unwrap());
        assert_eq!(&buf, b"record-onerecord-two");

        // reading past the end reports eof
        assert!(!dm.read_log(&mut buf, 20).unwrap());
    }
}
