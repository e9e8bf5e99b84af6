use std::sync::Arc;
use tempfile::NamedTempFile;
use karstdb::storage::buffer::BufferPoolManager;
use karstdb::storage::disk::DiskManager;
use anyhow::Result;

/// Temp files for one engine instance; dropping them deletes the database.
pub struct TestFiles {
    pub db: NamedTempFile,
    pub log: NamedTempFile,
}

#[allow(dead_code)]
pub fn create_test_files() -> Result<TestFiles> {
    Ok(TestFiles {
        db: NamedTempFile::new()?,
        log: NamedTempFile::new()?,
    })
}

#[allow(dead_code)]
pub fn create_disk_manager(files: &TestFiles) -> Result<Arc<DiskManager>> {
    Ok(Arc::new(DiskManager::new(files.db.path(), files.log.path())?))
}

/// A buffer pool over fresh temp files.
#[allow(dead_code)]
pub fn create_test_buffer_pool(pool_size: usize) -> Result<(Arc<BufferPoolManager>, TestFiles)> {
    let files = create_test_files()?;
    let disk_manager = create_disk_manager(&files)?;
    let buffer_pool = Arc::new(BufferPoolManager::new(pool_size, disk_manager));
    Ok((buffer_pool, files))
}
