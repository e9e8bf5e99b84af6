use std::collections::VecDeque;
use std::sync::Arc;
use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::common::types::{Page, PageId, PagePtr, Frame, FrameId, FramePtr, INVALID_PAGE_ID};
use crate::storage::disk::DiskManager;
use crate::storage::buffer::error::BufferPoolError;
use crate::storage::buffer::page_table::ExtendibleHashTable;
use crate::storage::buffer::replacer::LruReplacer;
use crate::transaction::wal::log_manager::LogManager;

/// Fixed-size page cache over the disk manager.
///
/// Frame metadata (the page table, free list, replacer and pin counts) is
/// manipulated under a single pool latch. Page contents are protected by
/// the per-page RwLock, which index code uses as the page latch; that lock
/// is never taken while the pool latch is held on behalf of a caller.
pub struct BufferPoolManager {
    pool_size: usize,
    frames: Vec<FramePtr>,
    page_table: ExtendibleHashTable<PageId, FrameId>,
    free_list: Mutex<VecDeque<FrameId>>,
    replacer: LruReplacer<FrameId>,
    disk_manager: Arc<DiskManager>,
    log_manager: Option<Arc<LogManager>>,
    latch: Mutex<()>,
}

impl BufferPoolManager {
    pub fn new(pool_size: usize, disk_manager: Arc<DiskManager>) -> Self {
        Self::build(pool_size, disk_manager, None)
    }

    /// A pool that observes the write-ahead rule: before a dirty page whose
    /// last LSN is not yet durable gets written back, the log is forced.
    pub fn new_with_wal(
        pool_size: usize,
        disk_manager: Arc<DiskManager>,
        log_manager: Arc<LogManager>,
    ) -> Self {
        Self::build(pool_size, disk_manager, Some(log_manager))
    }

    fn build(
        pool_size: usize,
        disk_manager: Arc<DiskManager>,
        log_manager: Option<Arc<LogManager>>,
    ) -> Self {
        let mut frames = Vec::with_capacity(pool_size);
        let mut free_list = VecDeque::with_capacity(pool_size);

        for i in 0..pool_size {
            let frame_id = i as FrameId;
            let frame = Frame::new(frame_id, Arc::new(RwLock::new(Page::new(INVALID_PAGE_ID))));
            frames.push(Arc::new(RwLock::new(frame)));
            free_list.push_back(frame_id);
        }

        Self {
            pool_size,
            frames,
            page_table: ExtendibleHashTable::default(),
            free_list: Mutex::new(free_list),
            replacer: LruReplacer::new(),
            disk_manager,
            log_manager,
            latch: Mutex::new(()),
        }
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    pub fn disk_manager(&self) -> &Arc<DiskManager> {
        &self.disk_manager
    }

    /// Fetch a page, pinning it. Fails with `BufferPoolFull` when every frame
    /// is pinned.
    pub fn fetch_page(&self, page_id: PageId) -> Result<PagePtr, BufferPoolError> {
        if page_id == INVALID_PAGE_ID {
            return Err(BufferPoolError::InvalidOperation(
                "cannot fetch the invalid page ID".to_string(),
            ));
        }

        let guard = self.latch.lock();

        // Already resident: pin it and shield it from eviction
        if let Some(frame_id) = self.page_table.get(&page_id) {
            let frame = &self.frames[frame_id as usize];
            let mut frame_guard = frame.write();
            frame_guard.pin_count += 1;
            self.replacer.erase(&frame_id);
            return Ok(frame_guard.page.clone());
        }

        // Bring it in from disk
        let frame_id = self.allocate_frame(&guard)?;
        let frame = &self.frames[frame_id as usize];

        let mut new_page = Page::new(page_id);
        self.disk_manager.read_page(page_id, &mut new_page)?;

        let page_ptr = {
            let mut frame_guard = frame.write();
            {
                let mut page_guard = frame_guard.page.write();
                *page_guard = new_page;
            }
            frame_guard.pin_count = 1;
            frame_guard.is_dirty = false;
            frame_guard.page.clone()
        };

        self.page_table.insert(page_id, frame_id);
        Ok(page_ptr)
    }

    /// Allocate a fresh disk page and pin a zeroed frame for it.
    pub fn new_page(&self) -> Result<(PagePtr, PageId), BufferPoolError> {
        let guard = self.latch.lock();

        let frame_id = self.allocate_frame(&guard)?;
        let page_id = self.disk_manager.allocate_page()?;
        let frame = &self.frames[frame_id as usize];

        let page_ptr = {
            let mut frame_guard = frame.write();
            {
                let mut page_guard = frame_guard.page.write();
                *page_guard = Page::new(page_id);
            }
            frame_guard.pin_count = 1;
            frame_guard.is_dirty = false;
            frame_guard.page.clone()
        };

        self.page_table.insert(page_id, frame_id);
        Ok((page_ptr, page_id))
    }

    /// Drop one pin on a page, marking it dirty if requested. Returns false
    /// when the page is unknown or already unpinned.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> Result<bool, BufferPoolError> {
        let _guard = self.latch.lock();

        let frame_id = match self.page_table.get(&page_id) {
            Some(id) => id,
            None => return Ok(false),
        };

        let frame = &self.frames[frame_id as usize];
        let mut frame_guard = frame.write();

        if frame_guard.pin_count == 0 {
            return Ok(false);
        }

        if is_dirty {
            frame_guard.is_dirty = true;
        }
        frame_guard.pin_count -= 1;

        if frame_guard.pin_count == 0 {
            self.replacer.insert(frame_id);
        }

        Ok(true)
    }

    /// Write a page back to disk if it is dirty.
    pub fn flush_page(&self, page_id: PageId) -> Result<(), BufferPoolError> {
        if page_id == INVALID_PAGE_ID {
            return Err(BufferPoolError::InvalidOperation(
                "cannot flush the invalid page ID".to_string(),
            ));
        }

        let _guard = self.latch.lock();

        let frame_id = self
            .page_table
            .get(&page_id)
            .ok_or(BufferPoolError::PageNotFound(page_id))?;

        self.flush_frame(frame_id)
    }

    /// Write every resident dirty page back to disk.
    pub fn flush_all_pages(&self) -> Result<(), BufferPoolError> {
        let _guard = self.latch.lock();
        for page_id in self.page_table.keys() {
            if let Some(frame_id) = self.page_table.get(&page_id) {
                self.flush_frame(frame_id)?;
            }
        }
        Ok(())
    }

    /// Drop a page from the pool and the disk. Returns false while the page
    /// is pinned.
    pub fn delete_page(&self, page_id: PageId) -> Result<bool, BufferPoolError> {
        if page_id == INVALID_PAGE_ID {
            return Err(BufferPoolError::InvalidOperation(
                "cannot delete the invalid page ID".to_string(),
            ));
        }

        let _guard = self.latch.lock();

        if let Some(frame_id) = self.page_table.get(&page_id) {
            let frame = &self.frames[frame_id as usize];
            let mut frame_guard = frame.write();

            if frame_guard.pin_count > 0 {
                return Ok(false);
            }

            {
                let mut page_guard = frame_guard.page.write();
                *page_guard = Page::new(INVALID_PAGE_ID);
            }
            frame_guard.is_dirty = false;

            self.page_table.remove(&page_id);
            self.replacer.erase(&frame_id);
            self.free_list.lock().push_back(frame_id);
        }

        self.disk_manager.deallocate_page(page_id);
        Ok(true)
    }

    /// True when no frame holds a pin. Test support.
    pub fn all_unpinned(&self) -> bool {
        let _guard = self.latch.lock();
        self.frames.iter().all(|f| f.read().pin_count == 0)
    }

    /// Find a frame for an incoming page: the free list first, then an LRU
    /// victim, whose old contents are written back if dirty.
    fn allocate_frame(&self, _held: &MutexGuard<'_, ()>) -> Result<FrameId, BufferPoolError> {
        if let Some(frame_id) = self.free_list.lock().pop_front() {
            return Ok(frame_id);
        }

        let victim_id = self.replacer.victim().ok_or(BufferPoolError::BufferPoolFull)?;

        let old_page_id = {
            let frame_guard = self.frames[victim_id as usize].read();
            debug_assert_eq!(frame_guard.pin_count, 0, "victim frame must be unpinned");
            let page_id = frame_guard.page.read().page_id;
            page_id
        };

        self.flush_frame(victim_id)?;

        if old_page_id != INVALID_PAGE_ID {
            self.page_table.remove(&old_page_id);
        }

        Ok(victim_id)
    }

    /// Write one frame's page back if dirty, honouring the write-ahead rule:
    /// the log must be durable past the page's last LSN first.
    fn flush_frame(&self, frame_id: FrameId) -> Result<(), BufferPoolError> {
        let frame = &self.frames[frame_id as usize];

        let (dirty, page_copy) = {
            let frame_guard = frame.read();
            let dirty = frame_guard.is_dirty;
            if dirty {
                (true, frame_guard.page.read().clone())
            } else {
                (false, Page::new(INVALID_PAGE_ID))
            }
        };

        if !dirty {
            return Ok(());
        }

        if let Some(log_manager) = &self.log_manager {
            if log_manager.is_enabled() && page_copy.lsn > log_manager.persistent_lsn() {
                log_manager.flush(true)?;
            }
        }

        self.disk_manager.write_page(&page_copy)?;
        frame.write().is_dirty = false;
        Ok(())
    }
}
