use std::sync::Arc;
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{RawRwLock, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::common::types::{Page, PageId};
use crate::index::btree::error::BTreeError;
use crate::storage::buffer::BufferPoolManager;

pub(crate) type PageReadGuard = ArcRwLockReadGuard<RawRwLock, Page>;
pub(crate) type PageWriteGuard = ArcRwLockWriteGuard<RawRwLock, Page>;

/// One held page latch, read or write depending on the traversal mode.
pub(crate) enum PageLatch {
    Read(PageReadGuard),
    Write(PageWriteGuard),
}

impl PageLatch {
    pub(crate) fn page(&self) -> &Page {
        match self {
            PageLatch::Read(g) => g,
            PageLatch::Write(g) => g,
        }
    }

    pub(crate) fn page_mut(&mut self) -> &mut Page {
        match self {
            PageLatch::Write(g) => g,
            PageLatch::Read(_) => unreachable!("write access through a read latch"),
        }
    }
}

enum RootGuard<'a> {
    Read(RwLockReadGuard<'a, PageId>),
    Write(RwLockWriteGuard<'a, PageId>),
}

/// The page set of one tree traversal.
///
/// Crabbing keeps the chain of latches from the lowest unsafe ancestor down
/// to the current node in `pages`, in descent order. Releasing happens
/// together: latches drop first, then pins, then any pages queued for
/// deletion are returned to the buffer pool. Dropping the context releases
/// everything, so early returns and errors unwind cleanly.
pub(crate) struct LatchContext<'a> {
    pool: &'a Arc<BufferPoolManager>,
    exclusive: bool,
    root_guard: Option<RootGuard<'a>>,
    pages: Vec<(PageId, PageLatch)>,
    deleted: Vec<PageId>,
}

impl<'a> LatchContext<'a> {
    pub(crate) fn new(pool: &'a Arc<BufferPoolManager>, exclusive: bool) -> Self {
        Self {
            pool,
            exclusive,
            root_guard: None,
            pages: Vec::new(),
            deleted: Vec::new(),
        }
    }

    /// Latch the root-page-id slot and return the current root.
    pub(crate) fn lock_root(&mut self, root_latch: &'a RwLock<PageId>) -> PageId {
        debug_assert!(self.root_guard.is_none());
        if self.exclusive {
            let guard = root_latch.write();
            let root = *guard;
            self.root_guard = Some(RootGuard::Write(guard));
            root
        } else {
            let guard = root_latch.read();
            let root = *guard;
            self.root_guard = Some(RootGuard::Read(guard));
            root
        }
    }

    /// Point the root-page-id at a new page. Only valid on a write traversal
    /// that still holds the root latch.
    pub(crate) fn set_root(&mut self, new_root: PageId) {
        match self.root_guard.as_mut() {
            Some(RootGuard::Write(guard)) => **guard = new_root,
            _ => unreachable!("root update without the root write latch"),
        }
    }

    /// Pin `page_id` and push its latch onto the traversal chain.
    pub(crate) fn latch_page(&mut self, page_id: PageId) -> Result<(), BTreeError> {
        let page_ptr = self.pool.fetch_page(page_id)?;
        let latch = if self.exclusive {
            PageLatch::Write(page_ptr.write_arc())
        } else {
            PageLatch::Read(page_ptr.read_arc())
        };
        self.pages.push((page_id, latch));
        Ok(())
    }

    pub(crate) fn len(&self) -> usize {
        self.pages.len()
    }

    /// Position of `page_id` in the latched chain, if this traversal holds
    /// it. Callers must reuse that latch instead of taking a second one.
    pub(crate) fn position(&self, page_id: PageId) -> Option<usize> {
        self.pages.iter().position(|(id, _)| *id == page_id)
    }

    pub(crate) fn page_at(&self, idx: usize) -> &Page {
        self.pages[idx].1.page()
    }

    pub(crate) fn page_mut_at(&mut self, idx: usize) -> &mut Page {
        self.pages[idx].1.page_mut()
    }

    pub(crate) fn current_page(&self) -> &Page {
        self.pages
            .last()
            .expect("traversal holds at least one page")
            .1
            .page()
    }

    pub(crate) fn current_page_mut(&mut self) -> &mut Page {
        self.pages
            .last_mut()
            .expect("traversal holds at least one page")
            .1
            .page_mut()
    }

    /// Queue a page for deletion once every latch and pin is released.
    pub(crate) fn mark_deleted(&mut self, page_id: PageId) {
        self.deleted.push(page_id);
    }

    /// The current node proved safe: let go of everything above it, the
    /// root-id latch included.
    pub(crate) fn release_ancestors(&mut self) {
        self.root_guard = None;
        let keep = match self.pages.pop() {
            Some(entry) => entry,
            None => return,
        };
        self.release_pages();
        self.pages.push(keep);
    }

    /// Release every held latch and pin, then apply queued deletions.
    pub(crate) fn release_all(&mut self) {
        self.root_guard = None;
        self.release_pages();
        for page_id in std::mem::take(&mut self.deleted) {
            let _ = self.pool.delete_page(page_id);
        }
    }

    fn release_pages(&mut self) {
        let dirty = self.exclusive;
        for (page_id, latch) in self.pages.drain(..) {
            drop(latch);
            let _ = self.pool.unpin_page(page_id, dirty);
        }
    }
}

impl Drop for LatchContext<'_> {
    fn drop(&mut self) {
        self.release_all();
    }
}
