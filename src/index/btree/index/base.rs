use std::marker::PhantomData;
use std::sync::Arc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::common::types::{PageId, Rid, HEADER_PAGE_ID, INVALID_PAGE_ID};
use crate::index::btree::error::BTreeError;
use crate::index::btree::index::context::LatchContext;
use crate::index::btree::node::{BTreeNode, LeafNode, OpType};
use crate::index::btree::serialization::{calculate_btree_order, deserialize_node, serialize_node};
use crate::storage::buffer::BufferPoolManager;
use crate::storage::page::header_page::HeaderPage;

/// Disk-resident B+Tree over buffer-pool pages, made concurrent by latch
/// crabbing: a traversal latches a child before deciding whether its
/// ancestors' latches can be released, so writers never expose a
/// half-restructured path and readers never see one.
pub struct BTreeIndex<K> {
    pub(crate) index_name: String,
    pub(crate) buffer_pool: Arc<BufferPoolManager>,
    /// Latch over the root page id; every traversal enters through it.
    pub(crate) root_page_id: RwLock<PageId>,
    /// Maximum number of keys a leaf holds; internal nodes hold one more
    /// child than keys.
    pub(crate) order: usize,
    pub(crate) _phantom: PhantomData<K>,
}

impl<K> BTreeIndex<K>
where
    K: Clone + Ord + Serialize + for<'de> Deserialize<'de> + Send + Sync + 'static,
{
    /// Open (or register) the index named `name`, restoring its root from
    /// the header page.
    pub fn new(name: &str, buffer_pool: Arc<BufferPoolManager>) -> Result<Self, BTreeError> {
        let order = calculate_btree_order::<K>();
        Self::with_order(name, buffer_pool, order)
    }

    /// Like `new` but with an explicit order; small orders make split and
    /// merge paths easy to exercise.
    pub fn with_order(
        name: &str,
        buffer_pool: Arc<BufferPoolManager>,
        order: usize,
    ) -> Result<Self, BTreeError> {
        assert!(order >= 2, "order must be at least 2");

        let root_page_id = {
            let header_ptr = buffer_pool.fetch_page(HEADER_PAGE_ID)?;
            let existing = {
                let header = header_ptr.read();
                HeaderPage::get_root_id(&header, name)
            };
            match existing {
                Some(root) => {
                    buffer_pool.unpin_page(HEADER_PAGE_ID, false)?;
                    root
                }
                None => {
                    {
                        let mut header = header_ptr.write();
                        HeaderPage::insert_record(&mut header, name, INVALID_PAGE_ID);
                    }
                    buffer_pool.unpin_page(HEADER_PAGE_ID, true)?;
                    INVALID_PAGE_ID
                }
            }
        };

        Ok(Self {
            index_name: name.to_string(),
            buffer_pool,
            root_page_id: RwLock::new(root_page_id),
            order,
            _phantom: PhantomData,
        })
    }

    pub fn order(&self) -> usize {
        self.order
    }

    pub fn is_empty(&self) -> bool {
        *self.root_page_id.read() == INVALID_PAGE_ID
    }

    /// Point lookup.
    pub fn get_value(&self, key: &K) -> Result<Option<Rid>, BTreeError> {
        let mut ctx = LatchContext::new(&self.buffer_pool, false);
        let root = ctx.lock_root(&self.root_page_id);
        if root == INVALID_PAGE_ID {
            return Ok(None);
        }
        ctx.latch_page(root)?;

        loop {
            let node: BTreeNode<K> = deserialize_node(ctx.current_page())?;
            match node {
                BTreeNode::Leaf(leaf) => {
                    let result = leaf.lookup(key);
                    ctx.release_all();
                    return Ok(result);
                }
                BTreeNode::Internal(internal) => {
                    let child = internal.child_at(internal.child_index(key));
                    ctx.latch_page(child)?;
                    // the child is latched; readers always release upward
                    ctx.release_ancestors();
                }
            }
        }
    }

    /// Descend to the leaf responsible for `key` under write latches,
    /// retaining ancestor latches only while a split or merge could still
    /// reach them. On return the context's last page is the leaf.
    pub(crate) fn find_leaf_exclusive(
        &self,
        key: &K,
        op: OpType,
        ctx: &mut LatchContext<'_>,
    ) -> Result<LeafNode<K>, BTreeError> {
        loop {
            let node: BTreeNode<K> = deserialize_node(ctx.current_page())?;
            if node.is_safe(op, self.order) {
                ctx.release_ancestors();
            }
            match node {
                BTreeNode::Leaf(leaf) => return Ok(leaf),
                BTreeNode::Internal(internal) => {
                    let child = internal.child_at(internal.child_index(key));
                    ctx.latch_page(child)?;
                }
            }
        }
    }

    /// Record the new root in the header page.
    pub(crate) fn update_root_page_id(&self, new_root: PageId) -> Result<(), BTreeError> {
        let header_ptr = self.buffer_pool.fetch_page(HEADER_PAGE_ID)?;
        {
            let mut header = header_ptr.write();
            if !HeaderPage::update_record(&mut header, &self.index_name, new_root) {
                HeaderPage::insert_record(&mut header, &self.index_name, new_root);
            }
        }
        self.buffer_pool.unpin_page(HEADER_PAGE_ID, true)?;
        Ok(())
    }

    /// Re-point the parent pointer of every page in `children` at
    /// `new_parent`. Used when a split or merge moves children between
    /// internal nodes. A child the traversal already holds latched is
    /// rewritten through that latch; latching it twice would self-deadlock.
    pub(crate) fn reparent_children(
        &self,
        ctx: &mut LatchContext<'_>,
        children: &[PageId],
        new_parent: PageId,
    ) -> Result<(), BTreeError> {
        for &child_id in children {
            if let Some(held) = ctx.position(child_id) {
                let mut node: BTreeNode<K> = deserialize_node(ctx.page_at(held))?;
                node.set_parent_page_id(new_parent);
                serialize_node(&node, ctx.page_mut_at(held))?;
                continue;
            }
            let child_ptr = self.buffer_pool.fetch_page(child_id)?;
            {
                let mut guard = child_ptr.write_arc();
                let mut node: BTreeNode<K> = deserialize_node(&guard)?;
                node.set_parent_page_id(new_parent);
                serialize_node(&node, &mut guard)?;
            }
            self.buffer_pool.unpin_page(child_id, true)?;
        }
        Ok(())
    }

    /// Number of keys stored in the tree. Test support; takes no latches
    /// beyond one page at a time.
    pub fn count(&self) -> Result<usize, BTreeError> {
        let root = *self.root_page_id.read();
        if root == INVALID_PAGE_ID {
            return Ok(0);
        }
        self.count_subtree(root)
    }

    fn count_subtree(&self, page_id: PageId) -> Result<usize, BTreeError> {
        let page_ptr = self.buffer_pool.fetch_page(page_id)?;
        let node: BTreeNode<K> = {
            let guard = page_ptr.read();
            deserialize_node(&guard)?
        };
        self.buffer_pool.unpin_page(page_id, false)?;

        match node {
            BTreeNode::Leaf(leaf) => Ok(leaf.keys.len()),
            BTreeNode::Internal(internal) => {
                let mut total = 0;
                for child in internal.children {
                    total += self.count_subtree(child)?;
                }
                Ok(total)
            }
        }
    }

    /// Walk the whole tree verifying key order, size bounds, and parent
    /// pointers. Test support.
    pub fn check_integrity(&self) -> Result<(), BTreeError> {
        let root = *self.root_page_id.read();
        if root == INVALID_PAGE_ID {
            return Ok(());
        }
        self.check_subtree(root, INVALID_PAGE_ID, None, None)?;
        Ok(())
    }

    fn check_subtree(
        &self,
        page_id: PageId,
        expected_parent: PageId,
        lower: Option<&K>,
        upper: Option<&K>,
    ) -> Result<(), BTreeError> {
        let page_ptr = self.buffer_pool.fetch_page(page_id)?;
        let node: BTreeNode<K> = {
            let guard = page_ptr.read();
            deserialize_node(&guard)?
        };
        self.buffer_pool.unpin_page(page_id, false)?;

        if node.parent_page_id() != expected_parent {
            return Err(BTreeError::InvalidPageFormat);
        }
        if !node.is_root()
            && (node.size() < node.min_size(self.order) || node.size() > node.max_size(self.order))
        {
            return Err(BTreeError::InvalidPageFormat);
        }

        let keys: &[K] = match &node {
            BTreeNode::Leaf(l) => &l.keys,
            BTreeNode::Internal(i) => &i.keys,
        };
        for window in keys.windows(2) {
            if window[0] >= window[1] {
                return Err(BTreeError::InvalidPageFormat);
            }
        }
        if let (Some(lo), Some(first)) = (lower, keys.first()) {
            if first < lo {
                return Err(BTreeError::InvalidPageFormat);
            }
        }
        if let (Some(hi), Some(last)) = (upper, keys.last()) {
            if last >= hi {
                return Err(BTreeError::InvalidPageFormat);
            }
        }

        if let BTreeNode::Internal(internal) = &node {
            for (i, &child) in internal.children.iter().enumerate() {
                let lo = if i == 0 { lower } else { Some(&internal.keys[i - 1]) };
                let hi = if i == internal.keys.len() {
                    upper
                } else {
                    Some(&internal.keys[i])
                };
                self.check_subtree(child, page_id, lo, hi)?;
            }
        }
        Ok(())
    }
}
