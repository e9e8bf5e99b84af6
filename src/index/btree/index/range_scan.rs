use std::sync::Arc;
use serde::{Deserialize, Serialize};

use crate::common::types::{PageId, Rid, INVALID_PAGE_ID};
use crate::index::btree::error::BTreeError;
use crate::index::btree::node::{BTreeNode, LeafNode};
use crate::index::btree::serialization::deserialize_node;
use crate::storage::buffer::BufferPoolManager;
use super::base::BTreeIndex;

impl<K> BTreeIndex<K>
where
    K: Clone + Ord + Serialize + for<'de> Deserialize<'de> + Send + Sync + 'static,
{
    /// Iterator over the whole tree in key order.
    pub fn begin(&self) -> Result<BTreeIterator<K>, BTreeError> {
        match self.find_leaf_read(None)? {
            Some((_, leaf)) => Ok(BTreeIterator::new(self.buffer_pool.clone(), Some(leaf), 0)),
            None => Ok(BTreeIterator::new(self.buffer_pool.clone(), None, 0)),
        }
    }

    /// Iterator positioned at the first key >= `key`.
    pub fn begin_at(&self, key: &K) -> Result<BTreeIterator<K>, BTreeError> {
        match self.find_leaf_read(Some(key))? {
            Some((_, leaf)) => {
                let index = leaf.key_index(key);
                Ok(BTreeIterator::new(self.buffer_pool.clone(), Some(leaf), index))
            }
            None => Ok(BTreeIterator::new(self.buffer_pool.clone(), None, 0)),
        }
    }

    /// Collect the rids of every key in `[start, end]`.
    pub fn range_scan(&self, start: &K, end: &K) -> Result<Vec<Rid>, BTreeError> {
        if start > end {
            return Ok(Vec::new());
        }
        let mut result = Vec::new();
        for (key, rid) in self.begin_at(start)? {
            if &key > end {
                break;
            }
            result.push(rid);
        }
        Ok(result)
    }

    /// Read-crab down to the leaf for `key` (or the leftmost leaf) and hand
    /// it over still pinned, latch released; the iterator owns the pin.
    fn find_leaf_read(&self, key: Option<&K>) -> Result<Option<(PageId, LeafNode<K>)>, BTreeError> {
        let root_guard = self.root_page_id.read();
        let root = *root_guard;
        if root == INVALID_PAGE_ID {
            return Ok(None);
        }

        let mut current_id = root;
        let page_ptr = self.buffer_pool.fetch_page(current_id)?;
        let mut guard = page_ptr.read_arc();
        drop(root_guard);

        loop {
            let node: BTreeNode<K> = deserialize_node(&guard)?;
            match node {
                BTreeNode::Leaf(leaf) => {
                    drop(guard);
                    return Ok(Some((current_id, leaf)));
                }
                BTreeNode::Internal(internal) => {
                    let child_id = match key {
                        Some(k) => internal.child_at(internal.child_index(k)),
                        None => internal.child_at(0),
                    };
                    let child_ptr = self.buffer_pool.fetch_page(child_id)?;
                    let child_guard = child_ptr.read_arc();

                    // child latched: release the parent latch, then its pin
                    drop(guard);
                    self.buffer_pool.unpin_page(current_id, false)?;
                    guard = child_guard;
                    current_id = child_id;
                }
            }
        }
    }
}

/// Range-scan cursor over the leaf chain.
///
/// Holds one pin on the current leaf and a decoded copy of it; advancing
/// past the last slot releases the pin, follows `next_leaf`, and pins and
/// reads the next leaf. Yields nothing more once the chain ends.
pub struct BTreeIterator<K> {
    buffer_pool: Arc<BufferPoolManager>,
    leaf: Option<LeafNode<K>>,
    index: usize,
}

impl<K> BTreeIterator<K>
where
    K: Clone + Ord + Serialize + for<'de> Deserialize<'de> + Send + Sync + 'static,
{
    fn new(buffer_pool: Arc<BufferPoolManager>, leaf: Option<LeafNode<K>>, index: usize) -> Self {
        Self {
            buffer_pool,
            leaf,
            index,
        }
    }

    pub fn is_end(&self) -> bool {
        self.leaf.is_none()
    }

    fn advance_leaf(&mut self) -> bool {
        let leaf = match self.leaf.take() {
            Some(leaf) => leaf,
            None => return false,
        };
        let next = leaf.next_leaf;
        let _ = self.buffer_pool.unpin_page(leaf.page_id, false);

        if next == INVALID_PAGE_ID {
            return false;
        }

        let page_ptr = match self.buffer_pool.fetch_page(next) {
            Ok(ptr) => ptr,
            Err(_) => return false,
        };
        let node = {
            let guard = page_ptr.read_arc();
            deserialize_node::<K>(&guard)
        };
        match node {
            Ok(BTreeNode::Leaf(next_leaf)) => {
                self.leaf = Some(next_leaf);
                self.index = 0;
                true
            }
            _ => {
                let _ = self.buffer_pool.unpin_page(next, false);
                false
            }
        }
    }
}

impl<K> Iterator for BTreeIterator<K>
where
    K: Clone + Ord + Serialize + for<'de> Deserialize<'de> + Send + Sync + 'static,
{
    type Item = (K, Rid);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let leaf = self.leaf.as_ref()?;
            if self.index < leaf.keys.len() {
                let item = (leaf.keys[self.index].clone(), leaf.values[self.index]);
                self.index += 1;
                return Some(item);
            }
            if !self.advance_leaf() {
                return None;
            }
        }
    }
}

impl<K> Drop for BTreeIterator<K> {
    fn drop(&mut self) {
        if let Some(leaf) = self.leaf.take() {
            let _ = self.buffer_pool.unpin_page(leaf.page_id, false);
        }
    }
}
