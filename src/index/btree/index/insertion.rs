use serde::{Deserialize, Serialize};

use crate::common::types::{PageId, Rid, INVALID_PAGE_ID};
use crate::index::btree::error::BTreeError;
use crate::index::btree::index::context::LatchContext;
use crate::index::btree::node::{BTreeNode, InternalNode, LeafNode, OpType};
use crate::index::btree::serialization::{deserialize_node, serialize_node};
use super::base::BTreeIndex;

impl<K> BTreeIndex<K>
where
    K: Clone + Ord + Serialize + for<'de> Deserialize<'de> + Send + Sync + 'static,
{
    /// Insert a key/rid pair. Keys are unique; inserting an existing key
    /// fails without mutating the tree.
    pub fn insert(&self, key: K, rid: Rid) -> Result<(), BTreeError> {
        let mut ctx = LatchContext::new(&self.buffer_pool, true);
        let root = ctx.lock_root(&self.root_page_id);

        if root == INVALID_PAGE_ID {
            return self.start_new_tree(&mut ctx, key, rid);
        }

        ctx.latch_page(root)?;
        let mut leaf = self.find_leaf_exclusive(&key, OpType::Insert, &mut ctx)?;

        if leaf.lookup(&key).is_some() {
            return Err(BTreeError::DuplicateKey);
        }
        leaf.insert(key, rid);

        if leaf.keys.len() <= self.order {
            serialize_node(&BTreeNode::Leaf(leaf), ctx.current_page_mut())?;
            ctx.release_all();
            return Ok(());
        }

        self.split_leaf(&mut ctx, leaf)?;
        ctx.release_all();
        Ok(())
    }

    /// First insert into an empty tree: the new leaf is the root.
    fn start_new_tree(
        &self,
        ctx: &mut LatchContext<'_>,
        key: K,
        rid: Rid,
    ) -> Result<(), BTreeError> {
        let (page_ptr, page_id) = self.buffer_pool.new_page()?;

        let mut root: LeafNode<K> = LeafNode::new(page_id, INVALID_PAGE_ID);
        root.insert(key, rid);
        {
            let mut page = page_ptr.write();
            serialize_node(&BTreeNode::Leaf(root), &mut page)?;
        }
        self.buffer_pool.unpin_page(page_id, true)?;

        ctx.set_root(page_id);
        self.update_root_page_id(page_id)?;
        Ok(())
    }

    /// Split an overfull leaf (already written into the context's last
    /// page) and push the separator into the parent chain.
    fn split_leaf(&self, ctx: &mut LatchContext<'_>, mut leaf: LeafNode<K>) -> Result<(), BTreeError> {
        let (new_page_ptr, new_page_id) = self.buffer_pool.new_page()?;

        let mut new_leaf = leaf.split_off_upper();
        new_leaf.page_id = new_page_id;
        leaf.next_leaf = new_page_id;
        let separator = new_leaf.keys[0].clone();

        // the right half must be complete on its page before the chain and
        // the parent can lead readers to it
        {
            let mut page = new_page_ptr.write();
            serialize_node(&BTreeNode::Leaf(new_leaf), &mut page)?;
        }
        self.buffer_pool.unpin_page(new_page_id, true)?;

        let left_id = leaf.page_id;
        serialize_node(&BTreeNode::Leaf(leaf), ctx.current_page_mut())?;

        let leaf_idx = ctx.len() - 1;
        self.insert_into_parent(ctx, leaf_idx, left_id, separator, new_page_id)
    }

    /// Insert a separator produced by splitting the node at `child_idx` in
    /// the context chain, splitting ancestors as the separator bubbles up.
    fn insert_into_parent(
        &self,
        ctx: &mut LatchContext<'_>,
        child_idx: usize,
        left_id: PageId,
        key: K,
        right_id: PageId,
    ) -> Result<(), BTreeError> {
        let mut child_idx = child_idx;
        let mut left_id = left_id;
        let mut key = key;
        let mut right_id = right_id;

        loop {
            if child_idx == 0 {
                // the split node was the root: grow the tree by one level
                return self.make_new_root(ctx, child_idx, left_id, key, right_id);
            }

            let parent_idx = child_idx - 1;
            let mut parent: InternalNode<K> = match deserialize_node(ctx.page_at(parent_idx))? {
                BTreeNode::Internal(internal) => internal,
                BTreeNode::Leaf(_) => return Err(BTreeError::InvalidPageFormat),
            };

            parent.insert_node_after(left_id, key, right_id);

            if parent.children.len() <= self.order + 1 {
                serialize_node(&BTreeNode::Internal(parent), ctx.page_mut_at(parent_idx))?;
                return Ok(());
            }

            // the parent overflows in turn: split it and keep bubbling
            let (new_page_ptr, new_page_id) = self.buffer_pool.new_page()?;
            let (middle_key, mut right_node) = parent.split_off_upper();
            right_node.page_id = new_page_id;

            self.reparent_children(ctx, &right_node.children, new_page_id)?;

            {
                let mut page = new_page_ptr.write();
                serialize_node(&BTreeNode::Internal(right_node), &mut page)?;
            }
            self.buffer_pool.unpin_page(new_page_id, true)?;

            let parent_id = parent.page_id;
            serialize_node(&BTreeNode::Internal(parent), ctx.page_mut_at(parent_idx))?;

            child_idx = parent_idx;
            left_id = parent_id;
            key = middle_key;
            right_id = new_page_id;
        }
    }

    /// The root split: create a new root holding the separator and fix both
    /// halves' parent pointers.
    fn make_new_root(
        &self,
        ctx: &mut LatchContext<'_>,
        old_root_idx: usize,
        left_id: PageId,
        key: K,
        right_id: PageId,
    ) -> Result<(), BTreeError> {
        let (root_ptr, root_id) = self.buffer_pool.new_page()?;

        let mut new_root: InternalNode<K> = InternalNode::new(root_id, INVALID_PAGE_ID);
        new_root.populate_new_root(left_id, key, right_id);
        {
            let mut page = root_ptr.write();
            serialize_node(&BTreeNode::Internal(new_root), &mut page)?;
        }
        self.buffer_pool.unpin_page(root_id, true)?;

        // left half is still latched in the context; the right half was
        // created by this split and is reachable only through the new root
        {
            let mut node: BTreeNode<K> = deserialize_node(ctx.page_at(old_root_idx))?;
            node.set_parent_page_id(root_id);
            serialize_node(&node, ctx.page_mut_at(old_root_idx))?;
        }
        self.reparent_children(ctx, &[right_id], root_id)?;

        ctx.set_root(root_id);
        self.update_root_page_id(root_id)?;
        Ok(())
    }
}
