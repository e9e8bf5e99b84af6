use serde::{Deserialize, Serialize};

use crate::common::types::INVALID_PAGE_ID;
use crate::index::btree::error::BTreeError;
use crate::index::btree::index::context::LatchContext;
use crate::index::btree::node::{BTreeNode, InternalNode, OpType};
use crate::index::btree::serialization::{deserialize_node, serialize_node};
use super::base::BTreeIndex;

impl<K> BTreeIndex<K>
where
    K: Clone + Ord + Serialize + for<'de> Deserialize<'de> + Send + Sync + 'static,
{
    /// Remove a key. An underfull leaf borrows from or merges with a
    /// sibling, and the repair can cascade up to the root.
    pub fn remove(&self, key: &K) -> Result<(), BTreeError> {
        let mut ctx = LatchContext::new(&self.buffer_pool, true);
        let root = ctx.lock_root(&self.root_page_id);
        if root == INVALID_PAGE_ID {
            return Err(BTreeError::KeyNotFound);
        }

        ctx.latch_page(root)?;
        let mut leaf = self.find_leaf_exclusive(key, OpType::Delete, &mut ctx)?;

        if !leaf.remove(key) {
            return Err(BTreeError::KeyNotFound);
        }

        let node = BTreeNode::Leaf(leaf);
        serialize_node(&node, ctx.current_page_mut())?;

        if node.size() < node.min_size(self.order) {
            let idx = ctx.len() - 1;
            self.coalesce_or_redistribute(&mut ctx, idx)?;
        }

        ctx.release_all();
        Ok(())
    }

    /// Repair the underfull node at position `idx` of the latched chain by
    /// merging with or borrowing from a sibling. Every page touched here is
    /// already write-latched: the node and its retained ancestors by the
    /// descent, the sibling locally.
    fn coalesce_or_redistribute(
        &self,
        ctx: &mut LatchContext<'_>,
        idx: usize,
    ) -> Result<(), BTreeError> {
        let node: BTreeNode<K> = deserialize_node(ctx.page_at(idx))?;
        if node.is_root() {
            return self.adjust_root(ctx, node);
        }

        debug_assert!(idx >= 1, "a non-root underflow retains its parent");
        let parent_idx = idx - 1;
        let mut parent: InternalNode<K> = match deserialize_node(ctx.page_at(parent_idx))? {
            BTreeNode::Internal(internal) => internal,
            BTreeNode::Leaf(_) => return Err(BTreeError::InvalidPageFormat),
        };

        let node_pos = parent
            .value_index(node.page_id())
            .ok_or(BTreeError::InvalidPageFormat)?;
        // prefer the left sibling; the leftmost child borrows rightward
        let (sibling_pos, sibling_on_left) = if node_pos == 0 {
            (1, false)
        } else {
            (node_pos - 1, true)
        };
        let sibling_id = parent.child_at(sibling_pos);

        let sibling_ptr = self.buffer_pool.fetch_page(sibling_id)?;
        let mut sibling_guard = sibling_ptr.write_arc();
        let sibling: BTreeNode<K> = deserialize_node(&sibling_guard)?;

        let can_merge = node.size() + sibling.size() <= node.max_size(self.order);
        let mut parent_underflow = false;

        match (node, sibling) {
            (BTreeNode::Leaf(mut node_leaf), BTreeNode::Leaf(mut sib_leaf)) => {
                if can_merge {
                    if sibling_on_left {
                        sib_leaf.merge_from_right(&mut node_leaf);
                        serialize_node(&BTreeNode::Leaf(sib_leaf), &mut sibling_guard)?;
                        ctx.mark_deleted(node_leaf.page_id);
                        parent.remove_at(node_pos);
                    } else {
                        node_leaf.merge_from_right(&mut sib_leaf);
                        serialize_node(&BTreeNode::Leaf(node_leaf), ctx.page_mut_at(idx))?;
                        ctx.mark_deleted(sibling_id);
                        parent.remove_at(sibling_pos);
                    }
                    parent_underflow = true;
                } else if sibling_on_left {
                    // borrow the left sibling's last entry
                    let key = sib_leaf.keys.pop().expect("donor sibling is not empty");
                    let value = sib_leaf.values.pop().expect("donor sibling is not empty");
                    node_leaf.keys.insert(0, key);
                    node_leaf.values.insert(0, value);
                    parent.keys[node_pos - 1] = node_leaf.keys[0].clone();

                    serialize_node(&BTreeNode::Leaf(sib_leaf), &mut sibling_guard)?;
                    serialize_node(&BTreeNode::Leaf(node_leaf), ctx.page_mut_at(idx))?;
                } else {
                    // borrow the right sibling's first entry
                    let key = sib_leaf.keys.remove(0);
                    let value = sib_leaf.values.remove(0);
                    node_leaf.keys.push(key);
                    node_leaf.values.push(value);
                    parent.keys[0] = sib_leaf.keys[0].clone();

                    serialize_node(&BTreeNode::Leaf(sib_leaf), &mut sibling_guard)?;
                    serialize_node(&BTreeNode::Leaf(node_leaf), ctx.page_mut_at(idx))?;
                }
            }
            (BTreeNode::Internal(mut node_int), BTreeNode::Internal(mut sib_int)) => {
                if can_merge {
                    if sibling_on_left {
                        let separator = parent.keys[node_pos - 1].clone();
                        let moved = node_int.children.clone();
                        let left_id = sib_int.page_id;
                        sib_int.merge_from_right(separator, &mut node_int);
                        serialize_node(&BTreeNode::Internal(sib_int), &mut sibling_guard)?;
                        self.reparent_children(ctx, &moved, left_id)?;
                        ctx.mark_deleted(node_int.page_id);
                        parent.remove_at(node_pos);
                    } else {
                        let separator = parent.keys[0].clone();
                        let moved = sib_int.children.clone();
                        let left_id = node_int.page_id;
                        node_int.merge_from_right(separator, &mut sib_int);
                        serialize_node(&BTreeNode::Internal(node_int), ctx.page_mut_at(idx))?;
                        self.reparent_children(ctx, &moved, left_id)?;
                        ctx.mark_deleted(sibling_id);
                        parent.remove_at(sibling_pos);
                    }
                    parent_underflow = true;
                } else if sibling_on_left {
                    // rotate the left sibling's last child through the parent
                    let separator = parent.keys[node_pos - 1].clone();
                    node_int.keys.insert(0, separator);
                    parent.keys[node_pos - 1] =
                        sib_int.keys.pop().expect("donor sibling is not empty");
                    let moved_child = sib_int.children.pop().expect("donor sibling is not empty");
                    node_int.children.insert(0, moved_child);
                    let node_id = node_int.page_id;

                    serialize_node(&BTreeNode::Internal(sib_int), &mut sibling_guard)?;
                    serialize_node(&BTreeNode::Internal(node_int), ctx.page_mut_at(idx))?;
                    self.reparent_children(ctx, &[moved_child], node_id)?;
                } else {
                    // rotate the right sibling's first child through the parent
                    let separator = parent.keys[0].clone();
                    node_int.keys.push(separator);
                    parent.keys[0] = sib_int.keys.remove(0);
                    let moved_child = sib_int.children.remove(0);
                    node_int.children.push(moved_child);
                    let node_id = node_int.page_id;

                    serialize_node(&BTreeNode::Internal(sib_int), &mut sibling_guard)?;
                    serialize_node(&BTreeNode::Internal(node_int), ctx.page_mut_at(idx))?;
                    self.reparent_children(ctx, &[moved_child], node_id)?;
                }
            }
            _ => return Err(BTreeError::InvalidPageFormat),
        }

        drop(sibling_guard);
        self.buffer_pool.unpin_page(sibling_id, true)?;

        let parent_node = BTreeNode::Internal(parent);
        serialize_node(&parent_node, ctx.page_mut_at(parent_idx))?;

        if parent_underflow && parent_node.size() < parent_node.min_size(self.order) {
            self.coalesce_or_redistribute(ctx, parent_idx)?;
        }
        Ok(())
    }

    /// Shrink the tree at the top: an internal root left with one child
    /// hands the root role to that child, and an emptied leaf root leaves
    /// the tree empty.
    fn adjust_root(&self, ctx: &mut LatchContext<'_>, node: BTreeNode<K>) -> Result<(), BTreeError> {
        match node {
            BTreeNode::Leaf(leaf) => {
                if leaf.keys.is_empty() {
                    ctx.set_root(INVALID_PAGE_ID);
                    self.update_root_page_id(INVALID_PAGE_ID)?;
                    ctx.mark_deleted(leaf.page_id);
                }
                Ok(())
            }
            BTreeNode::Internal(mut internal) => {
                if internal.children.len() == 1 {
                    let new_root = internal.remove_and_return_only_child();
                    ctx.set_root(new_root);
                    self.update_root_page_id(new_root)?;
                    self.reparent_children(ctx, &[new_root], INVALID_PAGE_ID)?;
                    ctx.mark_deleted(internal.page_id);
                }
                Ok(())
            }
        }
    }
}
