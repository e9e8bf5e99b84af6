use std::mem;
use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

use crate::common::types::{Page, PAGE_SIZE};
use crate::index::btree::error::BTreeError;
use crate::index::btree::node::BTreeNode;

// Node pages carry a u32 length prefix followed by the bincode-encoded node.
const LENGTH_PREFIX: usize = 4;

/// Serialize a node into a page, replacing its previous contents.
pub fn serialize_node<K>(node: &BTreeNode<K>, page: &mut Page) -> Result<(), BTreeError>
where
    K: Serialize + Clone + Ord,
{
    let bytes = bincode::serialize(node)
        .map_err(|e| BTreeError::SerializationError(e.to_string()))?;
    if LENGTH_PREFIX + bytes.len() > PAGE_SIZE {
        return Err(BTreeError::NodeTooLarge);
    }

    page.data.fill(0);
    LittleEndian::write_u32(&mut page.data[0..LENGTH_PREFIX], bytes.len() as u32);
    page.data[LENGTH_PREFIX..LENGTH_PREFIX + bytes.len()].copy_from_slice(&bytes);
    Ok(())
}

/// Deserialize the node stored in a page.
pub fn deserialize_node<K>(page: &Page) -> Result<BTreeNode<K>, BTreeError>
where
    K: for<'de> Deserialize<'de> + Clone + Ord,
{
    let len = LittleEndian::read_u32(&page.data[0..LENGTH_PREFIX]) as usize;
    if len == 0 || LENGTH_PREFIX + len > PAGE_SIZE {
        return Err(BTreeError::InvalidPageFormat);
    }
    bincode::deserialize(&page.data[LENGTH_PREFIX..LENGTH_PREFIX + len])
        .map_err(|e| BTreeError::DeserializationError(e.to_string()))
}

/// Pick the tree order (max keys per node) from the key width so one more
/// insert always fits in a page before the node splits.
pub fn calculate_btree_order<K>() -> usize {
    let key_size = mem::size_of::<K>().max(1);
    // key + record id + bincode framing, with page headroom for the node
    // header fields
    let entry_size = key_size + 8 + 8;
    let usable = PAGE_SIZE - 128;
    (usable / entry_size).clamp(8, 256)
}
