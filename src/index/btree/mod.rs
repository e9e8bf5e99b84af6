pub mod error;
pub mod index;
pub mod node;
pub mod serialization;

pub use error::BTreeError;
pub use index::{BTreeIndex, BTreeIterator};
pub use node::{BTreeNode, InternalNode, LeafNode, OpType};
pub use serialization::{calculate_btree_order, deserialize_node, serialize_node};
