//! The compacted context tree and its node storage.

mod arena;
mod context_tree;

pub use arena::{Node, NodeArena, NodeId};
pub use context_tree::{
    ContextTree, DfsPathIterator, InsertAction, Insertion, NodePath, PathNode,
};
