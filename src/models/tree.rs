use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A named document in the forest.
///
/// Trees are created on first load or edit and are never deleted by the
/// server. `dirty` is set by every accepted store and cleared by a flush that
/// observed the same `revision`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tree {
    pub name: String,
    pub dirty: bool,
    /// Bumped by every accepted store.
    pub revision: i64,
    pub updated_at: DateTime<Utc>,
}

/// Merged CRDT state of a dirty tree, captured for a flush.
#[derive(Debug, Clone)]
pub struct DirtyTree {
    pub name: String,
    pub content: Vec<u8>,
    pub revision: i64,
}

/// Response body for an accepted store.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreReceipt {
    pub revision: i64,
}

/// Check that a tree name is usable as a single file name under the content
/// and built roots.
pub fn is_valid_tree_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0'])
}
