//! Bridge between the collaboration engine and the content store.
//!
//! The collaboration engine calls [`Persistence::on_load`] when a tree is
//! opened and [`Persistence::on_store`] with every update it accepts. The
//! build orchestrator calls [`Persistence::flush`] to write each dirty tree's
//! materialized text to `content_root/<tree>`, the input of the build command.

use std::path::{Path, PathBuf};

use thiserror::Error;
use yrs::updates::decoder::Decode;
use yrs::{Doc, GetString, Transact, Update};

use crate::db::Database;
use crate::models::{is_valid_tree_name, DirtyTree};

/// Name of the shared text holding a tree's source.
pub const CONTENT_TEXT: &str = "content";

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("Invalid tree name: {0:?}")]
    InvalidTreeName(String),

    #[error("Invalid update for tree {tree}: {reason}")]
    InvalidUpdate { tree: String, reason: String },

    #[error("Stored state cannot be decoded: {0}")]
    CorruptState(String),

    #[error("Content store error: {0}")]
    Store(#[from] anyhow::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Outcome of one flush cycle.
#[derive(Debug, Default, Clone)]
pub struct FlushReport {
    /// Trees written and marked clean.
    pub flushed: Vec<String>,
    /// Trees written, but edited again during the flush; still dirty.
    pub requeued: Vec<String>,
    /// Trees that could not be written; still dirty.
    pub failed: Vec<(String, String)>,
}

impl FlushReport {
    pub fn is_clean(&self) -> bool {
        self.requeued.is_empty() && self.failed.is_empty()
    }
}

#[derive(Clone)]
pub struct Persistence {
    db: Database,
    content_root: PathBuf,
}

impl Persistence {
    pub fn new(db: Database, content_root: impl Into<PathBuf>) -> Self {
        Self {
            db,
            content_root: content_root.into(),
        }
    }

    pub fn content_root(&self) -> &Path {
        &self.content_root
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Directory next to the content root where snapshots are written before
    /// being renamed into place. No tree name can address it.
    pub fn staging_root(&self) -> PathBuf {
        let name = self
            .content_root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "trees".to_string());
        self.content_root.with_file_name(format!(".{name}-staging"))
    }

    /// Last stored state for `tree`, empty for a tree never stored.
    pub fn on_load(&self, tree: &str) -> Result<Vec<u8>, PersistenceError> {
        check_tree_name(tree)?;
        Ok(self.db.load_tree_state(tree)?.unwrap_or_default())
    }

    /// Merge `update` into the stored state of `tree` and mark it dirty.
    ///
    /// Every accepted update marks the tree dirty, including ones that do not
    /// change the text. Returns the tree's new revision.
    pub fn on_store(&self, tree: &str, update: &[u8]) -> Result<i64, PersistenceError> {
        check_tree_name(tree)?;

        // Validate before touching the store so a bad update leaves the tree as-is
        Update::decode_v1(update).map_err(|e| PersistenceError::InvalidUpdate {
            tree: tree.to_string(),
            reason: e.to_string(),
        })?;

        let revision = self.db.store_tree_update(tree, |existing| {
            let merged = match existing {
                Some(state) if !state.is_empty() => yrs::merge_updates_v1(&[state, update])
                    .map_err(|e| anyhow::anyhow!("Failed to merge update: {e}"))?,
                _ => update.to_vec(),
            };
            Ok(merged)
        })?;

        tracing::debug!(tree, revision, bytes = update.len(), "Stored update");
        Ok(revision)
    }

    /// Write every dirty tree to its snapshot file.
    ///
    /// A tree is marked clean only after its file is written and only if no
    /// store landed since its state was read. Failures are logged and leave
    /// the tree dirty for the next cycle.
    pub async fn flush(&self) -> Result<FlushReport, PersistenceError> {
        let dirty = self.db.dirty_trees()?;
        let mut report = FlushReport::default();

        if dirty.is_empty() {
            return Ok(report);
        }

        tokio::fs::create_dir_all(&self.content_root).await?;
        tokio::fs::create_dir_all(self.staging_root()).await?;

        for tree in dirty {
            let name = tree.name.clone();
            match self.flush_tree(tree).await {
                Ok(true) => report.flushed.push(name),
                Ok(false) => {
                    tracing::debug!(tree = %name, "Tree edited during flush, left dirty");
                    report.requeued.push(name);
                }
                Err(e) => {
                    tracing::error!(tree = %name, "Failed to flush tree: {}", e);
                    report.failed.push((name, e.to_string()));
                }
            }
        }

        tracing::info!(
            flushed = report.flushed.len(),
            requeued = report.requeued.len(),
            failed = report.failed.len(),
            "Flushed dirty trees"
        );
        Ok(report)
    }

    async fn flush_tree(&self, tree: DirtyTree) -> Result<bool, PersistenceError> {
        check_tree_name(&tree.name)?;
        let text = materialize(&tree.content)?;

        let target = self.content_root.join(&tree.name);
        let staging = self.staging_root().join(&tree.name);
        tokio::fs::write(&staging, text.as_bytes()).await?;
        tokio::fs::rename(&staging, &target).await?;

        Ok(self.db.mark_clean(&tree.name, tree.revision)?)
    }
}

/// Text of the [`CONTENT_TEXT`] shared type in an encoded document state.
pub fn materialize(state: &[u8]) -> Result<String, PersistenceError> {
    let doc = Doc::new();
    let text = doc.get_or_insert_text(CONTENT_TEXT);

    if !state.is_empty() {
        let update =
            Update::decode_v1(state).map_err(|e| PersistenceError::CorruptState(e.to_string()))?;
        let mut txn = doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| PersistenceError::CorruptState(e.to_string()))?;
    }

    let txn = doc.transact();
    Ok(text.get_string(&txn))
}

fn check_tree_name(tree: &str) -> Result<(), PersistenceError> {
    if is_valid_tree_name(tree) {
        Ok(())
    } else {
        Err(PersistenceError::InvalidTreeName(tree.to_string()))
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use yrs::{Doc, ReadTxn, StateVector, Text, Transact};

    use super::CONTENT_TEXT;

    /// Encoded state of a document whose content text is `text`.
    pub fn text_update(text: &str) -> Vec<u8> {
        let doc = Doc::new();
        let content = doc.get_or_insert_text(CONTENT_TEXT);
        {
            let mut txn = doc.transact_mut();
            content.insert(&mut txn, 0, text);
        }
        let txn = doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::text_update;
    use super::*;

    fn setup() -> (Persistence, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_memory().unwrap();
        db.migrate().unwrap();
        let persistence = Persistence::new(db, dir.path().join("trees"));
        (persistence, dir)
    }

    #[test]
    fn load_of_unknown_tree_is_empty() {
        let (persistence, _dir) = setup();
        assert!(persistence.on_load("ocl-0001").unwrap().is_empty());
    }

    #[test]
    fn store_marks_tree_dirty_and_bumps_revision() {
        let (persistence, _dir) = setup();
        let update = text_update("\\title{Hello}");

        assert_eq!(persistence.on_store("ocl-0001", &update).unwrap(), 1);
        // Same update again is a no-op for the text but still counts
        assert_eq!(persistence.on_store("ocl-0001", &update).unwrap(), 2);

        let tree = persistence.database().get_tree("ocl-0001").unwrap().unwrap();
        assert!(tree.dirty);
        assert_eq!(tree.revision, 2);
    }

    #[test]
    fn load_returns_merged_state() {
        let (persistence, _dir) = setup();
        persistence
            .on_store("ocl-0001", &text_update("\\title{Hello}"))
            .unwrap();

        let state = persistence.on_load("ocl-0001").unwrap();
        assert_eq!(materialize(&state).unwrap(), "\\title{Hello}");
    }

    #[test]
    fn rejects_garbage_update_without_marking_dirty() {
        let (persistence, _dir) = setup();
        let err = persistence.on_store("ocl-0001", &[0xff, 0xff, 0xff]).unwrap_err();
        assert!(matches!(err, PersistenceError::InvalidUpdate { .. }));
        assert!(persistence.database().get_tree("ocl-0001").unwrap().is_none());
    }

    #[test]
    fn rejects_path_like_tree_names() {
        let (persistence, _dir) = setup();
        let err = persistence.on_store("../escape", &text_update("x")).unwrap_err();
        assert!(matches!(err, PersistenceError::InvalidTreeName(_)));
    }

    #[tokio::test]
    async fn flush_writes_snapshot_and_clears_dirty() {
        let (persistence, _dir) = setup();
        persistence
            .on_store("ocl-0001", &text_update("\\title{Hello}"))
            .unwrap();

        let report = persistence.flush().await.unwrap();
        assert_eq!(report.flushed, vec!["ocl-0001".to_string()]);
        assert!(report.is_clean());

        let on_disk =
            std::fs::read_to_string(persistence.content_root().join("ocl-0001")).unwrap();
        assert_eq!(on_disk, "\\title{Hello}");

        let tree = persistence.database().get_tree("ocl-0001").unwrap().unwrap();
        assert!(!tree.dirty);
    }

    #[tokio::test]
    async fn flush_keeps_trees_with_staging_like_names_apart() {
        let (persistence, _dir) = setup();
        persistence
            .on_store(".ocl-0001.tmp", &text_update("OTHER TREE"))
            .unwrap();
        persistence.on_store("ocl-0001", &text_update("main")).unwrap();

        let report = persistence.flush().await.unwrap();
        assert_eq!(report.flushed, vec![".ocl-0001.tmp", "ocl-0001"]);

        let root = persistence.content_root();
        assert_eq!(
            std::fs::read_to_string(root.join(".ocl-0001.tmp")).unwrap(),
            "OTHER TREE"
        );
        assert_eq!(std::fs::read_to_string(root.join("ocl-0001")).unwrap(), "main");
        assert!(!persistence.staging_root().starts_with(root));
    }

    #[tokio::test]
    async fn flush_skips_clean_trees() {
        let (persistence, _dir) = setup();
        persistence.on_store("ocl-0001", &text_update("a")).unwrap();
        persistence.flush().await.unwrap();

        let report = persistence.flush().await.unwrap();
        assert!(report.flushed.is_empty());
    }

    #[tokio::test]
    async fn store_racing_a_flush_keeps_tree_dirty() {
        let (persistence, _dir) = setup();
        let db = persistence.database().clone();
        persistence.on_store("ocl-0001", &text_update("a")).unwrap();

        // Snapshot taken by a flush, then an edit lands before the clear
        let snapshot = db.dirty_trees().unwrap().remove(0);
        persistence.on_store("ocl-0001", &text_update("b")).unwrap();

        assert!(!db.mark_clean(&snapshot.name, snapshot.revision).unwrap());
        assert!(db.get_tree("ocl-0001").unwrap().unwrap().dirty);
    }

    #[tokio::test]
    async fn failed_write_leaves_tree_dirty() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_memory().unwrap();
        db.migrate().unwrap();

        // Content root is a regular file, so nothing can be written under it
        let blocked = dir.path().join("trees");
        std::fs::write(&blocked, "not a directory").unwrap();
        let persistence = Persistence::new(db.clone(), &blocked);

        persistence.on_store("ocl-0001", &text_update("a")).unwrap();
        assert!(persistence.flush().await.is_err());
        assert!(db.get_tree("ocl-0001").unwrap().unwrap().dirty);
    }
}
