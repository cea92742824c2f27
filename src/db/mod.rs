mod schema;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};

use crate::models::*;

/// Key of the singleton build result row.
const LAST_BUILD_RESULT: &str = "last_build_result";

/// Durable content store.
///
/// Holds the merged CRDT state of every tree with its dirty flag, and the
/// single most recent [`BuildResult`]. All access goes through one
/// connection behind a mutex, so each method is atomic with respect to the
/// others.
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn open(path: PathBuf) -> Result<Self> {
        let parent = path
            .parent()
            .ok_or_else(|| anyhow::anyhow!("Database path has no parent directory"))?;
        std::fs::create_dir_all(parent)?;
        let conn = Connection::open(&path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock().expect("database lock poisoned");
        schema::run_migrations(&conn)
    }

    // ============================================================
    // Tree operations
    // ============================================================

    /// Stored CRDT state for a tree, or `None` if it has never been stored.
    pub fn load_tree_state(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let content = conn
            .query_row("SELECT content FROM trees WHERE name = ?", [name], |row| {
                row.get::<_, Vec<u8>>(0)
            })
            .optional()?;
        Ok(content)
    }

    /// Replace a tree's state with `merge(existing)`, mark it dirty and bump
    /// its revision. Returns the new revision.
    ///
    /// The read, merge and write happen under one lock, so concurrent stores
    /// to the same tree cannot lose each other's updates. If `merge` fails
    /// nothing is written.
    pub fn store_tree_update<F>(&self, name: &str, merge: F) -> Result<i64>
    where
        F: FnOnce(Option<&[u8]>) -> Result<Vec<u8>>,
    {
        let mut conn = self.conn.lock().expect("database lock poisoned");
        let tx = conn.transaction()?;

        let existing: Option<Vec<u8>> = tx
            .query_row("SELECT content FROM trees WHERE name = ?", [name], |row| {
                row.get(0)
            })
            .optional()?;
        let merged = merge(existing.as_deref())?;

        let revision: i64 = tx.query_row(
            "INSERT INTO trees (name, content, dirty, revision, updated_at)
             VALUES (?1, ?2, 1, 1, ?3)
             ON CONFLICT(name) DO UPDATE SET
                content = excluded.content,
                dirty = 1,
                revision = trees.revision + 1,
                updated_at = excluded.updated_at
             RETURNING revision",
            (name, &merged, Utc::now().to_rfc3339()),
            |row| row.get(0),
        )?;

        tx.commit()?;
        Ok(revision)
    }

    pub fn get_tree(&self, name: &str) -> Result<Option<Tree>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let tree = conn
            .query_row(
                "SELECT name, dirty, revision, updated_at FROM trees WHERE name = ?",
                [name],
                row_to_tree,
            )
            .optional()?;
        Ok(tree)
    }

    pub fn list_trees(&self) -> Result<Vec<Tree>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let mut stmt =
            conn.prepare("SELECT name, dirty, revision, updated_at FROM trees ORDER BY name")?;

        let trees = stmt
            .query_map([], row_to_tree)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(trees)
    }

    /// Snapshot every dirty tree's state and revision.
    pub fn dirty_trees(&self) -> Result<Vec<DirtyTree>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT name, content, revision FROM trees WHERE dirty = 1 ORDER BY name",
        )?;

        let trees = stmt
            .query_map([], |row| {
                Ok(DirtyTree {
                    name: row.get(0)?,
                    content: row.get(1)?,
                    revision: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(trees)
    }

    /// Clear the dirty flag only if the tree is still at `revision`.
    ///
    /// Returns `false` when a store landed after the snapshot was taken; the
    /// tree then stays dirty.
    pub fn mark_clean(&self, name: &str, revision: i64) -> Result<bool> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let rows = conn.execute(
            "UPDATE trees SET dirty = 0 WHERE name = ? AND revision = ?",
            (name, revision),
        )?;
        Ok(rows > 0)
    }

    // ============================================================
    // Build result
    // ============================================================

    pub fn get_last_build_result(&self) -> Result<Option<BuildResult>> {
        Ok(self.get_last_build_record()?.map(|record| record.result))
    }

    pub fn get_last_build_record(&self) -> Result<Option<BuildRecord>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let row = conn
            .query_row(
                "SELECT value, updated_at FROM build_state WHERE key = ?",
                [LAST_BUILD_RESULT],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;

        let Some((value, updated_at)) = row else {
            return Ok(None);
        };

        let result: BuildResult =
            serde_json::from_str(&value).context("Stored build result is not valid JSON")?;
        Ok(Some(BuildRecord {
            result,
            finished_at: parse_datetime(updated_at),
        }))
    }

    /// Overwrite the singleton build result in one statement.
    pub fn set_last_build_result(&self, result: &BuildResult) -> Result<()> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let value = serde_json::to_string(result)?;

        conn.execute(
            "INSERT INTO build_state (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            (LAST_BUILD_RESULT, value, Utc::now().to_rfc3339()),
        )?;

        Ok(())
    }
}

impl Clone for Database {
    fn clone(&self) -> Self {
        Self {
            conn: self.conn.clone(),
        }
    }
}

fn row_to_tree(row: &rusqlite::Row<'_>) -> rusqlite::Result<Tree> {
    Ok(Tree {
        name: row.get(0)?,
        dirty: row.get::<_, i32>(1)? != 0,
        revision: row.get(2)?,
        updated_at: parse_datetime(row.get::<_, String>(3)?),
    })
}

fn parse_datetime(s: String) -> chrono::DateTime<Utc> {
    chrono::DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
