//! Cross-process exclusion for builds of one forest.
//!
//! The server's worker and the one-shot `build` command both write the same
//! content and built roots. Each build holds an advisory lock on a file in the
//! forest directory for its whole run, so the two never overlap.

use std::fs::{File, OpenOptions, TryLockError};
use std::io;
use std::path::Path;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// File name of the lock, next to the content root.
pub const LOCK_FILE: &str = ".build.lock";

const RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Held for the duration of one build; released on drop.
#[derive(Debug)]
pub struct BuildLock {
    _file: File,
}

impl BuildLock {
    /// Take the lock at `path`, waiting while another build holds it.
    ///
    /// Returns `None` if `cancel` fires before the lock is free.
    pub async fn acquire(path: &Path, cancel: &CancellationToken) -> io::Result<Option<Self>> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;

        let mut waiting = false;
        loop {
            match file.try_lock() {
                Ok(()) => return Ok(Some(Self { _file: file })),
                Err(TryLockError::WouldBlock) => {}
                Err(TryLockError::Error(e)) => return Err(e),
            }

            if !waiting {
                tracing::info!(path = %path.display(), "Another build is running on this forest, waiting");
                waiting = true;
            }

            tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                _ = tokio::time::sleep(RETRY_INTERVAL) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_holder_waits_until_the_first_releases() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(LOCK_FILE);
        let never = CancellationToken::new();

        let first = BuildLock::acquire(&path, &never).await.unwrap();
        assert!(first.is_some());

        let cancel = CancellationToken::new();
        let give_up = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            give_up.cancel();
        });
        assert!(BuildLock::acquire(&path, &cancel).await.unwrap().is_none());

        drop(first);
        assert!(BuildLock::acquire(&path, &never).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn creates_the_forest_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("forest").join(LOCK_FILE);

        let lock = BuildLock::acquire(&path, &CancellationToken::new())
            .await
            .unwrap();
        assert!(lock.is_some());
        assert!(path.exists());
    }
}
