//! Build orchestration.
//!
//! A single worker task owns the external build command. Requests from any
//! source go through a [`BuildHandle`]; requests that arrive while a build is
//! running collapse into one follow-up run.
//!
//! Each run:
//!
//! 1. takes the forest's [`BuildLock`]
//! 2. publishes [`BuildEvent::Building`]
//! 3. flushes dirty trees to the content root
//! 4. runs the build command
//! 5. stores the [`BuildResult`]
//! 6. publishes [`BuildEvent::Finished`]
//!
//! A cancelled run stops after step 4 without storing or publishing, so the
//! previous result stays current.

mod command;
mod lock;

pub use command::*;
pub use lock::*;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::models::{BuildEvent, BuildResult, BuildState, BuildStatus};
use crate::notify::NotificationBus;
use crate::persistence::Persistence;

pub struct BuildOrchestrator {
    persistence: Persistence,
    bus: NotificationBus,
    command: BuildCommand,
    built_root: PathBuf,
}

impl BuildOrchestrator {
    pub fn new(
        persistence: Persistence,
        bus: NotificationBus,
        command: BuildCommand,
        built_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            persistence,
            bus,
            command,
            built_root: built_root.into(),
        }
    }

    fn lock_path(&self) -> PathBuf {
        self.persistence.content_root().with_file_name(LOCK_FILE)
    }

    /// Start the worker task. It runs until `cancel` fires; an in-flight
    /// build is killed on cancellation.
    pub fn spawn(self, cancel: CancellationToken) -> BuildHandle {
        let requests = Arc::new(Notify::new());
        let (status_tx, status_rx) = watch::channel(BuildStatus::default());

        let worker = tokio::spawn(self.run(requests.clone(), status_tx, cancel.clone()));

        BuildHandle {
            requests,
            status: status_rx,
            cancel,
            worker: Arc::new(tokio::sync::Mutex::new(Some(worker))),
        }
    }

    async fn run(
        self,
        requests: Arc<Notify>,
        status: watch::Sender<BuildStatus>,
        cancel: CancellationToken,
    ) {
        tracing::info!("Build worker started");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = requests.notified() => {}
            }

            status.send_modify(|s| s.state = BuildState::Building);
            self.build_once(&cancel).await;
            status.send_modify(|s| {
                s.state = BuildState::Idle;
                s.completed += 1;
            });
        }

        tracing::info!("Build worker stopped");
    }

    /// Run one complete build cycle and return its result.
    ///
    /// The result is stored before `finished` is published, so every
    /// subscriber reacting to `finished` reads this run's result. Returns
    /// `None` if `cancel` fired first; nothing is stored then.
    pub async fn build_once(&self, cancel: &CancellationToken) -> Option<BuildResult> {
        let lock_path = self.lock_path();
        let _lock = match BuildLock::acquire(&lock_path, cancel).await {
            Ok(Some(lock)) => Some(lock),
            Ok(None) => {
                tracing::info!("Build cancelled while waiting for the forest lock");
                return None;
            }
            Err(e) => {
                tracing::warn!(path = %lock_path.display(), "Building without the forest lock: {}", e);
                None
            }
        };

        let started = Instant::now();
        self.bus.publish(BuildEvent::Building);

        match self.persistence.flush().await {
            Ok(report) if !report.is_clean() => {
                tracing::warn!(
                    requeued = ?report.requeued,
                    failed = report.failed.len(),
                    "Some trees stay dirty until the next build"
                );
            }
            Ok(_) => {}
            Err(e) => tracing::error!("Flush failed, building previous snapshots: {}", e),
        }

        if let Err(e) = tokio::fs::create_dir_all(&self.built_root).await {
            tracing::warn!(path = %self.built_root.display(), "Failed to create built root: {}", e);
        }

        let Some(result) = self
            .command
            .run(self.persistence.content_root(), &self.built_root, cancel)
            .await
        else {
            tracing::info!(
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Build cancelled, keeping the previous result"
            );
            return None;
        };

        if let Err(e) = self.persistence.database().set_last_build_result(&result) {
            tracing::error!("Failed to record build result: {:#}", e);
        }

        self.bus.publish(BuildEvent::Finished);

        tracing::info!(
            success = result.success,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Build finished"
        );
        Some(result)
    }
}

/// Cheap, cloneable access to the build worker.
#[derive(Clone)]
pub struct BuildHandle {
    requests: Arc<Notify>,
    status: watch::Receiver<BuildStatus>,
    cancel: CancellationToken,
    worker: Arc<tokio::sync::Mutex<Option<JoinHandle<()>>>>,
}

impl BuildHandle {
    /// Ask for a build. Returns immediately.
    ///
    /// If a build is running, at most one follow-up run is queued no matter
    /// how many requests arrive before it finishes.
    pub fn request(&self) {
        tracing::debug!(state = ?self.status.borrow().state, "Build requested");
        self.requests.notify_one();
    }

    pub fn status(&self) -> BuildStatus {
        *self.status.borrow()
    }

    /// Wait until the worker reports `state`.
    pub async fn wait_for_state(&self, state: BuildState) -> BuildStatus {
        let mut rx = self.status.clone();
        let result = rx.wait_for(|s| s.state == state).await.map(|s| *s);
        result.unwrap_or_else(|_| self.status())
    }

    /// Wait until at least `count` builds have finished.
    pub async fn wait_for_completed(&self, count: u64) -> BuildStatus {
        let mut rx = self.status.clone();
        let result = rx.wait_for(|s| s.completed >= count).await.map(|s| *s);
        result.unwrap_or_else(|_| self.status())
    }

    /// Stop the worker, killing any build in progress, and wait for it.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(worker) = self.worker.lock().await.take() {
            if let Err(e) = worker.await {
                tracing::error!("Build worker panicked: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::persistence::test_support::text_update;
    use std::path::Path;
    use std::time::Duration;

    struct Fixture {
        _dir: tempfile::TempDir,
        db: Database,
        persistence: Persistence,
        bus: NotificationBus,
        built_root: PathBuf,
        log: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_memory().unwrap();
        db.migrate().unwrap();
        let persistence = Persistence::new(db.clone(), dir.path().join("trees"));
        let built_root = dir.path().join("output");
        let log = dir.path().join("runs.log");
        Fixture {
            _dir: dir,
            db,
            persistence,
            bus: NotificationBus::default(),
            built_root,
            log,
        }
    }

    fn orchestrator(f: &Fixture, script: &str) -> BuildOrchestrator {
        let command = BuildCommand::new("sh").args(["-c", script]);
        BuildOrchestrator::new(f.persistence.clone(), f.bus.clone(), command, &f.built_root)
    }

    fn runs(log: &Path) -> usize {
        std::fs::read_to_string(log)
            .map(|s| s.lines().count())
            .unwrap_or(0)
    }

    #[tokio::test]
    async fn build_once_flushes_runs_and_records() {
        let f = fixture();
        f.persistence
            .on_store("ocl-0001", &text_update("\\title{One}"))
            .unwrap();
        let script = format!(
            "cp {trees}/ocl-0001 {out}/ocl-0001.xml",
            trees = f.persistence.content_root().display(),
            out = f.built_root.display()
        );

        let result = orchestrator(&f, &script)
            .build_once(&CancellationToken::new())
            .await
            .unwrap();

        assert!(result.success, "stderr: {}", result.stderr);
        assert_eq!(f.db.get_last_build_result().unwrap(), Some(result));
        assert!(!f.db.get_tree("ocl-0001").unwrap().unwrap().dirty);
        assert_eq!(
            std::fs::read_to_string(f.built_root.join("ocl-0001.xml")).unwrap(),
            "\\title{One}"
        );
    }

    #[tokio::test]
    async fn publishes_building_then_finished_after_recording() {
        let f = fixture();
        let mut events = f.bus.subscribe();
        let db = f.db.clone();

        let handle = orchestrator(&f, "echo 'parse error at line 4' >&2; exit 1")
            .spawn(CancellationToken::new());
        handle.request();

        assert_eq!(events.recv().await.unwrap(), BuildEvent::Building);
        assert_eq!(events.recv().await.unwrap(), BuildEvent::Finished);

        // Already stored when `finished` was observed
        let stored = db.get_last_build_result().unwrap().unwrap();
        assert!(!stored.success);
        assert_eq!(stored.stderr, "parse error at line 4\n");

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn requests_during_a_build_coalesce_into_one_follow_up() {
        let f = fixture();
        let script = format!("echo run >> {}; sleep 0.3", f.log.display());
        let handle = orchestrator(&f, &script).spawn(CancellationToken::new());

        handle.request();
        handle.wait_for_state(BuildState::Building).await;
        handle.request();
        handle.request();

        handle.wait_for_completed(2).await;
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(handle.status().completed, 2);
        assert_eq!(runs(&f.log), 2);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn never_runs_two_builds_at_once() {
        let f = fixture();
        let lock = f.log.with_extension("lock");
        let script = format!(
            "if [ -e {lock} ]; then echo overlap >> {log}; fi; touch {lock}; sleep 0.1; rm {lock}; echo run >> {log}",
            lock = lock.display(),
            log = f.log.display()
        );
        let handle = orchestrator(&f, &script).spawn(CancellationToken::new());

        for _ in 0..5 {
            handle.request();
            tokio::time::sleep(Duration::from_millis(30)).await;
        }
        handle.wait_for_completed(2).await;
        handle.wait_for_state(BuildState::Idle).await;

        let log = std::fs::read_to_string(&f.log).unwrap();
        assert!(!log.contains("overlap"));
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn recovers_after_a_failed_launch() {
        let f = fixture();
        let command = BuildCommand::new("/nonexistent/forest-compiler");
        let handle = BuildOrchestrator::new(
            f.persistence.clone(),
            f.bus.clone(),
            command,
            &f.built_root,
        )
        .spawn(CancellationToken::new());

        handle.request();
        let status = handle.wait_for_completed(1).await;
        assert_eq!(status.completed, 1);

        handle.request();
        handle.wait_for_completed(2).await;

        let stored = f.db.get_last_build_result().unwrap().unwrap();
        assert!(!stored.success);
        assert!(stored.stderr.contains("Failed to launch"));
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_kills_a_running_build() {
        let f = fixture();
        let handle = orchestrator(&f, "sleep 30").spawn(CancellationToken::new());

        handle.request();
        handle.wait_for_state(BuildState::Building).await;

        tokio::time::timeout(Duration::from_secs(5), handle.shutdown())
            .await
            .expect("shutdown should not wait for the build command");
    }

    #[tokio::test]
    async fn shutdown_keeps_the_previous_result() {
        let f = fixture();
        let previous = BuildResult::succeeded("ok", "");
        f.db.set_last_build_result(&previous).unwrap();
        let mut events = f.bus.subscribe();

        let handle = orchestrator(&f, "sleep 30").spawn(CancellationToken::new());
        handle.request();
        handle.wait_for_state(BuildState::Building).await;
        assert_eq!(events.recv().await.unwrap(), BuildEvent::Building);

        handle.shutdown().await;

        assert_eq!(f.db.get_last_build_result().unwrap(), Some(previous));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn waits_while_another_build_holds_the_forest() {
        let f = fixture();
        let orchestrator = orchestrator(&f, &format!("echo run >> {}", f.log.display()));
        let held = BuildLock::acquire(&orchestrator.lock_path(), &CancellationToken::new())
            .await
            .unwrap();

        let handle = orchestrator.spawn(CancellationToken::new());
        handle.request();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(runs(&f.log), 0);

        drop(held);
        handle.wait_for_completed(1).await;
        assert_eq!(runs(&f.log), 1);
        handle.shutdown().await;
    }
}
