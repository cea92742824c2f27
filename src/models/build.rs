use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of one build over the whole forest.
///
/// This is global: a failed build carries the same `stdout`/`stderr` for
/// every tree's preview.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BuildResult {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl BuildResult {
    pub fn succeeded(stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            success: true,
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }

    pub fn failed(stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }
}

/// The stored build result together with the time it was written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRecord {
    pub result: BuildResult,
    pub finished_at: DateTime<Utc>,
}

/// Build lifecycle event carried by the notification bus.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BuildEvent {
    Building,
    Finished,
}

/// Orchestrator state.
///
/// - `Idle`: waiting for a build request
/// - `Building`: flushing trees or running the build command
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BuildState {
    Idle,
    Building,
}

/// Snapshot of the orchestrator, observable through a watch channel.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct BuildStatus {
    pub state: BuildState,
    /// Number of builds that have finished since the server started.
    pub completed: u64,
}

impl Default for BuildStatus {
    fn default() -> Self {
        Self {
            state: BuildState::Idle,
            completed: 0,
        }
    }
}

/// Response for `GET /api/build`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildStatusResponse {
    pub status: BuildStatus,
    pub last_build: Option<BuildRecord>,
}
