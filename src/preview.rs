//! Per-connection preview state machine.
//!
//! ```text
//! AwaitingFirstResult ──initial()──▶ Streaming ──close()──▶ Closed
//!                                     │    ▲
//!                                     └────┘ next(): one message per bus event
//! ```
//!
//! A session subscribes to the notification bus before it reads anything, so
//! no `finished` published after [`PreviewSession::open`] can be missed. A
//! reconnecting client re-derives its status from the stored build result,
//! never from bus history.

use std::path::PathBuf;

use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

use crate::db::Database;
use crate::models::{BuildEvent, BuildResult, PreviewMessage};
use crate::notify::{NotificationBus, Subscription};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Build notifications are no longer available")]
    BusClosed,

    #[error("Session is closed")]
    Closed,

    #[error("Content store error: {0}")]
    Store(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingFirstResult,
    Streaming,
    Closed,
}

pub struct PreviewSession {
    id: Uuid,
    tree: String,
    built_root: PathBuf,
    db: Database,
    events: Option<Subscription>,
    state: SessionState,
}

impl PreviewSession {
    /// Subscribe to build events for a preview of `tree`.
    pub fn open(
        tree: impl Into<String>,
        built_root: impl Into<PathBuf>,
        db: Database,
        bus: &NotificationBus,
    ) -> Self {
        let events = bus.subscribe();
        let session = Self {
            id: Uuid::new_v4(),
            tree: tree.into(),
            built_root: built_root.into(),
            db,
            events: Some(events),
            state: SessionState::AwaitingFirstResult,
        };
        tracing::debug!(session = %session.id, tree = %session.tree, "Preview session opened");
        session
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Current status for a newly connected client.
    ///
    /// With no build ever run this is `building`: the session waits for a
    /// build rather than requesting one.
    pub async fn initial(&mut self) -> Result<PreviewMessage, SessionError> {
        if self.state == SessionState::Closed {
            return Err(SessionError::Closed);
        }
        let message = self.resolve(true).await?;
        self.state = SessionState::Streaming;
        // resolve(true) always yields a message
        Ok(message.unwrap_or(PreviewMessage::Building))
    }

    /// Wait for the next message to push.
    ///
    /// `building` events are forwarded as-is; `finished` re-reads the stored
    /// result. If this session fell behind the bus, it catches up from the
    /// stored result instead of replaying missed events.
    pub async fn next(&mut self) -> Result<PreviewMessage, SessionError> {
        loop {
            let events = self.events.as_mut().ok_or(SessionError::Closed)?;

            let event = match events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(session = %self.id, skipped, "Preview session lagged, resynchronizing");
                    BuildEvent::Finished
                }
                Err(RecvError::Closed) => {
                    self.close();
                    return Err(SessionError::BusClosed);
                }
            };

            match event {
                BuildEvent::Building => return Ok(PreviewMessage::Building),
                BuildEvent::Finished => {
                    if let Some(message) = self.resolve(false).await? {
                        return Ok(message);
                    }
                }
            }
        }
    }

    /// Build the message describing the stored build result for this tree.
    ///
    /// Returns `None` only when no build has ever finished and `first` is
    /// false.
    pub async fn resolve(&self, first: bool) -> Result<Option<PreviewMessage>, SessionError> {
        let Some(result) = self.db.get_last_build_result()? else {
            return Ok(first.then_some(PreviewMessage::Building));
        };

        if !result.success {
            return Ok(Some(PreviewMessage::failed(result)));
        }

        let artifact = self.built_root.join(format!("{}.xml", self.tree));
        match tokio::fs::read_to_string(&artifact).await {
            Ok(content) => Ok(Some(PreviewMessage::rendered(content))),
            Err(e) => {
                tracing::warn!(
                    session = %self.id,
                    path = %artifact.display(),
                    "Build succeeded but artifact is unreadable: {}",
                    e
                );
                Ok(Some(PreviewMessage::failed(BuildResult::failed(
                    "",
                    format!("No built output for tree {:?}: {}", self.tree, e),
                ))))
            }
        }
    }

    /// Drop the subscription. Further calls to [`next`](Self::next) fail.
    pub fn close(&mut self) {
        if self.state != SessionState::Closed {
            self.events = None;
            self.state = SessionState::Closed;
            tracing::debug!(session = %self.id, tree = %self.tree, "Preview session closed");
        }
    }
}

impl Drop for PreviewSession {
    fn drop(&mut self) {
        self.close();
    }
}
