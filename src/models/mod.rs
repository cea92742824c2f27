//! Domain models for the forest server.
//!
//! # Core Concepts
//!
//! ## Durable Entities
//!
//! - [`Tree`]: A named, collaboratively edited document. Its merged CRDT state
//!   lives in the content store together with a dirty flag and a revision.
//! - [`BuildResult`]: The outcome of the most recent build over the whole forest.
//!   Exactly one exists once the first build has run.
//!
//! ## Ephemeral Entities
//!
//! These are never persisted:
//!
//! - [`BuildEvent`]: Lifecycle notification carried by the notification bus.
//! - [`PreviewMessage`]: A single JSON message pushed to a preview connection.

mod build;
mod preview;
mod tree;

pub use build::*;
pub use preview::*;
pub use tree::*;
