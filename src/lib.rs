//! Build-and-preview server for collaboratively edited forests.
//!
//! Trees are edited live through an external collaboration engine, which
//! persists through [`persistence::Persistence`]. A build request flushes dirty
//! trees to disk, runs the forest compiler once over everything, records the
//! result and notifies every open preview connection.

pub mod api;
pub mod build;
pub mod config;
pub mod db;
pub mod models;
pub mod notify;
pub mod persistence;
pub mod preview;
