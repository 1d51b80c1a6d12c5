//! # murmur-store
//!
//! Storage for the murmur call client.
//!
//! Two very different stores live here:
//! - the **signaling store**, an external, eventually-consistent document
//!   store shared by both parties of a call, reached through the
//!   [`SignalingStore`] trait (with [`MemorySignalingStore`] as the
//!   in-process backend);
//! - the **local database**, a synchronous SQLite [`Database`] holding the
//!   user's own call history.

pub mod call_logs;
pub mod database;
pub mod memory;
pub mod migrations;
pub mod signaling;

mod error;

pub use database::Database;
pub use error::{Result, StoreError};
pub use memory::MemorySignalingStore;
pub use signaling::{SignalingStore, Subscription};
