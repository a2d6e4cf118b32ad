//! # huddle-store
//!
//! Local, advisory persistence for the huddle client.
//!
//! Values are wrapped in a [`CacheItem`] envelope carrying a write timestamp
//! and an optional expiry, and written as JSON to a [`KeyValueStore`]:
//! either the SQLite-backed [`SqliteStore`] or the in-memory [`MemoryStore`].
//! The cache is never a source of truth, so [`LocalCache`] and
//! [`MessageCache`] swallow and log every persistence failure.

pub mod cache;
pub mod clock;
pub mod database;
pub mod kv;
pub mod messages;
pub mod migrations;

mod error;

pub use cache::{CacheItem, LocalCache};
pub use clock::{Clock, ManualClock, SystemClock};
pub use database::Database;
pub use error::{Result, StoreError};
pub use kv::{KeyValueStore, MemoryStore, SqliteStore};
pub use messages::MessageCache;
