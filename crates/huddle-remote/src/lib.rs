//! # huddle-remote
//!
//! The contract the client core relies on from the hosted backend: a
//! row store with filter/order/range queries and conflict-target upserts
//! ([`RowStore`]), and a per-room push channel ([`ChangeFeed`]).
//!
//! Three implementations ship with the crate:
//! - [`MemoryBackend`]: both traits in-process, for tests and offline work
//! - [`RestStore`]: [`RowStore`] over a PostgREST HTTP endpoint
//! - [`RealtimeFeed`]: [`ChangeFeed`] over a Phoenix-channel websocket

pub mod feed;
pub mod hub;
pub mod memory;
pub mod query;
pub mod realtime;
pub mod rest;
pub mod store;

mod error;

pub use error::{RemoteError, Result};
pub use feed::{ChangeFeed, FeedSubscription, SubscriptionHandle};
pub use memory::MemoryBackend;
pub use query::{from_row, from_rows, to_row, Direction, Filter, FilterOp, Order, Query, Row, Table};
pub use realtime::RealtimeFeed;
pub use rest::RestStore;
pub use store::RowStore;
