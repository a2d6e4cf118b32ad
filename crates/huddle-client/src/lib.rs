//! # huddle-client
//!
//! Room messaging and membership core: paging, the room directory, the
//! messaging service with merge and dedup, and the live per-room
//! subscription with optimistic reconciliation.
//!
//! [`ChatClient`] is the composition root.  It is built from injected
//! [`huddle_remote::RowStore`], [`huddle_remote::ChangeFeed`] and
//! [`huddle_store::KeyValueStore`] instances, or from a [`ClientConfig`]
//! with [`ChatClient::connect`].

pub mod config;
pub mod directory;
pub mod events;
pub mod membership;
pub mod messaging;
pub mod pagination;
pub mod recent;
pub mod reconcile;
pub mod session;
pub mod subscription;

mod error;

use tracing_subscriber::{fmt, EnvFilter};

pub use config::ClientConfig;
pub use directory::{generate_access_code, JoinOutcome, RoomDirectory};
pub use error::{ClientError, Result};
pub use events::RoomEvent;
pub use membership::{MemberList, MembershipChange};
pub use messaging::MessagingService;
pub use pagination::{Page, Paginator};
pub use recent::RecentRoomIndex;
pub use reconcile::{merge_and_dedup, Applied, DedupPolicy, SeenIds, Timeline};
pub use session::{ChatClient, Identity, RoomSession};
pub use subscription::{RoomSubscription, SubscriptionState, Transition};

/// Install a `fmt` subscriber filtered by `RUST_LOG`.  Does nothing when a
/// global subscriber is already set.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("huddle_client=debug,huddle_remote=info,huddle_store=info,warn")
    });

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init();
}
