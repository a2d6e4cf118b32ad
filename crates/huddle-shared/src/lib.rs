//! # huddle-shared
//!
//! Identifiers, data model and change-feed event types shared by the
//! storage, remote and client crates.

pub mod constants;
pub mod models;
pub mod protocol;
pub mod types;

pub use models::{Message, MessageKind, RecentRoom, Room, RoomParticipant};
pub use protocol::{ChannelStatus, FeedEvent, MembershipNotice, Topic};
pub use types::{ConnectionHealth, MessageId, RoomId, SessionId, UserId};
