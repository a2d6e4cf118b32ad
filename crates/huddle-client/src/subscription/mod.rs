//! Live per-room subscription: one explicit state machine plus the manager
//! that drives it from channel events and health checks.

mod manager;
mod state;

pub use manager::{RoomSubscription, SubscriptionContext, SubscriptionOptions};
pub use state::{SubscriptionState, Transition};
