use thiserror::Error;

use huddle_remote::RemoteError;

use crate::subscription::{SubscriptionState, Transition};

/// Errors surfaced by the client core's public operations.
#[derive(Error, Debug)]
pub enum ClientError {
    /// The record an operation needs does not exist.
    #[error("{0} not found")]
    NotFound(&'static str),

    /// The caller may not perform this mutation (not the owner or author).
    #[error("Not allowed to {0}")]
    Unauthorized(&'static str),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// The room session has been unmounted.
    #[error("Room session closed")]
    SessionClosed,

    #[error("Invalid subscription transition from {from:?} on {input:?}")]
    InvalidTransition {
        from: SubscriptionState,
        input: Transition,
    },
}

impl ClientError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_)) || matches!(self, Self::Remote(e) if e.is_not_found())
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ClientError>;
