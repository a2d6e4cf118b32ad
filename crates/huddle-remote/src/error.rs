use thiserror::Error;

/// Errors produced by the remote store and change feed.
#[derive(Error, Debug)]
pub enum RemoteError {
    /// A single-row lookup matched nothing.
    #[error("Record not found")]
    NotFound,

    /// An identifier did not have the shape of the column it was compared to
    /// (e.g. a legacy numeric code sent where a UUID was expected).
    #[error("Malformed identifier: {0}")]
    MalformedIdentifier(String),

    /// A write collided with a declared unique constraint.
    #[error("Unique constraint violated: {0}")]
    UniqueViolation(String),

    /// The backend is unreachable.
    #[error("Remote store unavailable")]
    Unavailable,

    /// Non-2xx response from the server.
    #[error("HTTP {status}: {message}")]
    Http {
        status: u16,
        code: Option<String>,
        message: String,
    },

    /// Request never produced a response.
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Push-channel transport failure.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// A row or payload did not decode into the expected shape.
    #[error("Decode error: {0}")]
    Decode(#[from] serde_json::Error),

    /// The server answered with something the contract does not allow.
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    /// The channel or backend has been shut down.
    #[error("Channel closed")]
    Closed,
}

impl RemoteError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }

    pub fn is_unique_violation(&self) -> bool {
        matches!(self, Self::UniqueViolation(_))
    }

    pub fn is_malformed_identifier(&self) -> bool {
        matches!(self, Self::MalformedIdentifier(_))
    }

    /// Failures of the network path itself, as opposed to answers from the
    /// server about the request.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Unavailable | Self::Transport(_) | Self::WebSocket(_) | Self::Closed
        ) || matches!(self, Self::Http { status, .. } if *status >= 500)
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, RemoteError>;
