//! Error taxonomy shared by every relay crate.

use std::time::Duration;

use crate::ids::SessionId;

/// Error taxonomy for session create/join and frame delivery.
///
/// Validation and not-found errors reject a connection attempt outright.
/// Transport errors end exactly one connection: the whole session when they
/// hit the producer, a single subscriber otherwise.
#[derive(Clone, Debug, thiserror::Error)]
pub enum RelayError {
    // Client errors
    /// The `sessionId` query parameter was missing or empty.
    #[error("missing or empty sessionId")]
    InvalidSessionId,
    /// No active session is registered under the id.
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),
    /// The session exists but no longer accepts subscribers.
    #[error("session is closing: {0}")]
    SessionClosing(SessionId),

    // Transport errors
    /// A read or write on the underlying connection failed.
    #[error("transport error: {0}")]
    Transport(String),
    /// A single write did not complete in time.
    #[error("write timed out after {0:?}")]
    WriteTimeout(Duration),
    /// The peer stopped answering pings.
    #[error("no pong received within {0:?}")]
    HeartbeatTimeout(Duration),
}

impl RelayError {
    /// Wrap any displayable transport failure.
    pub fn transport(err: impl std::fmt::Display) -> Self {
        Self::Transport(err.to_string())
    }

    /// Rejections caused by the request itself rather than by I/O.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidSessionId | Self::SessionNotFound(_) | Self::SessionClosing(_)
        )
    }

    /// Short classification string for logging/metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidSessionId => "invalid_session_id",
            Self::SessionNotFound(_) => "session_not_found",
            Self::SessionClosing(_) => "session_closing",
            Self::Transport(_) => "transport",
            Self::WriteTimeout(_) => "write_timeout",
            Self::HeartbeatTimeout(_) => "heartbeat_timeout",
        }
    }
}

/// Result alias defaulting to [`RelayError`].
pub type Result<T, E = RelayError> = std::result::Result<T, E>;
