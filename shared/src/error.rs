//! Error taxonomy shared by the server hub and its clients.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Protocol-level failure, sent to the originating participant only.
///
/// Rejections never partially apply: by the time a `SyncError` is produced
/// for an intent, no session state has been touched and nothing has been
/// broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
pub enum SyncError {
    /// Role or ownership violation.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Unknown session, character or participant.
    #[error("not found: {0}")]
    NotFound(String),

    /// The payload failed validation or could not be decoded.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// The transport dropped. Handled by the client's reconnect flow.
    #[error("connection lost")]
    ConnectionLost,

    /// The session is over; every participant has been evicted.
    #[error("session ended")]
    SessionEnded,
}

impl SyncError {
    pub fn unauthorized(reason: impl Into<String>) -> Self {
        SyncError::Unauthorized(reason.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        SyncError::NotFound(what.into())
    }

    pub fn malformed(reason: impl Into<String>) -> Self {
        SyncError::MalformedPayload(reason.into())
    }

    /// Errors after which retrying the same join cannot succeed.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SyncError::NotFound(_) | SyncError::Unauthorized(_) | SyncError::SessionEnded
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            SyncError::unauthorized("sketch is master-only").to_string(),
            "unauthorized: sketch is master-only"
        );
        assert_eq!(SyncError::ConnectionLost.to_string(), "connection lost");
    }

    #[test]
    fn test_terminal_errors() {
        assert!(SyncError::not_found("session 4").is_terminal());
        assert!(SyncError::SessionEnded.is_terminal());
        assert!(!SyncError::ConnectionLost.is_terminal());
        assert!(!SyncError::malformed("bad frame").is_terminal());
    }
}
