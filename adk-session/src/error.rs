use chrono::{DateTime, Utc};
use thiserror::Error;

/// The error taxonomy a [`crate::SessionService`] implementation must
/// distinguish between. Callers that only want the workspace-wide error
/// type can convert via `.into()`.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The natural key does not match a non-deleted session.
    #[error("session not found")]
    NotFound,

    /// `create_session` collided with an existing non-deleted session.
    #[error("session already exists")]
    AlreadyExists,

    /// The caller's snapshot is older than the stored row
    /// (`stored_update_time > snapshot.last_update_time`).
    #[error(
        "stale session snapshot: stored update_time {stored} is newer than snapshot {snapshot}"
    )]
    Stale { stored: DateTime<Utc>, snapshot: DateTime<Utc> },

    /// The OCC witness (nonce) did not match, or the expected target
    /// version row was missing on re-read.
    #[error("version conflict advancing to version {expected}")]
    VersionConflict { expected: i64 },

    /// Transport or DDL failure from the backend adapter. Not retried by
    /// the service.
    #[error("backend IO error: {0}")]
    BackendIO(String),

    /// State JSON could not be decoded. Adapters choose their own recovery
    /// policy; this variant is for adapters that fail loudly rather than
    /// substitute an empty state.
    #[error("corrupted state for {context}: {detail}")]
    Corruption { context: String, detail: String },
}

pub type Result<T> = std::result::Result<T, SessionError>;

/// Lets callers that only care about the workspace-wide error type use
/// `?` against [`adk_core::Result`] directly.
impl From<SessionError> for adk_core::AdkError {
    fn from(err: SessionError) -> Self {
        adk_core::AdkError::Session(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_message() {
        assert_eq!(SessionError::NotFound.to_string(), "session not found");
    }

    #[test]
    fn test_converts_into_adk_error() {
        let err: adk_core::AdkError = SessionError::AlreadyExists.into();
        assert!(matches!(err, adk_core::AdkError::Session(_)));
    }
}
