//! Error types for the playback core.
//!
//! The frame queue and cue tracker never fail (they drop or return `None`).
//! Everything that can fail in the session lifecycle reports a
//! [`PlaybackError`].

use crate::session::SessionState;

/// Error type for playback operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackError {
    /// A codec or track is missing. Recoverable by falling back to another
    /// decode path or reselecting tracks.
    ResourceUnavailable(String),
    /// The backend failed mid-stream. Fatal to the current session; recover
    /// with `prepare()` from Stopped or a full `release()` + new player.
    BackendFailure(String),
    /// A seek or thread join exceeded its bound. Playback continues from the
    /// last good position.
    Timeout(String),
    /// The operation is not legal in the current state.
    InvalidTransition {
        /// Name of the rejected operation
        operation: &'static str,
        /// State the session was in when the call was made
        state: SessionState,
    },
}

impl PlaybackError {
    /// Returns true if this error ends the current session.
    pub fn is_fatal(&self) -> bool {
        matches!(self, PlaybackError::BackendFailure(_))
    }
}

impl std::fmt::Display for PlaybackError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlaybackError::ResourceUnavailable(msg) => write!(f, "Resource unavailable: {msg}"),
            PlaybackError::BackendFailure(msg) => write!(f, "Backend failure: {msg}"),
            PlaybackError::Timeout(msg) => write!(f, "Timed out: {msg}"),
            PlaybackError::InvalidTransition { operation, state } => {
                write!(f, "Invalid transition: {operation}() not allowed in state {state:?}")
            }
        }
    }
}

impl std::error::Error for PlaybackError {}
