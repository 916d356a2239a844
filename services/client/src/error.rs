//! services/client/src/error.rs
//!
//! Error types for the client service: `ClientError` for process-level failures in the
//! binary, and `SessionError` for everything a session operation can report back to the
//! presentation layer.

use crate::config::ConfigError;
use study_sync_core::code::CodeError;
use study_sync_core::ports::PortError;
use study_sync_core::timer::TimerError;

/// The primary error type for the `study-client` binary.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Service Port Error: {0}")]
    Port(#[from] PortError),

    #[error("Session Error: {0}")]
    Session(#[from] SessionError),

    #[error("Database Error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration Error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("WebSocket Error: {0}")]
    Websocket(#[from] axum::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("An unexpected internal error occurred: {0}")]
    Internal(String),
}

/// Failures of a session operation. Nothing here is fatal; each variant degrades to an
/// inline message, a retry on the next natural cycle, or a silent fallback.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// A store or relay call failed; the next tick, poll or heartbeat retries it.
    #[error("Temporary failure talking to the backend: {0}")]
    TransientIo(String),

    /// Duplicate display name, unknown join code and the like.
    #[error("{0}")]
    Conflict(String),

    #[error("You need to be signed in to do that")]
    Unauthorized,

    /// The relay is unreachable; polling covers for it.
    #[error("Realtime channel unavailable: {0}")]
    ChannelDegraded(String),

    /// The row was already gone, usually because another client got there first.
    #[error("Already removed: {0}")]
    DeletionRace(String),

    /// The intent does not apply in the current session or timer state.
    #[error("{0}")]
    InvalidState(String),

    #[error("{0}")]
    Validation(String),
}

impl SessionError {
    /// Whether the presentation layer should show this to the user.
    pub fn is_user_facing(&self) -> bool {
        !matches!(
            self,
            SessionError::ChannelDegraded(_) | SessionError::DeletionRace(_)
        )
    }
}

impl From<PortError> for SessionError {
    fn from(err: PortError) -> Self {
        match err {
            PortError::NotFound(what) => SessionError::DeletionRace(what),
            PortError::Conflict(what) => SessionError::Conflict(what),
            PortError::Unauthorized => SessionError::Unauthorized,
            PortError::ChannelClosed(what) => SessionError::ChannelDegraded(what),
            PortError::Unexpected(what) => SessionError::TransientIo(what),
        }
    }
}

impl From<TimerError> for SessionError {
    fn from(err: TimerError) -> Self {
        match err {
            TimerError::InvalidSettings(reason) => SessionError::Validation(reason),
            other => SessionError::InvalidState(other.to_string()),
        }
    }
}

impl From<CodeError> for SessionError {
    fn from(err: CodeError) -> Self {
        SessionError::Validation(err.to_string())
    }
}

pub type SessionResult<T> = Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;
    use study_sync_core::domain::TimerState;

    #[test]
    fn port_errors_map_onto_the_session_taxonomy() {
        assert_eq!(
            SessionError::from(PortError::ChannelClosed("group-1".into())),
            SessionError::ChannelDegraded("group-1".into())
        );
        assert_eq!(
            SessionError::from(PortError::NotFound("member".into())),
            SessionError::DeletionRace("member".into())
        );
        assert_eq!(SessionError::from(PortError::Unauthorized), SessionError::Unauthorized);
    }

    #[test]
    fn degraded_channels_and_races_stay_silent() {
        assert!(!SessionError::ChannelDegraded("x".into()).is_user_facing());
        assert!(!SessionError::DeletionRace("x".into()).is_user_facing());
        assert!(SessionError::TransientIo("x".into()).is_user_facing());
    }

    #[test]
    fn timer_errors_become_rejected_intents() {
        let err = SessionError::from(TimerError::InvalidTransition {
            from: TimerState::Idle,
            action: "quit",
        });
        assert!(matches!(err, SessionError::InvalidState(_)));
        assert!(matches!(
            SessionError::from(TimerError::InvalidSettings("focusTime".into())),
            SessionError::Validation(_)
        ));
    }
}
