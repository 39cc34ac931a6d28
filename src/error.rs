//! Error taxonomy shared by every agent.
//!
//! Every failure that crosses the wire carries an [`ErrorCode`]; free-text-only failures are never
//! sent. Orchestrator-facing operations additionally surface [`LeagueError`], which adds the
//! scheduling and stall conditions an operator has to act upon.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Machine-readable error code carried in every error reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Malformed envelope or unknown method.
    ProtocolError,
    /// Missing, unknown or mismatched-owner token.
    AuthError,
    /// Timeout, refused or reset connection.
    TransientNetworkError,
    /// A peer kept failing after every retry, or its circuit is open.
    PeerUnavailable,
    /// Illegal move or malformed parameters.
    ValidationError,
    /// A match could not be handed to any supervisor.
    SchedulingFailure,
    /// An id was registered twice.
    DuplicateId,
    /// A call arrived out of order (e.g. a move request without an accepted invitation).
    SequencingError,
    /// The operation is not allowed in the current lifecycle state.
    InvalidState,
    /// The addressed league, match or agent does not exist.
    NotFound,
    /// The peer failed while handling the call (5xx-equivalent).
    Internal,
}

impl ErrorCode {
    /// Wire representation of the code.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::ProtocolError => "PROTOCOL_ERROR",
            ErrorCode::AuthError => "AUTH_ERROR",
            ErrorCode::TransientNetworkError => "TRANSIENT_NETWORK_ERROR",
            ErrorCode::PeerUnavailable => "PEER_UNAVAILABLE",
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::SchedulingFailure => "SCHEDULING_FAILURE",
            ErrorCode::DuplicateId => "DUPLICATE_ID",
            ErrorCode::SequencingError => "SEQUENCING_ERROR",
            ErrorCode::InvalidState => "INVALID_STATE",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::Internal => "INTERNAL",
        }
    }

    /// Whether a remote reply carrying this code may succeed if the call is repeated.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorCode::TransientNetworkError | ErrorCode::Internal)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A coded failure, as produced by a method handler or received in an error reply.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("[{code}] {message}")]
pub struct ProtocolError {
    /// Taxonomy code.
    pub code: ErrorCode,
    /// Human readable detail, always including the affected ids.
    pub message: String,
}

impl ProtocolError {
    /// Create an error with an explicit code.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ProtocolError, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::AuthError, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ValidationError, message)
    }

    pub fn duplicate_id(id: &str) -> Self {
        Self::new(ErrorCode::DuplicateId, format!("id '{id}' is already registered"))
    }

    pub fn sequencing(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::SequencingError, message)
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidState, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }

    /// See [`ErrorCode::is_retryable`].
    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        ProtocolError::validation(format!("malformed parameters: {e}"))
    }
}

/// A match that could not be dispatched. The match stays unassigned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulingFailure {
    /// The match left unassigned.
    pub match_id: String,
    /// The supervisor that was tried, if any was available.
    pub supervisor_id: Option<String>,
    /// Code of the underlying cause.
    pub cause: ErrorCode,
    /// Detail of the underlying cause.
    pub message: String,
}

impl fmt::Display for SchedulingFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.supervisor_id {
            Some(sup) => write!(
                f,
                "match {} not assigned to {sup}: [{}] {}",
                self.match_id, self.cause, self.message
            ),
            None => write!(
                f,
                "match {} not assigned: [{}] {}",
                self.match_id, self.cause, self.message
            ),
        }
    }
}

/// Errors surfaced by the league orchestrator to whatever drives it.
#[derive(Debug, Error)]
pub enum LeagueError {
    /// A coded failure (registration, lifecycle, lookup, ...).
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    /// A single match could not be dispatched.
    #[error("{0}")]
    Scheduling(SchedulingFailure),
    /// The league cannot make progress without external remediation.
    #[error("league stalled, unassigned matches: {}", .unassigned.join(", "))]
    Stalled {
        /// Matches still waiting for a supervisor.
        unassigned: Vec<String>,
        /// Dispatch failures observed during the last attempt.
        failures: Vec<SchedulingFailure>,
    },
}

impl LeagueError {
    /// Taxonomy code of this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            LeagueError::Protocol(e) => e.code,
            LeagueError::Scheduling(_) | LeagueError::Stalled { .. } => {
                ErrorCode::SchedulingFailure
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_serialize_as_wire_strings() {
        let json = serde_json::to_string(&ErrorCode::PeerUnavailable).unwrap();
        assert_eq!(json, "\"PEER_UNAVAILABLE\"");
        for code in [
            ErrorCode::ProtocolError,
            ErrorCode::AuthError,
            ErrorCode::SequencingError,
            ErrorCode::Internal,
        ] {
            let json = serde_json::to_string(&code).unwrap();
            assert_eq!(json, format!("\"{}\"", code.as_str()));
        }
    }

    #[test]
    fn only_transient_codes_are_retryable() {
        assert!(ErrorCode::TransientNetworkError.is_retryable());
        assert!(ErrorCode::Internal.is_retryable());
        assert!(!ErrorCode::AuthError.is_retryable());
        assert!(!ErrorCode::ProtocolError.is_retryable());
        assert!(!ErrorCode::ValidationError.is_retryable());
    }

    #[test]
    fn stalled_lists_matches() {
        let err = LeagueError::Stalled {
            unassigned: vec!["m1".into(), "m2".into()],
            failures: vec![],
        };
        assert_eq!(err.code(), ErrorCode::SchedulingFailure);
        assert!(err.to_string().contains("m1, m2"));
    }
}
