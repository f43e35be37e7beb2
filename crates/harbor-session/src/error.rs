use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;

/// Why a backend never became ready.
///
/// Cloneable so every waiter on a tracker observes the same failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReadinessError {
    #[error("status request returned {status}: {body}")]
    StatusFetch { status: StatusCode, body: String },
    #[error("backend reported terminal state: {0}")]
    TerminalState(String),
    #[error("unexpected line from status stream: {0}")]
    ProtocolViolation(String),
    #[error("status request failed: {0}")]
    Network(String),
    #[error("{stage} timed out after {after:?}")]
    Timeout { stage: &'static str, after: Duration },
    #[error("status stream closed before the backend became ready")]
    StreamClosed,
    #[error("readiness check cancelled")]
    Cancelled,
    #[error("invalid status url: {0}")]
    InvalidUrl(String),
    #[error("no async runtime available to run the readiness check")]
    NoRuntime,
}

impl From<reqwest::Error> for ReadinessError {
    fn from(err: reqwest::Error) -> Self {
        ReadinessError::Network(err.to_string())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("no async runtime available to drive the transport")]
    NoRuntime,
    #[error("transport closed")]
    Closed,
    #[error("transport not connected")]
    NotConnected,
    #[error("transport connect failed: {0}")]
    Connect(String),
    #[error("transport emit failed: {0}")]
    Emit(String),
}

pub type TransportResult<T> = Result<T, TransportError>;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid session url: {0}")]
    InvalidUrl(String),
    #[error(transparent)]
    Readiness(#[from] ReadinessError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}
