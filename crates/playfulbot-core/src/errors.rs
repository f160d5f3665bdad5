use std::time::Duration;

use crate::ids::Endpoint;
use crate::status::{Code, Status};

/// Failures while applying a state patch or keeping versions in step.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum PatchError {
    #[error("malformed patch document: {0}")]
    Malformed(String),
    #[error("path does not resolve: {0}")]
    InvalidPointer(String),
    #[error("test failed at {0}")]
    TestFailed(String),
    #[error("version gap unresolved: expected {expected}, received {received}")]
    VersionGap { expected: u64, received: u64 },
}

/// Error hierarchy for a bot run.
///
/// Connection and stream failures are terminal for the affected game; patch
/// and protocol failures propagate exactly like stream failures.
#[derive(Clone, Debug, thiserror::Error)]
pub enum BotError {
    #[error("connection to {endpoint} failed: {status}")]
    Connection { endpoint: Endpoint, status: Status },
    #[error("connection to {endpoint} timed out after {timeout:?}")]
    ConnectTimeout { endpoint: Endpoint, timeout: Duration },
    #[error("stream error: {0}")]
    Stream(#[from] Status),
    #[error("patch error: {0}")]
    Patch(#[from] PatchError),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("cancelled")]
    Cancelled,
    #[error("{0}")]
    Internal(String),
}

impl BotError {
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// Status code the failure surfaces with.
    pub fn code(&self) -> Code {
        match self {
            Self::Connection { status, .. } => status.code,
            Self::ConnectTimeout { .. } => Code::DeadlineExceeded,
            Self::Stream(status) => status.code,
            Self::Patch(_) => Code::FailedPrecondition,
            Self::Protocol(_) => Code::InvalidArgument,
            Self::Cancelled => Code::Cancelled,
            Self::Internal(_) => Code::Internal,
        }
    }

    /// Message without the classification prefix.
    pub fn message(&self) -> String {
        match self {
            Self::Connection { status, .. } | Self::Stream(status) => status.message.clone(),
            Self::Patch(e) => e.to_string(),
            Self::Protocol(m) | Self::Internal(m) => m.clone(),
            other => other.to_string(),
        }
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Connection { .. } => "connection",
            Self::ConnectTimeout { .. } => "connect_timeout",
            Self::Stream(_) => "stream",
            Self::Patch(_) => "patch",
            Self::Protocol(_) => "protocol",
            Self::Cancelled => "cancelled",
            Self::Internal(_) => "internal",
        }
    }

    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::ConnectTimeout { .. })
    }
}

impl From<serde_json::Error> for BotError {
    fn from(e: serde_json::Error) -> Self {
        Self::Protocol(e.to_string())
    }
}
