//! Error taxonomy for the engine and tool surface.
//!
//! Every error that can cross the tool boundary carries a stable [`ErrorCode`]
//! that clients can dispatch on. Internal modules return [`EngramError`]; the
//! tool layer serializes it to a `{code, message}` JSON object.

use thiserror::Error;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, EngramError>;

/// Stable error codes exposed over the tool protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    InvalidArguments,
    InvalidContent,
    NotFound,
    Conflict,
    DimensionMismatch,
    Initializing,
    Draining,
    Timeout,
    BackendUnavailable,
    InvalidTransition,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidArguments => "INVALID_ARGUMENTS",
            Self::InvalidContent => "INVALID_CONTENT",
            Self::NotFound => "NOT_FOUND",
            Self::Conflict => "CONFLICT",
            Self::DimensionMismatch => "DIMENSION_MISMATCH",
            Self::Initializing => "INITIALIZING",
            Self::Draining => "DRAINING",
            Self::Timeout => "TIMEOUT",
            Self::BackendUnavailable => "BACKEND_UNAVAILABLE",
            Self::InvalidTransition => "INVALID_TRANSITION",
            Self::Internal => "INTERNAL",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors produced by the memory engine.
#[derive(Error, Debug)]
pub enum EngramError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("invalid content: {0}")]
    InvalidContent(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("engine is initializing (state: {0})")]
    Initializing(String),

    #[error("engine is draining, no new calls accepted")]
    Draining,

    #[error("operation deadline exceeded")]
    Timeout,

    #[error("backend unavailable: {0}")]
    Backend(String),

    #[error("invalid migration transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("internal error")]
    Internal(String),
}

impl EngramError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidArguments(_) => ErrorCode::InvalidArguments,
            Self::InvalidContent(_) => ErrorCode::InvalidContent,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::Conflict(_) => ErrorCode::Conflict,
            Self::DimensionMismatch { .. } => ErrorCode::DimensionMismatch,
            Self::Initializing(_) => ErrorCode::Initializing,
            Self::Draining => ErrorCode::Draining,
            Self::Timeout => ErrorCode::Timeout,
            Self::Backend(_) => ErrorCode::BackendUnavailable,
            Self::InvalidTransition { .. } => ErrorCode::InvalidTransition,
            Self::Internal(_) => ErrorCode::Internal,
        }
    }

    /// `true` for transient infrastructure errors that a write path may retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Backend(_) | Self::Timeout | Self::DimensionMismatch { .. }
        )
    }

    pub fn invalid_arguments(msg: impl Into<String>) -> Self {
        Self::InvalidArguments(msg.into())
    }

    pub fn invalid_content(msg: impl Into<String>) -> Self {
        Self::InvalidContent(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Serialize to the `{code, message}` JSON object returned over the wire.
    ///
    /// `Internal` deliberately reports a stable message so backend details
    /// never leak to callers; the real cause goes to the log.
    pub fn to_rpc_json(&self) -> String {
        let message = match self {
            Self::Internal(detail) => {
                tracing::error!(detail = %detail, "internal error surfaced to caller");
                "internal error".to_string()
            }
            other => other.to_string(),
        };
        serde_json::json!({
            "code": self.code().as_str(),
            "message": message,
        })
        .to_string()
    }
}

impl From<rusqlite::Error> for EngramError {
    fn from(e: rusqlite::Error) -> Self {
        match e {
            rusqlite::Error::QueryReturnedNoRows => Self::NotFound("no such row".into()),
            other => Self::Backend(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for EngramError {
    fn from(e: serde_json::Error) -> Self {
        Self::Internal(format!("json: {e}"))
    }
}
