//! Client-visible error taxonomy
//!
//! Every error leaving the daemon has a kind from this fixed set, a
//! message, and a retryable flag. The wire shape is shared across all
//! request types: `{"error": {"kind", "message", "retryable"}}`.

use crate::engine::EngineError;
use crate::store::StoreError;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    BadRequest,
    RejectedPrivacy,
    NotFound,
    StorageFull,
    Corrupt,
    Timeout,
    AlreadyRunning,
    BackendError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadRequest => "BadRequest",
            Self::RejectedPrivacy => "Rejected(Privacy)",
            Self::NotFound => "NotFound",
            Self::StorageFull => "StorageFull",
            Self::Corrupt => "Corrupt",
            Self::Timeout => "Timeout",
            Self::AlreadyRunning => "AlreadyRunning",
            Self::BackendError => "BackendError",
        }
    }

    /// Whether the client may retry with unchanged inputs.
    pub fn retryable(&self) -> bool {
        matches!(self, Self::Timeout | Self::BackendError)
    }
}

/// An error ready for the wire.
#[derive(Debug, Error)]
#[error("{kind:?}: {message}")]
pub struct WireError {
    pub kind: ErrorKind,
    pub message: String,
}

impl WireError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadRequest, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            kind: self.kind.as_str(),
            message: self.message.clone(),
            retryable: self.kind.retryable(),
        }
    }
}

/// The serialized `error` object.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub kind: &'static str,
    pub message: String,
    pub retryable: bool,
}

impl From<StoreError> for WireError {
    fn from(e: StoreError) -> Self {
        let kind = match &e {
            StoreError::StorageFull => ErrorKind::StorageFull,
            StoreError::Corrupt(_) => ErrorKind::Corrupt,
            StoreError::Closed | StoreError::Backend(_) => ErrorKind::BackendError,
        };
        Self::new(kind, e.to_string())
    }
}

impl From<EngineError> for WireError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::BadRequest(message) => Self::new(ErrorKind::BadRequest, message),
            EngineError::NotFound => Self::new(ErrorKind::NotFound, "unknown id"),
            EngineError::Store(store) => store.into(),
            EngineError::Backend(err) => Self::new(ErrorKind::BackendError, err.to_string()),
        }
    }
}
