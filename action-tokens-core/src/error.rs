use thiserror::Error;

use crate::types::TokenId;

/// Failure reported by a storage backend.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("storage session is closed")]
    SessionClosed,

    #[error("version conflict on token {id}: stored {stored}, staged {staged}")]
    Conflict { id: TokenId, stored: u64, staged: u64 },
}

/// Failure reported by an event sink.
#[derive(Debug, Error)]
pub enum EventError {
    #[error("event sink is closed")]
    Closed,
}

/// Coarse error class, for callers mapping errors onto a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    BadRequest,
    Forbidden,
    Internal,
}

/// Errors surfaced by token entities and the orchestrator.
///
/// A token that does not exist is never an error; operations return an
/// `Option` or a not-found outcome instead.
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("token {0} has already been executed")]
    AlreadyExecuted(TokenId),

    #[error("token {id} has reached its view limit of {limit}")]
    ViewLimitExceeded { id: TokenId, limit: i64 },

    #[error("token {0} has expired")]
    Expired(TokenId),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("token hook failed: {0}")]
    Hook(#[source] anyhow::Error),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    EventDispatch(#[from] EventError),
}

impl TokenError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Validation(_) | Self::InvalidArgument(_) => ErrorClass::BadRequest,
            Self::AlreadyExecuted(_) | Self::ViewLimitExceeded { .. } | Self::Expired(_) => {
                ErrorClass::Forbidden
            }
            Self::Hook(_) | Self::Storage(_) | Self::EventDispatch(_) => ErrorClass::Internal,
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            Self::Validation(_) | Self::InvalidArgument(_) => 400,
            Self::AlreadyExecuted(_) => 403,
            Self::ViewLimitExceeded { .. } | Self::Expired(_) => 410,
            Self::Hook(_) | Self::Storage(_) | Self::EventDispatch(_) => 500,
        }
    }
}
