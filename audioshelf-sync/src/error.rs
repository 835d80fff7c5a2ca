use audioshelf_core::{ApiError, ApiErrorClass};
use thiserror::Error;

use crate::sync::images::ImageError;
use crate::sync::records::{EntityFamily, RecordError};
use crate::sync::store::StoreError;
use crate::token_provider::TokenError;

/// Failure taxonomy shared by pull, push and downloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Unreachable server or timeout.
    Network,
    /// Non-success HTTP status.
    Server,
    /// Malformed or unexpected payload.
    Data,
    /// Expired or rejected credential.
    Auth,
    /// Local persistence or disk space.
    Storage,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Network => "network",
            ErrorKind::Server => "server",
            ErrorKind::Data => "data",
            ErrorKind::Auth => "auth",
            ErrorKind::Storage => "storage",
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("api error: {0}")]
    Api(#[from] ApiError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("token error: {0}")]
    Token(#[from] TokenError),
    #[error("image error: {0}")]
    Image(#[from] ImageError),
    #[error("record error: {0}")]
    Record(#[from] RecordError),
    #[error("invalid sync page for {family}: {reason}")]
    InvalidPage {
        family: EntityFamily,
        reason: String,
    },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Api(err) => api_error_kind(err),
            SyncError::Store(err) => err.kind(),
            SyncError::Token(err) => err.kind(),
            SyncError::Image(err) => err.kind(),
            SyncError::Record(_) | SyncError::InvalidPage { .. } => ErrorKind::Data,
            SyncError::Io(_) => ErrorKind::Storage,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Api(err) => err.is_retryable(),
            SyncError::Token(err) => err.is_retryable(),
            SyncError::Image(err) => err.is_retryable(),
            _ => false,
        }
    }

    pub fn is_auth(&self) -> bool {
        self.kind() == ErrorKind::Auth
    }
}

pub(crate) fn api_error_kind(err: &ApiError) -> ErrorKind {
    if err.is_network() {
        return ErrorKind::Network;
    }
    match err {
        ApiError::Decode(_) | ApiError::Url(_) => ErrorKind::Data,
        ApiError::Api { .. } => match err.classification() {
            Some(ApiErrorClass::Auth) => ErrorKind::Auth,
            _ => ErrorKind::Server,
        },
        ApiError::Request(inner) if inner.is_decode() => ErrorKind::Data,
        ApiError::Request(inner) if inner.status().is_some() => ErrorKind::Server,
        ApiError::Request(_) => ErrorKind::Network,
    }
}
