use crate::crypto::CryptoError;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub type Result<T, E = MailError> = std::result::Result<T, E>;

/// What kind of entity a `NotFound` refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotFoundKind {
    Address,
    Message,
    BlockedAddress,
    Key,
}

impl fmt::Display for NotFoundKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NotFoundKind::Address => "email address",
            NotFoundKind::Message => "email message",
            NotFoundKind::BlockedAddress => "blocked address",
            NotFoundKind::Key => "key",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum MailError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Invalid message content: {0}")]
    InvalidMessageContent(String),
    #[error("Sender address is not owned by this account: {0}")]
    UnauthorizedAddress(String),
    #[error("In-network address not found: {0}")]
    InNetworkAddressNotFound(String),
    #[error("Message size limit exceeded: {size} bytes, max {max}")]
    MessageSizeLimitExceeded { size: usize, max: usize },
    #[error("Limit exceeded: {requested} requested, max {max}")]
    LimitExceeded { requested: usize, max: usize },
    #[error("{kind} not found: {id}")]
    NotFound { kind: NotFoundKind, id: String },
    #[error("Decryption failed: {0}")]
    Decryption(String),
    #[error("Key not found: {0}")]
    KeyNotFound(String),
    #[error("Secure key archive error: {0}")]
    SecureKeyArchive(String),
    #[error("Already exists: {0}")]
    AlreadyExists(String),
    #[error("Unavailable: {0}")]
    Unavailable(String),
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Flat classification of [`MailError`], used by callers and by per-item
/// failure records so they can branch without matching on error payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    InvalidArgument,
    InvalidMessageContent,
    UnauthorizedAddress,
    InNetworkAddressNotFound,
    MessageSizeLimitExceeded,
    LimitExceeded,
    NotFound,
    Decryption,
    KeyNotFound,
    SecureKeyArchive,
    AlreadyExists,
    Unavailable,
    Crypto,
    Transport,
}

impl MailError {
    pub fn not_found(kind: NotFoundKind, id: impl Into<String>) -> Self {
        MailError::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            MailError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            MailError::InvalidMessageContent(_) => ErrorKind::InvalidMessageContent,
            MailError::UnauthorizedAddress(_) => ErrorKind::UnauthorizedAddress,
            MailError::InNetworkAddressNotFound(_) => ErrorKind::InNetworkAddressNotFound,
            MailError::MessageSizeLimitExceeded { .. } => ErrorKind::MessageSizeLimitExceeded,
            MailError::LimitExceeded { .. } => ErrorKind::LimitExceeded,
            MailError::NotFound { .. } => ErrorKind::NotFound,
            MailError::Decryption(_) => ErrorKind::Decryption,
            MailError::KeyNotFound(_) => ErrorKind::KeyNotFound,
            MailError::SecureKeyArchive(_) => ErrorKind::SecureKeyArchive,
            MailError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            MailError::Unavailable(_) => ErrorKind::Unavailable,
            MailError::Crypto(_) => ErrorKind::Crypto,
            MailError::Transport(_) | MailError::Database(_) | MailError::Serialization(_) => {
                ErrorKind::Transport
            }
        }
    }

    /// Errors that describe one item of a list or batch call. These are
    /// folded into the call's result; everything else aborts the call.
    pub fn is_item_scoped(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::NotFound
                | ErrorKind::Decryption
                | ErrorKind::Crypto
                | ErrorKind::InvalidMessageContent
                | ErrorKind::AlreadyExists
                | ErrorKind::Unavailable
        )
    }
}

/// Per-item failure cause carried by list pages and batch results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureCause {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&MailError> for FailureCause {
    fn from(err: &MailError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl From<MailError> for FailureCause {
    fn from(err: MailError) -> Self {
        FailureCause::from(&err)
    }
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}
