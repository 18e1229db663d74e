//! Error types for sealvault

use std::io;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for sealvault
#[derive(Error, Debug)]
pub enum Error {
    // Key custody errors
    #[error("Key material unavailable: {0}")]
    KeyUnavailable(String),

    // Symmetric layer errors
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("Decryption error: {0}")]
    Decryption(String),

    // Asymmetric layer errors
    #[error("Payload too large: {size} bytes exceeds limit of {limit} bytes")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("Key unwrap failed")]
    Unwrap,

    #[error("Key wrap failed: {0}")]
    Wrap(String),

    // Request errors
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Access denied")]
    AccessDenied,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Link expired")]
    ExpiredLink,

    // Storage errors
    #[error("Database error: {0}")]
    Database(#[from] sled::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // Config errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True for failures raised by either cipher layer
    pub fn is_crypto(&self) -> bool {
        matches!(
            self,
            Error::KeyUnavailable(_)
                | Error::MalformedEnvelope(_)
                | Error::Decryption(_)
                | Error::PayloadTooLarge { .. }
                | Error::Unwrap
                | Error::Wrap(_)
        )
    }

    /// Status number a boundary adapter should answer with
    pub fn status_code(&self) -> u16 {
        match self {
            Error::Validation(_) | Error::PayloadTooLarge { .. } => 400,
            Error::AccessDenied | Error::ExpiredLink => 403,
            Error::NotFound(_) => 404,
            Error::KeyUnavailable(_) => 500,
            e if e.is_crypto() => 400,
            _ => 500,
        }
    }

    /// Message safe to hand back to a caller.
    ///
    /// Cryptographic and infrastructure failures collapse to a generic text;
    /// the detailed message is only ever logged.
    pub fn public_message(&self) -> String {
        match self {
            Error::Validation(_)
            | Error::AccessDenied
            | Error::NotFound(_)
            | Error::ExpiredLink
            | Error::PayloadTooLarge { .. } => self.to_string(),
            e if e.is_crypto() => "Cryptographic operation failed".to_string(),
            _ => "Internal server error".to_string(),
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<sled::transaction::TransactionError<Error>> for Error {
    fn from(e: sled::transaction::TransactionError<Error>) -> Self {
        match e {
            sled::transaction::TransactionError::Abort(inner) => inner,
            sled::transaction::TransactionError::Storage(e) => Error::Database(e),
        }
    }
}
