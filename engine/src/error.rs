//! Centralized session coordinator error types.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorError {
    /// Session start, setup message or round completion deadline elapsed.
    #[error("Timeout: {0}")]
    Timeout(String),
    /// Relay transport failure (register, download, upload).
    #[error("Relay error: {0}")]
    Relay(String),
    /// MPC engine failure (bad setup message, failed finish, decode failure).
    #[error("Engine error: {0}")]
    Engine(String),
    /// Caller or protocol contract violation.
    #[error("Validation error: {0}")]
    Validation(String),
    /// Vault storage or local state failure.
    #[error("Storage error: {0}")]
    Storage(String),
    /// Encryption, decryption or key material failure.
    #[error("Cryptographic error: {0}")]
    Crypto(String),
    /// Serialization or deserialization error.
    #[error("Serialization error: {0}")]
    Serde(String),
    /// A retried round failed on every attempt.
    #[error("{label} failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        label: String,
        attempts: u32,
        last: Box<CoordinatorError>,
    },
}

impl CoordinatorError {
    /// Whether a round that failed with this error may be attempted again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoordinatorError::Timeout(_)
                | CoordinatorError::Relay(_)
                | CoordinatorError::Engine(_)
                | CoordinatorError::Crypto(_)
        )
    }
}

impl From<serde_json::Error> for CoordinatorError {
    fn from(e: serde_json::Error) -> Self {
        CoordinatorError::Serde(e.to_string())
    }
}

impl From<base64::DecodeError> for CoordinatorError {
    fn from(e: base64::DecodeError) -> Self {
        CoordinatorError::Serde(format!("base64: {e}"))
    }
}

impl From<hex::FromHexError> for CoordinatorError {
    fn from(e: hex::FromHexError) -> Self {
        CoordinatorError::Serde(format!("hex: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, CoordinatorError>;
