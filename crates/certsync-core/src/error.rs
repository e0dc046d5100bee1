//! Error types for certsync
//!
//! This module defines all error types used throughout the crate.
//!
//! Record-level failures (`Decrypt`, `MalformedEnvelope`) are absorbed by
//! [`StorageReader`](crate::reader::StorageReader) and never reach a poll
//! loop. Transport failures (`StoreUnavailable`) fail one poll step and are
//! retried on the next tick. `LockAcquisition` and `Validation` surface to
//! whoever started the process.

use thiserror::Error;

/// Result type alias for certsync operations
pub type Result<T> = std::result::Result<T, Error>;

/// AEAD failure for a single stored value
///
/// Carries the bytes that failed to decrypt so handlers can fingerprint the
/// failure (the default handler rate-limits on `(key, cipher)`).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct DecryptFailure {
    cipher: Vec<u8>,
    message: String,
}

impl DecryptFailure {
    /// Create a decrypt failure for the given input bytes
    pub fn new(cipher: impl Into<Vec<u8>>, message: impl Into<String>) -> Self {
        Self {
            cipher: cipher.into(),
            message: message.into(),
        }
    }

    /// The bytes that failed to decrypt
    pub fn cipher(&self) -> &[u8] {
        &self.cipher
    }

    /// The underlying cause
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Core error type for certsync
#[derive(Error, Debug)]
pub enum Error {
    /// Transport or connection failure while talking to the key-value store
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// AEAD decryption failure for one record
    #[error("Decrypt failure: {0}")]
    Decrypt(#[from] DecryptFailure),

    /// Stored bytes are not a `{value, modified}` envelope
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// The distributed lock could not be acquired or renewed
    #[error("Lock acquisition failed: {0}")]
    LockAcquisition(String),

    /// Missing or invalid construction/configuration input
    #[error("Validation error: {0}")]
    Validation(String),

    /// The operation was cancelled because its owner is shutting down
    #[error("Operation cancelled")]
    Cancelled,

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a store transport error
    pub fn store_unavailable(msg: impl Into<String>) -> Self {
        Self::StoreUnavailable(msg.into())
    }

    /// Create a malformed envelope error
    pub fn malformed_envelope(msg: impl Into<String>) -> Self {
        Self::MalformedEnvelope(msg.into())
    }

    /// Create a lock acquisition error
    pub fn lock_acquisition(msg: impl Into<String>) -> Self {
        Self::LockAcquisition(msg.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Whether this error only signals shutdown/cancellation
    ///
    /// Poll loops stay silent on these.
    pub fn is_cancellation(&self) -> bool {
        matches!(self.root_cause().downcast_ref::<Error>(), Some(Error::Cancelled))
            || matches!(self, Error::Cancelled)
    }

    /// Walk the `source()` chain down to the innermost cause
    pub fn root_cause(&self) -> &(dyn std::error::Error + 'static) {
        let mut current: &(dyn std::error::Error + 'static) = self;
        while let Some(next) = current.source() {
            current = next;
        }
        current
    }
}

/// Helper for converting anyhow::Error to our Error type
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(err.to_string())
    }
}
