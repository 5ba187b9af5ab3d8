//! Error types for HomeKit Data Stream operations.

use thiserror::Error;

/// Result type alias for HDS operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during HDS operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Operation is not valid in the current stream or setup state
    #[error("invalid state")]
    InvalidState,

    /// Malformed request or parameters from the controller
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// No free slot, timer or buffer space
    #[error("out of resources")]
    OutOfResources,

    /// Transient condition, retry later
    #[error("busy")]
    Busy,

    /// Cryptographic operation failed
    #[error("cryptographic error: {0}")]
    Crypto(String),

    /// Authentication tag did not verify
    #[error("authentication failed")]
    Authentication,

    /// Per-direction frame counter would wrap
    #[error("nonce counter exhausted")]
    NonceExhausted,

    /// Frame header violates the wire format
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// Buffer overflow/underflow
    #[error("buffer error: expected {expected} bytes, got {actual}")]
    Buffer { expected: usize, actual: usize },

    /// Network I/O error
    #[error("network error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create a new invalid data error
    pub fn invalid_data(msg: impl Into<String>) -> Self {
        Error::InvalidData(msg.into())
    }

    /// Create a new cryptographic error
    pub fn crypto(msg: impl Into<String>) -> Self {
        Error::Crypto(msg.into())
    }

    /// Create a new frame error
    pub fn frame(msg: impl Into<String>) -> Self {
        Error::InvalidFrame(msg.into())
    }

    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::Busy | Error::OutOfResources)
    }

    /// Check if this error indicates authentication failure
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Error::Authentication)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Authentication;
        assert_eq!(err.to_string(), "authentication failed");

        let err = Error::Buffer {
            expected: 4,
            actual: 2,
        };
        assert_eq!(err.to_string(), "buffer error: expected 4 bytes, got 2");

        let err = Error::invalid_data("salt missing");
        assert_eq!(err.to_string(), "invalid data: salt missing");
    }

    #[test]
    fn test_error_recoverable() {
        assert!(Error::Busy.is_recoverable());
        assert!(Error::OutOfResources.is_recoverable());
        assert!(!Error::InvalidState.is_recoverable());
        assert!(!Error::Authentication.is_recoverable());
        assert!(Error::Authentication.is_auth_failure());
    }
}
