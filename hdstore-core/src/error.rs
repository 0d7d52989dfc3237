//! Error types for hdstore

use crate::types::DataType;
use thiserror::Error;

/// Result type alias for hdstore operations
pub type Result<T> = std::result::Result<T, HdError>;

/// hdstore error types
#[derive(Error, Debug)]
pub enum HdError {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Data corruption detected
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// Checksum mismatch
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Invalid data format
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Value type does not match the configured data type
    #[error("Data type mismatch: channel stores {expected}, got {actual}")]
    DataTypeMismatch { expected: DataType, actual: DataType },

    /// Channel not found
    #[error("Channel not found: {0}")]
    ChannelNotFound(String),

    /// Channel already exists
    #[error("Channel already exists: {0}")]
    ChannelExists(String),

    /// Operation on a fragment that has been deleted
    #[error("Fragment deleted: {0}")]
    FragmentDeleted(String),

    /// Operation on a disposed channel or storage
    #[error("Disposed: {0}")]
    Disposed(String),

    /// Settings (de)serialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl HdError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, HdError::Io(_))
    }

    /// Check if error indicates corruption
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            HdError::Corruption(_) | HdError::ChecksumMismatch { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let io = HdError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk"));
        assert!(io.is_retryable());
        assert!(!io.is_corruption());

        let crc = HdError::ChecksumMismatch { expected: 1, actual: 2 };
        assert!(crc.is_corruption());
        assert!(!crc.is_retryable());

        let mismatch = HdError::DataTypeMismatch {
            expected: DataType::Long,
            actual: DataType::Double,
        };
        assert_eq!(
            mismatch.to_string(),
            "Data type mismatch: channel stores LONG, got DOUBLE"
        );
    }
}
