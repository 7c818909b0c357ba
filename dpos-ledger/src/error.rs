//! Error types for the ledger core

use thiserror::Error;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger errors
#[derive(Error, Debug)]
pub enum Error {
    /// Field-shape failure on an account or block field
    #[error("Validation error: {0}")]
    Validation(String),

    /// Block or transaction schema failure, carrying every collected field error
    #[error("Failed to validate block schema: {}", .0.join(", "))]
    SchemaValidation(Vec<String>),

    /// Malformed public key in an account write
    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    /// A non-negative field would go below zero
    #[error("Insufficient funds: account {address} {field} is {available}, cannot subtract {requested}")]
    InsufficientFunds {
        /// Account address
        address: String,
        /// Field being decremented
        field: &'static str,
        /// Current value
        available: i64,
        /// Requested decrement
        requested: i64,
    },

    /// Signing or key material failure
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Hex/base58 decoding failure
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// Storage transaction failure
    #[error("Ledger error: {0}")]
    Ledger(String),

    /// Height outside the chain (heights start at 1)
    #[error("Invalid height: {0}")]
    InvalidHeight(i64),

    /// Reward slot index outside the round
    #[error("Invalid slot index {index} for round with {len} rewards")]
    InvalidSlotIndex {
        /// Requested index
        index: usize,
        /// Number of rewards in the round
        len: usize,
    },

    /// Block not found
    #[error("Block not found: {0}")]
    BlockNotFound(String),

    /// Concurrency error (sequencer closed, etc.)
    #[error("Concurrency error: {0}")]
    Concurrency(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(feature = "rocksdb")]
impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Ledger(err.to_string())
    }
}

impl From<hex::FromHexError> for Error {
    fn from(err: hex::FromHexError) -> Self {
        Error::Encoding(err.to_string())
    }
}

impl Error {
    /// Whether the caller may retry the operation unchanged
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Ledger(_) | Error::Concurrency(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_error_lists_every_field() {
        let err = Error::SchemaValidation(vec![
            "blockSignature: missing".to_string(),
            "payloadHash: not hex".to_string(),
        ]);
        let msg = err.to_string();
        assert!(msg.contains("blockSignature"));
        assert!(msg.contains("payloadHash"));
    }

    #[test]
    fn test_retryable_kinds() {
        assert!(Error::Ledger("write failed".into()).is_retryable());
        assert!(!Error::InvalidHeight(0).is_retryable());
    }
}
