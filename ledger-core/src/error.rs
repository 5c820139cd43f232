//! Error types for the ledger store

use crate::types::UserId;
use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger errors
#[derive(Error, Debug)]
pub enum Error {
    /// Storage error (RocksDB)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Record missing from its column family
    #[error("{family} record not found: {id}")]
    RecordNotFound {
        /// Column family name
        family: &'static str,
        /// Record identity
        id: Uuid,
    },

    /// Wallet not found
    #[error("Wallet not found: {0}")]
    WalletNotFound(UserId),

    /// Charge would take the wallet below zero
    #[error("Insufficient funds in wallet {owner}: required {required}, available {available}")]
    InsufficientFunds {
        /// Wallet owner
        owner: UserId,
        /// Amount requested
        required: Decimal,
        /// Balance at the time of the charge
        available: Decimal,
    },

    /// Non-positive or otherwise unusable amount
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    /// Lock wait exceeded the configured timeout
    #[error("Lock wait on {resource} timed out after {waited_ms}ms")]
    LockTimeout {
        /// Locked resource
        resource: String,
        /// Time spent waiting
        waited_ms: u64,
    },

    /// Invariant violation (balance != sum of entries, etc.)
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Metrics registry error
    #[error("Metrics error: {0}")]
    Metrics(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether retrying the same request may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Storage(_) | Error::LockTimeout { .. })
    }
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

impl From<prometheus::Error> for Error {
    fn from(err: prometheus::Error) -> Self {
        Error::Metrics(err.to_string())
    }
}

impl From<String> for Error {
    fn from(msg: String) -> Self {
        Error::Other(msg)
    }
}

impl From<&str> for Error {
    fn from(msg: &str) -> Self {
        Error::Other(msg.to_string())
    }
}
