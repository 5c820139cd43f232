//! Error types for the settlement engine
//!
//! Callers branch on [`Error::kind`]: `Conflict` and `InvalidTransition`
//! mean "you lost the race" or "not allowed now" and must not be retried,
//! `Transient` is safe to retry.

use crate::types::ShipmentStatus;
use rust_decimal::Decimal;
use thiserror::Error;

/// Result type for settlement operations
pub type Result<T> = std::result::Result<T, Error>;

/// Settlement errors
#[derive(Error, Debug)]
pub enum Error {
    /// Shipment, offer, listing, bid or wallet missing
    #[error("Not found: {0}")]
    NotFound(String),

    /// Actor is not a party to the entity, or asked for a system-only move
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Entity already in an incompatible state (e.g. shipment already assigned)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// State machine rejected the move
    #[error("Invalid transition {from} -> {to}: {reason}")]
    InvalidTransition {
        /// Current status
        from: ShipmentStatus,
        /// Requested status
        to: ShipmentStatus,
        /// Why the move is rejected
        reason: &'static str,
    },

    /// Wallet charge rejected
    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds {
        /// Commission due
        required: Decimal,
        /// Wallet balance
        available: Decimal,
    },

    /// Lock timeout or store unavailable; safe to retry
    #[error("Transient failure: {0}")]
    Transient(String),

    /// Malformed request
    #[error("Validation error: {0}")]
    Validation(String),

    /// Other ledger error
    #[error("Ledger error: {0}")]
    Ledger(freight_ledger::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse error class for callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing entity
    NotFound,
    /// Not permitted
    Forbidden,
    /// Lost race / incompatible state
    Conflict,
    /// State machine rejection
    InvalidTransition,
    /// Wallet cannot cover the charge
    InsufficientFunds,
    /// Retryable
    Transient,
    /// Bad input
    Validation,
    /// Everything else
    Internal,
}

impl Error {
    /// Coarse class of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Forbidden(_) => ErrorKind::Forbidden,
            Error::Conflict(_) => ErrorKind::Conflict,
            Error::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            Error::InsufficientFunds { .. } => ErrorKind::InsufficientFunds,
            Error::Transient(_) => ErrorKind::Transient,
            Error::Validation(_) => ErrorKind::Validation,
            Error::Ledger(_) | Error::Config(_) | Error::Serialization(_) | Error::Io(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Whether the caller may retry the same request
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

impl From<freight_ledger::Error> for Error {
    fn from(err: freight_ledger::Error) -> Self {
        use freight_ledger::Error as LedgerError;

        match err {
            LedgerError::InsufficientFunds {
                required,
                available,
                ..
            } => Error::InsufficientFunds {
                required,
                available,
            },
            LedgerError::RecordNotFound { .. } | LedgerError::WalletNotFound(_) => {
                Error::NotFound(err.to_string())
            }
            LedgerError::InvalidAmount(msg) => Error::Validation(msg),
            LedgerError::Config(msg) => Error::Config(msg),
            err if err.is_transient() => Error::Transient(err.to_string()),
            other => Error::Ledger(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use freight_ledger::UserId;

    #[test]
    fn test_lock_timeout_is_retryable() {
        let err: Error = freight_ledger::Error::LockTimeout {
            resource: "shipments/x".to_string(),
            waited_ms: 5_000,
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_insufficient_funds_maps_through() {
        let err: Error = freight_ledger::Error::InsufficientFunds {
            owner: UserId::new(),
            required: Decimal::ONE,
            available: Decimal::new(50, 2),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::InsufficientFunds);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_conflict_not_retryable() {
        let err = Error::Conflict("shipment already assigned".to_string());
        assert!(!err.is_retryable());
        assert_ne!(err.kind(), Error::Transient("x".to_string()).kind());
    }
}
