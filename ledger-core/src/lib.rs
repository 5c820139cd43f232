//! Freight Ledger
//!
//! Durable store and wallet ledger underneath the freight settlement engine.
//!
//! # Architecture
//!
//! - **Storage**: RocksDB, one column family per record family
//! - **Transactions**: buffered writes applied as one atomic `WriteBatch`;
//!   dropping an uncommitted transaction is a rollback
//! - **Row locks**: per-record exclusive locks with a bounded wait, held
//!   until commit or rollback
//! - **Wallet ledger**: the only writer of wallet balances
//!
//! # Invariants
//!
//! - Ledger integrity: wallet balance == Σ(entry amounts) at all times
//! - No negative balance: charges are rejected, never clamped
//! - Append-only: ledger entries are never modified or deleted
//! - All-or-nothing: a transaction's writes are all visible or none are

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod config;
pub mod error;
pub mod ledger;
pub mod locks;
pub mod metrics;
pub mod schema;
pub mod storage;
pub mod transaction;
pub mod types;
pub mod wallet;

// Re-exports
pub use config::Config;
pub use error::{Error, Result};
pub use ledger::Ledger;
pub use locks::LockKey;
pub use metrics::Metrics;
pub use schema::{Family, Index, Record};
pub use storage::Storage;
pub use transaction::Transaction;
pub use types::{EntryType, LedgerEntry, UserId, Wallet, WalletAudit};
pub use wallet::WalletLedger;
