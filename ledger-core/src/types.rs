//! Core types for the wallet ledger
//!
//! All types are designed for:
//! - Deterministic serialization (bincode)
//! - Exact arithmetic (Decimal for money)

use crate::schema::{Family, Record};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Marketplace user identifier (shipper, carrier company or driver)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(Uuid);

impl UserId {
    /// Generate a fresh random ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// Underlying UUID
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Carrier wallet
///
/// `balance` is a cached running total; it must always equal the sum of the
/// wallet's ledger entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Wallet {
    /// Owning carrier (also the wallet identity)
    pub owner: UserId,

    /// Current balance, never negative
    pub balance: Decimal,

    /// Created timestamp
    pub created_at: DateTime<Utc>,

    /// Last updated timestamp
    pub updated_at: DateTime<Utc>,
}

impl Wallet {
    /// Empty wallet for `owner`
    pub fn open(owner: UserId) -> Self {
        let now = Utc::now();
        Self {
            owner,
            balance: Decimal::ZERO,
            created_at: now,
            updated_at: now,
        }
    }
}

impl Record for Wallet {
    const FAMILY: Family = Family::Wallets;

    fn id(&self) -> Uuid {
        self.owner.as_uuid()
    }
}

/// Kind of balance movement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    /// Marketplace fee charged when an offer wins
    Commission,
    /// Settled price released on completion
    Payout,
    /// Carrier top-up
    Deposit,
    /// Manual correction (either sign)
    Adjustment,
}

impl EntryType {
    /// Stable lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryType::Commission => "commission",
            EntryType::Payout => "payout",
            EntryType::Deposit => "deposit",
            EntryType::Adjustment => "adjustment",
        }
    }
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable ledger entry (one balance change)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Entry ID (UUIDv7 for time-ordering)
    pub id: Uuid,

    /// Wallet the entry belongs to
    pub wallet: UserId,

    /// Kind of movement
    pub entry_type: EntryType,

    /// Signed amount (negative for debits)
    pub amount: Decimal,

    /// Wallet balance right after this entry
    pub balance_after: Decimal,

    /// Free-text description
    pub description: String,

    /// Originating shipment or offer, if any
    pub reference: Option<Uuid>,

    /// Entry timestamp
    pub created_at: DateTime<Utc>,
}

impl Record for LedgerEntry {
    const FAMILY: Family = Family::Entries;

    fn id(&self) -> Uuid {
        self.id
    }
}

/// Result of recomputing a wallet from its entries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletAudit {
    /// Wallet owner
    pub owner: UserId,

    /// Cached balance
    pub balance: Decimal,

    /// Sum of all entry amounts
    pub entries_total: Decimal,

    /// Number of entries
    pub entry_count: usize,
}

impl WalletAudit {
    /// Cached balance matches the entry sum
    pub fn is_consistent(&self) -> bool {
        self.balance == self.entries_total
    }
}
