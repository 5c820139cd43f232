//! Main ledger orchestration layer
//!
//! This module ties together storage, row locks and the wallet ledger into
//! the handle the settlement engine holds.
//!
//! # Example
//!
//! ```no_run
//! use freight_ledger::{Config, Ledger, UserId};
//! use rust_decimal::Decimal;
//!
//! #[tokio::main]
//! async fn main() -> freight_ledger::Result<()> {
//!     let ledger = Ledger::open(Config::default())?;
//!     let carrier = UserId::new();
//!
//!     ledger.deposit(carrier, Decimal::from(50), "Initial top-up").await?;
//!
//!     let mut txn = ledger.begin();
//!     ledger
//!         .wallets()
//!         .charge(&mut txn, carrier, Decimal::ONE, "Commission", None)
//!         .await?;
//!     txn.commit()?;
//!
//!     ledger.verify_wallet(carrier).await?;
//!     Ok(())
//! }
//! ```

use crate::{
    locks::LockManager,
    metrics::Metrics,
    schema::{Family, Index, Record},
    storage::{Storage, StorageStats},
    transaction::Transaction,
    types::{LedgerEntry, UserId, Wallet, WalletAudit},
    wallet::WalletLedger,
    Config, Error, Result,
};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use uuid::Uuid;

/// Main ledger interface
#[derive(Debug)]
pub struct Ledger {
    storage: Arc<Storage>,
    locks: Arc<LockManager>,
    wallets: WalletLedger,
    metrics: Metrics,
    config: Config,
}

impl Ledger {
    /// Open ledger with configuration
    pub fn open(config: Config) -> Result<Self> {
        let metrics = Metrics::new()?;
        let storage = Arc::new(Storage::open(&config)?);
        let locks = Arc::new(LockManager::new(config.locks.timeout(), metrics.clone()));

        tracing::info!(
            service = %config.service_name,
            lock_timeout_ms = config.locks.timeout_ms,
            "Ledger opened"
        );

        Ok(Self {
            storage,
            locks,
            wallets: WalletLedger::new(metrics.clone()),
            metrics,
            config,
        })
    }

    /// Start a transaction
    pub fn begin(&self) -> Transaction {
        Transaction::begin(
            Arc::clone(&self.storage),
            Arc::clone(&self.locks),
            self.metrics.clone(),
        )
    }

    /// Wallet operations (to be staged on a transaction)
    pub fn wallets(&self) -> &WalletLedger {
        &self.wallets
    }

    /// Metrics collector
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    // Committed reads

    /// Load a committed record
    pub fn load<R: Record>(&self, id: Uuid) -> Result<Option<R>> {
        self.storage.load(id)
    }

    /// Committed raw-keyed value
    pub fn get<T: DeserializeOwned>(&self, family: Family, key: &[u8]) -> Result<Option<T>> {
        self.storage.get(family, key)
    }

    /// Committed children of `parent`
    pub fn members(&self, index: Index, parent: Uuid) -> Result<Vec<Uuid>> {
        self.storage.index_members(index, parent)
    }

    /// Every committed value of a family
    pub fn scan<T: DeserializeOwned>(&self, family: Family) -> Result<Vec<(Vec<u8>, T)>> {
        self.storage.scan(family)
    }

    /// Storage statistics
    pub fn stats(&self) -> Result<StorageStats> {
        self.storage.get_stats()
    }

    // Wallet reads

    /// Wallet of `owner`, if one was ever created
    pub fn wallet(&self, owner: UserId) -> Result<Option<Wallet>> {
        self.load(owner.as_uuid())
    }

    /// Current balance (zero for a wallet that does not exist yet)
    pub fn balance(&self, owner: UserId) -> Result<Decimal> {
        Ok(self
            .wallet(owner)?
            .map(|wallet| wallet.balance)
            .unwrap_or(Decimal::ZERO))
    }

    /// Entries of `owner`'s wallet, oldest first
    pub fn entries(&self, owner: UserId) -> Result<Vec<LedgerEntry>> {
        let mut entries = self
            .members(Index::EntriesByWallet, owner.as_uuid())?
            .into_iter()
            .map(|id| {
                self.load::<LedgerEntry>(id)?.ok_or(Error::RecordNotFound {
                    family: Family::Entries.name(),
                    id,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(entries)
    }

    /// Recompute the wallet from its entries
    ///
    /// Holds the wallet row lock while reading, so the balance and the
    /// entries come from the same committed state. Fails with
    /// [`Error::InvariantViolation`] if the cached balance drifted.
    pub async fn verify_wallet(&self, owner: UserId) -> Result<WalletAudit> {
        let mut txn = self.begin();
        txn.lock_record::<Wallet>(owner.as_uuid()).await?;

        let wallet = txn
            .load::<Wallet>(owner.as_uuid())?
            .ok_or(Error::WalletNotFound(owner))?;
        let entries = txn
            .members(Index::EntriesByWallet, owner.as_uuid())?
            .into_iter()
            .map(|id| txn.fetch::<LedgerEntry>(id))
            .collect::<Result<Vec<_>>>()?;

        let audit = WalletAudit {
            owner,
            balance: wallet.balance,
            entries_total: entries.iter().map(|entry| entry.amount).sum(),
            entry_count: entries.len(),
        };

        if !audit.is_consistent() {
            tracing::error!(
                wallet = %owner,
                balance = %audit.balance,
                entries_total = %audit.entries_total,
                "Wallet balance does not match its entries"
            );
            return Err(Error::InvariantViolation(format!(
                "wallet {} balance {} != entries total {}",
                owner, audit.balance, audit.entries_total
            )));
        }

        Ok(audit)
    }

    // Standalone wallet operations (own transaction)

    /// Top up a wallet
    pub async fn deposit(
        &self,
        owner: UserId,
        amount: Decimal,
        description: &str,
    ) -> Result<LedgerEntry> {
        let mut txn = self.begin();
        let entry = self.wallets.deposit(&mut txn, owner, amount, description).await?;
        txn.commit()?;

        tracing::info!(wallet = %owner, amount = %amount, "Wallet deposit committed");
        Ok(entry)
    }

    /// Apply a signed manual adjustment
    pub async fn adjust(
        &self,
        owner: UserId,
        amount: Decimal,
        description: &str,
    ) -> Result<LedgerEntry> {
        let mut txn = self.begin();
        let entry = self.wallets.adjust(&mut txn, owner, amount, description).await?;
        txn.commit()?;

        tracing::info!(wallet = %owner, amount = %amount, "Wallet adjustment committed");
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EntryType;
    use tempfile::TempDir;

    fn test_ledger() -> (Ledger, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        config.rocksdb.sync_writes = false;
        (Ledger::open(config).unwrap(), temp_dir)
    }

    #[tokio::test]
    async fn test_entries_in_order() {
        let (ledger, _temp) = test_ledger();
        let carrier = UserId::new();

        ledger.deposit(carrier, Decimal::from(10), "Top-up").await.unwrap();
        ledger.adjust(carrier, Decimal::from(-3), "Correction").await.unwrap();

        let entries = ledger.entries(carrier).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].entry_type, EntryType::Deposit);
        assert_eq!(entries[1].entry_type, EntryType::Adjustment);
        assert_eq!(entries[1].balance_after, Decimal::from(7));
    }

    #[tokio::test]
    async fn test_verify_wallet() {
        let (ledger, _temp) = test_ledger();
        let carrier = UserId::new();

        assert!(matches!(
            ledger.verify_wallet(carrier).await,
            Err(Error::WalletNotFound(_))
        ));

        ledger.deposit(carrier, Decimal::new(1250, 2), "Top-up").await.unwrap();
        let audit = ledger.verify_wallet(carrier).await.unwrap();
        assert_eq!(audit.entry_count, 1);
        assert_eq!(audit.entries_total, Decimal::new(1250, 2));
    }

    #[tokio::test]
    async fn test_verify_detects_drift() {
        let (ledger, _temp) = test_ledger();
        let carrier = UserId::new();
        ledger.deposit(carrier, Decimal::from(5), "Top-up").await.unwrap();

        // Bypass the wallet ledger to corrupt the cached balance
        let mut wallet = ledger.wallet(carrier).unwrap().unwrap();
        wallet.balance = Decimal::from(6);
        let mut txn = ledger.begin();
        txn.save(&wallet).unwrap();
        txn.commit().unwrap();

        assert!(matches!(
            ledger.verify_wallet(carrier).await,
            Err(Error::InvariantViolation(_))
        ));
    }

    #[tokio::test]
    async fn test_balance_of_unknown_wallet_is_zero() {
        let (ledger, _temp) = test_ledger();
        assert_eq!(ledger.balance(UserId::new()).unwrap(), Decimal::ZERO);
    }
}
