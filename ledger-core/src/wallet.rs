//! Wallet ledger
//!
//! The only writer of [`Wallet::balance`]. Every balance change locks the
//! wallet row inside the caller's [`Transaction`], updates the cached
//! balance and appends exactly one [`LedgerEntry`], so the balance always
//! equals the sum of the wallet's entries.
//!
//! Operations stage their writes on the caller's transaction and never
//! commit it: a failure anywhere in the enclosing operation rolls the
//! ledger movement back with everything else.

use crate::{
    metrics::Metrics,
    schema::Index,
    transaction::Transaction,
    types::{EntryType, LedgerEntry, UserId, Wallet},
    Error, Result,
};
use chrono::Utc;
use rust_decimal::Decimal;
use uuid::Uuid;

/// Balance-changing operations on carrier wallets
#[derive(Debug, Clone)]
pub struct WalletLedger {
    metrics: Metrics,
}

impl WalletLedger {
    /// Create wallet ledger
    pub fn new(metrics: Metrics) -> Self {
        Self { metrics }
    }

    /// Charge commission from `owner`'s wallet
    ///
    /// Rejects (never clamps) a charge larger than the balance; a rejected
    /// charge stages nothing.
    pub async fn charge(
        &self,
        txn: &mut Transaction,
        owner: UserId,
        amount: Decimal,
        description: &str,
        reference: Option<Uuid>,
    ) -> Result<LedgerEntry> {
        ensure_positive(amount)?;
        let mut wallet = self.lock_wallet(txn, owner).await?;

        if wallet.balance < amount {
            self.metrics.insufficient_funds.inc();
            tracing::warn!(
                wallet = %owner,
                required = %amount,
                available = %wallet.balance,
                "Charge rejected: insufficient funds"
            );
            return Err(Error::InsufficientFunds {
                owner,
                required: amount,
                available: wallet.balance,
            });
        }

        let entry = self.post(txn, &mut wallet, EntryType::Commission, -amount, description, reference)?;
        self.metrics.charges_total.inc();
        Ok(entry)
    }

    /// Credit a payout to `owner`'s wallet, creating it if absent
    pub async fn credit(
        &self,
        txn: &mut Transaction,
        owner: UserId,
        amount: Decimal,
        description: &str,
        reference: Option<Uuid>,
    ) -> Result<LedgerEntry> {
        self.increase(txn, owner, EntryType::Payout, amount, description, reference)
            .await
    }

    /// Top up `owner`'s wallet
    pub async fn deposit(
        &self,
        txn: &mut Transaction,
        owner: UserId,
        amount: Decimal,
        description: &str,
    ) -> Result<LedgerEntry> {
        self.increase(txn, owner, EntryType::Deposit, amount, description, None)
            .await
    }

    /// Signed manual correction; may not take the balance below zero
    pub async fn adjust(
        &self,
        txn: &mut Transaction,
        owner: UserId,
        amount: Decimal,
        description: &str,
    ) -> Result<LedgerEntry> {
        if amount.is_zero() {
            return Err(Error::InvalidAmount("Adjustment must be non-zero".to_string()));
        }
        let mut wallet = self.lock_wallet(txn, owner).await?;

        if checked_balance(&wallet, amount)? < Decimal::ZERO {
            return Err(Error::InsufficientFunds {
                owner,
                required: -amount,
                available: wallet.balance,
            });
        }

        let entry = self.post(txn, &mut wallet, EntryType::Adjustment, amount, description, None)?;
        if amount.is_sign_positive() {
            self.metrics.credits_total.inc();
        }
        Ok(entry)
    }

    async fn increase(
        &self,
        txn: &mut Transaction,
        owner: UserId,
        entry_type: EntryType,
        amount: Decimal,
        description: &str,
        reference: Option<Uuid>,
    ) -> Result<LedgerEntry> {
        ensure_positive(amount)?;
        let mut wallet = self.lock_wallet(txn, owner).await?;
        let entry = self.post(txn, &mut wallet, entry_type, amount, description, reference)?;
        self.metrics.credits_total.inc();
        Ok(entry)
    }

    async fn lock_wallet(&self, txn: &mut Transaction, owner: UserId) -> Result<Wallet> {
        txn.lock_record::<Wallet>(owner.as_uuid()).await?;
        Ok(txn
            .load::<Wallet>(owner.as_uuid())?
            .unwrap_or_else(|| Wallet::open(owner)))
    }

    fn post(
        &self,
        txn: &mut Transaction,
        wallet: &mut Wallet,
        entry_type: EntryType,
        amount: Decimal,
        description: &str,
        reference: Option<Uuid>,
    ) -> Result<LedgerEntry> {
        let balance_after = checked_balance(wallet, amount)?;
        if balance_after < Decimal::ZERO {
            return Err(Error::InvariantViolation(format!(
                "{} of {} would leave wallet {} at {}",
                entry_type, amount, wallet.owner, balance_after
            )));
        }

        let now = Utc::now();
        wallet.balance = balance_after;
        wallet.updated_at = now;

        let entry = LedgerEntry {
            id: Uuid::now_v7(),
            wallet: wallet.owner,
            entry_type,
            amount,
            balance_after,
            description: description.to_string(),
            reference,
            created_at: now,
        };

        txn.save(&*wallet)?;
        txn.save(&entry)?;
        txn.link(Index::EntriesByWallet, wallet.owner.as_uuid(), entry.id);

        tracing::debug!(
            txn_id = %txn.id(),
            wallet = %wallet.owner,
            entry_type = %entry_type,
            amount = %amount,
            balance_after = %balance_after,
            "Ledger entry staged"
        );

        Ok(entry)
    }
}

fn checked_balance(wallet: &Wallet, amount: Decimal) -> Result<Decimal> {
    wallet.balance.checked_add(amount).ok_or_else(|| {
        Error::InvalidAmount(format!(
            "{} would overflow wallet {} balance {}",
            amount, wallet.owner, wallet.balance
        ))
    })
}

fn ensure_positive(amount: Decimal) -> Result<()> {
    if amount <= Decimal::ZERO {
        return Err(Error::InvalidAmount(format!(
            "Amount must be positive, got {}",
            amount
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Config, Ledger};
    use tempfile::TempDir;

    fn test_ledger() -> (Ledger, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        config.rocksdb.sync_writes = false;
        (Ledger::open(config).unwrap(), temp_dir)
    }

    #[tokio::test]
    async fn test_charge_within_balance() {
        let (ledger, _temp) = test_ledger();
        let carrier = UserId::new();
        ledger.deposit(carrier, Decimal::from(5), "Top-up").await.unwrap();

        let mut txn = ledger.begin();
        let entry = ledger
            .wallets()
            .charge(&mut txn, carrier, Decimal::ONE, "Commission", None)
            .await
            .unwrap();
        txn.commit().unwrap();

        assert_eq!(entry.entry_type, EntryType::Commission);
        assert_eq!(entry.amount, Decimal::NEGATIVE_ONE);
        assert_eq!(entry.balance_after, Decimal::from(4));
        assert_eq!(ledger.balance(carrier).unwrap(), Decimal::from(4));
    }

    #[tokio::test]
    async fn test_charge_rejected_stages_nothing() {
        let (ledger, _temp) = test_ledger();
        let carrier = UserId::new();
        ledger.deposit(carrier, Decimal::new(50, 2), "Top-up").await.unwrap();

        let mut txn = ledger.begin();
        let result = ledger
            .wallets()
            .charge(&mut txn, carrier, Decimal::ONE, "Commission", None)
            .await;

        match result {
            Err(Error::InsufficientFunds { required, available, .. }) => {
                assert_eq!(required, Decimal::ONE);
                assert_eq!(available, Decimal::new(50, 2));
            }
            other => panic!("expected insufficient funds, got {:?}", other),
        }
        assert!(!txn.is_dirty());
    }

    #[tokio::test]
    async fn test_charge_on_missing_wallet_fails() {
        let (ledger, _temp) = test_ledger();
        let carrier = UserId::new();

        let mut txn = ledger.begin();
        let result = ledger
            .wallets()
            .charge(&mut txn, carrier, Decimal::ONE, "Commission", None)
            .await;
        assert!(matches!(result, Err(Error::InsufficientFunds { .. })));
        drop(txn);

        assert!(ledger.wallet(carrier).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_credit_creates_wallet() {
        let (ledger, _temp) = test_ledger();
        let carrier = UserId::new();

        let mut txn = ledger.begin();
        let entry = ledger
            .wallets()
            .credit(&mut txn, carrier, Decimal::from(100), "Payout", Some(Uuid::new_v4()))
            .await
            .unwrap();
        txn.commit().unwrap();

        assert_eq!(entry.entry_type, EntryType::Payout);
        assert_eq!(ledger.balance(carrier).unwrap(), Decimal::from(100));
    }

    #[tokio::test]
    async fn test_non_positive_amounts_rejected() {
        let (ledger, _temp) = test_ledger();
        let carrier = UserId::new();
        let mut txn = ledger.begin();

        assert!(matches!(
            ledger.wallets().credit(&mut txn, carrier, Decimal::ZERO, "Payout", None).await,
            Err(Error::InvalidAmount(_))
        ));
        assert!(matches!(
            ledger.wallets().charge(&mut txn, carrier, Decimal::NEGATIVE_ONE, "Fee", None).await,
            Err(Error::InvalidAmount(_))
        ));
    }

    #[tokio::test]
    async fn test_credit_overflow_stages_nothing() {
        let (ledger, _temp) = test_ledger();
        let carrier = UserId::new();
        ledger.deposit(carrier, Decimal::MAX, "Top-up").await.unwrap();

        let mut txn = ledger.begin();
        let result = ledger
            .wallets()
            .credit(&mut txn, carrier, Decimal::MAX, "Payout", None)
            .await;
        assert!(matches!(result, Err(Error::InvalidAmount(_))));
        assert!(!txn.is_dirty());
    }

    #[tokio::test]
    async fn test_negative_adjustment_bounded_by_balance() {
        let (ledger, _temp) = test_ledger();
        let carrier = UserId::new();
        ledger.deposit(carrier, Decimal::from(3), "Top-up").await.unwrap();

        assert!(matches!(
            ledger.adjust(carrier, Decimal::from(-4), "Correction").await,
            Err(Error::InsufficientFunds { .. })
        ));

        let entry = ledger.adjust(carrier, Decimal::from(-2), "Correction").await.unwrap();
        assert_eq!(entry.entry_type, EntryType::Adjustment);
        assert_eq!(ledger.balance(carrier).unwrap(), Decimal::ONE);
    }
}
