//! Property-based tests for ledger invariants
//!
//! These tests use proptest to verify critical invariants:
//! - Ledger integrity: balance == Σ(entry amounts) after any sequence
//! - No negative balance: charges beyond the balance are rejected
//! - Failed charges append no entry

use freight_ledger::{Config, EntryType, Error, Ledger, UserId};
use proptest::prelude::*;
use rust_decimal::Decimal;
use tempfile::TempDir;

#[derive(Debug, Clone)]
enum Op {
    Deposit(Decimal),
    Charge(Decimal),
    Credit(Decimal),
    Adjust(Decimal),
}

/// Strategy for generating valid amounts (positive decimals)
fn amount_strategy() -> impl Strategy<Value = Decimal> {
    (1i64..50_000i64).prop_map(|cents| Decimal::new(cents, 2))
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        amount_strategy().prop_map(Op::Deposit),
        amount_strategy().prop_map(Op::Charge),
        amount_strategy().prop_map(Op::Credit),
        (amount_strategy(), any::<bool>())
            .prop_map(|(amount, negative)| Op::Adjust(if negative { -amount } else { amount })),
    ]
}

/// Create test ledger with temp directory
fn create_test_ledger() -> (Ledger, TempDir) {
    let temp_dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.data_dir = temp_dir.path().to_path_buf();
    config.rocksdb.sync_writes = false;

    (Ledger::open(config).unwrap(), temp_dir)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Property: balance always equals the sum of entries and never goes negative
    #[test]
    fn prop_balance_matches_entries(ops in prop::collection::vec(op_strategy(), 1..40)) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let (ledger, _temp) = create_test_ledger();
            let carrier = UserId::new();
            let mut expected = Decimal::ZERO;
            let mut expected_entries = 0usize;

            for op in ops {
                let mut txn = ledger.begin();
                let result = match op {
                    Op::Deposit(amount) => ledger.wallets().deposit(&mut txn, carrier, amount, "Top-up").await,
                    Op::Charge(amount) => ledger.wallets().charge(&mut txn, carrier, amount, "Commission", None).await,
                    Op::Credit(amount) => ledger.wallets().credit(&mut txn, carrier, amount, "Payout", None).await,
                    Op::Adjust(amount) => ledger.wallets().adjust(&mut txn, carrier, amount, "Correction").await,
                };

                match result {
                    Ok(entry) => {
                        txn.commit().unwrap();
                        expected += entry.amount;
                        expected_entries += 1;
                        prop_assert_eq!(entry.balance_after, expected);
                    }
                    Err(Error::InsufficientFunds { required, available, .. }) => {
                        prop_assert!(required > available);
                        prop_assert!(!txn.is_dirty());
                    }
                    Err(other) => prop_assert!(false, "unexpected error: {}", other),
                }

                let balance = ledger.balance(carrier).unwrap();
                prop_assert_eq!(balance, expected);
                prop_assert!(balance >= Decimal::ZERO);
            }

            let entries = ledger.entries(carrier).unwrap();
            prop_assert_eq!(entries.len(), expected_entries);
            if expected_entries > 0 {
                let audit = ledger.verify_wallet(carrier).await.unwrap();
                prop_assert!(audit.is_consistent());
            }
            Ok(())
        })?;
    }

    /// Property: a charge succeeds exactly when it fits the balance
    #[test]
    fn prop_charge_never_overdraws(deposit in amount_strategy(), charge in amount_strategy()) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let (ledger, _temp) = create_test_ledger();
            let carrier = UserId::new();
            ledger.deposit(carrier, deposit, "Top-up").await.unwrap();

            let mut txn = ledger.begin();
            let result = ledger.wallets().charge(&mut txn, carrier, charge, "Commission", None).await;

            if charge <= deposit {
                let entry = result.unwrap();
                txn.commit().unwrap();
                prop_assert_eq!(entry.entry_type, EntryType::Commission);
                prop_assert_eq!(ledger.balance(carrier).unwrap(), deposit - charge);
            } else {
                let is_insufficient = matches!(result, Err(Error::InsufficientFunds { .. }));
                prop_assert!(is_insufficient);
                drop(txn);
                prop_assert_eq!(ledger.balance(carrier).unwrap(), deposit);
                prop_assert_eq!(ledger.entries(carrier).unwrap().len(), 1);
            }
            Ok(())
        })?;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_charges_serialize_on_wallet_lock() {
    let (ledger, _temp) = create_test_ledger();
    let ledger = std::sync::Arc::new(ledger);
    let carrier = UserId::new();
    ledger.deposit(carrier, Decimal::from(10), "Top-up").await.unwrap();

    // 20 charges of 1.00 against a balance of 10.00: exactly 10 can win
    let mut handles = Vec::new();
    for _ in 0..20 {
        let ledger = std::sync::Arc::clone(&ledger);
        handles.push(tokio::spawn(async move {
            let mut txn = ledger.begin();
            let result = ledger
                .wallets()
                .charge(&mut txn, carrier, Decimal::ONE, "Commission", None)
                .await;
            match result {
                Ok(_) => txn.commit().map(|_| true),
                Err(Error::InsufficientFunds { .. }) => Ok(false),
                Err(other) => Err(other),
            }
        }));
    }

    let mut succeeded = 0;
    for handle in handles {
        if handle.await.unwrap().unwrap() {
            succeeded += 1;
        }
    }

    assert_eq!(succeeded, 10);
    assert_eq!(ledger.balance(carrier).unwrap(), Decimal::ZERO);
    assert_eq!(ledger.verify_wallet(carrier).await.unwrap().entry_count, 11);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn verify_wallet_is_consistent_during_concurrent_deposits() {
    let (ledger, _temp) = create_test_ledger();
    let ledger = std::sync::Arc::new(ledger);
    let carrier = UserId::new();
    ledger.deposit(carrier, Decimal::ONE, "Top-up").await.unwrap();

    let writer = {
        let ledger = std::sync::Arc::clone(&ledger);
        tokio::spawn(async move {
            for _ in 0..300 {
                ledger.deposit(carrier, Decimal::ONE, "Top-up").await.unwrap();
            }
        })
    };

    let mut audits = 0;
    while !writer.is_finished() {
        let audit = ledger.verify_wallet(carrier).await.unwrap();
        assert!(audit.is_consistent());
        audits += 1;
        tokio::task::yield_now().await;
    }
    writer.await.unwrap();

    assert!(audits > 0);
    let audit = ledger.verify_wallet(carrier).await.unwrap();
    assert_eq!(audit.balance, Decimal::from(301));
    assert_eq!(audit.entry_count, 301);
}

#[tokio::test]
async fn deposit_overflow_is_rejected() {
    let (ledger, _temp) = create_test_ledger();
    let carrier = UserId::new();

    ledger.deposit(carrier, Decimal::MAX, "Top-up").await.unwrap();
    assert!(matches!(
        ledger.deposit(carrier, Decimal::MAX, "Top-up").await,
        Err(Error::InvalidAmount(_))
    ));
    assert!(matches!(
        ledger.adjust(carrier, Decimal::ONE, "Correction").await,
        Err(Error::InvalidAmount(_))
    ));

    assert_eq!(ledger.balance(carrier).unwrap(), Decimal::MAX);
    assert_eq!(ledger.entries(carrier).unwrap().len(), 1);
}
