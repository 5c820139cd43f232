//! Request deduplication
//!
//! A mutating request carrying a caller-supplied token runs at most once per
//! `(actor, token)`. Concurrent calls with the same key serialize on a
//! token lock; the loser of the race sees the winner's stored response.
//! Only successful responses are stored, so a retry after a failure executes
//! again and observes whatever state the first attempt left.

use crate::metrics::SettlementMetrics;
use crate::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use freight_ledger::{Family, Ledger, LockKey, UserId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::future::Future;

/// Key of an idempotency record
pub type TokenKey = [u8; 32];

/// Stored outcome of a request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    /// Caller
    pub actor: UserId,

    /// Operation name, e.g. `accept_offer`
    pub operation: String,

    /// SHA-256 of the request parameters
    pub fingerprint: [u8; 32],

    /// bincode-encoded response
    pub response: Vec<u8>,

    /// When the request first succeeded
    pub created_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    fn is_expired(&self, retention: Duration, now: DateTime<Utc>) -> bool {
        self.created_at + retention < now
    }
}

/// `SHA-256(actor || token)`
pub fn token_key(actor: UserId, token: &str) -> TokenKey {
    let mut hasher = Sha256::new();
    hasher.update(actor.as_uuid().as_bytes());
    hasher.update(token.as_bytes());
    hasher.finalize().into()
}

/// Fingerprint of a request's parameters
pub fn fingerprint<T: Serialize + ?Sized>(request: &T) -> Result<[u8; 32]> {
    let bytes = bincode::serialize(request)?;
    Ok(Sha256::digest(&bytes).into())
}

/// Deduplicates retried requests
#[derive(Debug, Clone)]
pub struct IdempotencyGuard {
    retention: Duration,
    metrics: SettlementMetrics,
}

impl IdempotencyGuard {
    /// Create a guard keeping records for `retention`
    pub fn new(retention: Duration, metrics: SettlementMetrics) -> Self {
        Self { retention, metrics }
    }

    /// Run `op` once per `(actor, token)`
    ///
    /// A stored response for the same operation and fingerprint is returned
    /// without running `op`. A stored response for anything else is a
    /// `Conflict`.
    pub async fn run<T, F, Fut>(
        &self,
        ledger: &Ledger,
        actor: UserId,
        token: &str,
        operation: &'static str,
        fingerprint: [u8; 32],
        op: F,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if token.trim().is_empty() {
            return Err(Error::Validation("idempotency token must not be empty".to_string()));
        }

        let key = token_key(actor, token);
        let mut guard = ledger.begin();
        guard.lock(LockKey::Token(key)).await?;

        let existing: Option<IdempotencyRecord> = guard.get(Family::Idempotency, &key)?;
        if let Some(record) = existing.filter(|r| !r.is_expired(self.retention, Utc::now())) {
            if record.operation != operation || record.fingerprint != fingerprint {
                self.metrics.conflicts.inc();
                tracing::warn!(
                    actor = %actor,
                    operation,
                    stored_operation = %record.operation,
                    "Idempotency token reused for a different request"
                );
                return Err(Error::Conflict(
                    "idempotency token was already used for a different request".to_string(),
                ));
            }

            self.metrics.idempotent_replays.inc();
            tracing::info!(actor = %actor, operation, "Replaying stored response");
            return Ok(bincode::deserialize(&record.response)?);
        }

        let response = op().await?;

        let record = IdempotencyRecord {
            actor,
            operation: operation.to_string(),
            fingerprint,
            response: bincode::serialize(&response)?,
            created_at: Utc::now(),
        };
        guard.put(Family::Idempotency, key.to_vec(), &record)?;

        // The operation itself is already committed; a lost record only
        // means a retry runs again and gets the post-state answer.
        if let Err(e) = guard.commit() {
            tracing::warn!(actor = %actor, operation, error = %e, "Failed to store idempotency record");
        }

        Ok(response)
    }

    /// Delete records older than the retention window
    pub async fn purge(&self, ledger: &Ledger, now: DateTime<Utc>) -> Result<usize> {
        let expired: Vec<TokenKey> = ledger
            .scan::<IdempotencyRecord>(Family::Idempotency)?
            .into_iter()
            .filter(|(_, record)| record.is_expired(self.retention, now))
            .filter_map(|(key, _)| TokenKey::try_from(key.as_slice()).ok())
            .collect();

        if expired.is_empty() {
            return Ok(0);
        }

        let mut txn = ledger.begin();
        let mut purged = 0;
        for key in expired {
            txn.lock(LockKey::Token(key)).await?;
            // Re-read under the lock: a concurrent request may have replaced it.
            let current: Option<IdempotencyRecord> = txn.get(Family::Idempotency, &key)?;
            if current.is_some_and(|r| r.is_expired(self.retention, now)) {
                txn.delete(Family::Idempotency, key.to_vec());
                purged += 1;
            }
        }
        txn.commit()?;

        tracing::info!(purged, "Purged expired idempotency records");
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::Registry;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn setup() -> (Ledger, IdempotencyGuard, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let mut config = freight_ledger::Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        config.rocksdb.sync_writes = false;
        let ledger = Ledger::open(config).unwrap();
        let metrics = SettlementMetrics::register(&Registry::new()).unwrap();
        (ledger, IdempotencyGuard::new(Duration::hours(1), metrics), temp_dir)
    }

    #[test]
    fn test_token_key_scoped_by_actor() {
        let a = UserId::new();
        let b = UserId::new();
        assert_eq!(token_key(a, "t-1"), token_key(a, "t-1"));
        assert_ne!(token_key(a, "t-1"), token_key(b, "t-1"));
        assert_ne!(token_key(a, "t-1"), token_key(a, "t-2"));
    }

    #[tokio::test]
    async fn test_second_call_replays() {
        let (ledger, guard, _temp) = setup();
        let actor = UserId::new();
        let calls = AtomicUsize::new(0);
        let print = fingerprint(&("accept", 1u32)).unwrap();

        for _ in 0..2 {
            let value: u64 = guard
                .run(&ledger, actor, "req-1", "accept_offer", print, || async {
                    Ok(calls.fetch_add(1, Ordering::SeqCst) as u64 + 41)
                })
                .await
                .unwrap();
            assert_eq!(value, 41);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_mismatched_fingerprint_conflicts() {
        let (ledger, guard, _temp) = setup();
        let actor = UserId::new();

        guard
            .run(&ledger, actor, "req-1", "accept_offer", [1; 32], || async { Ok(1u8) })
            .await
            .unwrap();

        let err = guard
            .run(&ledger, actor, "req-1", "accept_offer", [2; 32], || async { Ok(2u8) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        let err = guard
            .run(&ledger, actor, "req-1", "create_offer", [1; 32], || async { Ok(3u8) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn test_failures_are_not_stored() {
        let (ledger, guard, _temp) = setup();
        let actor = UserId::new();

        let first: Result<u8> = guard
            .run(&ledger, actor, "req-1", "accept_offer", [0; 32], || async {
                Err(Error::Transient("lock timeout".to_string()))
            })
            .await;
        assert!(first.is_err());

        let second = guard
            .run(&ledger, actor, "req-1", "accept_offer", [0; 32], || async { Ok(7u8) })
            .await
            .unwrap();
        assert_eq!(second, 7);
    }

    #[tokio::test]
    async fn test_empty_token_rejected() {
        let (ledger, guard, _temp) = setup();
        let err = guard
            .run(&ledger, UserId::new(), "  ", "accept_offer", [0; 32], || async { Ok(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_purge_removes_only_expired() {
        let (ledger, guard, _temp) = setup();
        let actor = UserId::new();

        guard
            .run(&ledger, actor, "old", "create_offer", [0; 32], || async { Ok(()) })
            .await
            .unwrap();

        assert_eq!(guard.purge(&ledger, Utc::now()).await.unwrap(), 0);
        assert_eq!(
            guard.purge(&ledger, Utc::now() + Duration::hours(2)).await.unwrap(),
            1
        );
        assert!(ledger
            .get::<IdempotencyRecord>(Family::Idempotency, &token_key(actor, "old"))
            .unwrap()
            .is_none());
    }
}
