//! Multi-record atomic transactions
//!
//! A [`Transaction`] buffers every write in memory and reads its own writes.
//! [`Transaction::commit`] applies the buffer as one RocksDB `WriteBatch`;
//! dropping an uncommitted transaction discards the buffer, so a failure at
//! any step leaves nothing observable. Row locks taken through the
//! transaction are held until it is committed or dropped.

use crate::{
    locks::{LockGuard, LockKey, LockManager},
    metrics::Metrics,
    schema::{Family, Index, Record},
    storage::Storage,
    Error, Result,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Unit of work over the ledger store
pub struct Transaction {
    id: Uuid,
    storage: Arc<Storage>,
    locks: Arc<LockManager>,
    metrics: Metrics,
    held: Vec<LockGuard>,
    held_keys: HashSet<LockKey>,
    writes: BTreeMap<(Family, Vec<u8>), Option<Vec<u8>>>,
    committed: bool,
}

impl Transaction {
    pub(crate) fn begin(storage: Arc<Storage>, locks: Arc<LockManager>, metrics: Metrics) -> Self {
        Self {
            id: Uuid::now_v7(),
            storage,
            locks,
            metrics,
            held: Vec::new(),
            held_keys: HashSet::new(),
            writes: BTreeMap::new(),
            committed: false,
        }
    }

    /// Transaction id (for logs)
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Whether any write is staged
    pub fn is_dirty(&self) -> bool {
        !self.writes.is_empty()
    }

    // Locking

    /// Acquire an exclusive lock, held until commit or rollback
    ///
    /// Re-locking a key this transaction already holds is a no-op.
    pub async fn lock(&mut self, key: LockKey) -> Result<()> {
        if self.held_keys.contains(&key) {
            return Ok(());
        }
        let guard = self.locks.acquire(key.clone()).await?;
        self.held.push(guard);
        self.held_keys.insert(key);
        Ok(())
    }

    /// Lock the row of record `id`
    pub async fn lock_record<R: Record>(&mut self, id: Uuid) -> Result<()> {
        self.lock(LockKey::record(R::FAMILY, id)).await
    }

    /// Whether this transaction holds `key`
    pub fn holds(&self, key: &LockKey) -> bool {
        self.held_keys.contains(key)
    }

    // Reads (staged writes first, then committed state)

    /// Raw value under `key`
    pub fn get_raw(&self, family: Family, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match self.writes.get(&(family, key.to_vec())) {
            Some(staged) => Ok(staged.clone()),
            None => self.storage.get_raw(family, key),
        }
    }

    /// Decoded value under `key`
    pub fn get<T: DeserializeOwned>(&self, family: Family, key: &[u8]) -> Result<Option<T>> {
        match self.get_raw(family, key)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Load a record if present
    pub fn load<R: Record>(&self, id: Uuid) -> Result<Option<R>> {
        self.get(R::FAMILY, id.as_bytes())
    }

    /// Load a record that must exist
    pub fn fetch<R: Record>(&self, id: Uuid) -> Result<R> {
        self.load(id)?.ok_or(Error::RecordNotFound {
            family: R::FAMILY.name(),
            id,
        })
    }

    /// Children of `parent`, including staged links and excluding staged unlinks
    pub fn members(&self, index: Index, parent: Uuid) -> Result<Vec<Uuid>> {
        let mut members = self.storage.index_members(index, parent)?;
        let prefix = index.prefix(parent);

        for ((family, key), value) in &self.writes {
            if *family != Family::Indices || !key.starts_with(&prefix) {
                continue;
            }
            let Some(child) = Index::child_of(key) else {
                continue;
            };
            match value {
                Some(_) if !members.contains(&child) => members.push(child),
                None => members.retain(|member| *member != child),
                _ => {}
            }
        }

        Ok(members)
    }

    // Writes (staged until commit)

    /// Stage a value under `key`
    pub fn put<T: Serialize>(&mut self, family: Family, key: Vec<u8>, value: &T) -> Result<()> {
        let bytes = bincode::serialize(value)?;
        self.writes.insert((family, key), Some(bytes));
        Ok(())
    }

    /// Stage a deletion of `key`
    pub fn delete(&mut self, family: Family, key: Vec<u8>) {
        self.writes.insert((family, key), None);
    }

    /// Stage a record under its id
    pub fn save<R: Record>(&mut self, record: &R) -> Result<()> {
        self.put(R::FAMILY, record.id().as_bytes().to_vec(), record)
    }

    /// Stage a record deletion
    pub fn remove<R: Record>(&mut self, id: Uuid) {
        self.delete(R::FAMILY, id.as_bytes().to_vec());
    }

    /// Stage an index link
    pub fn link(&mut self, index: Index, parent: Uuid, child: Uuid) {
        self.writes
            .insert((Family::Indices, index.key(parent, child)), Some(Vec::new()));
    }

    /// Stage an index unlink
    pub fn unlink(&mut self, index: Index, parent: Uuid, child: Uuid) {
        self.delete(Family::Indices, index.key(parent, child));
    }

    /// Apply every staged write atomically, then release the locks
    pub fn commit(mut self) -> Result<()> {
        let writes = std::mem::take(&mut self.writes);
        let count = self
            .storage
            .write(writes.into_iter().map(|((family, key), value)| (family, key, value)))?;
        self.committed = true;
        self.metrics.commits_total.inc();

        tracing::debug!(
            txn_id = %self.id,
            writes = count,
            locks = self.held.len(),
            "Transaction committed"
        );

        Ok(())
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("locks", &self.held_keys)
            .field("staged_writes", &self.writes.len())
            .field("committed", &self.committed)
            .finish()
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.committed && !self.writes.is_empty() {
            tracing::debug!(
                txn_id = %self.id,
                discarded_writes = self.writes.len(),
                "Transaction rolled back"
            );
        }
        // Locks release after the writes above are either applied or discarded.
        self.held.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{UserId, Wallet};
    use crate::{Config, Ledger};
    use rust_decimal::Decimal;
    use tempfile::TempDir;

    fn test_ledger() -> (Ledger, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        config.rocksdb.sync_writes = false;
        config.locks.timeout_ms = 100;
        (Ledger::open(config).unwrap(), temp_dir)
    }

    #[tokio::test]
    async fn test_read_your_writes() {
        let (ledger, _temp) = test_ledger();
        let mut txn = ledger.begin();
        let mut wallet = Wallet::open(UserId::new());
        wallet.balance = Decimal::from(7);

        txn.save(&wallet).unwrap();
        let staged: Wallet = txn.fetch(wallet.owner.as_uuid()).unwrap();
        assert_eq!(staged.balance, Decimal::from(7));

        // Not visible outside the transaction before commit
        assert!(ledger.load::<Wallet>(wallet.owner.as_uuid()).unwrap().is_none());

        txn.commit().unwrap();
        assert!(ledger.load::<Wallet>(wallet.owner.as_uuid()).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_drop_discards_writes() {
        let (ledger, _temp) = test_ledger();
        let wallet = Wallet::open(UserId::new());
        {
            let mut txn = ledger.begin();
            txn.save(&wallet).unwrap();
            txn.link(Index::EntriesByWallet, wallet.owner.as_uuid(), Uuid::now_v7());
        }

        assert!(ledger.load::<Wallet>(wallet.owner.as_uuid()).unwrap().is_none());
        assert!(ledger
            .members(Index::EntriesByWallet, wallet.owner.as_uuid())
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_members_overlay_staged_links() {
        let (ledger, _temp) = test_ledger();
        let parent = Uuid::new_v4();
        let kept = Uuid::new_v4();
        let dropped = Uuid::new_v4();

        let mut txn = ledger.begin();
        txn.link(Index::OffersByShipment, parent, kept);
        txn.link(Index::OffersByShipment, parent, dropped);
        txn.commit().unwrap();

        let added = Uuid::new_v4();
        let mut txn = ledger.begin();
        txn.unlink(Index::OffersByShipment, parent, dropped);
        txn.link(Index::OffersByShipment, parent, added);

        let mut members = txn.members(Index::OffersByShipment, parent).unwrap();
        members.sort();
        let mut expected = vec![kept, added];
        expected.sort();
        assert_eq!(members, expected);
    }

    #[tokio::test]
    async fn test_locks_released_on_commit_and_drop() {
        let (ledger, _temp) = test_ledger();
        let id = Uuid::new_v4();

        let mut first = ledger.begin();
        first.lock_record::<Wallet>(id).await.unwrap();
        // Relocking inside the same transaction does not deadlock
        first.lock_record::<Wallet>(id).await.unwrap();

        let mut second = ledger.begin();
        assert!(matches!(
            second.lock_record::<Wallet>(id).await,
            Err(Error::LockTimeout { .. })
        ));

        first.commit().unwrap();
        second.lock_record::<Wallet>(id).await.unwrap();
        drop(second);

        let mut third = ledger.begin();
        third.lock_record::<Wallet>(id).await.unwrap();
    }
}
