//! Storage layer using RocksDB
//!
//! # Column Families
//!
//! - `shipments`, `offers`, `listings`, `bids` - Marketplace records (key: id)
//! - `wallets` - Carrier wallets (key: owner id)
//! - `entries` - Append-only ledger entries (key: entry id)
//! - `indices` - Secondary indices (see [`crate::schema::Index`])
//! - `idempotency` - Stored responses of mutating requests
//!
//! Writes only reach the database through [`Storage::write`], which applies a
//! whole transaction as one atomic `WriteBatch`.

use crate::{
    error::{Error, Result},
    schema::{Family, Index, Record},
    Config,
};
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch,
    WriteOptions, DB,
};
use serde::de::DeserializeOwned;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// A staged change: `Some(bytes)` puts, `None` deletes
pub type StagedWrite = (Family, Vec<u8>, Option<Vec<u8>>);

/// Storage wrapper for RocksDB
pub struct Storage {
    db: DB,
    sync_writes: bool,
}

impl fmt::Debug for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Storage")
            .field("path", &self.db.path())
            .field("sync_writes", &self.sync_writes)
            .finish()
    }
}

impl Storage {
    /// Open or create database
    pub fn open(config: &Config) -> Result<Self> {
        let path = &config.data_dir;

        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);

        if config.rocksdb.enable_statistics {
            db_opts.enable_statistics();
        }

        let cf_descriptors = Family::ALL
            .iter()
            .map(|family| ColumnFamilyDescriptor::new(family.name(), Self::cf_options(*family)))
            .collect::<Vec<_>>();

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        tracing::info!(
            path = ?path,
            column_families = Family::ALL.len(),
            "Opened RocksDB"
        );

        Ok(Self {
            db,
            sync_writes: config.rocksdb.sync_writes,
        })
    }

    fn cf_options(family: Family) -> Options {
        let mut opts = Options::default();
        match family {
            Family::Entries => {
                // Append-only history, rarely read
                opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
            }
            Family::Indices => {
                opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
                let mut block_opts = rocksdb::BlockBasedOptions::default();
                block_opts.set_bloom_filter(10.0, false);
                opts.set_block_based_table_factory(&block_opts);
            }
            _ => {
                opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
            }
        }
        opts
    }

    fn cf_handle(&self, family: Family) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(family.name())
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", family)))
    }

    // Reads

    /// Raw value under `key`
    pub fn get_raw(&self, family: Family, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let cf = self.cf_handle(family)?;
        Ok(self.db.get_cf(&cf, key)?)
    }

    /// Decoded value under `key`
    pub fn get<T: DeserializeOwned>(&self, family: Family, key: &[u8]) -> Result<Option<T>> {
        match self.get_raw(family, key)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Load a record by id
    pub fn load<R: Record>(&self, id: Uuid) -> Result<Option<R>> {
        self.get(R::FAMILY, id.as_bytes())
    }

    /// Committed children of `parent` in `index`, in key order
    pub fn index_members(&self, index: Index, parent: Uuid) -> Result<Vec<Uuid>> {
        let cf = self.cf_handle(Family::Indices)?;
        let prefix = index.prefix(parent);

        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&prefix, Direction::Forward));

        let mut members = Vec::new();
        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            if let Some(child) = Index::child_of(&key) {
                members.push(child);
            }
        }

        Ok(members)
    }

    /// Every decoded value in a family
    pub fn scan<T: DeserializeOwned>(&self, family: Family) -> Result<Vec<(Vec<u8>, T)>> {
        let cf = self.cf_handle(family)?;
        let mut values = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, value) = item?;
            values.push((key.to_vec(), bincode::deserialize(&value)?));
        }
        Ok(values)
    }

    // Writes

    /// Apply staged writes atomically
    pub fn write(&self, writes: impl IntoIterator<Item = StagedWrite>) -> Result<usize> {
        let mut batch = WriteBatch::default();
        let mut count = 0;

        for (family, key, value) in writes {
            let cf = self.cf_handle(family)?;
            match value {
                Some(bytes) => batch.put_cf(&cf, &key, &bytes),
                None => batch.delete_cf(&cf, &key),
            }
            count += 1;
        }

        if count == 0 {
            return Ok(0);
        }

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        Ok(count)
    }

    // Statistics

    /// Get storage statistics
    pub fn get_stats(&self) -> Result<StorageStats> {
        Ok(StorageStats {
            shipments: self.approximate_count(Family::Shipments)?,
            offers: self.approximate_count(Family::Offers)?,
            wallets: self.approximate_count(Family::Wallets)?,
            entries: self.approximate_count(Family::Entries)?,
        })
    }

    fn approximate_count(&self, family: Family) -> Result<u64> {
        let cf = self.cf_handle(family)?;
        let prop = self
            .db
            .property_int_value_cf(&cf, "rocksdb.estimate-num-keys")?
            .unwrap_or(0);

        Ok(prop)
    }
}

/// Storage statistics (approximate key counts)
#[derive(Debug, Clone)]
pub struct StorageStats {
    /// Shipments stored
    pub shipments: u64,
    /// Offers stored
    pub offers: u64,
    /// Wallets stored
    pub wallets: u64,
    /// Ledger entries stored
    pub entries: u64,
}
