// Store - Persistent key-value storage using sled
//
// One sled database per process. Each service opens its own named trees
// through `Store::table`; the default tree holds service keypairs.

use crate::identity::Keypair;
use crate::storage::Table;
use std::path::Path;
use thiserror::Error;

mod keys {
    pub const KEYPAIR_PREFIX: &[u8] = b"identity:keypair:";
}

/// Errors from storage operations
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to open database: {0}")]
    OpenFailed(String),

    #[error("Database operation failed: {0}")]
    DatabaseError(String),

    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),

    #[error("Flush failed: {0}")]
    FlushFailed(String),
}

impl From<sled::Error> for StoreError {
    fn from(err: sled::Error) -> Self {
        StoreError::DatabaseError(err.to_string())
    }
}

/// Statistics about the storage
#[derive(Clone, Debug)]
pub struct StorageStats {
    /// Number of named trees, including the default tree
    pub tree_count: usize,
    /// Approximate disk size in bytes
    pub disk_size_bytes: u64,
}

/// Persistent store shared by the marketplace, escrow and ledger services.
///
/// Cloning is cheap; clones share the same underlying database.
#[derive(Clone)]
pub struct Store {
    db: sled::Db,
}

impl Store {
    /// Open or create a store at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = sled::open(path).map_err(|e| StoreError::OpenFailed(e.to_string()))?;
        Ok(Self { db })
    }

    /// Open a store that is deleted when dropped
    pub fn temporary() -> Result<Self, StoreError> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| StoreError::OpenFailed(e.to_string()))?;
        Ok(Self { db })
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.db.is_empty())
    }

    /// Flush all pending writes to disk
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db
            .flush()
            .map_err(|e| StoreError::FlushFailed(e.to_string()))?;
        Ok(())
    }

    pub fn stats(&self) -> Result<StorageStats, StoreError> {
        Ok(StorageStats {
            tree_count: self.db.tree_names().len(),
            disk_size_bytes: self.db.size_on_disk().unwrap_or(0),
        })
    }

    /// Open a typed table backed by the named tree
    pub fn table<T>(&self, name: &str) -> Result<Table<T>, StoreError> {
        Ok(Table::new(self.db.open_tree(name)?))
    }

    // ========================================================================
    // RAW KEY-VALUE OPERATIONS
    // ========================================================================

    pub fn put_raw(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.db.insert(key, value)?;
        Ok(())
    }

    pub fn get_raw(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.db.get(key)?.map(|v| v.to_vec()))
    }

    pub fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
        self.db.remove(key)?;
        Ok(())
    }

    // ========================================================================
    // SERVICE IDENTITIES
    // ========================================================================

    /// Save a keypair under a label
    pub fn save_keypair(&self, label: &str, keypair: &Keypair) -> Result<(), StoreError> {
        let key = [keys::KEYPAIR_PREFIX, label.as_bytes()].concat();
        self.put_raw(&key, &keypair.to_bytes())
    }

    /// Load a keypair by label
    pub fn load_keypair(&self, label: &str) -> Result<Option<Keypair>, StoreError> {
        let key = [keys::KEYPAIR_PREFIX, label.as_bytes()].concat();
        match self.get_raw(&key)? {
            Some(bytes) => {
                let keypair = Keypair::from_bytes(&bytes)
                    .map_err(|e| StoreError::DeserializationFailed(e.to_string()))?;
                Ok(Some(keypair))
            }
            None => Ok(None),
        }
    }

    /// Load the keypair for a label, generating and saving one on first use
    pub fn get_or_create_keypair(&self, label: &str) -> Result<Keypair, StoreError> {
        if let Some(keypair) = self.load_keypair(label)? {
            return Ok(keypair);
        }

        let keypair = Keypair::generate();
        self.save_keypair(label, &keypair)?;
        tracing::info!(label, did = %keypair.did(), "generated service identity");
        Ok(keypair)
    }

    /// Labels of all stored keypairs
    pub fn keypair_labels(&self) -> Result<Vec<String>, StoreError> {
        let mut labels = Vec::new();
        for result in self.db.scan_prefix(keys::KEYPAIR_PREFIX) {
            let (key, _) = result?;
            labels.push(String::from_utf8_lossy(&key[keys::KEYPAIR_PREFIX.len()..]).into_owned());
        }
        Ok(labels)
    }
}
