// Typed tables over sled trees, plus helpers for multi-tree transactions

use crate::storage::StoreError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::transaction::{ConflictableTransactionError, TransactionError, TransactionalTree};
use std::marker::PhantomData;

/// Result type inside a sled transaction closure
pub type TxResult<T, E> = Result<T, ConflictableTransactionError<E>>;

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    postcard::to_allocvec(value).map_err(|e| StoreError::SerializationFailed(e.to_string()))
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    postcard::from_bytes(bytes).map_err(|e| StoreError::DeserializationFailed(e.to_string()))
}

/// A sled tree holding postcard-encoded values of one entity type
pub struct Table<T> {
    tree: sled::Tree,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Table<T> {
    fn clone(&self) -> Self {
        Self {
            tree: self.tree.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> Table<T> {
    pub(crate) fn new(tree: sled::Tree) -> Self {
        Self {
            tree,
            _marker: PhantomData,
        }
    }

    /// The underlying tree, for use in transactions
    pub fn tree(&self) -> &sled::Tree {
        &self.tree
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }
}

impl<T: Serialize + DeserializeOwned> Table<T> {
    pub fn get(&self, key: &[u8]) -> Result<Option<T>, StoreError> {
        match self.tree.get(key)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn insert(&self, key: &[u8], value: &T) -> Result<(), StoreError> {
        self.tree.insert(key, encode(value)?)?;
        Ok(())
    }

    pub fn contains(&self, key: &[u8]) -> Result<bool, StoreError> {
        Ok(self.tree.contains_key(key)?)
    }

    /// All values in key order
    pub fn values(&self) -> Result<Vec<T>, StoreError> {
        self.tree
            .iter()
            .values()
            .map(|bytes| decode(&bytes?))
            .collect()
    }

    /// Values in key order matching a predicate
    pub fn filter<F>(&self, mut predicate: F) -> Result<Vec<T>, StoreError>
    where
        F: FnMut(&T) -> bool,
    {
        let mut out = Vec::new();
        for bytes in self.tree.iter().values() {
            let value: T = decode(&bytes?)?;
            if predicate(&value) {
                out.push(value);
            }
        }
        Ok(out)
    }

    /// A page of values in key order
    pub fn page(&self, offset: usize, limit: usize) -> Result<Vec<T>, StoreError> {
        self.tree
            .iter()
            .values()
            .skip(offset)
            .take(limit)
            .map(|bytes| decode(&bytes?))
            .collect()
    }

    /// Values whose keys start with `prefix`
    pub fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<T>, StoreError> {
        self.tree
            .scan_prefix(prefix)
            .values()
            .map(|bytes| decode(&bytes?))
            .collect()
    }
}

// ============================================================================
// TRANSACTION HELPERS
// ============================================================================

/// Abort a transaction with a service error
pub fn abort<T, E>(err: E) -> TxResult<T, E> {
    Err(ConflictableTransactionError::Abort(err))
}

pub fn tx_get<T, E>(tree: &TransactionalTree, key: &[u8]) -> TxResult<Option<T>, E>
where
    T: DeserializeOwned,
    E: From<StoreError>,
{
    match tree.get(key)? {
        Some(bytes) => match decode(&bytes) {
            Ok(value) => Ok(Some(value)),
            Err(e) => abort(E::from(e)),
        },
        None => Ok(None),
    }
}

pub fn tx_put<T, E>(tree: &TransactionalTree, key: &[u8], value: &T) -> TxResult<(), E>
where
    T: Serialize,
    E: From<StoreError>,
{
    match encode(value) {
        Ok(bytes) => {
            tree.insert(key, bytes)?;
            Ok(())
        }
        Err(e) => abort(E::from(e)),
    }
}

/// Allocate the next value of a monotonic counter stored under `counter_key`.
/// Counters start at 1.
pub fn tx_next_id<E>(tree: &TransactionalTree, counter_key: &[u8]) -> TxResult<u64, E>
where
    E: From<StoreError>,
{
    let current = match tree.get(counter_key)? {
        Some(bytes) => {
            let arr: [u8; 8] = match bytes.as_ref().try_into() {
                Ok(arr) => arr,
                Err(_) => {
                    return abort(E::from(StoreError::DeserializationFailed(
                        "counter is not 8 bytes".to_string(),
                    )))
                }
            };
            u64::from_be_bytes(arr)
        }
        None => 0,
    };
    let next = current + 1;
    tree.insert(counter_key, next.to_be_bytes().to_vec())?;
    Ok(next)
}

/// Collapse a sled transaction result into the service error type
pub fn finish<T, E>(result: Result<T, TransactionError<E>>) -> Result<T, E>
where
    E: From<StoreError>,
{
    match result {
        Ok(value) => Ok(value),
        Err(TransactionError::Abort(e)) => Err(e),
        Err(TransactionError::Storage(e)) => Err(E::from(StoreError::from(e))),
    }
}
