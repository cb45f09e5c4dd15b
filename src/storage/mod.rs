// Storage module - PERSISTENCE
// sled-backed store, typed tables and transaction helpers

mod store;
mod table;

pub use store::{StorageStats, Store, StoreError};
pub use table::{abort, decode, encode, finish, tx_get, tx_next_id, tx_put, Table, TxResult};
