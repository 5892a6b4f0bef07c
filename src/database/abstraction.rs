use std::sync::Arc;

use crate::{Config, Result};

pub mod memory;
pub mod sqlite;

pub trait KeyValueDatabaseEngine: Send + Sync {
    fn open(config: &Config) -> Result<Arc<Self>>
    where
        Self: Sized;

    fn open_tree(self: &Arc<Self>, name: &'static str) -> Result<Arc<dyn KvTree>>;

    fn flush(self: &Arc<Self>) -> Result<()>;
}

pub trait KvTree: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    fn insert(&self, key: &[u8], value: &[u8]) -> Result<()>;

    fn remove(&self, key: &[u8]) -> Result<()>;

    /// All entries whose key starts with `prefix`, in ascending key order.
    fn scan_prefix(&self, prefix: Vec<u8>) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Atomically bumps the big-endian u64 at `key`, starting at 1.
    fn increment(&self, key: &[u8]) -> Result<Vec<u8>>;
}

pub fn increment_bytes(old: Option<&[u8]>) -> Vec<u8> {
    let number = match old.map(TryInto::try_into) {
        Some(Ok(bytes)) => {
            let number = u64::from_be_bytes(bytes);
            number + 1
        }
        // Start at one, zero is reserved for "nothing recorded yet"
        _ => 1,
    };

    number.to_be_bytes().to_vec()
}
