//! In-memory engine. Used by the test suite and handy for ephemeral dev
//! servers; rooms and rounds do not survive a restart.

use std::{
    collections::{BTreeMap, HashMap},
    ops::Bound,
    sync::Arc,
};

use parking_lot::RwLock;

use super::{increment_bytes, KeyValueDatabaseEngine, KvTree};
use crate::{Config, Result};

#[derive(Default)]
pub struct Engine {
    trees: RwLock<HashMap<&'static str, Arc<MemTree>>>,
}

impl KeyValueDatabaseEngine for Engine {
    fn open(_config: &Config) -> Result<Arc<Self>> {
        Ok(Arc::new(Engine::default()))
    }

    fn open_tree(self: &Arc<Self>, name: &'static str) -> Result<Arc<dyn KvTree>> {
        let tree = Arc::clone(
            self.trees
                .write()
                .entry(name)
                .or_insert_with(|| Arc::new(MemTree::default())),
        );
        Ok(tree)
    }

    fn flush(self: &Arc<Self>) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct MemTree {
    map: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl KvTree for MemTree {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.map.read().get(key).cloned())
    }

    fn insert(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.map.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn remove(&self, key: &[u8]) -> Result<()> {
        self.map.write().remove(key);
        Ok(())
    }

    fn scan_prefix(&self, prefix: Vec<u8>) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let map = self.map.read();
        Ok(map
            .range::<Vec<u8>, _>((Bound::Included(&prefix), Bound::Unbounded))
            .take_while(|(key, _)| key.starts_with(&prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    fn increment(&self, key: &[u8]) -> Result<Vec<u8>> {
        let mut map = self.map.write();
        let new = increment_bytes(map.get(key).map(Vec::as_slice));
        map.insert(key.to_vec(), new.clone());
        Ok(new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> Arc<MemTree> {
        Arc::new(MemTree::default())
    }

    #[test]
    fn scan_prefix_respects_boundaries() {
        let tree = tree();
        tree.insert(b"a\xffx", b"1").unwrap();
        tree.insert(b"a\xffy", b"2").unwrap();
        tree.insert(b"b\xffz", b"3").unwrap();

        let rows = tree.scan_prefix(b"a\xff".to_vec()).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].1, b"1");
        assert_eq!(rows[1].1, b"2");
    }

    #[test]
    fn increment_starts_at_one() {
        let tree = tree();
        assert_eq!(tree.increment(b"counter").unwrap(), 1u64.to_be_bytes());
        assert_eq!(tree.increment(b"counter").unwrap(), 2u64.to_be_bytes());
    }
}
