// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # In-memory backend
//!

use crate::{
    database::{Collection, DbManager},
    error::Error,
};

use std::{
    collections::{BTreeMap, HashMap},
    ops::Bound,
    sync::{Arc, RwLock},
};

type MemoryData = Arc<
    RwLock<HashMap<(String, String), Arc<RwLock<BTreeMap<String, Vec<u8>>>>>>,
>;

/// In-memory database manager. Collections created with the same name and
/// prefix share their data, so a re-created collection sees what a previous
/// incarnation stored.
#[derive(Default, Clone)]
pub struct MemoryManager {
    data: MemoryData,
}

impl DbManager for MemoryManager {
    fn create_collection(
        &self,
        name: &str,
        prefix: &str,
    ) -> Result<Box<dyn Collection>, Error> {
        let mut data_lock = self.data.write().map_err(|e| {
            Error::Store(format!("Can not lock manager data: {}", e))
        })?;
        let data = if let Some(data) = data_lock
            .get(&(name.to_owned(), prefix.to_owned()))
            .cloned()
        {
            data
        } else {
            let default = Arc::new(RwLock::new(BTreeMap::new()));
            data_lock
                .insert((name.to_owned(), prefix.to_owned()), default.clone());
            default
        };
        Ok(Box::new(MemoryStore {
            name: name.to_owned(),
            data,
        }))
    }
}

/// In-memory collection backed by a shared ordered map.
#[derive(Default, Clone)]
pub struct MemoryStore {
    name: String,
    data: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
}

impl Collection for MemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, Error> {
        let lock = self
            .data
            .read()
            .map_err(|e| Error::Store(format!("Can not lock data: {}", e)))?;
        match lock.get(key) {
            Some(value) => Ok(value.clone()),
            None => Err(Error::EntryNotFound),
        }
    }

    fn put(&mut self, key: &str, data: &[u8]) -> Result<(), Error> {
        let mut lock = self
            .data
            .write()
            .map_err(|e| Error::Store(format!("Can not lock data: {}", e)))?;
        lock.insert(key.to_owned(), data.to_vec());
        Ok(())
    }

    fn del(&mut self, key: &str) -> Result<(), Error> {
        let mut lock = self
            .data
            .write()
            .map_err(|e| Error::Store(format!("Can not lock data: {}", e)))?;
        lock.remove(key);
        Ok(())
    }

    fn last(&self) -> Option<(String, Vec<u8>)> {
        let lock = self.data.read().ok()?;
        lock.iter().next_back().map(|(k, v)| (k.clone(), v.clone()))
    }

    fn after(&self, key: &str) -> Vec<(String, Vec<u8>)> {
        let Ok(lock) = self.data.read() else {
            return Vec::new();
        };
        lock.range((Bound::Excluded(key.to_owned()), Bound::Unbounded))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn purge(&mut self) -> Result<(), Error> {
        let mut lock = self
            .data
            .write()
            .map_err(|e| Error::Store(format!("Can not lock data: {}", e)))?;
        lock.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn test_put_get_del() {
        let manager = MemoryManager::default();
        let mut collection =
            manager.create_collection("events", "player-1").unwrap();
        assert_eq!(collection.get("a"), Err(Error::EntryNotFound));
        collection.put("a", b"one").unwrap();
        assert_eq!(collection.get("a").unwrap(), b"one".to_vec());
        collection.del("a").unwrap();
        assert_eq!(collection.get("a"), Err(Error::EntryNotFound));
    }

    #[test]
    fn test_last_and_after_follow_key_order() {
        let manager = MemoryManager::default();
        let mut collection =
            manager.create_collection("events", "player-1").unwrap();
        collection.put("00000000000000000001", b"one").unwrap();
        collection.put("00000000000000000003", b"three").unwrap();
        collection.put("00000000000000000002", b"two").unwrap();

        let (key, value) = collection.last().unwrap();
        assert_eq!(key, "00000000000000000003");
        assert_eq!(value, b"three".to_vec());

        let tail = collection.after("00000000000000000001");
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].1, b"two".to_vec());
        assert_eq!(tail[1].1, b"three".to_vec());
    }

    #[test]
    fn test_collections_share_data_by_name_and_prefix() {
        let manager = MemoryManager::default();
        let mut first =
            manager.create_collection("states", "room-1").unwrap();
        first.put("k", b"v").unwrap();

        let second = manager.create_collection("states", "room-1").unwrap();
        assert_eq!(second.get("k").unwrap(), b"v".to_vec());

        let other = manager.create_collection("states", "room-2").unwrap();
        assert_eq!(other.get("k"), Err(Error::EntryNotFound));
    }
}
