use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::sync::Mutex;

/// Durable string key-value storage. Multi-key writes and removals are all-or-nothing.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Read several keys from one consistent snapshot.
    fn get_all(&self, keys: &[&str]) -> Result<Vec<Option<String>>> {
        keys.iter().map(|k| self.get(k)).collect()
    }

    fn set_all(&self, pairs: &[(&str, String)]) -> Result<()>;

    fn remove_all(&self, keys: &[&str]) -> Result<()>;
}

/// Process-local store, for tests and for runs that must not touch disk.
#[derive(Default)]
pub struct MemoryStore {
    map: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, String>>> {
        self.map.lock().map_err(|_| anyhow!("memory store lock poisoned"))
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.map()?.get(key).cloned())
    }

    fn get_all(&self, keys: &[&str]) -> Result<Vec<Option<String>>> {
        let map = self.map()?;
        Ok(keys.iter().map(|k| map.get(*k).cloned()).collect())
    }

    fn set_all(&self, pairs: &[(&str, String)]) -> Result<()> {
        let mut map = self.map()?;
        for (k, v) in pairs {
            map.insert(k.to_string(), v.clone());
        }
        Ok(())
    }

    fn remove_all(&self, keys: &[&str]) -> Result<()> {
        let mut map = self.map()?;
        for k in keys {
            map.remove(*k);
        }
        Ok(())
    }
}
