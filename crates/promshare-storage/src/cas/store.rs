use std::{collections::HashMap, sync::RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use promshare_common::error::{PromshareError, Result};

/// A shared key/value store offering nothing beyond single-key atomics.
#[async_trait]
pub trait CasStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Stores `value` only when `key` is absent. Returns whether it was stored.
    async fn add(&self, key: &str, value: Bytes) -> Result<bool>;

    /// Replaces the value only when the stored bytes equal `expected`.
    async fn compare_and_swap(&self, key: &str, expected: &[u8], value: Bytes) -> Result<bool>;

    async fn delete(&self, key: &str) -> Result<()>;
}

/// Process-local [`CasStore`]. Every clone of the owning `Arc` sees the same
/// entries, which is how tests model several processes sharing one segment.
#[derive(Debug, Default)]
pub struct MemoryCasStore {
    entries: RwLock<HashMap<String, Bytes>>,
}

impl MemoryCasStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.entries_read()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Writes raw bytes unconditionally, bypassing the CAS protocol.
    pub fn put_raw(&self, key: &str, value: Bytes) -> Result<()> {
        self.entries_write()?.insert(key.to_string(), value);
        Ok(())
    }

    fn entries_read(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, HashMap<String, Bytes>>> {
        self.entries
            .read()
            .map_err(|_| PromshareError::InternalError("cas store lock poisoned".to_string()))
    }

    fn entries_write(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<String, Bytes>>> {
        self.entries
            .write()
            .map_err(|_| PromshareError::InternalError("cas store lock poisoned".to_string()))
    }
}

#[async_trait]
impl CasStore for MemoryCasStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        Ok(self.entries_read()?.get(key).cloned())
    }

    async fn add(&self, key: &str, value: Bytes) -> Result<bool> {
        let mut entries = self.entries_write()?;
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(key.to_string(), value);
        Ok(true)
    }

    async fn compare_and_swap(&self, key: &str, expected: &[u8], value: Bytes) -> Result<bool> {
        let mut entries = self.entries_write()?;
        match entries.get_mut(key) {
            Some(current) if current.as_ref() == expected => {
                *current = value;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries_write()?.remove(key);
        Ok(())
    }
}
