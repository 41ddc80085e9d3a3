//! Ephemeral in-process backend

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use memento_hash::HashValue;

use crate::{CheckpointRecord, Error, Result, Storage};

type Container = HashMap<String, CheckpointRecord>;

/// Unbounded in-process mapping, discarded at process end.
///
/// Records are grouped per identity container so that clearing one callable
/// never touches another's entries.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    containers: RwLock<HashMap<String, Container>>,
}

impl MemoryStorage {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Container>> {
        // A poisoned lock means a writer panicked mid-insert; the map itself
        // is still a valid HashMap, so keep serving it.
        self.containers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Container>> {
        self.containers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Storage for MemoryStorage {
    fn exists(&self, fn_key: &str, call_hash: &HashValue) -> Result<bool> {
        Ok(self
            .read()
            .get(fn_key)
            .is_some_and(|c| c.contains_key(call_hash.as_hex())))
    }

    fn checkpoint_date(&self, fn_key: &str, call_hash: &HashValue) -> Result<DateTime<Utc>> {
        self.read()
            .get(fn_key)
            .and_then(|c| c.get(call_hash.as_hex()))
            .map(|r| r.created_at)
            .ok_or_else(|| Error::not_found(fn_key, call_hash))
    }

    fn load(&self, fn_key: &str, call_hash: &HashValue) -> Result<serde_json::Value> {
        self.read()
            .get(fn_key)
            .and_then(|c| c.get(call_hash.as_hex()))
            .map(|r| r.payload.clone())
            .ok_or_else(|| Error::not_found(fn_key, call_hash))
    }

    fn store(
        &self,
        fn_key: &str,
        call_hash: &HashValue,
        record: CheckpointRecord,
    ) -> Result<serde_json::Value> {
        let payload = record.payload.clone();
        self.write()
            .entry(fn_key.to_string())
            .or_default()
            .insert(call_hash.as_hex().to_string(), record);
        Ok(payload)
    }

    fn delete(&self, fn_key: &str, call_hash: &HashValue) -> Result<()> {
        if let Some(container) = self.write().get_mut(fn_key) {
            container.remove(call_hash.as_hex());
        }
        Ok(())
    }

    fn clear(&self, fn_key: &str) -> Result<()> {
        self.write().remove(fn_key);
        Ok(())
    }
}
