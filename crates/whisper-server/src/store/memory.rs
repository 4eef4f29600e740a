use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use super::{now_millis, short_id, SecretRecord, SecretStore, StoreError};

/// Single-node, non-durable store. One lock guards the whole map, so every
/// read-modify-write is serialized.
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<String, SecretRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries held, expired ones included.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SecretStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn create(&self, record: SecretRecord) -> Result<(), StoreError> {
        match self.records.lock().entry(record.id.clone()) {
            Entry::Occupied(_) => Err(StoreError::DuplicateId),
            Entry::Vacant(slot) => {
                debug!(id = %short_id(&record.id), "stored secret");
                slot.insert(record);
                Ok(())
            }
        }
    }

    async fn get(&self, id: &str) -> Result<Option<SecretRecord>, StoreError> {
        let now = now_millis();
        let mut records = self.records.lock();
        match records.get(id).map(|r| r.is_visible(now)) {
            None => Ok(None),
            Some(true) => Ok(records.get(id).cloned()),
            Some(false) => {
                records.remove(id);
                debug!(id = %short_id(id), "lazy-evicted expired secret");
                Ok(None)
            }
        }
    }

    async fn retrieve_and_decrement(&self, id: &str) -> Result<Option<SecretRecord>, StoreError> {
        let now = now_millis();
        let mut records = self.records.lock();
        let Entry::Occupied(mut entry) = records.entry(id.to_owned()) else {
            return Ok(None);
        };

        if !entry.get().is_visible(now) {
            entry.remove();
            debug!(id = %short_id(id), "lazy-evicted expired secret");
            return Ok(None);
        }

        entry.get_mut().views_remaining -= 1;
        if entry.get().views_remaining == 0 {
            debug!(id = %short_id(id), "burned after final view");
            Ok(Some(entry.remove()))
        } else {
            Ok(Some(entry.get().clone()))
        }
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.records.lock().remove(id);
        Ok(())
    }

    async fn remaining_ttl(&self, id: &str) -> Result<Option<Duration>, StoreError> {
        let now = now_millis();
        Ok(self
            .records
            .lock()
            .get(id)
            .filter(|r| r.is_visible(now))
            .map(|r| r.remaining_ttl(now)))
    }

    async fn purge_expired(&self) -> Result<usize, StoreError> {
        let now = now_millis();
        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|_, r| r.is_visible(now));
        Ok(before - records.len())
    }
}
