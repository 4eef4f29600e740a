use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use redb::{Database, ReadableTable, TableDefinition};
use tracing::{debug, info};

use super::{now_millis, short_id, SecretRecord, SecretStore, StoreError};

const SECRETS: TableDefinition<&str, &[u8]> = TableDefinition::new("secrets");

/// Leading byte of every encoded record, ahead of the bincode payload.
const RECORD_V1_MARKER: u8 = 0x01;

/// Durable single-node store backed by redb.
///
/// redb admits one write transaction at a time, so every mutation below is
/// serialized against every other.
#[derive(Clone)]
pub struct DbStore {
    db: Arc<Database>,
}

/// Outcome of a consuming read, decided inside the write transaction.
enum Consumed {
    Missing,
    Evicted,
    Viewed(SecretRecord),
    Burned(SecretRecord),
}

impl DbStore {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path).context("open redb database")?;

        let write_txn = db.begin_write()?;
        write_txn.open_table(SECRETS)?;
        write_txn.commit()?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Insert unless the id exists. Returns false on collision.
    fn insert_new(&self, record: &SecretRecord) -> Result<bool> {
        let bytes = encode(record)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(SECRETS)?;
            if table.get(record.id.as_str())?.is_some() {
                // Dropping the transaction aborts it.
                return Ok(false);
            }
            table.insert(record.id.as_str(), bytes.as_slice())?;
        }
        write_txn.commit()?;
        Ok(true)
    }

    fn read(&self, id: &str) -> Result<Option<SecretRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SECRETS)?;
        let raw_bytes: Option<Vec<u8>> = table.get(id)?.map(|guard| guard.value().to_vec());
        raw_bytes.as_deref().map(decode).transpose()
    }

    fn consume(&self, id: &str) -> Result<Consumed> {
        let now = now_millis();

        let write_txn = self.db.begin_write()?;
        let outcome = {
            let mut table = write_txn.open_table(SECRETS)?;

            // Copy the bytes out so the AccessGuard is dropped before mutating.
            let raw_bytes: Option<Vec<u8>> = table.get(id)?.map(|guard| guard.value().to_vec());

            match raw_bytes {
                None => Consumed::Missing,
                Some(bytes) => {
                    let mut record = decode(&bytes)?;
                    if !record.is_visible(now) {
                        table.remove(id)?;
                        Consumed::Evicted
                    } else {
                        record.views_remaining -= 1;
                        if record.views_remaining == 0 {
                            table.remove(id)?;
                            Consumed::Burned(record)
                        } else {
                            // expires_at is carried over untouched.
                            let updated = encode(&record)?;
                            table.insert(id, updated.as_slice())?;
                            Consumed::Viewed(record)
                        }
                    }
                }
            }
        };
        write_txn.commit()?;
        Ok(outcome)
    }

    fn remove(&self, id: &str) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(SECRETS)?;
            table.remove(id)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Run a synchronous redb operation on the blocking pool so callers can
    /// put a timeout around it and runtime workers stay free.
    async fn blocking<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&DbStore) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || op(&store))
            .await
            .context("redb task failed")?
    }

    fn prune(&self) -> Result<usize> {
        let now = now_millis();

        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut table = write_txn.open_table(SECRETS)?;
            let mut dead = Vec::new();
            for item in table.iter()? {
                let (k, v) = item?;
                if !decode(v.value())?.is_visible(now) {
                    dead.push(k.value().to_owned());
                }
            }
            for id in &dead {
                table.remove(id.as_str())?;
            }
            dead.len()
        };
        write_txn.commit()?;

        if removed > 0 {
            info!(removed, "pruned expired secrets");
        }
        Ok(removed)
    }
}

#[async_trait]
impl SecretStore for DbStore {
    fn backend(&self) -> &'static str {
        "redb"
    }

    async fn create(&self, record: SecretRecord) -> Result<(), StoreError> {
        let id = record.id.clone();
        if !self.blocking(move |s| s.insert_new(&record)).await? {
            return Err(StoreError::DuplicateId);
        }
        debug!(id = %short_id(&id), "stored secret");
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<SecretRecord>, StoreError> {
        let owned = id.to_owned();
        let record = self.blocking(move |s| s.read(&owned)).await?;
        let now = now_millis();
        Ok(record.filter(|r| r.is_visible(now)))
    }

    async fn retrieve_and_decrement(&self, id: &str) -> Result<Option<SecretRecord>, StoreError> {
        let owned = id.to_owned();
        match self.blocking(move |s| s.consume(&owned)).await? {
            Consumed::Missing => Ok(None),
            Consumed::Evicted => {
                debug!(id = %short_id(id), "lazy-evicted expired secret");
                Ok(None)
            }
            Consumed::Viewed(record) => Ok(Some(record)),
            Consumed::Burned(record) => {
                debug!(id = %short_id(id), "burned after final view");
                Ok(Some(record))
            }
        }
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let owned = id.to_owned();
        Ok(self.blocking(move |s| s.remove(&owned)).await?)
    }

    async fn remaining_ttl(&self, id: &str) -> Result<Option<Duration>, StoreError> {
        let owned = id.to_owned();
        let record = self.blocking(move |s| s.read(&owned)).await?;
        let now = now_millis();
        Ok(record
            .filter(|r| r.is_visible(now))
            .map(|r| r.remaining_ttl(now)))
    }

    async fn purge_expired(&self) -> Result<usize, StoreError> {
        Ok(self.blocking(|s| s.prune()).await?)
    }
}

/// Encode a record as `[RECORD_V1_MARKER] + bincode(record)`.
fn encode(record: &SecretRecord) -> Result<Vec<u8>> {
    let payload = bincode::serde::encode_to_vec(record, bincode::config::standard())
        .context("bincode encode")?;
    let mut out = Vec::with_capacity(1 + payload.len());
    out.push(RECORD_V1_MARKER);
    out.extend_from_slice(&payload);
    Ok(out)
}

fn decode(bytes: &[u8]) -> Result<SecretRecord> {
    match bytes.split_first() {
        Some((&RECORD_V1_MARKER, payload)) => {
            let (record, _) =
                bincode::serde::decode_from_slice(payload, bincode::config::standard())
                    .context("bincode decode")?;
            Ok(record)
        }
        Some((marker, _)) => anyhow::bail!("unknown record format marker {marker:#04x}"),
        None => anyhow::bail!("empty record"),
    }
}
