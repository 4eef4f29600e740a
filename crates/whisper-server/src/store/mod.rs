//! Secret storage: one trait, three interchangeable backends.

pub mod db;
pub mod memory;
pub mod model;
pub mod redis;
pub mod sweep;

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use async_trait::async_trait;
use thiserror::Error;

pub use db::DbStore;
pub use memory::MemoryStore;
pub use model::{SecretPayload, SecretRecord};
pub use self::redis::RedisStore;
pub use sweep::{spawn_sweep, SweepHandle};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("secret id already exists")]
    DuplicateId,
    #[error("store call timed out")]
    Timeout,
    #[error("store backend error: {0:#}")]
    Backend(#[from] anyhow::Error),
}

/// Storage contract shared by every backend.
///
/// `retrieve_and_decrement` must be linearizable per id: of any number of
/// concurrent calls against a record with `n` views left, exactly `n` return
/// `Some`.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Short backend name for logs and `/health`.
    fn backend(&self) -> &'static str;

    /// Insert a new record. Fails with [`StoreError::DuplicateId`] if the id
    /// is taken; the existing record is left untouched.
    async fn create(&self, record: SecretRecord) -> Result<(), StoreError>;

    /// Non-consuming lookup. Expired or exhausted records read as absent.
    async fn get(&self, id: &str) -> Result<Option<SecretRecord>, StoreError>;

    /// Consume one view. Returns the record as it was before any deletion,
    /// with `views_remaining` already decremented. The record is deleted in
    /// the same step when that count reaches zero; otherwise its expiry is
    /// left exactly as it was.
    async fn retrieve_and_decrement(&self, id: &str) -> Result<Option<SecretRecord>, StoreError>;

    /// Idempotent removal.
    async fn delete(&self, id: &str) -> Result<(), StoreError>;

    /// Remaining lifetime as the backend sees it, `None` if absent.
    async fn remaining_ttl(&self, id: &str) -> Result<Option<Duration>, StoreError>;

    /// Eagerly drop expired records. Returns how many were removed.
    async fn purge_expired(&self) -> Result<usize, StoreError>;
}

/// Which backend to open at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Db { path: std::path::PathBuf },
    Redis { url: String },
}

impl StoreBackend {
    pub async fn open(&self) -> anyhow::Result<Arc<dyn SecretStore>> {
        let store: Arc<dyn SecretStore> = match self {
            StoreBackend::Memory => Arc::new(MemoryStore::new()),
            StoreBackend::Db { path } => {
                Arc::new(DbStore::open(path).context("open redb store")?)
            }
            StoreBackend::Redis { url } => {
                Arc::new(RedisStore::connect(url).await.context("connect redis store")?)
            }
        };
        Ok(store)
    }
}

/// Current Unix time in milliseconds.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Id prefix that is safe to put in logs.
pub fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}
