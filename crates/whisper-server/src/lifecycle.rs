//! Create/retrieve use cases sitting between the HTTP layer and the store.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tokio::time;
use tracing::{debug, info, warn};

use crate::envelope::{IV_LEN, TAG_LEN};
use crate::link;
use crate::store::{now_millis, short_id, SecretPayload, SecretRecord, SecretStore, StoreError};

/// Longest accepted ciphertext, measured on the base64 text.
pub const MAX_CIPHERTEXT_LEN: usize = 100 * 1024;
pub const MAX_TTL_SECONDS: i64 = 30 * 24 * 60 * 60;
pub const DEFAULT_TTL_SECONDS: i64 = 24 * 60 * 60;
pub const MAX_VIEWS: i64 = 100;
pub const DEFAULT_VIEWS: u32 = 1;

/// Id collisions are retried with a fresh id this many times in total.
const CREATE_ATTEMPTS: usize = 3;

pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("invalid secret: {}", .0.join("; "))]
    Validation(Vec<String>),
    #[error("secret not found or expired")]
    NotFound,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Body of a create request. Every field is optional at this level so that
/// missing and malformed input is reported together by [`Lifecycle::create_secret`].
///
/// The aliases accept legacy field names on create only. Retrieval always
/// answers with `ciphertext` and `iv`, so a viewer must read those names.
///
/// `ttlSeconds` and `maxViews` stay untyped here so that floats and numeric
/// strings reach validation instead of failing at deserialization.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSecret {
    #[serde(default, alias = "encryptedData")]
    pub ciphertext: Option<String>,
    #[serde(default)]
    pub iv: Option<String>,
    #[serde(default, alias = "expiration")]
    pub ttl_seconds: Option<Value>,
    #[serde(default, alias = "views")]
    pub max_views: Option<Value>,
}

struct Validated {
    ciphertext: String,
    iv: String,
    ttl_seconds: i64,
    max_views: u32,
}

fn validate(req: CreateSecret) -> Result<Validated, Vec<String>> {
    let mut errors = Vec::new();

    match req.ciphertext.as_deref() {
        None | Some("") => errors.push("ciphertext is required".to_owned()),
        Some(ct) if ct.len() > MAX_CIPHERTEXT_LEN => {
            errors.push("ciphertext too large (max 100 KiB)".to_owned())
        }
        Some(ct) => match STANDARD.decode(ct) {
            Err(_) => errors.push("ciphertext is not valid base64".to_owned()),
            Ok(raw) if raw.len() < TAG_LEN => {
                errors.push("ciphertext is shorter than the authentication tag".to_owned())
            }
            Ok(_) => {}
        },
    }

    match req.iv.as_deref() {
        None | Some("") => errors.push("iv is required".to_owned()),
        Some(iv) => match STANDARD.decode(iv) {
            Err(_) => errors.push("iv is not valid base64".to_owned()),
            Ok(raw) if raw.len() != IV_LEN => {
                errors.push(format!("iv must be {IV_LEN} bytes"))
            }
            Ok(_) => {}
        },
    }

    let ttl_seconds = match req.ttl_seconds.as_ref().map(whole_number) {
        None => DEFAULT_TTL_SECONDS,
        Some(Some(ttl)) if (0..=MAX_TTL_SECONDS).contains(&ttl) => ttl,
        Some(_) => {
            errors.push(format!("ttlSeconds must be a whole number between 0 and {MAX_TTL_SECONDS}"));
            0
        }
    };

    let max_views = match req.max_views.as_ref().map(whole_number) {
        None => i64::from(DEFAULT_VIEWS),
        Some(Some(views)) if (1..=MAX_VIEWS).contains(&views) => views,
        Some(_) => {
            errors.push(format!("maxViews must be a whole number between 1 and {MAX_VIEWS}"));
            0
        }
    };

    if !errors.is_empty() {
        return Err(errors);
    }

    Ok(Validated {
        ciphertext: req.ciphertext.unwrap_or_default(),
        iv: req.iv.unwrap_or_default(),
        ttl_seconds,
        max_views: max_views as u32,
    })
}

/// Integer value of a JSON number or numeric string. `3600.0` and `"3600"`
/// both count; `3600.5`, `true` and `"soon"` do not. `null` reads as unset.
fn whole_number(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0 && f.abs() < 1e15)
                .map(|f| f as i64)
        }),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>().ok().or_else(|| {
                s.parse::<f64>()
                    .ok()
                    .filter(|f| f.fract() == 0.0 && f.abs() < 1e15)
                    .map(|f| f as i64)
            })
        }
        _ => None,
    }
}

/// The orchestrator. Cheap to clone; all clones share one store.
#[derive(Clone)]
pub struct Lifecycle {
    store: Arc<dyn SecretStore>,
    store_timeout: Duration,
}

impl Lifecycle {
    pub fn new(store: Arc<dyn SecretStore>, store_timeout: Duration) -> Self {
        Self {
            store,
            store_timeout,
        }
    }

    pub fn store(&self) -> &Arc<dyn SecretStore> {
        &self.store
    }

    /// Validate and store a new secret. Returns its id and nothing else.
    pub async fn create_secret(&self, req: CreateSecret) -> Result<String, LifecycleError> {
        let v = validate(req).map_err(LifecycleError::Validation)?;

        let now = now_millis();
        let expires_at = now + v.ttl_seconds * 1000;

        for attempt in 1..=CREATE_ATTEMPTS {
            let id = link::new_id();
            let record = SecretRecord {
                id: id.clone(),
                ciphertext: v.ciphertext.clone(),
                iv: v.iv.clone(),
                created_at: now,
                expires_at,
                views_remaining: v.max_views,
            };

            match self.bounded(self.store.create(record)).await {
                Ok(()) => {
                    info!(
                        id = %short_id(&id),
                        ttl_seconds = v.ttl_seconds,
                        max_views = v.max_views,
                        "secret created"
                    );
                    return Ok(id);
                }
                Err(StoreError::DuplicateId) => {
                    warn!(attempt, "secret id collision, regenerating");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(StoreError::DuplicateId.into())
    }

    /// Consume one view of a secret. Malformed ids, unknown ids, expired and
    /// exhausted secrets all come back as [`LifecycleError::NotFound`].
    pub async fn retrieve_secret(&self, id: &str) -> Result<SecretPayload, LifecycleError> {
        if !link::is_valid_id(id) {
            debug!(len = id.len(), "rejected malformed secret id");
            return Err(LifecycleError::NotFound);
        }

        match self.bounded(self.store.retrieve_and_decrement(id)).await? {
            Some(record) => {
                if record.views_remaining == 0 {
                    info!(id = %short_id(id), "secret viewed and burned");
                } else {
                    info!(
                        id = %short_id(id),
                        views_remaining = record.views_remaining,
                        "secret viewed"
                    );
                }
                Ok(record.payload())
            }
            None => {
                debug!(id = %short_id(id), "secret not found, expired or exhausted");
                Err(LifecycleError::NotFound)
            }
        }
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        time::timeout(self.store_timeout, call)
            .await
            .map_err(|_| StoreError::Timeout)?
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::envelope;
    use crate::store::MemoryStore;

    fn lifecycle() -> (Lifecycle, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (Lifecycle::new(store.clone(), DEFAULT_STORE_TIMEOUT), store)
    }

    fn request(ttl_seconds: Option<i64>, max_views: Option<i64>) -> CreateSecret {
        raw_request(ttl_seconds.map(Value::from), max_views.map(Value::from))
    }

    fn raw_request(ttl_seconds: Option<Value>, max_views: Option<Value>) -> CreateSecret {
        let sealed = envelope::encrypt("the launch codes", &envelope::generate_key()).unwrap();
        CreateSecret {
            ciphertext: Some(sealed.ciphertext),
            iv: Some(sealed.iv),
            ttl_seconds,
            max_views,
        }
    }

    #[tokio::test]
    async fn create_applies_defaults() {
        let (lc, store) = lifecycle();
        let before = now_millis();
        let id = lc.create_secret(request(None, None)).await.unwrap();
        assert!(link::is_valid_id(&id));

        let record = store.get(&id).await.unwrap().unwrap();
        assert_eq!(record.views_remaining, DEFAULT_VIEWS);
        let ttl_ms = record.expires_at - before;
        assert!((DEFAULT_TTL_SECONDS * 1000..DEFAULT_TTL_SECONDS * 1000 + 5_000).contains(&ttl_ms));
    }

    #[tokio::test]
    async fn validation_reports_every_problem_and_stores_nothing() {
        let (lc, store) = lifecycle();
        let err = lc
            .create_secret(CreateSecret {
                ciphertext: None,
                iv: Some("!!".into()),
                ttl_seconds: Some((MAX_TTL_SECONDS + 1).into()),
                max_views: Some(0.into()),
            })
            .await
            .unwrap_err();
        let reasons = match err {
            LifecycleError::Validation(reasons) => reasons,
            other => panic!("expected validation error, got {other:?}"),
        };
        assert_eq!(reasons.len(), 4, "{reasons:?}");
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn validation_limits() {
        let (lc, _) = lifecycle();

        let mut big = request(None, None);
        big.ciphertext = Some("A".repeat(MAX_CIPHERTEXT_LEN + 4));
        assert!(matches!(
            lc.create_secret(big).await,
            Err(LifecycleError::Validation(_))
        ));

        let mut short_iv = request(None, None);
        short_iv.iv = Some(STANDARD.encode([0u8; 8]));
        assert!(matches!(
            lc.create_secret(short_iv).await,
            Err(LifecycleError::Validation(_))
        ));

        let mut no_tag = request(None, None);
        no_tag.ciphertext = Some(STANDARD.encode([0u8; 4]));
        assert!(matches!(
            lc.create_secret(no_tag).await,
            Err(LifecycleError::Validation(_))
        ));

        for (ttl, views) in [(-1, 1), (0, 101), (10, -3)] {
            assert!(matches!(
                lc.create_secret(request(Some(ttl), Some(views))).await,
                Err(LifecycleError::Validation(_))
            ));
        }

        // boundaries are inclusive
        lc.create_secret(request(Some(MAX_TTL_SECONDS), Some(MAX_VIEWS)))
            .await
            .unwrap();
        lc.create_secret(request(Some(0), Some(1))).await.unwrap();
    }

    #[tokio::test]
    async fn numeric_fields_accept_floats_and_strings() {
        let (lc, store) = lifecycle();
        let id = lc
            .create_secret(raw_request(Some(Value::from(3600.0)), Some(Value::from("3"))))
            .await
            .unwrap();
        let record = store.get(&id).await.unwrap().unwrap();
        assert_eq!(record.views_remaining, 3);
        assert_eq!(record.expires_at - record.created_at, 3_600_000);

        let err = lc
            .create_secret(raw_request(Some(Value::from(1.5)), Some(Value::from(true))))
            .await
            .unwrap_err();
        let reasons = match err {
            LifecycleError::Validation(reasons) => reasons,
            other => panic!("expected validation error, got {other:?}"),
        };
        assert_eq!(reasons.len(), 2, "{reasons:?}");
        assert!(reasons[0].starts_with("ttlSeconds"));
        assert!(reasons[1].starts_with("maxViews"));
    }

    #[tokio::test]
    async fn single_view_secret_is_served_once() {
        let (lc, _) = lifecycle();
        let req = request(None, Some(1));
        let expected = (req.ciphertext.clone().unwrap(), req.iv.clone().unwrap());
        let id = lc.create_secret(req).await.unwrap();

        let payload = lc.retrieve_secret(&id).await.unwrap();
        assert_eq!((payload.ciphertext, payload.iv), expected);
        assert!(matches!(
            lc.retrieve_secret(&id).await,
            Err(LifecycleError::NotFound)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_retrievals_of_single_view_secret() {
        let (lc, _) = lifecycle();
        let id = lc.create_secret(request(None, Some(1))).await.unwrap();

        let attempts: Vec<_> = (0..8)
            .map(|_| {
                let lc = lc.clone();
                let id = id.clone();
                tokio::spawn(async move { lc.retrieve_secret(&id).await.is_ok() })
            })
            .collect();

        let mut served = 0;
        for attempt in attempts {
            if attempt.await.unwrap() {
                served += 1;
            }
        }
        assert_eq!(served, 1);
    }

    #[tokio::test]
    async fn ttl_expiry_hides_secret_with_views_left() {
        let (lc, store) = lifecycle();
        let id = lc.create_secret(request(Some(1), Some(5))).await.unwrap();
        time::sleep(Duration::from_millis(1_100)).await;
        assert!(matches!(
            lc.retrieve_secret(&id).await,
            Err(LifecycleError::NotFound)
        ));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn partial_view_keeps_original_expiry() {
        let (lc, store) = lifecycle();
        let id = lc.create_secret(request(Some(3600), Some(5))).await.unwrap();
        let expires_at = store.get(&id).await.unwrap().unwrap().expires_at;

        lc.retrieve_secret(&id).await.unwrap();

        let record = store.get(&id).await.unwrap().unwrap();
        assert_eq!(record.views_remaining, 4);
        assert_eq!(record.expires_at, expires_at);
        let ttl = store.remaining_ttl(&id).await.unwrap().unwrap();
        assert!(ttl <= Duration::from_secs(3600));
        assert!(ttl > Duration::from_secs(3590));
    }

    #[tokio::test]
    async fn malformed_id_is_not_found() {
        let (lc, _) = lifecycle();
        let malformed = ["".to_owned(), "abc".to_owned(), "z".repeat(32), "a".repeat(64)];
        for id in &malformed {
            assert!(matches!(
                lc.retrieve_secret(id).await,
                Err(LifecycleError::NotFound)
            ));
        }
        assert!(matches!(
            lc.retrieve_secret(&link::new_id()).await,
            Err(LifecycleError::NotFound)
        ));
    }

    /// Reports a collision for the first `collisions` creates.
    struct CollidingStore {
        inner: MemoryStore,
        collisions: AtomicUsize,
    }

    #[async_trait]
    impl SecretStore for CollidingStore {
        fn backend(&self) -> &'static str {
            "colliding"
        }
        async fn create(&self, record: SecretRecord) -> Result<(), StoreError> {
            let left = self.collisions.load(Ordering::SeqCst);
            if left > 0 {
                self.collisions.store(left - 1, Ordering::SeqCst);
                return Err(StoreError::DuplicateId);
            }
            self.inner.create(record).await
        }
        async fn get(&self, id: &str) -> Result<Option<SecretRecord>, StoreError> {
            self.inner.get(id).await
        }
        async fn retrieve_and_decrement(
            &self,
            id: &str,
        ) -> Result<Option<SecretRecord>, StoreError> {
            self.inner.retrieve_and_decrement(id).await
        }
        async fn delete(&self, id: &str) -> Result<(), StoreError> {
            self.inner.delete(id).await
        }
        async fn remaining_ttl(&self, id: &str) -> Result<Option<Duration>, StoreError> {
            self.inner.remaining_ttl(id).await
        }
        async fn purge_expired(&self) -> Result<usize, StoreError> {
            self.inner.purge_expired().await
        }
    }

    fn colliding(collisions: usize) -> Lifecycle {
        Lifecycle::new(
            Arc::new(CollidingStore {
                inner: MemoryStore::new(),
                collisions: AtomicUsize::new(collisions),
            }),
            DEFAULT_STORE_TIMEOUT,
        )
    }

    #[tokio::test]
    async fn id_collision_is_retried() {
        let lc = colliding(CREATE_ATTEMPTS - 1);
        let id = lc.create_secret(request(None, None)).await.unwrap();
        assert!(lc.store().get(&id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn id_collision_retries_are_bounded() {
        let lc = colliding(CREATE_ATTEMPTS);
        assert!(matches!(
            lc.create_secret(request(None, None)).await,
            Err(LifecycleError::Store(StoreError::DuplicateId))
        ));
    }

    /// Never answers.
    struct StalledStore;

    #[async_trait]
    impl SecretStore for StalledStore {
        fn backend(&self) -> &'static str {
            "stalled"
        }
        async fn create(&self, _: SecretRecord) -> Result<(), StoreError> {
            std::future::pending().await
        }
        async fn get(&self, _: &str) -> Result<Option<SecretRecord>, StoreError> {
            std::future::pending().await
        }
        async fn retrieve_and_decrement(&self, _: &str) -> Result<Option<SecretRecord>, StoreError> {
            std::future::pending().await
        }
        async fn delete(&self, _: &str) -> Result<(), StoreError> {
            std::future::pending().await
        }
        async fn remaining_ttl(&self, _: &str) -> Result<Option<Duration>, StoreError> {
            std::future::pending().await
        }
        async fn purge_expired(&self) -> Result<usize, StoreError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn stalled_store_times_out() {
        let lc = Lifecycle::new(Arc::new(StalledStore), Duration::from_millis(50));
        assert!(matches!(
            lc.create_secret(request(None, None)).await,
            Err(LifecycleError::Store(StoreError::Timeout))
        ));
        assert!(matches!(
            lc.retrieve_secret(&link::new_id()).await,
            Err(LifecycleError::Store(StoreError::Timeout))
        ));
    }
}
