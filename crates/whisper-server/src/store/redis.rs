use std::time::Duration;

use ::redis::{aio::ConnectionManager, Client, Script};
use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, info};

use super::{now_millis, short_id, SecretRecord, SecretStore, StoreError};

const KEY_PREFIX: &str = "whisper:secret:";

/// Inserts the hash and sets its absolute expiry in one step. Returns 0 when
/// the key already exists.
const CREATE_LUA: &str = r"
if redis.call('EXISTS', KEYS[1]) == 1 then
  return 0
end
redis.call('HSET', KEYS[1],
  'ciphertext', ARGV[1],
  'iv', ARGV[2],
  'created_at', ARGV[3],
  'expires_at', ARGV[4],
  'views_remaining', ARGV[5])
redis.call('PEXPIREAT', KEYS[1], ARGV[4])
return 1
";

/// Consumes one view. HSET on an existing field leaves the key's TTL alone,
/// so partial reads never extend or reset the expiry.
const RETRIEVE_LUA: &str = r"
local f = redis.call('HMGET', KEYS[1],
  'ciphertext', 'iv', 'created_at', 'expires_at', 'views_remaining')
if not f[1] then
  return false
end
local views = tonumber(f[5])
if views <= 0 or tonumber(f[4]) <= tonumber(ARGV[1]) then
  redis.call('DEL', KEYS[1])
  return false
end
views = views - 1
if views == 0 then
  redis.call('DEL', KEYS[1])
else
  redis.call('HSET', KEYS[1], 'views_remaining', views)
end
return {f[1], f[2], f[3], f[4], tostring(views)}
";

const FIELDS: [&str; 5] = ["ciphertext", "iv", "created_at", "expires_at", "views_remaining"];

/// Networked store on Redis with native per-key expiry.
pub struct RedisStore {
    conn: ConnectionManager,
    create_script: Script,
    retrieve_script: Script,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url).context("parse redis url")?;
        let conn = ConnectionManager::new(client)
            .await
            .context("connect to redis")?;
        info!("connected to redis");
        Ok(Self {
            conn,
            create_script: Script::new(CREATE_LUA),
            retrieve_script: Script::new(RETRIEVE_LUA),
        })
    }

    fn key(id: &str) -> String {
        format!("{KEY_PREFIX}{id}")
    }
}

/// Rebuild a record from the five hash fields, in `FIELDS` order.
fn record_from_fields(id: &str, fields: Vec<Option<String>>) -> Result<Option<SecretRecord>> {
    let [ciphertext, iv, created_at, expires_at, views] = <[Option<String>; 5]>::try_from(fields)
        .map_err(|f| anyhow::anyhow!("expected 5 hash fields, got {}", f.len()))?;

    let (Some(ciphertext), Some(iv), Some(created_at), Some(expires_at), Some(views)) =
        (ciphertext, iv, created_at, expires_at, views)
    else {
        return Ok(None);
    };

    Ok(Some(SecretRecord {
        id: id.to_owned(),
        ciphertext,
        iv,
        created_at: created_at.parse().context("parse created_at")?,
        expires_at: expires_at.parse().context("parse expires_at")?,
        views_remaining: views.parse().context("parse views_remaining")?,
    }))
}

#[async_trait]
impl SecretStore for RedisStore {
    fn backend(&self) -> &'static str {
        "redis"
    }

    async fn create(&self, record: SecretRecord) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let mut invocation = self.create_script.key(Self::key(&record.id));
        invocation
            .arg(&record.ciphertext)
            .arg(&record.iv)
            .arg(record.created_at)
            .arg(record.expires_at)
            .arg(record.views_remaining);
        let inserted: i64 = invocation
            .invoke_async(&mut conn)
            .await
            .context("redis create")?;

        if inserted == 0 {
            return Err(StoreError::DuplicateId);
        }
        debug!(id = %short_id(&record.id), "stored secret");
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<SecretRecord>, StoreError> {
        let mut conn = self.conn.clone();
        let fields: Vec<Option<String>> = ::redis::cmd("HMGET")
            .arg(Self::key(id))
            .arg(FIELDS.as_slice())
            .query_async(&mut conn)
            .await
            .context("redis hmget")?;

        let now = now_millis();
        Ok(record_from_fields(id, fields)?.filter(|r| r.is_visible(now)))
    }

    async fn retrieve_and_decrement(&self, id: &str) -> Result<Option<SecretRecord>, StoreError> {
        let mut conn = self.conn.clone();
        let mut invocation = self.retrieve_script.key(Self::key(id));
        invocation.arg(now_millis());
        let reply: Option<Vec<String>> = invocation
            .invoke_async(&mut conn)
            .await
            .context("redis retrieve")?;

        let Some(fields) = reply else {
            return Ok(None);
        };
        let record = record_from_fields(id, fields.into_iter().map(Some).collect())?;
        if record.as_ref().is_some_and(|r| r.views_remaining == 0) {
            debug!(id = %short_id(id), "burned after final view");
        }
        Ok(record)
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: i64 = ::redis::cmd("DEL")
            .arg(Self::key(id))
            .query_async(&mut conn)
            .await
            .context("redis del")?;
        Ok(())
    }

    async fn remaining_ttl(&self, id: &str) -> Result<Option<Duration>, StoreError> {
        let mut conn = self.conn.clone();
        let pttl: i64 = ::redis::cmd("PTTL")
            .arg(Self::key(id))
            .query_async(&mut conn)
            .await
            .context("redis pttl")?;
        // -2: no such key. -1 never happens since create always sets expiry.
        Ok((pttl >= 0).then(|| Duration::from_millis(pttl as u64)))
    }

    /// Redis evicts expired keys itself.
    async fn purge_expired(&self) -> Result<usize, StoreError> {
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::super::testkit;
    use super::*;

    /// Redis tests need a live server; they are skipped unless
    /// `WHISPER_TEST_REDIS_URL` is set.
    async fn test_store() -> Option<RedisStore> {
        let url = std::env::var("WHISPER_TEST_REDIS_URL").ok()?;
        Some(RedisStore::connect(&url).await.unwrap())
    }

    #[test]
    fn fields_round_trip_into_record() {
        let fields = vec![
            Some("Y3Q=".to_owned()),
            Some("aXY=".to_owned()),
            Some("10".to_owned()),
            Some("20".to_owned()),
            Some("3".to_owned()),
        ];
        let r = record_from_fields("abc", fields).unwrap().unwrap();
        assert_eq!(r.created_at, 10);
        assert_eq!(r.expires_at, 20);
        assert_eq!(r.views_remaining, 3);
    }

    #[test]
    fn missing_fields_mean_absent() {
        assert_eq!(record_from_fields("abc", vec![None; 5]).unwrap(), None);
        assert!(record_from_fields("abc", vec![None; 2]).is_err());
    }

    #[test]
    fn keys_are_namespaced() {
        assert_eq!(RedisStore::key("ab"), "whisper:secret:ab");
    }

    #[tokio::test]
    async fn contract() {
        let Some(s) = test_store().await else { return };
        testkit::create_get_delete(&s).await;
        testkit::duplicate_id_rejected(&s).await;
        testkit::single_view_burns(&s).await;
        testkit::multi_view_counts_down(&s).await;
        testkit::expired_reads_absent(&s).await;
        testkit::partial_read_preserves_ttl(&s).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_single_view_race() {
        let Some(s) = test_store().await else { return };
        testkit::concurrent_single_view_race(Arc::new(s)).await;
    }

    #[tokio::test]
    async fn native_expiry_needs_no_purge() {
        let Some(s) = test_store().await else { return };
        assert_eq!(testkit::purge_removes_only_expired(&s).await, 0);
    }
}
