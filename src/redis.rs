use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, RedisError, Script};
use uuid::Uuid;

use crate::error::IdempotencyError;
use crate::record::IdempotencyRecord;
use crate::store::{contention_backoff, IdempotencyStore, LockGuard};

/// Redis-backed idempotency store.
///
/// Records live at `{prefix}:cache:{key}` as JSON with a PX expiry; locks
/// live at `{prefix}:lock:{key}` installed with atomic SET NX PX and released
/// through a Lua compare-and-delete, so only the owner can free them. Expired
/// locks are taken over implicitly because TTL deletion frees the slot.
#[derive(Clone)]
pub struct RedisIdempotencyStore {
    conn: MultiplexedConnection,
    key_prefix: String,
}

impl RedisIdempotencyStore {
    /// Create a new RedisIdempotencyStore from a Redis URL.
    ///
    /// # Arguments
    /// * `url` - Redis connection URL (e.g., "redis://127.0.0.1:6379")
    pub async fn new(url: &str) -> Result<Self, IdempotencyError> {
        let client = Client::open(url).map_err(map_redis_error)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(map_redis_error)?;
        Ok(Self {
            conn,
            key_prefix: "idempotency".to_string(),
        })
    }

    /// Create a new RedisIdempotencyStore from an existing multiplexed connection.
    pub fn from_connection(conn: MultiplexedConnection) -> Self {
        Self {
            conn,
            key_prefix: "idempotency".to_string(),
        }
    }

    /// Set a custom key prefix for namespace isolation.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    fn record_key(&self, key: &str) -> String {
        format_record_key(&self.key_prefix, key)
    }

    fn lock_key(&self, key: &str) -> String {
        format_lock_key(&self.key_prefix, key)
    }
}

/// Lua script for safe lock release.
/// Only deletes the key if the stored value matches the owner token.
const RELEASE_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

#[async_trait]
impl IdempotencyStore for RedisIdempotencyStore {
    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>, IdempotencyError> {
        let mut conn = self.conn.clone();
        let full_key = self.record_key(key);
        let raw: Option<String> = conn.get(&full_key).await.map_err(map_redis_error)?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        let record: IdempotencyRecord = serde_json::from_str(&raw)?;
        if record.is_expired() {
            // PX expiry normally beats us here; clean up if it has not
            let _: i64 = conn.del(&full_key).await.map_err(map_redis_error)?;
            return Ok(None);
        }
        Ok(Some(record))
    }

    async fn save(
        &self,
        key: &str,
        record: IdempotencyRecord,
        ttl: Duration,
    ) -> Result<(), IdempotencyError> {
        let mut conn = self.conn.clone();
        let full_key = self.record_key(key);

        let mut record = record.refreshed(ttl);
        let prior: Option<String> = conn.get(&full_key).await.map_err(map_redis_error)?;
        if let Some(prior) = prior {
            if let Ok(prior) = serde_json::from_str::<IdempotencyRecord>(&prior) {
                record.created_at = prior.created_at;
            }
        }

        let payload = serde_json::to_string(&record)?;
        let millis = ttl.as_millis().max(1) as u64;
        conn.pset_ex::<_, _, ()>(&full_key, payload, millis)
            .await
            .map_err(map_redis_error)?;
        Ok(())
    }

    async fn try_acquire_lock(
        &self,
        key: &str,
        lock_ttl: Duration,
        wait_budget: Duration,
    ) -> Result<Option<LockGuard>, IdempotencyError> {
        let mut conn = self.conn.clone();
        let full_key = self.lock_key(key);
        let token = Uuid::new_v4().to_string();
        let millis = lock_ttl.as_millis().max(1) as u64;
        let started = Instant::now();

        loop {
            // Atomic SET key value NX PX milliseconds
            let installed: Option<String> = redis::cmd("SET")
                .arg(&full_key)
                .arg(&token)
                .arg("NX")
                .arg("PX")
                .arg(millis)
                .query_async(&mut conn)
                .await
                .map_err(map_redis_error)?;

            if installed.is_some() {
                return Ok(Some(LockGuard {
                    key: key.to_string(),
                    token,
                }));
            }
            if wait_budget.is_zero() || started.elapsed() >= wait_budget {
                return Ok(None);
            }
            tokio::time::sleep(contention_backoff()).await;
        }
    }

    async fn release_lock(&self, guard: LockGuard) -> Result<(), IdempotencyError> {
        let mut conn = self.conn.clone();
        let full_key = self.lock_key(&guard.key);

        let script = Script::new(RELEASE_SCRIPT);
        // 0 = 既に消えたか別の所有者。どちらも no-op で成功扱い（解放は冪等）。
        let _deleted: i64 = script
            .key(&full_key)
            .arg(&guard.token)
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(())
    }
}

fn map_redis_error(err: RedisError) -> IdempotencyError {
    IdempotencyError::Storage(err.to_string())
}

/// Helper functions to format store keys (exposed for testing without a Redis connection).
pub fn format_record_key(prefix: &str, key: &str) -> String {
    format!("{}:cache:{}", prefix, key)
}

pub fn format_lock_key(prefix: &str, key: &str) -> String {
    format!("{}:lock:{}", prefix, key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_record_key() {
        assert_eq!(format_record_key("idempotency", "abc"), "idempotency:cache:abc");
        assert_eq!(format_record_key("payments", "abc"), "payments:cache:abc");
    }

    #[test]
    fn test_format_lock_key() {
        assert_eq!(format_lock_key("idempotency", "abc"), "idempotency:lock:abc");
    }

    #[test]
    fn test_keys_are_stored_verbatim() {
        // URL 予約文字・クォート・スクリプト片もそのまま埋め込む
        let hostile = r#"a/b?c='1'<script>"#;
        let formatted = format_record_key("idempotency", hostile);
        assert!(formatted.ends_with(hostile));
    }

    #[test]
    fn test_map_redis_error_to_storage_error() {
        let err = map_redis_error(RedisError::from((
            redis::ErrorKind::IoError,
            "connection refused",
        )));
        match err {
            IdempotencyError::Storage(msg) => assert!(msg.contains("connection refused")),
            _ => panic!("Expected Storage error"),
        }
    }

    #[test]
    fn test_release_script_contains_get_and_del() {
        assert!(RELEASE_SCRIPT.contains("redis.call(\"get\""));
        assert!(RELEASE_SCRIPT.contains("redis.call(\"del\""));
    }

    // Integration tests requiring a running Redis instance are exercised
    // through the InMemoryIdempotencyStore contract tests (same trait); the
    // Redis-specific atomicity relies on SET NX PX and the release script.
}
