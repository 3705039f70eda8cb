use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;

use crate::error::IdempotencyError;
use crate::record::IdempotencyRecord;

/// Proof of lock ownership, threaded from `try_acquire_lock` to the matching
/// `release_lock`. The token is a fresh random value per acquisition and is
/// only ever compared for equality in the release path.
#[derive(Debug)]
pub struct LockGuard {
    pub key: String,
    pub token: String,
}

/// バックエンド非依存のストア契約。
///
/// `get`/`save` はレコードキャッシュ、`try_acquire_lock`/`release_lock` は
/// キー単位の相互排除を提供する。分散実装では L1（生きたロックはキーごとに
/// 高々 1 つ）をバックエンドのアトミック性で保証しなければならない。
#[cfg_attr(feature = "mock", mockall::automock)]
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Return the live record for `key`. Expired entries count as absent and
    /// may be purged lazily.
    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>, IdempotencyError>;

    /// Upsert the record with `expires_at = now + ttl`. When a prior record
    /// exists its `created_at` is preserved; everything else is overwritten.
    /// On return the new record is visible to `get` from any process.
    async fn save(
        &self,
        key: &str,
        record: IdempotencyRecord,
        ttl: Duration,
    ) -> Result<(), IdempotencyError>;

    /// Attempt to install the per-key lock with `expires_at = now + lock_ttl`.
    ///
    /// Returns `Some(guard)` when installed (including takeover of an expired
    /// lock). On contention, a zero `wait_budget` gives up immediately;
    /// otherwise the store polls with a uniform-random [15, 50] ms delay
    /// between attempts until the budget is exhausted, then returns `None`.
    async fn try_acquire_lock(
        &self,
        key: &str,
        lock_ttl: Duration,
        wait_budget: Duration,
    ) -> Result<Option<LockGuard>, IdempotencyError>;

    /// Delete the lock iff the live entry's token matches the guard's.
    /// A mismatch or missing entry is a no-op; the call is idempotent.
    async fn release_lock(&self, guard: LockGuard) -> Result<(), IdempotencyError>;
}

/// ロック競合時のポーリング間隔。[15, 50] ms の一様乱数でスパイクの同期を避ける。
/// ストア実装がロック獲得のリトライ間で使う。
pub fn contention_backoff() -> Duration {
    Duration::from_millis(rand::thread_rng().gen_range(15..=50))
}
