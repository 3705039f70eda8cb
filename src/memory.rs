use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedSemaphorePermit, RwLock, Semaphore};
use uuid::Uuid;

use crate::error::IdempotencyError;
use crate::record::IdempotencyRecord;
use crate::store::{IdempotencyStore, LockGuard};

/// 単一プロセス向けのインメモリ実装。開発・テスト・デフォルト用。
///
/// ロックはキーごとの 1 パーミットセマフォで実現する。プロセスが生きている限り
/// ロックも生きているため `lock_ttl` は無視する。レコードが消えたキーの
/// セマフォは best-effort で回収し、キーの入れ替わりが激しい場合の肥大化を防ぐ。
#[derive(Clone)]
pub struct InMemoryIdempotencyStore {
    records: Arc<RwLock<HashMap<String, IdempotencyRecord>>>,
    locks: Arc<Mutex<HashMap<String, Arc<Semaphore>>>>,
    held: Arc<Mutex<HashMap<String, OwnedSemaphorePermit>>>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
            locks: Arc::new(Mutex::new(HashMap::new())),
            held: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// 保持者も待機者もおらず、生きたレコードも無いセマフォを回収する。
    async fn sweep_locks(&self) {
        let records = self.records.read().await;
        let mut locks = self.locks.lock().await;
        locks.retain(|key, semaphore| {
            let live_record = records.get(key).map_or(false, |r| !r.is_expired());
            // A holder or a waiter keeps a clone of the Arc alive.
            live_record || Arc::strong_count(semaphore) > 1
        });
    }

    #[cfg(test)]
    pub(crate) async fn lock_entry_count(&self) -> usize {
        self.locks.lock().await.len()
    }
}

impl Default for InMemoryIdempotencyStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>, IdempotencyError> {
        {
            let records = self.records.read().await;
            match records.get(key) {
                Some(record) if !record.is_expired() => return Ok(Some(record.clone())),
                Some(_) => {}
                None => return Ok(None),
            }
        }
        // 期限切れエントリは読み取り時に除去する
        let mut records = self.records.write().await;
        if records.get(key).map_or(false, |r| r.is_expired()) {
            records.remove(key);
        }
        Ok(None)
    }

    async fn save(
        &self,
        key: &str,
        record: IdempotencyRecord,
        ttl: Duration,
    ) -> Result<(), IdempotencyError> {
        let mut records = self.records.write().await;
        let mut record = record.refreshed(ttl);
        if let Some(existing) = records.get(key) {
            record.created_at = existing.created_at;
        }
        records.insert(key.to_string(), record);
        Ok(())
    }

    async fn try_acquire_lock(
        &self,
        key: &str,
        _lock_ttl: Duration,
        wait_budget: Duration,
    ) -> Result<Option<LockGuard>, IdempotencyError> {
        let semaphore = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(1)))
                .clone()
        };

        let permit = if wait_budget.is_zero() {
            match semaphore.try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => return Ok(None),
            }
        } else {
            match tokio::time::timeout(wait_budget, semaphore.acquire_owned()).await {
                Ok(Ok(permit)) => permit,
                Ok(Err(e)) => return Err(IdempotencyError::Storage(e.to_string())),
                Err(_) => return Ok(None),
            }
        };

        let token = Uuid::new_v4().to_string();
        self.held.lock().await.insert(token.clone(), permit);
        Ok(Some(LockGuard {
            key: key.to_string(),
            token,
        }))
    }

    async fn release_lock(&self, guard: LockGuard) -> Result<(), IdempotencyError> {
        // Dropping the permit frees the semaphore. An unknown token means the
        // lock was already released; release stays idempotent.
        self.held.lock().await.remove(&guard.token);
        self.sweep_locks().await;
        Ok(())
    }
}
