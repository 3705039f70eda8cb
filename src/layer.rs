use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::header::CONTENT_LENGTH;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use http_body_util::{BodyExt, LengthLimitError, Limited};
use uuid::Uuid;

use crate::error::IdempotencyError;
use crate::policy::{FailureMode, IdempotencyConfig, IdempotencyPolicy};
pub use crate::policy::IDEMPOTENCY_KEY_HEADER;
use crate::record::{payload_fingerprint, IdempotencyRecord};
use crate::retry::with_store_retry;
use crate::store::{IdempotencyStore, LockGuard};

/// axum middleware State に渡すストア + 設定（dyn dispatch）
#[derive(Clone)]
pub struct IdempotencyState {
    pub store: Arc<dyn IdempotencyStore>,
    pub config: IdempotencyConfig,
    /// Policy applied to routes under this layer when no request extension
    /// overrides it. `None` means routes pass through untouched unless the
    /// host installs an `IdempotencyPolicy` extension ahead of the layer.
    pub policy: Option<IdempotencyPolicy>,
}

impl IdempotencyState {
    pub fn new(store: Arc<dyn IdempotencyStore>) -> Self {
        Self {
            store,
            config: IdempotencyConfig::default(),
            policy: Some(IdempotencyPolicy::default()),
        }
    }

    pub fn with_config(store: Arc<dyn IdempotencyStore>, config: IdempotencyConfig) -> Self {
        Self {
            store,
            config,
            policy: Some(IdempotencyPolicy::default()),
        }
    }

    /// このレイヤー配下のエンドポイントに適用するポリシーを差し替える。
    pub fn with_policy(mut self, policy: IdempotencyPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Extension でポリシーを付けたルートだけを対象にする。
    pub fn without_default_policy(mut self) -> Self {
        self.policy = None;
        self
    }
}

/// axum ミドルウェア関数
///
/// `axum::middleware::from_fn_with_state` で利用する。
///
/// ```ignore
/// use std::sync::Arc;
/// use axum::{middleware, routing::post, Router};
/// use k1s0_idempotency::{
///     idempotency_middleware, IdempotencyPolicy, IdempotencyState, InMemoryIdempotencyStore,
/// };
///
/// let state = IdempotencyState::new(Arc::new(InMemoryIdempotencyStore::new()))
///     .with_policy(IdempotencyPolicy::new(5, true));
/// let app = Router::new()
///     .route("/pay", post(handler))
///     .layer(middleware::from_fn_with_state(state, idempotency_middleware));
/// ```
///
/// The decision tree per request: replay a live cached record, or take the
/// per-key lock and execute the handler exactly once, or reject with 409/422.
/// Only 2xx responses are recorded; anything else leaves no trace so the
/// client may retry.
pub async fn idempotency_middleware(
    State(state): State<IdempotencyState>,
    req: Request,
    next: Next,
) -> Response {
    // 1. エンドポイントのポリシーを決める。無ければ素通し。
    let policy = req
        .extensions()
        .get::<IdempotencyPolicy>()
        .copied()
        .or(state.policy);
    let Some(policy) = policy else {
        return next.run(req).await;
    };

    // 2. キーの取得。ヘッダーが無い・空白のみなら素通し。
    let key = req
        .headers()
        .get(&state.config.header_name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(str::to_string);
    let Some(key) = key else {
        return next.run(req).await;
    };

    // 3. キー検証。ストアには一切触れない。
    if let Some(validator) = &state.config.key_validator {
        if !validator(&key) {
            return (StatusCode::BAD_REQUEST, "invalid idempotency key").into_response();
        }
    }

    // 4. ペイロード検証が有効ならボディをハッシュし、ハンドラー用に詰め直す。
    let (req, request_body_hash) = if policy.validate_payload {
        match hash_request_body(req, state.config.max_body_size).await {
            Ok((req, hash)) => (req, Some(hash)),
            Err(e) => return e.into_response(),
        }
    } else {
        (req, None)
    };

    match run_protocol(&state, policy, key, request_body_hash, req, next).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

/// Steps 5–11: cache probe, lock lifecycle, double-checked probe, handler
/// execution, conditional record write.
async fn run_protocol(
    state: &IdempotencyState,
    policy: IdempotencyPolicy,
    key: String,
    request_body_hash: Option<String>,
    req: Request,
    next: Next,
) -> Result<Response, IdempotencyError> {
    // 5. 最初のキャッシュ照会
    if let Some(record) = guarded_get(state, &key).await? {
        tracing::debug!("replaying cached response for idempotency key {}", key);
        return Ok(respond_from_record(&key, record, request_body_hash.as_deref()));
    }

    // 6. ロック獲得
    let guard = guarded_acquire(state, &key).await?;
    let Some(guard) = guard else {
        if state.config.wait_budget.is_zero() {
            return Err(IdempotencyError::InFlight { key });
        }
        return Err(IdempotencyError::LockTimeout {
            waited_ms: state.config.wait_budget.as_millis() as u64,
            key,
        });
    };

    // 7〜9 はロック保持中に実行し、どの経路でも必ず解放する。
    let lease = LockLease::new(state.store.clone(), guard);
    let outcome = execute_locked(state, policy, &key, request_body_hash, req, next).await;
    lease.release(&state.config).await;
    outcome
}

async fn execute_locked(
    state: &IdempotencyState,
    policy: IdempotencyPolicy,
    key: &str,
    request_body_hash: Option<String>,
    req: Request,
    next: Next,
) -> Result<Response, IdempotencyError> {
    // 7. ロック保持後の再照会。ロック待ちの間に別の競合者が完了していることがある。
    if let Some(record) = guarded_get(state, key).await? {
        tracing::debug!("another worker completed key {} while we waited", key);
        return Ok(respond_from_record(key, record, request_body_hash.as_deref()));
    }

    // 8. ハンドラー実行。レスポンスボディはバッファに取り込む。
    let response = next.run(req).await;

    // 9. 2xx のときだけ記録する。それ以外はクライアントの再試行に委ねる。
    if !response.status().is_success() {
        return Ok(response);
    }

    let (parts, body) = response.into_parts();
    let body_bytes = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            tracing::warn!("failed to buffer response body for key {}: {}", key, e);
            return Ok(Response::from_parts(parts, Body::empty()));
        }
    };

    let headers = capture_headers(&parts.headers, &state.config);
    let ttl = resolve_ttl(&policy, &state.config);
    let record = IdempotencyRecord::new(
        parts.status.as_u16(),
        headers,
        body_bytes.to_vec(),
        request_body_hash,
        ttl,
    );
    guarded_save(state, key, record, ttl).await?;

    Ok(Response::from_parts(parts, Body::from(body_bytes)))
}

/// Apply the payload-validation check, then replay the record (step 10).
fn respond_from_record(
    key: &str,
    record: IdempotencyRecord,
    request_body_hash: Option<&str>,
) -> Response {
    if let (Some(request_hash), Some(cached_hash)) =
        (request_body_hash, record.payload_hash.as_deref())
    {
        if request_hash != cached_hash {
            return IdempotencyError::PayloadMismatch {
                key: key.to_string(),
            }
            .into_response();
        }
    }
    replay_response(&record)
}

/// Write the captured status, headers, and body to a fresh response. Headers
/// already present are left alone; nothing is invented beyond the capture.
fn replay_response(record: &IdempotencyRecord) -> Response {
    let mut response = Response::new(Body::from(record.body.clone()));
    *response.status_mut() =
        StatusCode::from_u16(record.status_code).unwrap_or(StatusCode::OK);
    let headers = response.headers_mut();
    for (name, values) in &record.headers {
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
            continue;
        };
        if headers.contains_key(&name) {
            continue;
        }
        for value in values {
            if let Ok(value) = HeaderValue::from_str(value) {
                headers.append(name.clone(), value);
            }
        }
    }
    response
}

/// Buffer the request body, hash it, and rebuild the request for the handler.
async fn hash_request_body(
    req: Request,
    max_body_size: usize,
) -> Result<(Request, String), IdempotencyError> {
    let declared_length = req
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    if let Some(length) = declared_length {
        if length > max_body_size as u64 {
            return Err(IdempotencyError::PayloadTooLarge {
                size: length,
                limit: max_body_size as u64,
            });
        }
    }

    let (parts, body) = req.into_parts();
    let bytes = match Limited::new(body, max_body_size).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) if e.is::<LengthLimitError>() => {
            return Err(IdempotencyError::PayloadTooLarge {
                size: declared_length.unwrap_or(max_body_size as u64),
                limit: max_body_size as u64,
            });
        }
        Err(e) => {
            return Err(IdempotencyError::Storage(format!(
                "failed to read request body: {e}"
            )));
        }
    };

    let hash = payload_fingerprint(&bytes);
    let req = Request::from_parts(parts, Body::from(bytes));
    Ok((req, hash))
}

/// 除外ヘッダーを落としつつレスポンスヘッダーを写し取る。名前は小文字。
fn capture_headers(
    headers: &HeaderMap,
    config: &IdempotencyConfig,
) -> HashMap<String, Vec<String>> {
    let mut captured: HashMap<String, Vec<String>> = HashMap::new();
    for (name, value) in headers {
        if config.excluded_headers.contains(name.as_str()) {
            continue;
        }
        let Ok(value) = value.to_str() else {
            tracing::debug!("skipping non-UTF-8 response header {}", name);
            continue;
        };
        captured
            .entry(name.as_str().to_string())
            .or_default()
            .push(value.to_string());
    }
    captured
}

fn resolve_ttl(policy: &IdempotencyPolicy, config: &IdempotencyConfig) -> Duration {
    if policy.expiry_minutes > 0 {
        Duration::from_secs(u64::from(policy.expiry_minutes) * 60)
    } else {
        config.default_expiry
    }
}

async fn guarded_get(
    state: &IdempotencyState,
    key: &str,
) -> Result<Option<IdempotencyRecord>, IdempotencyError> {
    let store = state.store.clone();
    let key_owned = key.to_string();
    let result = with_store_retry(&state.config, "get", move || {
        let store = store.clone();
        let key = key_owned.clone();
        async move { store.get(&key).await }
    })
    .await;
    apply_failure_mode(state, "get", result, None)
}

async fn guarded_acquire(
    state: &IdempotencyState,
    key: &str,
) -> Result<Option<LockGuard>, IdempotencyError> {
    let store = state.store.clone();
    let key_owned = key.to_string();
    let lock_ttl = state.config.lock_ttl;
    let wait_budget = state.config.wait_budget;
    let result = with_store_retry(&state.config, "try_acquire_lock", move || {
        let store = store.clone();
        let key = key_owned.clone();
        async move { store.try_acquire_lock(&key, lock_ttl, wait_budget).await }
    })
    .await;
    // fail-open のフォールバックは「獲得できたことにする」。トークンは実在しない
    // ので解放は no-op になり、重複実行の可能性と引き換えに可用性を保つ。
    let fallback = Some(LockGuard {
        key: key.to_string(),
        token: Uuid::new_v4().to_string(),
    });
    apply_failure_mode(state, "try_acquire_lock", result, fallback)
}

async fn guarded_save(
    state: &IdempotencyState,
    key: &str,
    record: IdempotencyRecord,
    ttl: Duration,
) -> Result<(), IdempotencyError> {
    let store = state.store.clone();
    let key_owned = key.to_string();
    let result = with_store_retry(&state.config, "save", move || {
        let store = store.clone();
        let key = key_owned.clone();
        let record = record.clone();
        async move { store.save(&key, record, ttl).await }
    })
    .await;
    apply_failure_mode(state, "save", result, ())
}

fn apply_failure_mode<T>(
    state: &IdempotencyState,
    operation: &str,
    result: Result<T, IdempotencyError>,
    fallback: T,
) -> Result<T, IdempotencyError> {
    match result {
        Ok(value) => Ok(value),
        Err(e) => match state.config.failure_mode {
            FailureMode::FailSafe => Err(e),
            FailureMode::FailOpen => {
                tracing::warn!(
                    "idempotency store {} failed, continuing without idempotency guarantee: {}",
                    operation,
                    e
                );
                Ok(fallback)
            }
        },
    }
}

/// Holds the lock guard through steps 7–9 and guarantees release.
///
/// `release` is the normal path. When the request future is dropped mid-flight
/// (client disconnect), `Drop` spawns a best-effort release; the lock TTL
/// covers the case where even that never runs.
struct LockLease {
    store: Arc<dyn IdempotencyStore>,
    guard: Option<LockGuard>,
}

impl LockLease {
    fn new(store: Arc<dyn IdempotencyStore>, guard: LockGuard) -> Self {
        Self {
            store,
            guard: Some(guard),
        }
    }

    async fn release(mut self, config: &IdempotencyConfig) {
        let Some(guard) = self.guard.take() else {
            return;
        };
        let store = self.store.clone();
        let key = guard.key.clone();
        let token = guard.token;
        let result = with_store_retry(config, "release_lock", move || {
            let store = store.clone();
            let key = key.clone();
            let token = token.clone();
            async move { store.release_lock(LockGuard { key, token }).await }
        })
        .await;
        if let Err(e) = result {
            // 解放失敗でレスポンスは止めない。TTL が最終的に回収する。
            tracing::warn!("idempotency lock release failed: {}", e);
        }
    }
}

impl Drop for LockLease {
    fn drop(&mut self) {
        if let Some(guard) = self.guard.take() {
            let store = self.store.clone();
            tokio::spawn(async move {
                if let Err(e) = store.release_lock(guard).await {
                    tracing::warn!("idempotency lock release on drop failed: {}", e);
                }
            });
        }
    }
}
