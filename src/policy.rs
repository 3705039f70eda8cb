use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// Idempotency-Key ヘッダー名（照合は大文字小文字を区別しない）
pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

/// レスポンスに保存・リプレイしないヘッダーのデフォルト集合。
pub const DEFAULT_EXCLUDED_HEADERS: [&str; 7] = [
    "transfer-encoding",
    "connection",
    "keep-alive",
    "upgrade",
    "date",
    "set-cookie",
    "authorization",
];

/// Per-endpoint idempotency policy, supplied by the hosting router either as
/// the state's default or as a request extension installed ahead of the
/// middleware. Routes without a policy pass through untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdempotencyPolicy {
    /// Cache lifetime in minutes. `0` means "use the process-wide default".
    pub expiry_minutes: u32,
    /// Bind the key to the SHA-256 of the request body; reuse with a
    /// different body is rejected with 422.
    pub validate_payload: bool,
}

impl Default for IdempotencyPolicy {
    fn default() -> Self {
        Self {
            expiry_minutes: 60,
            validate_payload: true,
        }
    }
}

impl IdempotencyPolicy {
    pub fn new(expiry_minutes: u32, validate_payload: bool) -> Self {
        Self {
            expiry_minutes,
            validate_payload,
        }
    }
}

/// ストレージ障害時の動作モード。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailureMode {
    /// ストアエラーを呼び出し元へ伝播する（トランスポート境界で 5xx になる）。
    #[default]
    FailSafe,
    /// エラーを握りつぶして処理を続行する。冪等性保証は失われるが可用性は保たれる。
    FailOpen,
}

/// Optional predicate applied to the raw header value; `false` rejects the
/// request with 400 before any store access.
pub type KeyValidator = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// IdempotencyConfig はプロセス全体のミドルウェア設定を表す。
#[derive(Clone)]
pub struct IdempotencyConfig {
    /// HTTP header carrying the idempotency key.
    pub header_name: String,
    /// TTL used when the endpoint policy says `expiry_minutes == 0`.
    pub default_expiry: Duration,
    /// Safety TTL handed to `try_acquire_lock`; bounds how long a crashed
    /// holder can wedge a key. Must exceed the slowest expected handler.
    pub lock_ttl: Duration,
    /// How long a contender keeps polling for the lock. Zero means a single
    /// non-blocking attempt answered with 409 on contention.
    pub wait_budget: Duration,
    /// Upper bound on the hashable request body.
    pub max_body_size: usize,
    /// Lowercase header names never persisted nor replayed.
    pub excluded_headers: HashSet<String>,
    pub key_validator: Option<KeyValidator>,
    pub failure_mode: FailureMode,
    /// Extra attempts per store call after the first failure.
    pub storage_retry_count: u32,
    /// Constant delay between store retries.
    pub storage_retry_delay: Duration,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            header_name: IDEMPOTENCY_KEY_HEADER.to_string(),
            default_expiry: Duration::from_secs(60 * 60),
            lock_ttl: Duration::from_millis(30_000),
            wait_budget: Duration::ZERO,
            max_body_size: 10 * 1024 * 1024,
            excluded_headers: DEFAULT_EXCLUDED_HEADERS
                .iter()
                .map(|h| h.to_string())
                .collect(),
            key_validator: None,
            failure_mode: FailureMode::FailSafe,
            storage_retry_count: 0,
            storage_retry_delay: Duration::from_millis(200),
        }
    }
}

impl IdempotencyConfig {
    pub fn with_header_name(mut self, name: impl Into<String>) -> Self {
        self.header_name = name.into().to_ascii_lowercase();
        self
    }

    pub fn with_default_expiry(mut self, expiry: Duration) -> Self {
        self.default_expiry = expiry;
        self
    }

    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    pub fn with_wait_budget(mut self, budget: Duration) -> Self {
        self.wait_budget = budget;
        self
    }

    pub fn with_max_body_size(mut self, bytes: usize) -> Self {
        self.max_body_size = bytes;
        self
    }

    /// ヘッダー名は小文字に正規化して保持する。
    pub fn with_excluded_headers<I, S>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.excluded_headers = headers
            .into_iter()
            .map(|h| h.into().to_ascii_lowercase())
            .collect();
        self
    }

    pub fn with_key_validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        self.key_validator = Some(Arc::new(validator));
        self
    }

    pub fn with_failure_mode(mut self, mode: FailureMode) -> Self {
        self.failure_mode = mode;
        self
    }

    pub fn with_storage_retry(mut self, count: u32, delay: Duration) -> Self {
        self.storage_retry_count = count;
        self.storage_retry_delay = delay;
        self
    }

    pub fn is_header_excluded(&self, name: &str) -> bool {
        self.excluded_headers.contains(&name.to_ascii_lowercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_defaults() {
        let policy = IdempotencyPolicy::default();
        assert_eq!(policy.expiry_minutes, 60);
        assert!(policy.validate_payload);
    }

    #[test]
    fn test_config_defaults() {
        let config = IdempotencyConfig::default();
        assert_eq!(config.header_name, "idempotency-key");
        assert_eq!(config.default_expiry, Duration::from_secs(3600));
        assert_eq!(config.lock_ttl, Duration::from_millis(30_000));
        assert_eq!(config.wait_budget, Duration::ZERO);
        assert_eq!(config.max_body_size, 10 * 1024 * 1024);
        assert_eq!(config.failure_mode, FailureMode::FailSafe);
        assert_eq!(config.storage_retry_count, 0);
        assert_eq!(config.storage_retry_delay, Duration::from_millis(200));
        assert!(config.key_validator.is_none());
    }

    #[test]
    fn test_default_excluded_headers() {
        let config = IdempotencyConfig::default();
        for name in ["set-cookie", "Set-Cookie", "DATE", "authorization"] {
            assert!(config.is_header_excluded(name), "{name} should be excluded");
        }
        assert!(!config.is_header_excluded("x-custom"));
    }

    #[test]
    fn test_with_excluded_headers_normalizes_case() {
        let config = IdempotencyConfig::default().with_excluded_headers(["X-Secret"]);
        assert!(config.is_header_excluded("x-secret"));
        assert!(!config.is_header_excluded("set-cookie"));
    }

    #[test]
    fn test_with_key_validator() {
        let config =
            IdempotencyConfig::default().with_key_validator(|key| key.len() >= 8);
        let validator = config.key_validator.as_ref().unwrap();
        assert!(validator("long-enough-key"));
        assert!(!validator("short"));
    }

    #[test]
    fn test_builder_chain() {
        let config = IdempotencyConfig::default()
            .with_header_name("X-Request-Key")
            .with_wait_budget(Duration::from_secs(2))
            .with_storage_retry(3, Duration::from_millis(50));
        assert_eq!(config.header_name, "x-request-key");
        assert_eq!(config.wait_budget, Duration::from_secs(2));
        assert_eq!(config.storage_retry_count, 3);
    }
}
