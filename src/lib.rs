pub mod error;
pub mod layer;
pub mod memory;
pub mod policy;
pub mod record;
pub mod retry;
pub mod store;

#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "redis")]
pub mod redis;

pub use error::IdempotencyError;
pub use layer::{idempotency_middleware, IdempotencyState, IDEMPOTENCY_KEY_HEADER};
pub use memory::InMemoryIdempotencyStore;
pub use policy::{FailureMode, IdempotencyConfig, IdempotencyPolicy, KeyValidator};
pub use record::{payload_fingerprint, IdempotencyRecord};
pub use store::{IdempotencyStore, LockGuard};

#[cfg(feature = "postgres")]
pub use postgres::PostgresIdempotencyStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisIdempotencyStore;

#[cfg(feature = "mock")]
pub use store::MockIdempotencyStore;
