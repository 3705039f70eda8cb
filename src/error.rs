use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IdempotencyError {
    #[error("request body of {size} bytes exceeds the {limit} byte hashing limit")]
    PayloadTooLarge { size: u64, limit: u64 },
    #[error("idempotency key {key} was reused with a different request payload")]
    PayloadMismatch { key: String },
    #[error("a request with idempotency key {key} is already in progress")]
    InFlight { key: String },
    #[error("timed out after {waited_ms} ms waiting for the lock on key {key}")]
    LockTimeout { key: String, waited_ms: u64 },
    #[error("シリアライズエラー: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("ストレージエラー: {0}")]
    Storage(String),
}

/// HTTP マッピング。ミドルウェアがトランスポート境界でそのまま利用する。
impl IntoResponse for IdempotencyError {
    fn into_response(self) -> Response {
        let status = match self {
            IdempotencyError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            IdempotencyError::PayloadMismatch { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            IdempotencyError::InFlight { .. } => StatusCode::CONFLICT,
            IdempotencyError::LockTimeout { .. }
            | IdempotencyError::Serialization(_)
            | IdempotencyError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = match &self {
            IdempotencyError::PayloadMismatch { .. } => {
                "the idempotency key was used with a different request payload".to_string()
            }
            IdempotencyError::InFlight { .. } => {
                "a request with the same idempotency key is currently in progress".to_string()
            }
            other => other.to_string(),
        };
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_mismatch_maps_to_422() {
        let resp = IdempotencyError::PayloadMismatch {
            key: "k".to_string(),
        }
        .into_response();
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[test]
    fn test_in_flight_maps_to_409() {
        let resp = IdempotencyError::InFlight {
            key: "k".to_string(),
        }
        .into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn test_storage_maps_to_500() {
        let resp = IdempotencyError::Storage("boom".to_string()).into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_lock_timeout_message_carries_key_and_budget() {
        let err = IdempotencyError::LockTimeout {
            key: "abc".to_string(),
            waited_ms: 2000,
        };
        let msg = err.to_string();
        assert!(msg.contains("abc"));
        assert!(msg.contains("2000"));
    }
}
