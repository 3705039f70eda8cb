use std::collections::HashMap;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// IdempotencyRecord はキャッシュ済みの 2xx レスポンスを表す。
///
/// ヘッダー名は小文字で保持する（HTTP ヘッダーは大文字小文字を区別しない）。
/// `created_at` は初回書き込み時刻で、upsert を跨いで保持される。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub status_code: u16,
    pub headers: HashMap<String, Vec<String>>,
    #[serde(with = "body_base64")]
    pub body: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub payload_hash: Option<String>,
}

impl IdempotencyRecord {
    pub fn new(
        status_code: u16,
        headers: HashMap<String, Vec<String>>,
        body: Vec<u8>,
        payload_hash: Option<String>,
        ttl: Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            status_code,
            headers,
            body,
            created_at: now,
            expires_at: now + chrono::Duration::milliseconds(ttl.as_millis() as i64),
            payload_hash,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }

    /// upsert 用: `created_at` を維持したまま有効期限を `now + ttl` に更新する。
    pub fn refreshed(mut self, ttl: Duration) -> Self {
        self.expires_at = Utc::now() + chrono::Duration::milliseconds(ttl.as_millis() as i64);
        self
    }
}

/// Compute the payload fingerprint: base64-encoded SHA-256 of the raw body bytes.
///
/// The empty body hashes to the SHA-256 of zero bytes, which is a valid
/// fingerprint; callers never special-case emptiness.
pub fn payload_fingerprint(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    STANDARD.encode(hasher.finalize())
}

mod body_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_sets_expiry_from_ttl() {
        let record = IdempotencyRecord::new(
            200,
            HashMap::new(),
            b"ok".to_vec(),
            None,
            Duration::from_secs(60),
        );
        assert_eq!(record.expires_at, record.created_at + chrono::Duration::seconds(60));
        assert!(!record.is_expired());
    }

    #[test]
    fn test_is_expired_in_the_past() {
        let mut record =
            IdempotencyRecord::new(200, HashMap::new(), vec![], None, Duration::from_secs(1));
        record.expires_at = Utc::now() - chrono::Duration::seconds(10);
        assert!(record.is_expired());
    }

    #[test]
    fn test_refreshed_preserves_created_at() {
        let record =
            IdempotencyRecord::new(201, HashMap::new(), vec![], None, Duration::from_secs(1));
        let created = record.created_at;
        let refreshed = record.refreshed(Duration::from_secs(300));
        assert_eq!(refreshed.created_at, created);
        assert!(refreshed.expires_at > created + chrono::Duration::seconds(200));
    }

    #[test]
    fn test_payload_fingerprint_is_base64_sha256() {
        // SHA-256 of zero bytes, base64-encoded
        assert_eq!(
            payload_fingerprint(b""),
            "47DEQpj8HBSa+/TImW+5JCeuQeRkm5NMpJWZG3hSuFU="
        );
        assert_ne!(payload_fingerprint(b"a"), payload_fingerprint(b"b"));
    }

    #[test]
    fn test_record_serializes_body_as_base64() {
        let record = IdempotencyRecord::new(
            200,
            HashMap::new(),
            vec![0xde, 0xad, 0xbe, 0xef],
            None,
            Duration::from_secs(60),
        );
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains(&STANDARD.encode([0xde, 0xad, 0xbe, 0xef])));

        let parsed: IdempotencyRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.body, record.body);
        assert_eq!(parsed, record);
    }

    #[test]
    fn test_headers_round_trip() {
        let mut headers = HashMap::new();
        headers.insert(
            "x-custom".to_string(),
            vec!["one".to_string(), "two".to_string()],
        );
        let record = IdempotencyRecord::new(
            204,
            headers.clone(),
            vec![],
            Some(payload_fingerprint(b"{}")),
            Duration::from_secs(60),
        );
        let json = serde_json::to_string(&record).unwrap();
        let parsed: IdempotencyRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.headers, headers);
        assert_eq!(parsed.payload_hash, record.payload_hash);
    }
}
