// exchange/hmac.rs
// ====
// HMAC-SHA256 request signing (Bybit / Binance family)
// ====

use std::time::{Duration, Instant};

use dashmap::DashMap;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

const CACHE_PRUNE_THRESHOLD: usize = 100;

pub fn hmac_sha256_hex(secret: &str, payload: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(payload.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

struct CachedSignature {
    signature: String,
    created: Instant,
}

/// Per-account HMAC signer.
///
/// The signature cache absorbs bursty identical requests (same query string
/// within the TTL hashes once). Cache state is owned by the signer instance,
/// with opportunistic TTL eviction once it grows past ~100 entries.
pub struct HmacSigner {
    api_key: String,
    secret: String,
    cache: DashMap<String, CachedSignature>,
    ttl: Duration,
}

impl HmacSigner {
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            secret: secret.into(),
            cache: DashMap::new(),
            ttl: Duration::from_secs(5),
        }
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    /// Bybit v5 concatenation: `timestamp + api_key + recv_window + payload`,
    /// where payload is the query string (GET) or raw JSON body (POST).
    pub fn sign_v5(&self, timestamp_ms: i64, recv_window: u64, payload: &str) -> String {
        let canonical = format!("{}{}{}{}", timestamp_ms, self.api_key, recv_window, payload);
        hmac_sha256_hex(&self.secret, &canonical)
    }

    /// Binance concatenation: the full query string is the payload and the
    /// signature is appended as a query parameter. Cached per query string.
    pub fn sign_query(&self, query: &str) -> String {
        if let Some(entry) = self.cache.get(query) {
            if entry.created.elapsed() < self.ttl {
                return entry.signature.clone();
            }
        }
        let signature = hmac_sha256_hex(&self.secret, query);
        if self.cache.len() >= CACHE_PRUNE_THRESHOLD {
            self.prune();
        }
        self.cache.insert(
            query.to_string(),
            CachedSignature {
                signature: signature.clone(),
                created: Instant::now(),
            },
        );
        signature
    }

    /// WebSocket auth signature: `GET/realtime{expires}`.
    pub fn sign_ws_auth(&self, expires_ms: i64) -> String {
        hmac_sha256_hex(&self.secret, &format!("GET/realtime{}", expires_ms))
    }

    fn prune(&self) {
        let ttl = self.ttl;
        self.cache.retain(|_, cached| cached.created.elapsed() < ttl);
    }

    #[cfg(test)]
    fn cache_len(&self) -> usize {
        self.cache.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_is_deterministic() {
        let signer = HmacSigner::new("key", "secret");
        assert_eq!(
            signer.sign_v5(1700000000000, 5000, "symbol=BTCUSDT"),
            signer.sign_v5(1700000000000, 5000, "symbol=BTCUSDT")
        );
    }

    #[test]
    fn test_signature_changes_with_any_input() {
        let signer = HmacSigner::new("key", "secret");
        let base = signer.sign_v5(1700000000000, 5000, "symbol=BTCUSDT");
        assert_ne!(base, signer.sign_v5(1700000000001, 5000, "symbol=BTCUSDT"));
        assert_ne!(base, signer.sign_v5(1700000000000, 5000, "symbol=ETHUSDT"));
        let other_secret = HmacSigner::new("key", "secret2");
        assert_ne!(base, other_secret.sign_v5(1700000000000, 5000, "symbol=BTCUSDT"));
    }

    #[test]
    fn test_query_cache_hit_returns_same_signature() {
        let signer = HmacSigner::new("key", "secret");
        let first = signer.sign_query("symbol=BTCUSDT&timestamp=1");
        let second = signer.sign_query("symbol=BTCUSDT&timestamp=1");
        assert_eq!(first, second);
        assert_eq!(signer.cache_len(), 1);
    }

    #[test]
    fn test_cache_prunes_expired_entries() {
        let signer = HmacSigner::new("key", "secret").with_cache_ttl(Duration::from_secs(0));
        for i in 0..CACHE_PRUNE_THRESHOLD + 10 {
            signer.sign_query(&format!("timestamp={}", i));
        }
        // Everything expires instantly at ttl=0, so pruning keeps the cache
        // from growing without bound.
        assert!(signer.cache_len() <= CACHE_PRUNE_THRESHOLD + 1);
    }

    #[test]
    fn test_ws_auth_payload_shape() {
        let signer = HmacSigner::new("key", "secret");
        assert_eq!(
            signer.sign_ws_auth(1700000000000),
            hmac_sha256_hex("secret", "GET/realtime1700000000000")
        );
    }
}
