use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use base64::Engine;
use hmac::{Hmac, Mac};
use lru::LruCache;
use parking_lot::Mutex;
use rand::Rng;
use sha2::Sha256;
use tracing::debug;

use crate::config::settings::CacheConfig;
use crate::models::context::AuthContext;
use crate::models::risk::AuthAnalysisResult;

type HmacSha256 = Hmac<Sha256>;

const FIELD_SEPARATOR: &[u8] = &[0x1f];

// ---------------------------------------------------------------------------
// Cache keys
// ---------------------------------------------------------------------------

/// Derives cache keys from the stable part of an attempt. Keys are keyed
/// hashes so they reveal nothing about the email or IP they were built from.
pub struct CacheKeyer {
    mac: HmacSha256,
    bucket_secs: i64,
}

impl CacheKeyer {
    pub fn new(config: &CacheConfig) -> Result<Self> {
        let secret: Vec<u8> = if config.key_secret.is_empty() {
            let mut rng = rand::rng();
            (0..32).map(|_| rng.random()).collect()
        } else {
            config.key_secret.as_bytes().to_vec()
        };

        let mac = HmacSha256::new_from_slice(&secret)
            .map_err(|e| anyhow!("invalid cache key secret: {}", e))?;

        Ok(Self {
            mac,
            bucket_secs: config.time_bucket_secs.max(1) as i64,
        })
    }

    /// HMAC-SHA256 over email (lower-cased), IP, user agent, device
    /// fingerprint and time bucket, base64url-encoded.
    pub fn key(&self, context: &AuthContext) -> String {
        let bucket = context.timestamp.timestamp().div_euclid(self.bucket_secs);
        let email = context.normalized_email();
        let ip = context.client_ip.to_string();
        let fingerprint = context.device_fingerprint.as_deref().unwrap_or("");
        let bucket = bucket.to_string();

        let mut mac = self.mac.clone();
        for field in [
            email.as_str(),
            ip.as_str(),
            context.user_agent.as_str(),
            fingerprint,
            bucket.as_str(),
        ] {
            mac.update(field.as_bytes());
            mac.update(FIELD_SEPARATOR);
        }

        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
    }
}

// ---------------------------------------------------------------------------
// ResultCache
// ---------------------------------------------------------------------------

struct CachedResult {
    result: AuthAnalysisResult,
    inserted_at: Instant,
}

pub enum CacheLookup {
    Hit(AuthAnalysisResult),
    Miss,
    /// The entry failed validation and has been evicted.
    Corrupted(String),
}

/// Bounded LRU of computed decisions with a per-entry TTL.
pub struct ResultCache {
    entries: Mutex<LruCache<String, CachedResult>>,
    ttl: Duration,
    enabled: bool,
}

impl ResultCache {
    pub fn new(config: &CacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl: Duration::from_secs(config.ttl_secs),
            enabled: config.enabled,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn get(&self, key: &str) -> CacheLookup {
        if !self.enabled {
            return CacheLookup::Miss;
        }

        let mut entries = self.entries.lock();
        let expired = match entries.get(key) {
            None => return CacheLookup::Miss,
            Some(entry) => entry.inserted_at.elapsed() >= self.ttl,
        };
        if expired {
            entries.pop(key);
            return CacheLookup::Miss;
        }

        let verdict = entries.get(key).map(|entry| {
            entry
                .result
                .validate()
                .map(|_| entry.result.clone())
        });
        match verdict {
            Some(Ok(result)) => CacheLookup::Hit(result),
            Some(Err(reason)) => {
                entries.pop(key);
                CacheLookup::Corrupted(reason)
            }
            None => CacheLookup::Miss,
        }
    }

    pub fn insert(&self, key: String, result: AuthAnalysisResult) {
        if !self.enabled {
            return;
        }
        self.entries.lock().put(
            key,
            CachedResult {
                result,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Drop entries older than the TTL. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let mut entries = self.entries.lock();
        let stale: Vec<String> = entries
            .iter()
            .filter(|(_, e)| e.inserted_at.elapsed() >= self.ttl)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &stale {
            entries.pop(key);
        }
        if !stale.is_empty() {
            debug!("Purged {} expired cache entries", stale.len());
        }
        stale.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}
