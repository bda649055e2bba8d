//! Two-tier TTL result cache.
//!
//! Reads consult the external tier first (shared across processes), then the
//! in-process map. Writes always land in the in-process map and are copied to
//! the external tier on a best-effort basis. Nothing on this path ever
//! surfaces an error to the caller: an unreachable or corrupt external tier
//! costs hit rate, never correctness.
//!
//! Entries expire lazily. An entry older than the TTL is reported as a miss
//! and dropped when it is next looked at; [`ResultCache::purge_expired`]
//! sweeps the in-process map on demand.

pub mod codec;
pub mod external;
pub mod key;

pub use codec::{CacheCodec, Json};
pub use external::{connect_external, ExternalTier, NoopTier, RedisTier};
pub use key::{Request, RequestKey, Scoped};

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::CacheConfig;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("{backend} cache tier: {message}")]
    External { backend: String, message: String },

    #[error("cache payload codec: {0}")]
    Codec(String),
}

#[derive(Debug, Clone)]
struct MemoryEntry {
    payload: Vec<u8>,
    written_at: Instant,
}

/// Counters and configuration, never payloads.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub memory_entries: usize,
    /// `None` when no external tier is configured or it could not be counted.
    pub external_entries: Option<usize>,
    pub external_backend: String,
    pub ttl_secs: u64,
    pub hits: u64,
    pub misses: u64,
    pub external_errors: u64,
}

pub struct ResultCache {
    memory: Mutex<HashMap<String, MemoryEntry>>,
    external: Arc<dyn ExternalTier>,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    external_errors: AtomicU64,
}

impl std::fmt::Debug for ResultCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultCache")
            .field("external", &self.external.name())
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl ResultCache {
    pub fn new(ttl: Duration, external: Arc<dyn ExternalTier>) -> Self {
        Self {
            memory: Mutex::new(HashMap::new()),
            external,
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            external_errors: AtomicU64::new(0),
        }
    }

    /// In-process tier only.
    pub fn in_memory(ttl: Duration) -> Self {
        Self::new(ttl, Arc::new(NoopTier))
    }

    /// Build from configuration, probing the external tier if enabled.
    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.ttl(), connect_external(config))
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn memory(&self) -> MutexGuard<'_, HashMap<String, MemoryEntry>> {
        self.memory.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_fresh_ms(&self, written_at_ms: i64) -> bool {
        let age_ms = (now_millis() - written_at_ms).max(0) as u128;
        age_ms <= self.ttl.as_millis()
    }

    /// Raw payload lookup.
    pub fn get_bytes(&self, key: &str) -> Option<Vec<u8>> {
        let found = self
            .external_lookup(key)
            .or_else(|| self.memory_lookup(key));
        match found {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        found
    }

    fn external_lookup(&self, key: &str) -> Option<Vec<u8>> {
        if !self.external.is_enabled() {
            return None;
        }
        let raw = match self.external.get(key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                self.external_errors.fetch_add(1, Ordering::Relaxed);
                warn!(key, error = %e, "external cache read failed");
                return None;
            }
        };

        match external::unseal(&raw) {
            Some((written_at, payload)) if self.is_fresh_ms(written_at) => Some(payload.to_vec()),
            Some(_) => {
                debug!(key, "dropping expired external cache entry");
                self.external_remove(key);
                None
            }
            None => {
                warn!(key, "dropping malformed external cache entry");
                self.external_remove(key);
                None
            }
        }
    }

    fn external_remove(&self, key: &str) {
        if let Err(e) = self.external.remove(key) {
            self.external_errors.fetch_add(1, Ordering::Relaxed);
            warn!(key, error = %e, "external cache delete failed");
        }
    }

    fn memory_lookup(&self, key: &str) -> Option<Vec<u8>> {
        let mut memory = self.memory();
        match memory.get(key) {
            Some(entry) if entry.written_at.elapsed() <= self.ttl => {
                return Some(entry.payload.clone());
            }
            Some(_) => {}
            None => return None,
        }
        debug!(key, "dropping expired cache entry");
        memory.remove(key);
        None
    }

    /// Store a raw payload. Never fails.
    pub fn set_bytes(&self, key: &str, payload: Vec<u8>) {
        if self.external.is_enabled() {
            let sealed = external::seal(now_millis(), &payload);
            if let Err(e) = self.external.set(key, &sealed, self.ttl) {
                self.external_errors.fetch_add(1, Ordering::Relaxed);
                warn!(key, error = %e, "external cache write failed, kept in-process copy");
            }
        }
        self.memory().insert(
            key.to_string(),
            MemoryEntry {
                payload,
                written_at: Instant::now(),
            },
        );
    }

    /// Typed lookup. A payload that no longer decodes is dropped and reported
    /// as a miss.
    pub fn get<T: CacheCodec>(&self, key: &str) -> Option<T> {
        let bytes = self.get_bytes(key)?;
        match T::decode(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key, error = %e, "discarding undecodable cache entry");
                self.remove(key);
                None
            }
        }
    }

    /// Typed store. Encoding failures are logged and the value is not cached.
    pub fn set<T: CacheCodec>(&self, key: &str, value: &T) {
        match value.encode() {
            Ok(bytes) => self.set_bytes(key, bytes),
            Err(e) => warn!(key, error = %e, "value not cached: encoding failed"),
        }
    }

    pub fn remove(&self, key: &str) {
        self.memory().remove(key);
        if self.external.is_enabled() {
            self.external_remove(key);
        }
    }

    /// Empty both tiers.
    pub fn clear(&self) {
        self.memory().clear();
        if let Err(e) = self.external.clear() {
            self.external_errors.fetch_add(1, Ordering::Relaxed);
            warn!(error = %e, "external cache clear failed");
        }
    }

    /// Drop expired in-process entries, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let mut memory = self.memory();
        let before = memory.len();
        memory.retain(|_, entry| entry.written_at.elapsed() <= self.ttl);
        before - memory.len()
    }

    pub fn stats(&self) -> CacheStats {
        let external_entries = if self.external.is_enabled() {
            match self.external.len() {
                Ok(n) => Some(n),
                Err(e) => {
                    warn!(error = %e, "could not count external cache entries");
                    None
                }
            }
        } else {
            None
        };

        CacheStats {
            memory_entries: self.memory().len(),
            external_entries,
            external_backend: self.external.name().to_string(),
            ttl_secs: self.ttl.as_secs(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            external_errors: self.external_errors.load(Ordering::Relaxed),
        }
    }

    /// Memoize one call of `op` under `key`.
    ///
    /// On a hit `op` is not invoked. On a miss its error propagates untouched
    /// and its value is stored before being returned.
    pub fn wrap<K, T, E, F>(&self, key: &K, op: F) -> Result<T, E>
    where
        K: RequestKey + ?Sized,
        T: CacheCodec,
        F: FnOnce() -> Result<T, E>,
    {
        let cache_key = key.cache_key();
        if let Some(hit) = self.get::<T>(&cache_key) {
            debug!(operation = key.operation(), "cache hit");
            return Ok(hit);
        }
        debug!(operation = key.operation(), "cache miss");
        let value = op()?;
        self.set(&cache_key, &value);
        Ok(value)
    }

    /// Cache-wrapped version of `op`, keyed by its request argument.
    pub fn cached<'a, K, T, E, F>(&'a self, op: F) -> impl Fn(&K) -> Result<T, E> + 'a
    where
        K: RequestKey,
        T: CacheCodec,
        F: Fn(&K) -> Result<T, E> + 'a,
    {
        move |request: &K| self.wrap(request, || op(request))
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
