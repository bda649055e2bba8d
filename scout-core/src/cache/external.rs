//! Optional shared cache tier.
//!
//! The tier is chosen once at construction: a Redis backend when it is
//! enabled and answers a PING, otherwise [`NoopTier`]. Values are stored as
//! an envelope of an 8-byte big-endian write timestamp (epoch millis)
//! followed by the payload, so freshness can be judged by any process.

use redis::Commands;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::CacheError;
use crate::config::{CacheConfig, RedisConfig};

/// Capability interface for a shared key-value cache.
pub trait ExternalTier: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this tier actually stores anything.
    fn is_enabled(&self) -> bool {
        true
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheError>;

    fn remove(&self, key: &str) -> Result<(), CacheError>;

    fn clear(&self) -> Result<(), CacheError>;

    fn len(&self) -> Result<usize, CacheError>;
}

/// Always misses, always accepts writes.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTier;

impl ExternalTier for NoopTier {
    fn name(&self) -> &str {
        "none"
    }

    fn is_enabled(&self) -> bool {
        false
    }

    fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        Ok(None)
    }

    fn set(&self, _key: &str, _value: &[u8], _ttl: Duration) -> Result<(), CacheError> {
        Ok(())
    }

    fn remove(&self, _key: &str) -> Result<(), CacheError> {
        Ok(())
    }

    fn clear(&self) -> Result<(), CacheError> {
        Ok(())
    }

    fn len(&self) -> Result<usize, CacheError> {
        Ok(0)
    }
}

/// Redis-backed tier over a single synchronous connection.
///
/// A dropped connection is discarded and re-opened on the next call.
pub struct RedisTier {
    client: redis::Client,
    conn: Mutex<Option<redis::Connection>>,
    prefix: String,
    timeout: Duration,
}

impl RedisTier {
    /// Connect and verify the server answers PING.
    pub fn connect(config: &RedisConfig) -> Result<Self, CacheError> {
        let client = redis::Client::open(config.url()).map_err(redis_err)?;
        let mut conn = client
            .get_connection_with_timeout(config.connect_timeout())
            .map_err(redis_err)?;
        redis::cmd("PING")
            .query::<String>(&mut conn)
            .map_err(redis_err)?;

        Ok(Self {
            client,
            conn: Mutex::new(Some(conn)),
            prefix: config.prefix.clone(),
            timeout: config.connect_timeout(),
        })
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{key}", self.prefix)
    }

    fn lock(&self) -> MutexGuard<'_, Option<redis::Connection>> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_conn<T, F>(&self, op: F) -> Result<T, CacheError>
    where
        F: FnOnce(&mut redis::Connection) -> redis::RedisResult<T>,
    {
        let mut guard = self.lock();
        if guard.is_none() {
            let fresh = self
                .client
                .get_connection_with_timeout(self.timeout)
                .map_err(redis_err)?;
            *guard = Some(fresh);
        }
        let Some(conn) = guard.as_mut() else {
            return Err(CacheError::External {
                backend: "redis".into(),
                message: "no connection".into(),
            });
        };

        match op(conn) {
            Ok(value) => Ok(value),
            Err(e) => {
                if e.is_io_error() || e.is_connection_dropped() {
                    *guard = None;
                }
                Err(redis_err(e))
            }
        }
    }

    fn matching_keys(&self) -> Result<Vec<String>, CacheError> {
        let pattern = format!("{}*", self.prefix);
        self.with_conn(|conn| {
            let keys: Vec<String> = conn.scan_match::<_, String>(&pattern)?.collect();
            Ok(keys)
        })
    }
}

impl ExternalTier for RedisTier {
    fn name(&self) -> &str {
        "redis"
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let key = self.full_key(key);
        self.with_conn(|conn| conn.get::<_, Option<Vec<u8>>>(&key))
    }

    fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheError> {
        let key = self.full_key(key);
        // Server-side expiry is a backstop; readers still check the envelope.
        let millis = expiry_millis(ttl);
        self.with_conn(|conn| conn.pset_ex::<_, _, ()>(&key, value, millis))
    }

    fn remove(&self, key: &str) -> Result<(), CacheError> {
        let key = self.full_key(key);
        self.with_conn(|conn| conn.del::<_, ()>(&key))
    }

    fn clear(&self) -> Result<(), CacheError> {
        let keys = self.matching_keys()?;
        if keys.is_empty() {
            return Ok(());
        }
        self.with_conn(|conn| conn.del::<_, ()>(&keys))
    }

    fn len(&self) -> Result<usize, CacheError> {
        Ok(self.matching_keys()?.len())
    }
}

fn redis_err(e: redis::RedisError) -> CacheError {
    CacheError::External {
        backend: "redis".into(),
        message: e.to_string(),
    }
}

/// Pick the external tier for a cache configuration.
///
/// Never fails: an unreachable server degrades to [`NoopTier`].
pub fn connect_external(config: &CacheConfig) -> Arc<dyn ExternalTier> {
    if !config.external {
        debug!("external cache tier disabled");
        return Arc::new(NoopTier);
    }

    match RedisTier::connect(&config.redis) {
        Ok(tier) => {
            info!(url = %config.redis.url(), "connected to redis cache tier");
            Arc::new(tier)
        }
        Err(e) => {
            warn!(
                url = %config.redis.url(),
                error = %e,
                "redis cache tier unreachable, continuing with in-process cache only"
            );
            Arc::new(NoopTier)
        }
    }
}

/// Server-side expiry for `ttl` in whole milliseconds, at least one.
fn expiry_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

const STAMP_LEN: usize = 8;

/// Prefix `payload` with its write time.
pub(crate) fn seal(written_at_ms: i64, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(STAMP_LEN + payload.len());
    out.extend_from_slice(&written_at_ms.to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Split an envelope into write time and payload. `None` if truncated.
pub(crate) fn unseal(bytes: &[u8]) -> Option<(i64, &[u8])> {
    if bytes.len() < STAMP_LEN {
        return None;
    }
    let (stamp, payload) = bytes.split_at(STAMP_LEN);
    let stamp: [u8; STAMP_LEN] = stamp.try_into().ok()?;
    Some((i64::from_be_bytes(stamp), payload))
}
