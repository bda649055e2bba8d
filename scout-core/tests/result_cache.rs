//! Two-tier cache behaviour seen from the outside.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use scout_core::cache::{CacheError, ExternalTier, Json, Request, RequestKey, ResultCache};

/// Shared map standing in for a cache server two processes both talk to.
#[derive(Default)]
struct SharedTier {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl ExternalTier for SharedTier {
    fn name(&self) -> &str {
        "shared-map"
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    fn set(&self, key: &str, value: &[u8], _ttl: Duration) -> Result<(), CacheError> {
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), CacheError> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }

    fn clear(&self) -> Result<(), CacheError> {
        self.entries.lock().unwrap().clear();
        Ok(())
    }

    fn len(&self) -> Result<usize, CacheError> {
        Ok(self.entries.lock().unwrap().len())
    }
}

/// A tier whose server is permanently down.
struct DownTier;

impl DownTier {
    fn err() -> CacheError {
        CacheError::External {
            backend: "down".into(),
            message: "connection refused".into(),
        }
    }
}

impl ExternalTier for DownTier {
    fn name(&self) -> &str {
        "down"
    }

    fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        Err(Self::err())
    }

    fn set(&self, _key: &str, _value: &[u8], _ttl: Duration) -> Result<(), CacheError> {
        Err(Self::err())
    }

    fn remove(&self, _key: &str) -> Result<(), CacheError> {
        Err(Self::err())
    }

    fn clear(&self) -> Result<(), CacheError> {
        Err(Self::err())
    }

    fn len(&self) -> Result<usize, CacheError> {
        Err(Self::err())
    }
}

#[test]
fn entry_expires_after_ttl() {
    let cache = ResultCache::in_memory(Duration::from_millis(1000));
    cache.set("k", &"v".to_string());
    assert_eq!(cache.get::<String>("k").as_deref(), Some("v"));

    thread::sleep(Duration::from_millis(1200));
    assert_eq!(cache.get::<String>("k"), None);
}

#[test]
fn wrapped_operation_runs_once_within_ttl() {
    let cache = ResultCache::in_memory(Duration::from_secs(60));
    let calls = AtomicUsize::new(0);
    let standings = cache.cached(|req: &Request| {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok::<_, String>(Json(vec![req.get_str("league").unwrap_or_default(), "1st".into()]))
    });

    let a = Request::new("standings")
        .param("league", "ESP-La Liga")
        .param("season", 2324);
    let b = Request::new("standings")
        .param("season", 2324)
        .param("league", "ESP-La Liga");

    let first = standings(&a).unwrap();
    let second = standings(&b).unwrap();
    assert_eq!(first, second);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn operation_errors_propagate_and_are_not_cached() {
    let cache = ResultCache::in_memory(Duration::from_secs(60));
    let request = Request::new("lineups").param("game", 42);

    let err = cache
        .wrap(&request, || Err::<String, _>("upstream 500".to_string()))
        .unwrap_err();
    assert_eq!(err, "upstream 500");
    assert_eq!(cache.get::<String>(&request.cache_key()), None);

    let ok = cache
        .wrap(&request, || Ok::<_, String>("lineup".to_string()))
        .unwrap();
    assert_eq!(ok, "lineup");
}

#[test]
fn external_tier_is_shared_between_instances() {
    let tier = Arc::new(SharedTier::default());
    let writer = ResultCache::new(Duration::from_secs(60), tier.clone());
    let reader = ResultCache::new(Duration::from_secs(60), tier.clone());

    writer.set("schedule", &"cached".to_string());
    assert_eq!(reader.get::<String>("schedule").as_deref(), Some("cached"));
    assert_eq!(reader.stats().external_entries, Some(1));
}

#[test]
fn stale_external_entry_is_a_miss_and_dropped() {
    let tier = Arc::new(SharedTier::default());
    let writer = ResultCache::new(Duration::from_secs(60), tier.clone());
    let strict = ResultCache::new(Duration::from_millis(10), tier.clone());

    writer.set("k", &"v".to_string());
    thread::sleep(Duration::from_millis(50));

    assert_eq!(strict.get::<String>("k"), None);
    assert_eq!(tier.len().unwrap(), 0);
}

#[test]
fn malformed_external_entry_falls_through_to_memory() {
    let tier = Arc::new(SharedTier::default());
    let cache = ResultCache::new(Duration::from_secs(60), tier.clone());
    cache.set("k", &"good".to_string());
    tier.set("k", &[1, 2, 3], Duration::from_secs(60)).unwrap();

    assert_eq!(cache.get::<String>("k").as_deref(), Some("good"));
}

#[test]
fn unreachable_external_tier_never_surfaces() {
    let cache = ResultCache::new(Duration::from_secs(60), Arc::new(DownTier));
    cache.set("k", &"v".to_string());
    assert_eq!(cache.get::<String>("k").as_deref(), Some("v"));
    cache.remove("k");
    cache.clear();

    let stats = cache.stats();
    assert_eq!(stats.external_backend, "down");
    assert_eq!(stats.external_entries, None);
    assert!(stats.external_errors >= 3);
}

#[test]
fn clear_empties_both_tiers() {
    let tier = Arc::new(SharedTier::default());
    let cache = ResultCache::new(Duration::from_secs(60), tier.clone());
    cache.set("a", &"1".to_string());
    cache.set("b", &"2".to_string());

    cache.clear();
    let stats = cache.stats();
    assert_eq!(stats.memory_entries, 0);
    assert_eq!(stats.external_entries, Some(0));
}
