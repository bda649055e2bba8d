//! Composition root for fetching.
//!
//! Order of the layers around one fetcher call:
//!
//! ```text
//! cache lookup ──hit──▶ return
//!      │ miss
//!      ▼
//! retry loop ─▶ [acquire token ─▶ fetcher.fetch] (per attempt)
//!      │ ok
//!      ▼
//! cache store ─▶ return
//! ```
//!
//! A cache hit costs no rate-limit tokens and no backoff, and every retry
//! attempt pays for its own token.

use polars::prelude::DataFrame;
use rayon::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::{FetchError, Fetcher, FetcherRegistry, SourceId};
use crate::cache::{Request, ResultCache, Scoped};
use crate::config::{ConfigError, ScoutConfig};
use crate::ratelimit::RateLimiter;
use crate::retry::RetryPolicy;
use crate::store::{PartitionedStore, TableKey};

pub struct Pipeline {
    registry: FetcherRegistry,
    limiter: Arc<RateLimiter>,
    cache: Arc<ResultCache>,
    retry: RetryPolicy,
    store: Option<Arc<PartitionedStore>>,
    acquire_timeout: Option<Duration>,
}

impl Pipeline {
    pub fn new(limiter: Arc<RateLimiter>, cache: Arc<ResultCache>, retry: RetryPolicy) -> Self {
        Self {
            registry: FetcherRegistry::new(),
            limiter,
            cache,
            retry,
            store: None,
            acquire_timeout: None,
        }
    }

    /// Limiter, cache and retry policy from configuration. The store is
    /// attached separately with [`Pipeline::with_store`].
    pub fn from_config(config: &ScoutConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let limiter = RateLimiter::from_config(config)?;
        let cache = ResultCache::from_config(&config.cache);
        Ok(Self::new(
            Arc::new(limiter),
            Arc::new(cache),
            config.retry.policy(),
        ))
    }

    pub fn with_store(mut self, store: Arc<PartitionedStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Give up on a token after `timeout`; the attempt then fails with
    /// [`FetchError::RateLimited`]. Without a timeout, acquire waits as long
    /// as it takes.
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = Some(timeout);
        self
    }

    /// Register every fetcher of `registry`.
    pub fn with_registry(mut self, registry: FetcherRegistry) -> Self {
        for fetcher in registry.fetchers() {
            self.register(Arc::clone(fetcher));
        }
        self
    }

    /// Add a fetcher. Its own rate limit is installed unless the source
    /// already has a configured one.
    pub fn register(&mut self, fetcher: Arc<dyn Fetcher>) {
        let source = fetcher.source();
        if let Some(limit) = fetcher.rate_limit() {
            if !self.limiter.is_configured(source.as_str()) {
                self.limiter.set_limit(source.as_str(), limit);
            }
        }
        if self.registry.register(fetcher).is_some() {
            info!(%source, "replaced fetcher");
        }
    }

    pub fn registry(&self) -> &FetcherRegistry {
        &self.registry
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    pub fn store(&self) -> Option<&Arc<PartitionedStore>> {
        self.store.as_ref()
    }

    /// Fetch through cache, retry and rate limiter.
    pub fn fetch(&self, source: &str, request: &Request) -> Result<DataFrame, FetchError> {
        let fetcher = self.registry.get(source)?;
        let source_id = fetcher.source();
        let key = Scoped {
            scope: source_id.as_str(),
            request,
        };

        self.cache.wrap(&key, || {
            self.retry.run(|| {
                self.admit(&source_id)?;
                debug!(source = %source_id, %request, "fetching");
                fetcher.fetch(request)
            })
        })
    }

    /// [`Pipeline::fetch`], then save the result under `key`.
    ///
    /// An empty result is returned but not stored.
    pub fn fetch_and_store(
        &self,
        source: &str,
        request: &Request,
        key: &TableKey,
    ) -> Result<DataFrame, FetchError> {
        let store = self
            .store
            .as_ref()
            .ok_or_else(|| FetchError::Other("pipeline has no store attached".into()))?;
        let frame = self.fetch(source, request)?;
        store.save(&frame, key)?;
        Ok(frame)
    }

    /// Run many requests against one source on the rayon pool.
    ///
    /// Results line up with `requests`. The source's rate limit still
    /// applies across all of them.
    pub fn fetch_many(
        &self,
        source: &str,
        requests: &[Request],
    ) -> Vec<Result<DataFrame, FetchError>> {
        requests
            .par_iter()
            .map(|request| self.fetch(source, request))
            .collect()
    }

    fn admit(&self, source: &SourceId) -> Result<(), FetchError> {
        let admitted = match self.acquire_timeout {
            Some(timeout) => self.limiter.acquire_timeout(source.as_str(), timeout),
            None => self.limiter.acquire(source.as_str()),
        };
        if admitted {
            Ok(())
        } else {
            Err(FetchError::RateLimited {
                source_id: source.clone(),
            })
        }
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("sources", &self.registry)
            .field("retry", &self.retry)
            .field("store", &self.store)
            .field("acquire_timeout", &self.acquire_timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::FnFetcher;
    use crate::ratelimit::RateLimit;
    use polars::prelude::df;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pipeline(retry: RetryPolicy) -> Pipeline {
        Pipeline::new(
            Arc::new(RateLimiter::new()),
            Arc::new(ResultCache::in_memory(Duration::from_secs(60))),
            retry,
        )
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(1))
    }

    fn season_frame(request: &Request) -> Result<DataFrame, FetchError> {
        let season = request.get_str("season").unwrap_or_default();
        df!("season" => [season]).map_err(|e| FetchError::Parse(e.to_string()))
    }

    /// Counts calls, failing transiently the first `fail_first` times.
    fn flaky(source: &str, calls: Arc<AtomicUsize>, fail_first: usize) -> Arc<dyn Fetcher> {
        Arc::new(FnFetcher::new(source, move |request: &Request| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < fail_first {
                return Err(FetchError::Transient(format!("attempt {n}")));
            }
            season_frame(request)
        }))
    }

    #[test]
    fn cache_hit_costs_no_token() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut p = pipeline(fast_retry());
        p.limiter().set_limit("fbref", RateLimit::with_burst(0.001, 2.0).unwrap());
        p.register(flaky("fbref", Arc::clone(&calls), 0));

        let request = Request::new("schedule").param("season", "2324");
        let first = p.fetch("fbref", &request).unwrap();
        let second = p.fetch("fbref", &request).unwrap();

        assert!(first.equals(&second));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let left = p.limiter().available("fbref").unwrap();
        assert!((0.99..1.01).contains(&left), "tokens left: {left}");
    }

    #[test]
    fn every_attempt_pays_a_token() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut p = pipeline(fast_retry());
        p.limiter().set_limit("espn", RateLimit::with_burst(0.001, 5.0).unwrap());
        p.register(flaky("espn", Arc::clone(&calls), 2));

        p.fetch("espn", &Request::new("scores")).unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let left = p.limiter().available("espn").unwrap();
        assert!((1.99..2.01).contains(&left), "tokens left: {left}");
    }

    #[test]
    fn limiter_timeout_becomes_rate_limited() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut p =
            pipeline(RetryPolicy::no_retry()).with_acquire_timeout(Duration::from_millis(20));
        p.limiter().set_limit("sofifa", RateLimit::with_burst(0.001, 1.0).unwrap());
        p.register(flaky("sofifa", Arc::clone(&calls), 0));

        p.fetch("sofifa", &Request::new("players").param("season", "1")).unwrap();
        let err = p
            .fetch("sofifa", &Request::new("players").param("season", "2"))
            .unwrap_err();

        assert!(matches!(err, FetchError::RateLimited { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn errors_are_not_cached() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut p = pipeline(RetryPolicy::no_retry());
        p.register(flaky("fotmob", Arc::clone(&calls), 1));

        let request = Request::new("leagues");
        assert!(p.fetch("fotmob", &request).is_err());
        assert!(p.fetch("fotmob", &request).is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unknown_source() {
        let p = pipeline(RetryPolicy::no_retry());
        assert!(matches!(
            p.fetch("nowhere", &Request::new("x")),
            Err(FetchError::UnknownSource(_))
        ));
    }

    #[test]
    fn configured_limit_wins_over_fetcher_default() {
        let mut p = pipeline(RetryPolicy::no_retry());
        let configured = RateLimit::with_burst(5.0, 10.0).unwrap();
        p.limiter().set_limit("whoscored", configured);
        p.register(Arc::new(
            FnFetcher::new("whoscored", season_frame)
                .with_rate_limit(RateLimit::with_burst(0.5, 1.0).unwrap()),
        ));
        assert_eq!(p.limiter().limit("whoscored"), configured);

        p.register(Arc::new(
            FnFetcher::new("clubelo", season_frame)
                .with_rate_limit(RateLimit::with_burst(0.5, 1.0).unwrap()),
        ));
        assert_eq!(p.limiter().limit("clubelo").rate(), 0.5);
    }

    #[test]
    fn fetch_many_keeps_input_order() {
        let mut p = pipeline(RetryPolicy::no_retry());
        p.limiter()
            .set_limit("matchhistory", RateLimit::with_burst(1000.0, 1000.0).unwrap());
        p.register(Arc::new(FnFetcher::new("matchhistory", season_frame)));

        let requests: Vec<Request> = (2000..2016)
            .map(|y| Request::new("games").param("season", y.to_string()))
            .collect();
        let results = p.fetch_many("matchhistory", &requests);

        assert_eq!(results.len(), requests.len());
        for (request, result) in requests.iter().zip(results) {
            let frame = result.unwrap();
            let season = frame
                .column("season")
                .unwrap()
                .as_materialized_series()
                .str()
                .unwrap()
                .get(0)
                .map(str::to_string);
            assert_eq!(season, request.get_str("season"));
        }
    }

    #[test]
    fn fetch_and_store_persists() {
        let store = Arc::new(PartitionedStore::open_in_memory().unwrap());
        let mut p = pipeline(RetryPolicy::no_retry()).with_store(Arc::clone(&store));
        p.register(Arc::new(FnFetcher::new("fbref", season_frame)));

        let key = TableKey::new("schedule", "fbref", "2324");
        let request = Request::new("schedule").param("season", "2324");
        p.fetch_and_store("fbref", &request, &key).unwrap();
        assert!(store.has_data(&key));

        let no_store = pipeline(RetryPolicy::no_retry());
        assert!(matches!(
            no_store.fetch_and_store("fbref", &request, &key),
            Err(FetchError::Other(_))
        ));
    }
}
