//! Scout Core: the resilience and persistence layer under every data fetcher.
//!
//! - Per-source token bucket rate limiting
//! - Two-tier TTL result cache (in-process plus optional Redis)
//! - Retry with exponential backoff
//! - Partitioned SQLite table store with multi-partition UNION reads and
//!   Parquet export
//! - Fetcher registry and the pipeline that composes all of the above
//!
//! Everything is synchronous: blocking calls on OS threads, with rayon for
//! fan-out.

pub mod cache;
pub mod config;
pub mod fetch;
pub mod ratelimit;
pub mod retry;
pub mod store;

pub use cache::{CacheCodec, Request, RequestKey, ResultCache};
pub use config::{ConfigError, ScoutConfig};
pub use fetch::{FetchError, Fetcher, FetcherRegistry, HttpFetcher, Pipeline, SourceId};
pub use ratelimit::{RateLimit, RateLimiter};
pub use retry::{RetryPolicy, Retryable};
pub use store::{Compression, LoadOptions, PartitionedStore, StoreError, TableKey};
