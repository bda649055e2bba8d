//! Source fetchers and the pipeline that wraps them.
//!
//! A [`Fetcher`] does the raw I/O for one data source and knows nothing
//! about caching, retries or rate limits. The [`Pipeline`] adds all three
//! around every call, and optionally persists results to the store.

pub mod http;
pub mod pipeline;
pub mod registry;

pub use http::HttpFetcher;
pub use pipeline::Pipeline;
pub use registry::FetcherRegistry;

use polars::prelude::DataFrame;
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;
use thiserror::Error;

use crate::cache::Request;
use crate::ratelimit::RateLimit;
use crate::retry::Retryable;
use crate::store::StoreError;

/// Tag naming a data source, e.g. `fbref`. Also the rate-limit bucket key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(String);

impl SourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SourceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SourceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl Borrow<str> for SourceId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("rate limit budget for '{source_id}' exhausted")]
    RateLimited { source_id: SourceId },

    #[error("HTTP {status} from {url}")]
    Http { status: u16, url: String },

    #[error("unexpected response format: {0}")]
    Parse(String),

    #[error("no fetcher registered for source '{0}'")]
    UnknownSource(SourceId),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("fetch error: {0}")]
    Other(String),
}

impl Retryable for FetchError {
    fn is_retryable(&self) -> bool {
        match self {
            FetchError::Transient(_) | FetchError::RateLimited { .. } => true,
            FetchError::Http { status, .. } => *status == 429 || (500..600).contains(status),
            _ => false,
        }
    }
}

/// Raw I/O for one data source: one request in, one table out.
pub trait Fetcher: Send + Sync {
    fn source(&self) -> SourceId;

    /// Limit to install for this source when none is configured.
    fn rate_limit(&self) -> Option<RateLimit> {
        None
    }

    fn fetch(&self, request: &Request) -> Result<DataFrame, FetchError>;
}

/// Fetcher backed by a closure. Handy for tests and one-off sources.
pub struct FnFetcher<F> {
    source: SourceId,
    rate_limit: Option<RateLimit>,
    f: F,
}

impl<F> FnFetcher<F>
where
    F: Fn(&Request) -> Result<DataFrame, FetchError> + Send + Sync,
{
    pub fn new(source: impl Into<SourceId>, f: F) -> Self {
        Self {
            source: source.into(),
            rate_limit: None,
            f,
        }
    }

    pub fn with_rate_limit(mut self, limit: RateLimit) -> Self {
        self.rate_limit = Some(limit);
        self
    }
}

impl<F> Fetcher for FnFetcher<F>
where
    F: Fn(&Request) -> Result<DataFrame, FetchError> + Send + Sync,
{
    fn source(&self) -> SourceId {
        self.source.clone()
    }

    fn rate_limit(&self) -> Option<RateLimit> {
        self.rate_limit
    }

    fn fetch(&self, request: &Request) -> Result<DataFrame, FetchError> {
        (self.f)(request)
    }
}
