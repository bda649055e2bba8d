use std::collections::BTreeMap;
use std::sync::Arc;

use super::{FetchError, Fetcher, SourceId};

/// Maps each source to the fetcher that serves it.
#[derive(Clone, Default)]
pub struct FetcherRegistry {
    fetchers: BTreeMap<SourceId, Arc<dyn Fetcher>>,
}

impl FetcherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a fetcher under its own source id, returning any fetcher it replaced.
    pub fn register(&mut self, fetcher: Arc<dyn Fetcher>) -> Option<Arc<dyn Fetcher>> {
        self.fetchers.insert(fetcher.source(), fetcher)
    }

    pub fn get(&self, source: &str) -> Result<Arc<dyn Fetcher>, FetchError> {
        self.fetchers
            .get(source)
            .cloned()
            .ok_or_else(|| FetchError::UnknownSource(source.into()))
    }

    pub fn contains(&self, source: &str) -> bool {
        self.fetchers.contains_key(source)
    }

    /// Registered sources in sorted order.
    pub fn sources(&self) -> impl Iterator<Item = &SourceId> {
        self.fetchers.keys()
    }

    pub(crate) fn fetchers(&self) -> impl Iterator<Item = &Arc<dyn Fetcher>> {
        self.fetchers.values()
    }

    pub fn len(&self) -> usize {
        self.fetchers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fetchers.is_empty()
    }
}

impl std::fmt::Debug for FetcherRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.fetchers.keys()).finish()
    }
}
