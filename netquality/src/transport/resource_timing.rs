//! Resource timing capability.
//!
//! A [`ResourceTimingSource`] reports fine-grained timestamps for a request,
//! keyed by its exact URL. Sources are optional: when a lookup returns
//! `None` the timing estimator falls back to coarse wall-clock stamps.

use std::sync::Arc;

use dashmap::DashMap;

/// Unread entries a [`TimingRecorder`] holds before it starts over.
pub const MAX_PENDING_TIMINGS: usize = 1024;

/// Fine-grained timestamps for one request, in clock milliseconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceTiming {
    /// When the request was issued.
    pub request_start: f64,
    /// When the first response byte arrived.
    pub response_start: f64,
    /// When the last body byte arrived.
    pub response_end: f64,
    /// Bytes on the wire (headers plus body), when the platform reports it.
    pub transfer_size: Option<u64>,
}

impl ResourceTiming {
    /// Time to first byte.
    pub fn time_to_first_byte_ms(&self) -> f64 {
        self.response_start - self.request_start
    }

    /// Time spent receiving the body.
    pub fn download_ms(&self) -> f64 {
        self.response_end - self.response_start
    }
}

/// Lookup of recorded resource timing by exact URL.
pub trait ResourceTimingSource: Send + Sync {
    /// Timing recorded for `url`, if any.
    fn lookup(&self, url: &str) -> Option<ResourceTiming>;
}

/// In-process resource timing buffer.
///
/// Transports record an entry per completed request. Lookups consume the
/// entry so the buffer only holds timings that have not been read yet.
/// Entries nobody reads are dropped once `capacity` is reached.
#[derive(Debug)]
pub struct TimingRecorder {
    entries: DashMap<String, ResourceTiming>,
    capacity: usize,
}

impl TimingRecorder {
    /// Create an empty recorder holding up to [`MAX_PENDING_TIMINGS`] entries.
    pub fn new() -> Self {
        Self::with_capacity(MAX_PENDING_TIMINGS)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Record timing for `url`, replacing any unread entry.
    pub fn record(&self, url: impl Into<String>, timing: ResourceTiming) {
        if self.entries.len() >= self.capacity {
            tracing::warn!(
                pending = self.entries.len(),
                "Resource timing entries are not being read, discarding them"
            );
            self.entries.clear();
        }
        self.entries.insert(url.into(), timing);
    }

    /// Number of unread entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if there are no unread entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop all unread entries.
    pub fn clear(&self) {
        self.entries.clear();
    }
}

impl Default for TimingRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceTimingSource for TimingRecorder {
    fn lookup(&self, url: &str) -> Option<ResourceTiming> {
        self.entries.remove(url).map(|(_, timing)| timing)
    }
}

/// Several sources consulted in order; the first hit wins.
///
/// Every source is queried on each lookup, so consuming sources such as
/// [`TimingRecorder`] drop their entry even when an earlier source answered.
#[derive(Clone, Default)]
pub struct ChainedTimingSource {
    sources: Vec<Arc<dyn ResourceTimingSource>>,
}

impl ChainedTimingSource {
    pub fn new(sources: Vec<Arc<dyn ResourceTimingSource>>) -> Self {
        Self { sources }
    }

    /// Collapse `sources` into a single source: `None` when empty, the
    /// source itself when there is one, a chain otherwise.
    pub fn combine(
        sources: impl IntoIterator<Item = Arc<dyn ResourceTimingSource>>,
    ) -> Option<Arc<dyn ResourceTimingSource>> {
        let mut sources: Vec<_> = sources.into_iter().collect();
        match sources.len() {
            0 => None,
            1 => sources.pop(),
            _ => Some(Arc::new(Self::new(sources))),
        }
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

impl ResourceTimingSource for ChainedTimingSource {
    fn lookup(&self, url: &str) -> Option<ResourceTiming> {
        let mut found = None;
        for source in &self.sources {
            let timing = source.lookup(url);
            if found.is_none() {
                found = timing;
            }
        }
        found
    }
}

impl std::fmt::Debug for ChainedTimingSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainedTimingSource")
            .field("sources", &self.sources.len())
            .finish()
    }
}
