//! Probe transport abstraction.
//!
//! The engine does not own an HTTP stack. It consumes a [`ProbeTransport`]
//! that issues a GET and resolves once the response body has been fully
//! consumed, plus an optional [`ResourceTimingSource`] that can report
//! fine-grained timestamps for the request.
//!
//! # Implementations
//!
//! - [`ReqwestTransport`] - default transport over an async `reqwest::Client`.
//!   Records resource timing for every request into a [`TimingRecorder`].
//! - Test doubles implement the trait directly and script responses.
//!
//! # Dyn Compatibility
//!
//! [`ProbeTransport::fetch`] returns a [`BoxFuture`] so the engine can hold an
//! `Arc<dyn ProbeTransport>` and tests can substitute fakes freely.

mod http;
#[cfg(test)]
pub(crate) mod mock;
mod resource_timing;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use thiserror::Error;

pub use http::{ReqwestTransport, DEFAULT_REQUEST_TIMEOUT};
pub use resource_timing::{
    ChainedTimingSource, ResourceTiming, ResourceTimingSource, TimingRecorder,
    MAX_PENDING_TIMINGS,
};

/// Header carrying the server's own processing time (`...dur=<ms>...`).
pub const SERVER_TIMING_HEADER: &str = "server-timing";

/// Boxed future type for dyn-compatible async methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Errors raised by a transport.
///
/// All variants are recovered at the probe level; none reach the caller of
/// a measurement.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransportError {
    /// The request could not be sent or no response arrived.
    #[error("Request failed: {0}")]
    Request(String),

    /// The response arrived but its body could not be consumed.
    #[error("Failed to read response body: {0}")]
    Body(String),

    /// The request was aborted or timed out.
    #[error("Request aborted: {0}")]
    Aborted(String),

    /// The underlying HTTP client could not be created.
    #[error("Failed to create HTTP client: {0}")]
    ClientBuild(String),
}

/// A completed probe exchange.
///
/// Carries what the timing estimator needs from the response: the final
/// resolved URL (used for resource-timing lookup), response headers, and the
/// number of body bytes consumed.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProbeResponse {
    url: String,
    headers: Vec<(String, String)>,
    body_bytes: u64,
}

impl ProbeResponse {
    /// Create a response for `url` whose body had `body_bytes` bytes.
    pub fn new(url: impl Into<String>, body_bytes: u64) -> Self {
        Self {
            url: url.into(),
            headers: Vec::new(),
            body_bytes,
        }
    }

    /// Add a response header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Final resolved URL after redirects.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Look up a header by name (case-insensitive). Returns the first match.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// The `server-timing` header, if present.
    pub fn server_timing(&self) -> Option<&str> {
        self.header(SERVER_TIMING_HEADER)
    }

    /// Number of body bytes consumed.
    pub fn body_bytes(&self) -> u64 {
        self.body_bytes
    }

    /// All headers in arrival order.
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }
}

/// HTTP transport used to issue probes.
///
/// Implementations must not fail on non-success status codes; a probe is
/// timed regardless of status. Timeouts are the transport's responsibility.
pub trait ProbeTransport: Send + Sync {
    /// Issue a GET for `url` and resolve once the body has been consumed.
    fn fetch(&self, url: &str) -> BoxFuture<'_, Result<ProbeResponse, TransportError>>;

    /// Timing this transport records for its own requests, if any.
    ///
    /// The engine reads every source it is given so recorded entries are
    /// always consumed.
    fn resource_timing(&self) -> Option<Arc<dyn ResourceTimingSource>> {
        None
    }
}

/// Shared transport handle.
pub type SharedTransport = Arc<dyn ProbeTransport>;
