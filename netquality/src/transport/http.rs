//! Reqwest-backed probe transport.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderValue, CACHE_CONTROL};

use super::resource_timing::{ResourceTiming, ResourceTimingSource, TimingRecorder};
use super::{BoxFuture, ProbeResponse, ProbeTransport, TransportError};
use crate::clock::SharedClock;

/// Default timeout for a single probe request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-header wire overhead beyond name and value (`": "` and CRLF).
const HEADER_LINE_OVERHEAD: u64 = 4;

/// Probe transport over an async `reqwest::Client`.
///
/// Every completed request is timed against the engine clock and recorded
/// into a [`TimingRecorder`] under the response's final URL, which gives the
/// timing estimator precise phases without any platform support:
///
/// - `request_start`: just before the request is sent
/// - `response_start`: when response headers arrive
/// - `response_end`: when the body has been fully read
///
/// The recorder is exposed through [`ProbeTransport::resource_timing`], so an
/// engine built with this transport reads (and drains) it automatically.
///
/// Responses are accepted regardless of HTTP status.
pub struct ReqwestTransport {
    client: reqwest::Client,
    clock: SharedClock,
    recorder: Arc<TimingRecorder>,
}

impl ReqwestTransport {
    /// Create a transport with the default request timeout.
    pub fn new(clock: SharedClock) -> Result<Self, TransportError> {
        Self::with_timeout(clock, DEFAULT_REQUEST_TIMEOUT)
    }

    /// Create a transport with a custom request timeout.
    pub fn with_timeout(clock: SharedClock, timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::ClientBuild(e.to_string()))?;

        Ok(Self::with_client(clock, client))
    }

    /// Wrap an already configured client.
    pub fn with_client(clock: SharedClock, client: reqwest::Client) -> Self {
        Self {
            client,
            clock,
            recorder: Arc::new(TimingRecorder::new()),
        }
    }

    /// The recorder this transport writes resource timing into.
    pub fn recorder(&self) -> Arc<TimingRecorder> {
        Arc::clone(&self.recorder)
    }

    fn map_send_error(e: reqwest::Error) -> TransportError {
        if e.is_timeout() {
            TransportError::Aborted(e.to_string())
        } else {
            TransportError::Request(e.to_string())
        }
    }
}

impl std::fmt::Debug for ReqwestTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReqwestTransport")
            .field("pending_timings", &self.recorder.len())
            .finish_non_exhaustive()
    }
}

impl ProbeTransport for ReqwestTransport {
    fn fetch(&self, url: &str) -> BoxFuture<'_, Result<ProbeResponse, TransportError>> {
        let url = url.to_string();
        Box::pin(async move {
            let request_start = self.clock.now_ms();
            let response = self
                .client
                .get(&url)
                .header(CACHE_CONTROL, HeaderValue::from_static("no-store"))
                .send()
                .await
                .map_err(Self::map_send_error)?;
            let response_start = self.clock.now_ms();

            if !response.status().is_success() {
                tracing::debug!(status = %response.status(), url = %url, "Probe returned non-success status");
            }

            let final_url = response.url().to_string();
            let headers: Vec<(String, String)> = response
                .headers()
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|v| (name.as_str().to_string(), v.to_string()))
                })
                .collect();
            let header_bytes: u64 = headers
                .iter()
                .map(|(n, v)| (n.len() + v.len()) as u64 + HEADER_LINE_OVERHEAD)
                .sum();

            let body = response.bytes().await.map_err(|e| {
                if e.is_timeout() {
                    TransportError::Aborted(e.to_string())
                } else {
                    TransportError::Body(e.to_string())
                }
            })?;
            let response_end = self.clock.now_ms();
            let body_bytes = body.len() as u64;

            self.recorder.record(
                final_url.clone(),
                ResourceTiming {
                    request_start,
                    response_start,
                    response_end,
                    transfer_size: Some(body_bytes + header_bytes),
                },
            );

            tracing::trace!(
                url = %final_url,
                ttfb_ms = format!("{:.1}", response_start - request_start),
                download_ms = format!("{:.1}", response_end - response_start),
                body_bytes,
                "Probe exchange recorded"
            );

            let mut probe_response = ProbeResponse::new(final_url, body_bytes);
            for (name, value) in headers {
                probe_response = probe_response.with_header(name, value);
            }
            Ok(probe_response)
        })
    }

    fn resource_timing(&self) -> Option<Arc<dyn ResourceTimingSource>> {
        Some(self.recorder.clone())
    }
}
