//! Probe runner.
//!
//! A probe is one latency exchange followed by one download exchange against
//! the probe endpoint:
//!
//! ```text
//! GET {origin}/__down?measId={group}&bytes=0&i={index}      ──► latency
//!     settle delay
//! GET {origin}/__down?measId={group}&bytes={n}&i={index}    ──► throughput
//! ```
//!
//! Failures are silent: any transport error or untimeable response discards
//! the sample and the runner returns `None`.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use rand::Rng;

use crate::clock::SharedClock;
use crate::config::EngineConfig;
use crate::events::EventHub;
use crate::measurement::MeasurementSample;
use crate::telemetry::EngineTelemetry;
use crate::timing::{TimingEstimate, TimingEstimator, WallClockSpan};
use crate::transport::{ResourceTimingSource, SharedTransport};

/// Path of the probe endpoint.
pub const PROBE_PATH: &str = "/__down";

/// Random token shared by every probe of one measurement cycle.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProbeGroupId(String);

impl ProbeGroupId {
    /// Generate a fresh 16-hex-digit token.
    pub fn generate() -> Self {
        let value: u64 = rand::rng().random();
        Self(format!("{:016x}", value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProbeGroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Build a probe URL.
///
/// ```
/// use netquality::probe::{probe_url, ProbeGroupId};
///
/// let group = ProbeGroupId::generate();
/// let url = probe_url("https://speed.example.com", &group, 0, 2);
/// assert!(url.starts_with("https://speed.example.com/__down?measId="));
/// assert!(url.ends_with("&bytes=0&i=2"));
/// ```
pub fn probe_url(origin: &str, group: &ProbeGroupId, bytes: u64, index: usize) -> String {
    format!(
        "{}{}?measId={}&bytes={}&i={}",
        origin, PROBE_PATH, group, bytes, index
    )
}

/// External capabilities a probe consumes.
#[derive(Clone)]
pub struct ProbeCapabilities {
    pub transport: SharedTransport,
    pub clock: SharedClock,
    pub resource_timing: Option<Arc<dyn ResourceTimingSource>>,
}

impl fmt::Debug for ProbeCapabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProbeCapabilities")
            .field("resource_timing", &self.resource_timing.is_some())
            .finish_non_exhaustive()
    }
}

/// One timed exchange.
#[derive(Debug, Clone, Copy)]
struct TimedExchange {
    estimate: TimingEstimate,
    wall_ms: f64,
}

/// Executes latency + download probe pairs.
pub struct ProbeRunner {
    origin: String,
    capabilities: ProbeCapabilities,
    estimator: TimingEstimator,
    settle_delay: std::time::Duration,
    events: Arc<EventHub>,
    telemetry: Arc<EngineTelemetry>,
}

impl ProbeRunner {
    pub fn new(
        config: &EngineConfig,
        capabilities: ProbeCapabilities,
        events: Arc<EventHub>,
        telemetry: Arc<EngineTelemetry>,
    ) -> Self {
        Self {
            origin: config.origin.clone(),
            capabilities,
            estimator: TimingEstimator::new(config),
            settle_delay: config.tuning.settle_delay,
            events,
            telemetry,
        }
    }

    /// Run probe `index` with a download payload of `payload_bytes`.
    ///
    /// Publishes a sample event and returns the sample on success.
    pub async fn run(
        &self,
        group: &ProbeGroupId,
        index: usize,
        payload_bytes: u64,
    ) -> Option<MeasurementSample> {
        let latency = self.timed_exchange(group, index, 0).await?;

        tokio::time::sleep(self.settle_delay).await;

        let download = self.timed_exchange(group, index, payload_bytes).await?;

        let sample = MeasurementSample {
            latency_ms: latency.estimate.latency_ms,
            throughput_mbps: download.estimate.throughput_mbps(),
            payload_bytes,
            network_duration_ms: download.estimate.network_duration_ms,
            total_duration_ms: download.wall_ms,
            taken_at: Utc::now(),
        };

        tracing::debug!(
            index,
            payload_bytes,
            latency_ms = format!("{:.1}", sample.latency_ms),
            throughput_mbps = format!("{:.3}", sample.throughput_mbps),
            "Probe sample collected"
        );

        self.telemetry.sample_collected();
        self.events.publish_sample(&sample);
        Some(sample)
    }

    async fn timed_exchange(
        &self,
        group: &ProbeGroupId,
        index: usize,
        bytes: u64,
    ) -> Option<TimedExchange> {
        let url = probe_url(&self.origin, group, bytes, index);
        self.telemetry.probe_attempted();

        let start_ms = self.capabilities.clock.now_ms();
        let response = match self.capabilities.transport.fetch(&url).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(url = %url, error = %e, "Probe request failed, discarding sample");
                self.telemetry.transport_failure();
                return None;
            }
        };
        let end_ms = self.capabilities.clock.now_ms();

        let precise = self.capabilities.resource_timing.as_ref().and_then(|source| {
            source
                .lookup(response.url())
                .or_else(|| source.lookup(&url))
        });
        let span = WallClockSpan::checked(start_ms, end_ms);
        if span.is_none() {
            tracing::debug!(start_ms, end_ms, "Clock readings unusable for wall-clock timing");
        }

        match self
            .estimator
            .estimate(&response, bytes, precise.as_ref(), span)
        {
            Ok(estimate) => Some(TimedExchange {
                estimate,
                wall_ms: span
                    .map(|s| s.duration_ms())
                    .or_else(|| precise.map(|t| t.response_end - t.request_start))
                    .unwrap_or(0.0),
            }),
            Err(e) => {
                tracing::warn!(error = %e, "Probe could not be timed, discarding sample");
                self.telemetry.timing_failure();
                None
            }
        }
    }
}

impl fmt::Debug for ProbeRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProbeRunner")
            .field("origin", &self.origin)
            .field("settle_delay", &self.settle_delay)
            .finish_non_exhaustive()
    }
}
