//! Timing estimation for a single probe exchange.
//!
//! Turns one completed HTTP exchange into a latency and throughput estimate.
//! Two sources of timing are supported, in order of preference:
//!
//! 1. **Resource timing** - precise request/response phase timestamps.
//!    Latency is time-to-first-byte minus server processing time; download
//!    time is the body phase alone.
//! 2. **Wall-clock span** - start and end stamps taken around the exchange.
//!    Phases cannot be separated, so latency is approximated as a share of
//!    the total duration.
//!
//! ```text
//! request_start      response_start                response_end
//!      │──── ttfb ────────│────────── download ───────────│
//!      │ latency │ server │
//! ```
//!
//! Server processing time is read from the response's `server-timing`
//! header (`dur=<ms>`) when present, otherwise the configured estimate.

use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;

use crate::config::{EngineConfig, ProbeTuning};
use crate::transport::{ProbeResponse, ResourceTiming};

/// Raised when an exchange has neither resource timing nor wall-clock stamps.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TimingError {
    #[error("No timing data available for {url}")]
    Unavailable { url: String },
}

/// Wall-clock stamps taken around an exchange, in clock milliseconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WallClockSpan {
    pub start_ms: f64,
    pub end_ms: f64,
}

impl WallClockSpan {
    pub fn new(start_ms: f64, end_ms: f64) -> Self {
        Self { start_ms, end_ms }
    }

    /// A span only if both stamps are finite and ordered.
    pub fn checked(start_ms: f64, end_ms: f64) -> Option<Self> {
        (start_ms.is_finite() && end_ms.is_finite() && end_ms >= start_ms)
            .then(|| Self::new(start_ms, end_ms))
    }

    pub fn duration_ms(&self) -> f64 {
        self.end_ms - self.start_ms
    }
}

/// Latency and throughput derived from one exchange.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimingEstimate {
    /// Round-trip latency excluding server processing (ms).
    pub latency_ms: f64,

    /// Payload throughput in bits per second. Zero for latency-only probes.
    pub throughput_bps: f64,

    /// Latency plus download time (ms).
    pub network_duration_ms: f64,
}

impl TimingEstimate {
    /// Throughput in megabits per second.
    pub fn throughput_mbps(&self) -> f64 {
        self.throughput_bps / 1_000_000.0
    }
}

fn server_timing_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"dur=([0-9]*\.?[0-9]+)").unwrap())
}

/// Extract the first `dur=<ms>` value from a `server-timing` header.
///
/// ```
/// use netquality::timing::parse_server_timing_duration;
///
/// assert_eq!(parse_server_timing_duration("cfRequestDuration;dur=12.5"), Some(12.5));
/// assert_eq!(parse_server_timing_duration("edge;desc=\"hit\""), None);
/// ```
pub fn parse_server_timing_duration(header: &str) -> Option<f64> {
    server_timing_pattern()
        .captures(header)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .filter(|d| d.is_finite())
}

/// Derives [`TimingEstimate`]s from probe exchanges.
#[derive(Debug, Clone, Copy)]
pub struct TimingEstimator {
    server_processing_time_ms: f64,
    header_overhead_fraction: f64,
    tuning: ProbeTuning,
}

impl TimingEstimator {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            server_processing_time_ms: config.server_processing_time_ms,
            header_overhead_fraction: config.header_overhead_fraction,
            tuning: config.tuning,
        }
    }

    /// Estimate latency and throughput for an exchange of `requested_bytes`.
    ///
    /// Uses `precise` when available, otherwise `fallback`.
    ///
    /// # Errors
    ///
    /// [`TimingError::Unavailable`] when both are absent.
    pub fn estimate(
        &self,
        response: &ProbeResponse,
        requested_bytes: u64,
        precise: Option<&ResourceTiming>,
        fallback: Option<WallClockSpan>,
    ) -> Result<TimingEstimate, TimingError> {
        let server_ms = self.server_time_ms(response);
        match (precise, fallback) {
            (Some(timing), _) => Ok(self.from_resource_timing(timing, requested_bytes, server_ms)),
            (None, Some(span)) => Ok(self.from_wall_clock(span, requested_bytes, server_ms)),
            (None, None) => Err(TimingError::Unavailable {
                url: response.url().to_string(),
            }),
        }
    }

    fn server_time_ms(&self, response: &ProbeResponse) -> f64 {
        response
            .server_timing()
            .and_then(parse_server_timing_duration)
            .unwrap_or(self.server_processing_time_ms)
    }

    /// Bytes assumed on the wire when the transfer size is unknown.
    fn inflated_bytes(&self, requested_bytes: u64) -> f64 {
        requested_bytes as f64 * (1.0 + self.header_overhead_fraction)
    }

    fn throughput_bps(&self, bytes: f64, download_ms: f64) -> f64 {
        let seconds = download_ms.max(self.tuning.min_duration_ms) / 1000.0;
        bytes * 8.0 / seconds
    }

    fn from_resource_timing(
        &self,
        timing: &ResourceTiming,
        requested_bytes: u64,
        server_ms: f64,
    ) -> TimingEstimate {
        let floor = self.tuning.min_duration_ms;
        let latency_ms = (timing.time_to_first_byte_ms() - server_ms).max(floor);
        let download_ms = timing.download_ms().max(0.0);

        let throughput_bps = if requested_bytes == 0 {
            0.0
        } else {
            let bytes = match timing.transfer_size {
                Some(size) if size > 0 => size as f64,
                _ => self.inflated_bytes(requested_bytes),
            };
            self.throughput_bps(bytes, download_ms)
        };

        tracing::trace!(
            ttfb_ms = timing.time_to_first_byte_ms(),
            server_ms,
            latency_ms,
            download_ms,
            "Estimated from resource timing"
        );

        TimingEstimate {
            latency_ms,
            throughput_bps,
            network_duration_ms: latency_ms + download_ms,
        }
    }

    fn from_wall_clock(
        &self,
        span: WallClockSpan,
        requested_bytes: u64,
        server_ms: f64,
    ) -> TimingEstimate {
        let floor = self.tuning.min_duration_ms;
        let total_ms = (span.duration_ms() - server_ms).max(floor);

        let estimate = if requested_bytes == 0 {
            TimingEstimate {
                latency_ms: (total_ms * self.tuning.latency_only_fraction).max(floor),
                throughput_bps: 0.0,
                network_duration_ms: total_ms,
            }
        } else {
            let latency_ms = (total_ms * self.tuning.download_latency_fraction)
                .min(self.tuning.download_latency_cap_ms);
            let download_ms = total_ms - latency_ms;
            TimingEstimate {
                latency_ms,
                throughput_bps: self
                    .throughput_bps(self.inflated_bytes(requested_bytes), download_ms),
                network_duration_ms: total_ms,
            }
        };

        tracing::trace!(
            total_ms,
            server_ms,
            latency_ms = estimate.latency_ms,
            "Estimated from wall-clock span"
        );

        estimate
    }
}
