//! Measurement cycles and sample aggregation.
//!
//! A cycle runs `probe_count` probes with geometrically growing payloads,
//! strictly one after another, then aggregates the successful samples with
//! independent medians of latency and throughput.
//!
//! # Cycle Flow
//!
//! ```text
//! new group token
//!   │
//!   ├─► probe 0 ──► sample? ──► preliminary change (when probe_count > 1)
//!   │   inter-probe delay
//!   ├─► probe 1 ──► sample?
//!   │   ...
//!   └─► probe n-1
//!         │
//!         ▼
//!   median(latency), median(throughput) ──► final change (unless redundant)
//! ```
//!
//! A cycle with no successful samples leaves the connection state untouched.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::EngineConfig;
use crate::events::EventHub;
use crate::probe::{ProbeGroupId, ProbeRunner};
use crate::state::ConnectionState;
use crate::telemetry::EngineTelemetry;

/// Raw result of one probe pair.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MeasurementSample {
    /// Latency from the zero-byte probe (ms).
    pub latency_ms: f64,
    /// Throughput from the download probe (Mbps).
    pub throughput_mbps: f64,
    /// Download payload size requested (bytes).
    pub payload_bytes: u64,
    /// Estimated network time of the download probe (ms).
    pub network_duration_ms: f64,
    /// Wall-clock time of the download probe (ms).
    pub total_duration_ms: f64,
    /// When the sample was produced.
    pub taken_at: DateTime<Utc>,
}

/// Median of `values`.
///
/// Odd counts return the middle element; even counts the mean of the two
/// middle elements. Returns `None` for an empty slice.
///
/// ```
/// use netquality::measurement::median;
///
/// assert_eq!(median(&[5.0, 1.0, 3.0]), Some(3.0));
/// assert_eq!(median(&[10.0, 20.0]), Some(15.0));
/// assert_eq!(median(&[]), None);
/// ```
pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);

    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 1 {
        Some(sorted[mid])
    } else {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    }
}

/// Aggregated metrics over a set of samples.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AggregatedMetrics {
    /// Median latency (ms).
    pub latency_ms: f64,
    /// Median throughput (Mbps).
    pub throughput_mbps: f64,
    /// Samples the medians were taken over.
    pub sample_count: usize,
}

impl AggregatedMetrics {
    /// Aggregate samples; latency and throughput medians are independent.
    pub fn from_samples(samples: &[MeasurementSample]) -> Option<Self> {
        let latencies: Vec<f64> = samples.iter().map(|s| s.latency_ms).collect();
        let throughputs: Vec<f64> = samples.iter().map(|s| s.throughput_mbps).collect();
        Some(Self {
            latency_ms: median(&latencies)?,
            throughput_mbps: median(&throughputs)?,
            sample_count: samples.len(),
        })
    }
}

/// How a measurement request ended.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// Another cycle was already running, or the engine is disposed.
    Skipped,
    /// Every probe failed; state was left untouched.
    NoSamples,
    /// At least one sample was aggregated into the connection state.
    Completed {
        /// Samples collected during the cycle.
        samples: usize,
        /// Label after the final aggregation.
        label: String,
        /// Whether a final change event was published.
        published_final: bool,
    },
}

impl CycleOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, CycleOutcome::Completed { .. })
    }
}

impl fmt::Display for CycleOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CycleOutcome::Skipped => write!(f, "skipped"),
            CycleOutcome::NoSamples => write!(f, "no samples"),
            CycleOutcome::Completed { samples, label, .. } => {
                write!(f, "completed ({} samples, {})", samples, label)
            }
        }
    }
}

/// One measurement cycle over borrowed engine components.
pub struct MeasurementCycle<'a> {
    config: &'a EngineConfig,
    runner: &'a ProbeRunner,
    state: &'a ConnectionState,
    events: &'a EventHub,
    telemetry: &'a EngineTelemetry,
}

impl<'a> MeasurementCycle<'a> {
    pub fn new(
        config: &'a EngineConfig,
        runner: &'a ProbeRunner,
        state: &'a ConnectionState,
        events: &'a EventHub,
        telemetry: &'a EngineTelemetry,
    ) -> Self {
        Self {
            config,
            runner,
            state,
            events,
            telemetry,
        }
    }

    /// Run every probe in order, then aggregate.
    pub async fn run(self) -> CycleOutcome {
        let group = ProbeGroupId::generate();
        let probe_count = self.config.probe_count;
        let mut samples: Vec<MeasurementSample> = Vec::with_capacity(probe_count);
        let mut preliminary_label: Option<String> = None;

        tracing::debug!(group = %group, probe_count, "Measurement cycle started");

        for index in 0..probe_count {
            let payload_bytes = self.config.payload_size(index);
            if let Some(sample) = self.runner.run(&group, index, payload_bytes).await {
                samples.push(sample);
                if index == 0 && probe_count > 1 {
                    if let Some(metrics) = AggregatedMetrics::from_samples(&samples) {
                        preliminary_label = Some(self.publish(&metrics, true));
                    }
                }
            }

            if index + 1 < probe_count {
                tokio::time::sleep(self.config.tuning.inter_probe_delay).await;
            }
        }

        let Some(metrics) = AggregatedMetrics::from_samples(&samples) else {
            tracing::warn!(group = %group, "Measurement cycle produced no samples, keeping previous state");
            self.telemetry.cycle_without_samples();
            return CycleOutcome::NoSamples;
        };

        let label = self.state.classify(&metrics).to_string();
        let redundant = samples.len() == 1 && preliminary_label.as_deref() == Some(label.as_str());
        if !redundant {
            self.publish(&metrics, false);
        }

        tracing::info!(
            samples = samples.len(),
            rtt_ms = format!("{:.1}", metrics.latency_ms),
            downlink_mbps = format!("{:.3}", metrics.throughput_mbps),
            effective_type = %label,
            "Measurement cycle complete"
        );
        self.telemetry.cycle_completed();

        CycleOutcome::Completed {
            samples: samples.len(),
            label,
            published_final: !redundant,
        }
    }

    /// Apply metrics to the state and publish the change. Returns the label.
    fn publish(&self, metrics: &AggregatedMetrics, preliminary: bool) -> String {
        let change = self.state.apply(metrics, preliminary);
        let label = change.effective_type.clone();
        self.events.publish_change(&change);
        self.telemetry.change_published();
        label
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::classification::tables;
    use crate::clock::TokioClock;
    use crate::events::{EngineEvent, EventKind};
    use crate::probe::ProbeCapabilities;
    use crate::state::ConnectionChange;
    use crate::transport::mock::{MockReply, MockTransport};
    use parking_lot::Mutex;

    struct Harness {
        config: EngineConfig,
        runner: ProbeRunner,
        state: ConnectionState,
        events: Arc<EventHub>,
        telemetry: Arc<EngineTelemetry>,
        changes: Arc<Mutex<Vec<ConnectionChange>>>,
    }

    impl Harness {
        fn new(probe_count: usize, transport: Arc<MockTransport>) -> Self {
            let mut config = EngineConfig::new(tables::wicg());
            config.origin = "https://speed.example.com".to_string();
            config.probe_count = probe_count;
            config.base_payload_bytes = 10_000;
            config.payload_growth_factor = 10.0;

            let events = Arc::new(EventHub::new());
            let telemetry = Arc::new(EngineTelemetry::new());
            let runner = ProbeRunner::new(
                &config,
                ProbeCapabilities {
                    transport,
                    clock: Arc::new(TokioClock::new()),
                    resource_timing: None,
                },
                Arc::clone(&events),
                Arc::clone(&telemetry),
            );
            let state = ConnectionState::new(config.classification.clone(), config.tuning.uplink_ratio);

            let changes = Arc::new(Mutex::new(Vec::new()));
            let sink = Arc::clone(&changes);
            events.subscribe(EventKind::Change, move |event| {
                if let EngineEvent::Change(change) = event {
                    sink.lock().push(change.clone());
                }
            });

            Self {
                config,
                runner,
                state,
                events,
                telemetry,
                changes,
            }
        }

        async fn run(&self) -> CycleOutcome {
            MeasurementCycle::new(
                &self.config,
                &self.runner,
                &self.state,
                &self.events,
                &self.telemetry,
            )
            .run()
            .await
        }
    }

    fn sample(latency_ms: f64, throughput_mbps: f64) -> MeasurementSample {
        MeasurementSample {
            latency_ms,
            throughput_mbps,
            payload_bytes: 1000,
            network_duration_ms: 0.0,
            total_duration_ms: 0.0,
            taken_at: Utc::now(),
        }
    }

    #[test]
    fn test_median_odd_and_even() {
        assert_eq!(median(&[1.0, 3.0, 5.0]), Some(3.0));
        assert_eq!(median(&[1.0, 2.0, 4.0, 5.0]), Some(3.0));
        assert_eq!(median(&[42.0]), Some(42.0));
        assert_eq!(median(&[10.0, 20.0]), Some(15.0));
        assert_eq!(median(&[]), None);
    }

    #[test]
    fn test_median_unsorted_input() {
        assert_eq!(median(&[9.0, 1.0, 5.0, 3.0, 7.0]), Some(5.0));
        assert_eq!(median(&[4.0, 1.0, 2.0, 5.0]), Some(3.0));
    }

    #[test]
    fn test_aggregation_is_not_paired() {
        let samples = vec![sample(10.0, 1.0), sample(30.0, 9.0), sample(20.0, 2.0)];
        let metrics = AggregatedMetrics::from_samples(&samples).unwrap();
        assert_eq!(metrics.latency_ms, 20.0);
        assert_eq!(metrics.throughput_mbps, 2.0);
        assert_eq!(metrics.sample_count, 3);

        assert_eq!(AggregatedMetrics::from_samples(&[]), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycle_payload_sizes_and_order() {
        let transport = Arc::new(
            MockTransport::new().with_fallback(MockReply::after(Duration::from_millis(20))),
        );
        let harness = Harness::new(3, Arc::clone(&transport));

        let outcome = harness.run().await;
        assert!(outcome.is_completed());

        let bytes: Vec<String> = transport
            .requests()
            .iter()
            .map(|url| url.split("bytes=").nth(1).unwrap().to_string())
            .collect();
        assert_eq!(
            bytes,
            vec!["0&i=0", "10000&i=0", "0&i=1", "100000&i=1", "0&i=2", "1000000&i=2"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycle_timing_includes_delays() {
        let transport = Arc::new(
            MockTransport::new().with_fallback(MockReply::after(Duration::from_millis(20))),
        );
        let harness = Harness::new(3, transport);

        let start = tokio::time::Instant::now();
        harness.run().await;
        // 3 × (20 + 50 + 20) + 2 × 200
        assert_eq!(start.elapsed(), Duration::from_millis(670));
    }

    #[tokio::test(start_paused = true)]
    async fn test_preliminary_uses_first_sample() {
        let transport = Arc::new(MockTransport::new().with_script([
            // probe 0: latency 100ms wall, download 1010ms wall
            MockReply::after(Duration::from_millis(110)),
            MockReply::after(Duration::from_millis(1010)),
            // probe 1
            MockReply::after(Duration::from_millis(60)),
            MockReply::after(Duration::from_millis(110)),
        ]));
        let harness = Harness::new(2, transport);

        harness.run().await;

        let changes = harness.changes.lock().clone();
        assert_eq!(changes.len(), 2);
        let preliminary = &changes[0];
        assert!(preliminary.preliminary);
        assert!((preliminary.rtt - 90.0).abs() < 1e-6);
        // 10 000 × 1.02 bytes over 800ms
        assert!((preliminary.downlink - 0.102).abs() < 1e-6);
        assert!(!changes[1].preliminary);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_probe_cycle_has_no_preliminary() {
        let transport = Arc::new(
            MockTransport::new().with_fallback(MockReply::after(Duration::from_millis(20))),
        );
        let harness = Harness::new(1, transport);

        let outcome = harness.run().await;
        let changes = harness.changes.lock().clone();
        assert_eq!(changes.len(), 1);
        assert!(!changes[0].preliminary);
        assert!(matches!(
            outcome,
            CycleOutcome::Completed {
                samples: 1,
                published_final: true,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_redundant_final_is_suppressed() {
        // Probe 0 succeeds, probe 1 fails: one sample, same label as preliminary.
        let transport = Arc::new(MockTransport::new().with_script([
            MockReply::after(Duration::from_millis(20)),
            MockReply::after(Duration::from_millis(20)),
            MockReply::fail(),
        ]));
        let harness = Harness::new(2, transport);

        let outcome = harness.run().await;
        let changes = harness.changes.lock().clone();
        assert_eq!(changes.len(), 1);
        assert!(changes[0].preliminary);
        assert!(matches!(
            outcome,
            CycleOutcome::Completed {
                samples: 1,
                published_final: false,
                ..
            }
        ));
        assert!(harness.state.snapshot().downlink_mbps.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_first_probe_skips_preliminary() {
        let transport = Arc::new(MockTransport::new().with_script([
            MockReply::fail(),
            MockReply::after(Duration::from_millis(20)),
            MockReply::after(Duration::from_millis(20)),
        ]));
        let harness = Harness::new(2, transport);

        harness.run().await;
        let changes = harness.changes.lock().clone();
        assert_eq!(changes.len(), 1);
        assert!(!changes[0].preliminary);
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_probes_failing_leaves_state_untouched() {
        let transport = Arc::new(MockTransport::new().with_fallback(MockReply::fail()));
        let harness = Harness::new(3, Arc::clone(&transport));

        let before = harness.state.snapshot();
        let outcome = harness.run().await;

        assert_eq!(outcome, CycleOutcome::NoSamples);
        assert_eq!(harness.state.snapshot(), before);
        assert!(harness.changes.lock().is_empty());
        // Each probe stops after its failed latency request
        assert_eq!(transport.request_count(), 3);
        assert_eq!(harness.telemetry.snapshot().cycles_without_samples, 1);
    }

    #[test]
    fn test_outcome_display() {
        assert_eq!(CycleOutcome::Skipped.to_string(), "skipped");
        assert_eq!(CycleOutcome::NoSamples.to_string(), "no samples");
        let outcome = CycleOutcome::Completed {
            samples: 3,
            label: "4g".to_string(),
            published_final: true,
        };
        assert_eq!(outcome.to_string(), "completed (3 samples, 4g)");
    }

    mod property_tests {
        use super::super::median;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn test_median_within_bounds(values in prop::collection::vec(-1e6..1e6_f64, 1..50)) {
                let m = median(&values).unwrap();
                let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
                let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
                prop_assert!(m >= min && m <= max);
            }

            #[test]
            fn test_median_order_independent(mut values in prop::collection::vec(-1e6..1e6_f64, 1..50)) {
                let m = median(&values);
                values.reverse();
                prop_assert_eq!(median(&values), m);
            }
        }
    }
}
