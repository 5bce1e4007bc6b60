//! Network quality engine.
//!
//! [`NetworkQualityEngine`] owns the configuration, connection state, event
//! hub and telemetry of one measurement instance, and optionally a periodic
//! scheduler.
//!
//! # Example
//!
//! ```no_run
//! use netquality::{tables, EngineConfig, EventKind, NetworkQualityEngine};
//!
//! # async fn run() -> Result<(), netquality::EngineError> {
//! let engine = NetworkQualityEngine::builder(EngineConfig::new(tables::wicg())).build()?;
//!
//! engine.subscribe(EventKind::Change, |event| println!("{:?}", event));
//! engine.measure_now().await;
//!
//! let snapshot = engine.snapshot();
//! println!("effective type: {:?}", snapshot.effective_type);
//! engine.dispose();
//! # Ok(())
//! # }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::clock::{SharedClock, TokioClock};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::events::{EngineEvent, EventHub, EventKind, ListenerId};
use crate::measurement::{CycleOutcome, MeasurementCycle};
use crate::probe::{ProbeCapabilities, ProbeRunner};
use crate::scheduler::{PeriodicTarget, Scheduler};
use crate::state::{ConnectionSnapshot, ConnectionState};
use crate::telemetry::{EngineTelemetry, TelemetrySnapshot};
use crate::transport::{
    BoxFuture, ChainedTimingSource, ReqwestTransport, ResourceTimingSource, SharedTransport,
};

/// Re-entrancy and lifecycle flags.
#[derive(Debug, Default)]
struct RunState {
    measuring: AtomicBool,
    disposed: AtomicBool,
    /// Clock reading (ms) when the last cycle started.
    last_started_ms: Mutex<Option<f64>>,
}

/// Clears the measuring flag when a cycle ends, however it ends.
struct MeasuringGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> MeasuringGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for MeasuringGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Everything a cycle touches; shared with the scheduler task.
struct EngineCore {
    config: EngineConfig,
    clock: SharedClock,
    runner: ProbeRunner,
    state: ConnectionState,
    events: Arc<EventHub>,
    telemetry: Arc<EngineTelemetry>,
    run: RunState,
}

impl EngineCore {
    async fn measure(&self) -> CycleOutcome {
        if self.run.disposed.load(Ordering::Acquire) {
            debug!("Measurement requested after dispose, ignoring");
            self.telemetry.cycle_skipped();
            return CycleOutcome::Skipped;
        }

        let Some(_guard) = MeasuringGuard::acquire(&self.run.measuring) else {
            debug!("Measurement already in progress, ignoring request");
            self.telemetry.cycle_skipped();
            return CycleOutcome::Skipped;
        };

        *self.run.last_started_ms.lock() = Some(self.clock.now_ms());
        self.telemetry.cycle_started();

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

impl PeriodicTarget for EngineCore {
    /// Due when idle, not disposed, and more than `interval` has passed since
    /// the last cycle started (or no cycle ever ran).
    fn is_due(&self, interval: Duration) -> bool {
        if self.run.measuring.load(Ordering::Acquire) || self.run.disposed.load(Ordering::Acquire) {
            return false;
        }
        match *self.run.last_started_ms.lock() {
            Some(started) => self.clock.now_ms() - started > interval.as_secs_f64() * 1000.0,
            None => true,
        }
    }

    fn run_cycle(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let outcome = self.measure().await;
            debug!(outcome = %outcome, "Periodic measurement finished");
        })
    }
}

/// Network quality measurement engine.
///
/// Cheap operations (`snapshot`, `subscribe`, `telemetry`) never wait on a
/// running cycle. At most one cycle runs at a time; concurrent
/// [`measure_now`](Self::measure_now) calls resolve immediately as
/// [`CycleOutcome::Skipped`].
pub struct NetworkQualityEngine {
    core: Arc<EngineCore>,
    scheduler: Mutex<Option<Scheduler>>,
}

impl NetworkQualityEngine {
    /// Start building an engine for `config`.
    pub fn builder(config: EngineConfig) -> NetworkQualityEngineBuilder {
        NetworkQualityEngineBuilder::new(config)
    }

    /// Build an engine with the default transport and clock.
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        Self::builder(config).build()
    }

    /// Run a measurement cycle now.
    ///
    /// Resolves once the cycle finishes, or immediately if a cycle is
    /// already running or the engine is disposed. Probe failures are never
    /// returned as errors.
    pub async fn measure_now(&self) -> CycleOutcome {
        self.core.measure().await
    }

    /// Copy of the current connection state.
    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.core.state.snapshot()
    }

    /// Stop the scheduler and refuse further measurements.
    ///
    /// A cycle already in flight is not aborted and may still update state.
    pub fn dispose(&self) {
        if self.core.run.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(scheduler) = self.scheduler.lock().take() {
            scheduler.stop();
        }
        self.core.run.measuring.store(false, Ordering::Release);
        info!("Network quality engine disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.core.run.disposed.load(Ordering::Acquire)
    }

    pub fn is_measuring(&self) -> bool {
        self.core.run.measuring.load(Ordering::Acquire)
    }

    /// Register a callback for `kind` events.
    pub fn subscribe<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&EngineEvent) + Send + Sync + 'static,
    {
        self.core.events.subscribe(kind, listener)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.core.events.unsubscribe(id)
    }

    /// Receive every event over a broadcast channel.
    pub fn subscribe_channel(&self) -> broadcast::Receiver<EngineEvent> {
        self.core.events.subscribe_channel()
    }

    pub fn telemetry(&self) -> TelemetrySnapshot {
        self.core.telemetry.snapshot()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.core.config
    }
}

impl Drop for NetworkQualityEngine {
    fn drop(&mut self) {
        if let Some(scheduler) = self.scheduler.get_mut().take() {
            scheduler.stop();
        }
    }
}

impl std::fmt::Debug for NetworkQualityEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkQualityEngine")
            .field("origin", &self.core.config.origin)
            .field("measuring", &self.is_measuring())
            .field("disposed", &self.is_disposed())
            .field("periodic", &self.scheduler.lock().is_some())
            .finish()
    }
}

/// Builder injecting the engine's external capabilities.
///
/// Anything not supplied falls back to the defaults: [`TokioClock`],
/// [`ReqwestTransport`] and the transport's own timing recorder.
pub struct NetworkQualityEngineBuilder {
    config: EngineConfig,
    transport: Option<SharedTransport>,
    clock: Option<SharedClock>,
    resource_timing: Option<Arc<dyn ResourceTimingSource>>,
    runtime: Option<Handle>,
}

impl NetworkQualityEngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            transport: None,
            clock: None,
            resource_timing: None,
            runtime: None,
        }
    }

    /// Use a custom transport.
    ///
    /// Timing the transport records itself (see
    /// [`ProbeTransport::resource_timing`](crate::transport::ProbeTransport::resource_timing))
    /// is wired automatically.
    pub fn transport(mut self, transport: SharedTransport) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Add a resource timing source, consulted before the transport's own.
    pub fn resource_timing(mut self, source: Arc<dyn ResourceTimingSource>) -> Self {
        self.resource_timing = Some(source);
        self
    }

    /// Runtime for the periodic scheduler. Defaults to the current runtime.
    pub fn runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    pub fn build(self) -> Result<NetworkQualityEngine, EngineError> {
        self.config.validate()?;

        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(TokioClock::new()) as SharedClock);

        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::new(Arc::clone(&clock))?) as SharedTransport,
        };
        // Caller-supplied timing first, then whatever the transport records.
        let resource_timing = ChainedTimingSource::combine(
            self.resource_timing
                .into_iter()
                .chain(transport.resource_timing()),
        );

        let runtime = if self.config.periodic_enabled {
            Some(
                self.runtime
                    .or_else(|| Handle::try_current().ok())
                    .ok_or(EngineError::NoRuntime)?,
            )
        } else {
            None
        };

        let events = Arc::new(EventHub::new());
        let telemetry = Arc::new(EngineTelemetry::new());
        let runner = ProbeRunner::new(
            &self.config,
            ProbeCapabilities {
                transport,
                clock: Arc::clone(&clock),
                resource_timing,
            },
            Arc::clone(&events),
            Arc::clone(&telemetry),
        );
        let state = ConnectionState::new(
            self.config.classification.clone(),
            self.config.tuning.uplink_ratio,
        );

        let core = Arc::new(EngineCore {
            config: self.config,
            clock,
            runner,
            state,
            events,
            telemetry,
            run: RunState::default(),
        });

        let scheduler = runtime.map(|handle| {
            let target: Arc<dyn PeriodicTarget> = core.clone();
            Scheduler::start(
                &handle,
                Arc::downgrade(&target),
                core.config.tuning.housekeeping_interval,
                core.config.periodic_interval,
            )
        });

        info!(
            origin = %core.config.origin,
            probe_count = core.config.probe_count,
            periodic = core.config.periodic_enabled,
            rules = core.config.classification.len(),
            "Network quality engine created"
        );

        Ok(NetworkQualityEngine {
            core,
            scheduler: Mutex::new(scheduler),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classification::tables;
    use crate::state::ConnectionChange;
    use crate::transport::mock::{MockReply, MockTransport};
    use crate::transport::TimingRecorder;

    fn test_config(probe_count: usize) -> EngineConfig {
        let mut config = EngineConfig::new(tables::wicg());
        config.origin = "https://speed.example.com".to_string();
        config.probe_count = probe_count;
        config
    }

    fn build(config: EngineConfig, transport: &Arc<MockTransport>) -> NetworkQualityEngine {
        NetworkQualityEngine::builder(config)
            .transport(transport.clone())
            .build()
            .unwrap()
    }

    fn record_changes(engine: &NetworkQualityEngine) -> Arc<Mutex<Vec<ConnectionChange>>> {
        let changes = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&changes);
        engine.subscribe(EventKind::Change, move |event| {
            if let EngineEvent::Change(change) = event {
                sink.lock().push(change.clone());
            }
        });
        changes
    }

    fn responsive() -> Arc<MockTransport> {
        Arc::new(MockTransport::new().with_fallback(MockReply::after(Duration::from_millis(30))))
    }

    #[tokio::test(start_paused = true)]
    async fn test_measure_now_populates_snapshot() {
        let transport = responsive();
        let engine = build(test_config(3), &transport);
        assert!(engine.snapshot().is_empty());

        let outcome = engine.measure_now().await;

        assert!(outcome.is_completed());
        let snapshot = engine.snapshot();
        assert!(snapshot.downlink_mbps.is_some());
        assert!(snapshot.rtt_ms.is_some());
        assert!(snapshot.effective_type.is_some());
        assert_eq!(transport.request_count(), 6);
        assert!(!engine.is_measuring());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_measure_is_noop() {
        let transport = responsive();
        let engine = build(test_config(3), &transport);

        let (first, second) = tokio::join!(engine.measure_now(), engine.measure_now());

        assert!(first.is_completed());
        assert_eq!(second, CycleOutcome::Skipped);
        assert_eq!(transport.request_count(), 6);

        let telemetry = engine.telemetry();
        assert_eq!(telemetry.cycles_started, 1);
        assert_eq!(telemetry.cycles_skipped, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_cycle_keeps_previous_state() {
        let transport = Arc::new(MockTransport::new().with_script([
            MockReply::after(Duration::from_millis(30)),
            MockReply::after(Duration::from_millis(30)),
        ]));
        let engine = build(test_config(1), &transport);

        engine.measure_now().await;
        let before = engine.snapshot();
        assert!(!before.is_empty());

        // Script exhausted: every further request fails.
        let outcome = engine.measure_now().await;
        assert_eq!(outcome, CycleOutcome::NoSamples);
        assert_eq!(engine.snapshot(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_cycle_on_fresh_engine_stays_empty() {
        let transport = Arc::new(MockTransport::new().with_fallback(MockReply::fail()));
        let engine = build(test_config(3), &transport);

        engine.measure_now().await;
        assert_eq!(engine.snapshot(), ConnectionSnapshot::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_preliminary_then_final() {
        let transport = responsive();
        let engine = build(test_config(3), &transport);
        let changes = record_changes(&engine);

        engine.measure_now().await;

        let changes = changes.lock().clone();
        assert_eq!(changes.len(), 2);
        assert!(changes[0].preliminary);
        assert!(!changes[1].preliminary);
        assert_eq!(engine.telemetry().changes_published, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispose_stops_periodic_timer() {
        let transport = responsive();
        let mut config = test_config(1);
        config.periodic_enabled = true;
        config.periodic_interval = Duration::from_secs(1);
        let engine = build(config, &transport);

        engine.dispose();
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(transport.request_count(), 0);
        assert!(engine.is_disposed());
        assert_eq!(engine.measure_now().await, CycleOutcome::Skipped);
        assert_eq!(transport.request_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_waits_for_interval() {
        let transport = responsive();
        let mut config = test_config(1);
        config.periodic_enabled = true;
        config.periodic_interval = Duration::from_secs(25);
        let engine = build(config, &transport);

        // First tick at 10s: never measured, so due.
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(transport.request_count(), 2);

        // Ticks at 20s and 30s are within the interval.
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(transport.request_count(), 2);

        // Tick at 40s: 30s since the last start.
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(transport.request_count(), 4);

        engine.dispose();
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_disabled_never_measures() {
        let transport = responsive();
        let engine = build(test_config(1), &transport);

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(transport.request_count(), 0);
        assert!(engine.snapshot().is_empty());
    }

    #[test]
    fn test_periodic_without_runtime_fails() {
        let transport = responsive();
        let mut config = test_config(1);
        config.periodic_enabled = true;

        let result = NetworkQualityEngine::builder(config)
            .transport(transport)
            .build();
        assert!(matches!(result, Err(EngineError::NoRuntime)));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let transport = responsive();
        let mut config = test_config(1);
        config.probe_count = 0;

        let result = NetworkQualityEngine::builder(config)
            .transport(transport)
            .build();
        assert!(matches!(result, Err(EngineError::Config(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_timing_is_wired_and_drained() {
        let recorder = Arc::new(TimingRecorder::new());
        let transport = Arc::new(
            MockTransport::new()
                .with_fallback(MockReply::after(Duration::from_millis(30)))
                .with_recorder(Arc::clone(&recorder)),
        );
        let engine = build(test_config(3), &transport);

        for _ in 0..3 {
            engine.measure_now().await;
        }

        assert!(recorder.is_empty());
        // Precise path: 15ms to first byte minus 10ms server time
        assert_eq!(engine.snapshot().rtt_ms, Some(5.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_timing_source_does_not_strand_transport_timing() {
        let recorder = Arc::new(TimingRecorder::new());
        let custom = Arc::new(TimingRecorder::new());
        let transport = Arc::new(
            MockTransport::new()
                .with_fallback(MockReply::after(Duration::from_millis(30)))
                .with_recorder(Arc::clone(&recorder)),
        );
        let engine = NetworkQualityEngine::builder(test_config(3))
            .transport(transport.clone())
            .resource_timing(custom.clone())
            .build()
            .unwrap();

        engine.measure_now().await;
        engine.measure_now().await;

        assert!(recorder.is_empty());
        assert!(custom.is_empty());
        assert!(!engine.snapshot().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispose_is_idempotent() {
        let engine = build(test_config(1), &responsive());
        engine.dispose();
        engine.dispose();
        assert!(engine.is_disposed());
        assert!(!engine.is_measuring());
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_cycle_completes_after_dispose() {
        let transport = responsive();
        let engine = Arc::new(build(test_config(1), &transport));

        let running = Arc::clone(&engine);
        let handle = tokio::spawn(async move { running.measure_now().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        engine.dispose();

        let outcome = handle.await.unwrap();
        assert!(outcome.is_completed());
        assert!(!engine.snapshot().is_empty());
    }
}
