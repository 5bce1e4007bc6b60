//! NetQuality - network quality estimation
//!
//! This library estimates effective downlink bandwidth, round-trip latency and
//! a discrete connection-quality label ("4g", "3g", ...) by timing small and
//! large HTTP downloads against a probe endpoint.
//!
//! # Architecture
//!
//! ```text
//! NetworkQualityEngine
//!   ├── Scheduler (optional, housekeeping ticks)
//!   └── MeasurementCycle
//!         ├── ProbeRunner ──► ProbeTransport + Clock (+ ResourceTimingSource)
//!         │       └── TimingEstimator
//!         ├── median aggregation
//!         └── ConnectionState ──► ClassificationTable
//!                 └── EventHub ("change" / "sample")
//! ```
//!
//! # Example
//!
//! ```no_run
//! use netquality::{tables, EngineOptions, NetworkQualityEngine};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = EngineOptions::new()
//!     .with_probe_count(3)
//!     .resolve(tables::wicg())?;
//! let engine = NetworkQualityEngine::new(config)?;
//!
//! engine.measure_now().await;
//! println!("{:?}", engine.snapshot());
//! # Ok(())
//! # }
//! ```

pub mod classification;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod logging;
pub mod measurement;
pub mod probe;
pub mod scheduler;
pub mod state;
pub mod telemetry;
pub mod timing;
pub mod transport;

pub use classification::{tables, ClassificationError, ClassificationRule, ClassificationTable};
pub use clock::{Clock, SharedClock, TokioClock};
pub use config::{ConfigError, EngineConfig, EngineOptions, ProbeTuning};
pub use engine::{NetworkQualityEngine, NetworkQualityEngineBuilder};
pub use error::EngineError;
pub use events::{EngineEvent, EventHub, EventKind, ListenerId};
pub use measurement::{median, AggregatedMetrics, CycleOutcome, MeasurementSample};
pub use state::{ConnectionChange, ConnectionSnapshot, ConnectionType};
pub use telemetry::TelemetrySnapshot;
pub use timing::{TimingError, TimingEstimate};
pub use transport::{
    BoxFuture, ChainedTimingSource, ProbeResponse, ProbeTransport, ReqwestTransport,
    ResourceTiming, ResourceTimingSource, SharedTransport, TimingRecorder, TransportError,
};
