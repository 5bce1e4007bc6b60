//! Engine telemetry.
//!
//! Lock-free counters recorded by the probe runner, the measurement cycle
//! and the engine, read through a point-in-time [`TelemetrySnapshot`].
//!
//! ```text
//! ProbeRunner ─┐
//! Cycle ───────┼──► EngineTelemetry ──► TelemetrySnapshot
//! Engine ──────┘    (atomic counters)   (serializable copy)
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Atomic counters for one engine instance.
#[derive(Debug, Default)]
pub struct EngineTelemetry {
    cycles_started: AtomicU64,
    cycles_skipped: AtomicU64,
    cycles_completed: AtomicU64,
    cycles_without_samples: AtomicU64,
    probes_attempted: AtomicU64,
    samples_collected: AtomicU64,
    transport_failures: AtomicU64,
    timing_failures: AtomicU64,
    changes_published: AtomicU64,
}

impl EngineTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cycle_started(&self) {
        self.cycles_started.fetch_add(1, Ordering::Relaxed);
    }

    /// A request found a cycle already running, or the engine disposed.
    pub fn cycle_skipped(&self) {
        self.cycles_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cycle_completed(&self) {
        self.cycles_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cycle_without_samples(&self) {
        self.cycles_without_samples.fetch_add(1, Ordering::Relaxed);
    }

    /// One HTTP exchange (latency or download) was issued.
    pub fn probe_attempted(&self) {
        self.probes_attempted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sample_collected(&self) {
        self.samples_collected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn transport_failure(&self) {
        self.transport_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn timing_failure(&self) {
        self.timing_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn change_published(&self) {
        self.changes_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            cycles_started: self.cycles_started.load(Ordering::Relaxed),
            cycles_skipped: self.cycles_skipped.load(Ordering::Relaxed),
            cycles_completed: self.cycles_completed.load(Ordering::Relaxed),
            cycles_without_samples: self.cycles_without_samples.load(Ordering::Relaxed),
            probes_attempted: self.probes_attempted.load(Ordering::Relaxed),
            samples_collected: self.samples_collected.load(Ordering::Relaxed),
            transport_failures: self.transport_failures.load(Ordering::Relaxed),
            timing_failures: self.timing_failures.load(Ordering::Relaxed),
            changes_published: self.changes_published.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`EngineTelemetry`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetrySnapshot {
    pub cycles_started: u64,
    pub cycles_skipped: u64,
    pub cycles_completed: u64,
    pub cycles_without_samples: u64,
    pub probes_attempted: u64,
    pub samples_collected: u64,
    pub transport_failures: u64,
    pub timing_failures: u64,
    pub changes_published: u64,
}

impl TelemetrySnapshot {
    /// Probe failures of either kind.
    pub fn probe_failures(&self) -> u64 {
        self.transport_failures + self.timing_failures
    }
}

impl fmt::Display for TelemetrySnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cycles {}/{} (skipped {}), samples {}, failures {}, changes {}",
            self.cycles_completed,
            self.cycles_started,
            self.cycles_skipped,
            self.samples_collected,
            self.probe_failures(),
            self.changes_published
        )
    }
}
