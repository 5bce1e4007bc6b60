//! High-resolution timer capability.
//!
//! Probe timing is expressed as floating-point milliseconds on a single
//! monotonic timebase, the same way resource-timing entries are. The engine
//! never reads ambient time for measurements; it asks the injected [`Clock`].

use std::sync::Arc;

use tokio::time::Instant;

/// Monotonic millisecond timer.
pub trait Clock: Send + Sync {
    /// Milliseconds elapsed since an arbitrary, fixed origin.
    fn now_ms(&self) -> f64;
}

/// Shared clock handle.
pub type SharedClock = Arc<dyn Clock>;

/// Clock backed by `tokio::time::Instant`.
///
/// Follows tokio's virtual time when the runtime is paused, which keeps
/// timing-dependent tests deterministic.
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
    origin: Instant,
}

impl TokioClock {
    /// Create a clock whose origin is now.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now_ms(&self) -> f64 {
        self.origin.elapsed().as_secs_f64() * 1000.0
    }
}
