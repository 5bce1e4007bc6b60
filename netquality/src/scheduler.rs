//! Periodic measurement scheduler.
//!
//! The scheduler ticks at a short housekeeping cadence and asks its target
//! whether a cycle is due on every tick, so the configured interval can be
//! any value while the worst-case lag stays bounded by the cadence.
//!
//! ```text
//! tick (cadence) ──► target alive? ──► is_due(interval)? ──► run_cycle()
//!        ▲                                                        │
//!        └────────────────────────────────────────────────────────┘
//! ```
//!
//! The task holds only a weak reference to its target and exits when the
//! target is dropped or the scheduler is stopped.

use std::sync::Weak;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::transport::BoxFuture;

/// Something the scheduler can drive.
pub trait PeriodicTarget: Send + Sync {
    /// Whether a cycle should start now given the configured `interval`.
    fn is_due(&self, interval: Duration) -> bool;

    /// Run one measurement cycle to completion.
    fn run_cycle(&self) -> BoxFuture<'_, ()>;
}

/// Handle to a running housekeeping task.
#[derive(Debug)]
pub struct Scheduler {
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl Scheduler {
    /// Spawn the housekeeping task on `runtime`.
    ///
    /// The first tick fires one `cadence` after start.
    pub fn start(
        runtime: &Handle,
        target: Weak<dyn PeriodicTarget>,
        cadence: Duration,
        interval: Duration,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let task_shutdown = shutdown.clone();

        let task = runtime.spawn(async move {
            run_housekeeping(target, cadence, interval, task_shutdown).await;
        });

        info!(
            cadence_secs = cadence.as_secs_f64(),
            interval_secs = interval.as_secs_f64(),
            "Periodic measurement scheduler started"
        );

        Self { shutdown, task }
    }

    /// Cancel the housekeeping timer. A cycle already running is not aborted.
    pub fn stop(&self) {
        if !self.shutdown.is_cancelled() {
            self.shutdown.cancel();
            debug!("Periodic measurement scheduler stopping");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Whether the housekeeping task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn run_housekeeping(
    target: Weak<dyn PeriodicTarget>,
    cadence: Duration,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = interval_at(Instant::now() + cadence, cadence);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                break;
            }

            _ = ticker.tick() => {
                let Some(target) = target.upgrade() else {
                    debug!("Scheduler target dropped");
                    break;
                };
                if shutdown.is_cancelled() {
                    break;
                }
                if target.is_due(interval) {
                    debug!("Periodic measurement due");
                    target.run_cycle().await;
                }
            }
        }
    }

    debug!("Periodic measurement scheduler stopped");
}
