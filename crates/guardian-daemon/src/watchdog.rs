//! Pipeline watchdog
//!
//! Runs on its own interval, independent of the tasks that intercept
//! actions. It only reads aggregate counters and runs a read-only canary
//! evaluation; it never touches an action that is being enforced.

use crate::config::ProtectionConfig;
use guardian_core::verdict::VALIDATOR_FAILURE_RULE;
use guardian_core::{Action, GuardianCoordinator};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::time::{timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Harmless command evaluated on every tick
const CANARY: &str = "echo guardian-canary";

/// Aggregate progress of the pipeline
#[derive(Debug)]
pub struct PipelineCounters {
    epoch: Instant,
    in_flight: AtomicUsize,
    completed: AtomicU64,
    /// Milliseconds after `epoch` of the last start or finish
    last_progress_ms: AtomicU64,
}

impl PipelineCounters {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            in_flight: AtomicUsize::new(0),
            completed: AtomicU64::new(0),
            last_progress_ms: AtomicU64::new(0),
        }
    }

    /// Mark one unit of work as started; it finishes when the guard drops
    pub fn begin(self: &Arc<Self>) -> InFlight {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.record_progress();
        InFlight {
            counters: Arc::clone(self),
        }
    }

    pub fn record_progress(&self) {
        let now = self.epoch.elapsed().as_millis() as u64;
        self.last_progress_ms.fetch_max(now, Ordering::SeqCst);
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::SeqCst)
    }

    /// Time since the last start or finish
    pub fn idle_for(&self) -> Duration {
        let now = self.epoch.elapsed().as_millis() as u64;
        Duration::from_millis(now.saturating_sub(self.last_progress_ms.load(Ordering::SeqCst)))
    }
}

impl Default for PipelineCounters {
    fn default() -> Self {
        Self::new()
    }
}

/// One unit of in-flight work
#[derive(Debug)]
pub struct InFlight {
    counters: Arc<PipelineCounters>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.counters.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.counters.completed.fetch_add(1, Ordering::SeqCst);
        self.counters.record_progress();
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum WatchdogFault {
    #[error("pipeline stalled: {in_flight} action(s) in flight, no progress for {idle_ms}ms")]
    Stalled { in_flight: usize, idle_ms: u64 },

    #[error("canary evaluation did not finish within {timeout_ms}ms")]
    CanaryTimedOut { timeout_ms: u64 },

    #[error("canary evaluation failed: {reason}")]
    CanaryFailed { reason: String },
}

#[derive(Debug)]
pub struct Watchdog {
    coordinator: Arc<GuardianCoordinator>,
    counters: Arc<PipelineCounters>,
    canary_timeout: Duration,
    stall_threshold: Duration,
}

impl Watchdog {
    pub fn new(
        coordinator: Arc<GuardianCoordinator>,
        counters: Arc<PipelineCounters>,
        config: &ProtectionConfig,
    ) -> Self {
        Self {
            coordinator,
            counters,
            canary_timeout: config.canary_timeout(),
            stall_threshold: config.stall_threshold(),
        }
    }

    /// One health check: stall detection, then the canary evaluation
    pub async fn inspect(&self) -> Result<(), WatchdogFault> {
        let in_flight = self.counters.in_flight();
        let idle = self.counters.idle_for();
        if in_flight > 0 && idle >= self.stall_threshold {
            return Err(WatchdogFault::Stalled {
                in_flight,
                idle_ms: idle.as_millis() as u64,
            });
        }
        self.canary().await
    }

    async fn canary(&self) -> Result<(), WatchdogFault> {
        let canary = Action::shell(CANARY);
        let verdict = timeout(self.canary_timeout, self.coordinator.evaluate(&canary))
            .await
            .map_err(|_| WatchdogFault::CanaryTimedOut {
                timeout_ms: self.canary_timeout.as_millis() as u64,
            })?;
        match verdict
            .violations
            .iter()
            .find(|v| v.rule == VALIDATOR_FAILURE_RULE)
        {
            Some(failure) => Err(WatchdogFault::CanaryFailed {
                reason: failure.message.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Tick until cancelled. `on_fault` fires once per healthy-to-faulty
    /// change, not on every faulty tick.
    pub async fn run<F>(self, interval: Duration, token: CancellationToken, on_fault: F)
    where
        F: Fn(WatchdogFault) + Send,
    {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut faulted = false;
        info!(interval_ms = interval.as_millis() as u64, "watchdog started");

        loop {
            let checked = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = ticker.tick() => tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    checked = self.inspect() => checked,
                },
            };
            match checked {
                Ok(()) => {
                    if faulted {
                        info!("watchdog checks healthy again");
                    }
                    faulted = false;
                    debug!(
                        in_flight = self.counters.in_flight(),
                        completed = self.counters.completed(),
                        "watchdog tick"
                    );
                }
                Err(fault) => {
                    warn!(error = %fault, "watchdog fault");
                    if !faulted {
                        on_fault(fault);
                    }
                    faulted = true;
                }
            }
        }
        info!("watchdog stopped");
    }
}
