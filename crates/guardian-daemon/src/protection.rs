//! Always-on protection around a [`GuardianCoordinator`]
//!
//! [`AutoProtection`] intercepts every action the host dispatches, runs it
//! through the coordinator and, when the pipeline blocks it up front, applies
//! the configured [`CorrectionStrategy`]. A background watchdog puts the
//! daemon into lockdown when the pipeline stalls or its validators fail; while
//! locked down every action is refused without being evaluated.

use crate::audit::AuditTrail;
use crate::config::{CorrectionStrategy, ProtectionConfig};
use crate::correction::{Correction, FixCatalog};
use crate::error::{DaemonError, Result};
use crate::event::{AlertLevel, ProtectionAlert, ProtectionEvent};
use crate::watchdog::{PipelineCounters, Watchdog};
use guardian_core::types::now;
use guardian_core::{
    Action, ApprovalRequest, Artifact, AttemptContext, EnforcementReport, EnforcementStatus,
    ExecutionFailure, GuardKind, GuardMode, GuardianConfig, GuardianCoordinator,
};
use itertools::Itertools;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// What happened to one intercepted action
#[derive(Debug, Clone)]
pub struct Interception {
    pub original_action_id: Uuid,
    /// The action the pipeline ran last: the original, or its correction
    pub action: Action,
    pub correction: Option<Correction>,
    pub report: EnforcementReport,
}

impl Interception {
    pub fn is_accepted(&self) -> bool {
        self.report.is_accepted()
    }

    pub fn was_corrected(&self) -> bool {
        self.correction.is_some() && self.action.id() != self.original_action_id
    }
}

/// Point-in-time counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectionStats {
    pub intercepted: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub corrected: u64,
    /// Refused during lockdown
    pub blocked: u64,
    pub in_flight: usize,
    pub running: bool,
    pub locked_down: bool,
}

#[derive(Debug, Default)]
struct Tally {
    intercepted: AtomicU64,
    accepted: AtomicU64,
    rejected: AtomicU64,
    corrected: AtomicU64,
    blocked: AtomicU64,
}

/// State reachable from both the interception path and the watchdog task
#[derive(Debug)]
struct Shared {
    coordinator: Arc<GuardianCoordinator>,
    settings: ProtectionConfig,
    catalog: FixCatalog,
    counters: Arc<PipelineCounters>,
    events: broadcast::Sender<ProtectionEvent>,
    alerts: broadcast::Sender<ProtectionAlert>,
    audit: AuditTrail,
    lockdown: RwLock<Option<String>>,
    tally: Tally,
}

impl Shared {
    fn emit(&self, event: ProtectionEvent) {
        // no subscribers is fine; the audit trail still records it
        let _ = self.events.send(event.clone());
        self.audit.append(event);
    }

    fn raise(&self, alert: ProtectionAlert) {
        error!(level = %alert.level, source = %alert.source, message = %alert.message, "protection alert");
        let _ = self.alerts.send(alert);
    }

    fn enter_lockdown(&self, reason: String) {
        {
            let mut lockdown = self.lockdown.write();
            if lockdown.is_some() {
                return;
            }
            *lockdown = Some(reason.clone());
        }
        warn!(%reason, "protection entering lockdown");
        self.emit(ProtectionEvent::LockdownEntered { reason, at: now() });
    }

    /// Lockdown, then a CRITICAL alert; alert receivers already see the lockdown
    fn fail_safe(&self, source: &str, reason: String) {
        self.enter_lockdown(format!("{}: {}", source, reason));
        self.raise(ProtectionAlert::critical(source, reason));
    }
}

struct WatchdogHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

/// Auto-protection daemon.
///
/// Interception works whether or not the daemon is started; `start` only adds
/// the watchdog.
#[derive(Debug)]
pub struct AutoProtection {
    shared: Arc<Shared>,
    watchdog: Mutex<Option<WatchdogHandle>>,
}

impl std::fmt::Debug for WatchdogHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchdogHandle")
            .field("cancelled", &self.token.is_cancelled())
            .field("finished", &self.task.is_finished())
            .finish()
    }
}

impl AutoProtection {
    /// Fails when the settings are invalid, or when their stall threshold
    /// does not outlast every phase the coordinator's configuration allows
    pub fn new(coordinator: Arc<GuardianCoordinator>, settings: ProtectionConfig) -> Result<Self> {
        settings.validate_against(&coordinator.config().snapshot())?;
        let (events, _) = broadcast::channel(settings.event_capacity);
        let (alerts, _) = broadcast::channel(settings.event_capacity);
        info!(strategy = %settings.strategy, "auto-protection created");
        Ok(Self {
            shared: Arc::new(Shared {
                coordinator,
                catalog: FixCatalog::builtin(),
                counters: Arc::new(PipelineCounters::new()),
                events,
                alerts,
                audit: AuditTrail::new(settings.audit_capacity),
                lockdown: RwLock::new(None),
                tally: Tally::default(),
                settings,
            }),
            watchdog: Mutex::new(None),
        })
    }

    /// Start the watchdog on the current tokio runtime
    pub fn start(&self) -> Result<()> {
        let mut slot = self.watchdog.lock();
        if slot.is_some() {
            return Err(DaemonError::AlreadyRunning);
        }
        let handle = Handle::try_current().map_err(|_| DaemonError::NoRuntime)?;

        let shared = Arc::clone(&self.shared);
        let watchdog = Watchdog::new(
            Arc::clone(&shared.coordinator),
            Arc::clone(&shared.counters),
            &shared.settings,
        );
        let token = CancellationToken::new();
        let interval = shared.settings.watchdog_interval();
        let task = handle.spawn(watchdog.run(interval, token.clone(), move |fault| {
            shared.fail_safe("watchdog", fault.to_string());
        }));
        *slot = Some(WatchdogHandle { token, task });
        drop(slot);

        info!(interval_ms = interval.as_millis() as u64, "auto-protection started");
        self.shared.emit(ProtectionEvent::Started { at: now() });
        Ok(())
    }

    /// Stop the watchdog and wait for it to exit
    pub async fn stop(&self) -> Result<()> {
        let handle = self.watchdog.lock().take().ok_or(DaemonError::NotRunning)?;
        handle.token.cancel();
        if let Err(e) = handle.task.await {
            warn!(error = %e, "watchdog task ended abnormally");
        }
        info!("auto-protection stopped");
        self.shared.emit(ProtectionEvent::Stopped { at: now() });
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.watchdog.lock().is_some()
    }

    pub fn coordinator(&self) -> &Arc<GuardianCoordinator> {
        &self.shared.coordinator
    }

    pub fn settings(&self) -> &ProtectionConfig {
        &self.shared.settings
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ProtectionEvent> {
        self.shared.events.subscribe()
    }

    pub fn subscribe_alerts(&self) -> broadcast::Receiver<ProtectionAlert> {
        self.shared.alerts.subscribe()
    }

    pub fn audit(&self) -> &AuditTrail {
        &self.shared.audit
    }

    pub fn counters(&self) -> &Arc<PipelineCounters> {
        &self.shared.counters
    }

    pub fn stats(&self) -> ProtectionStats {
        let tally = &self.shared.tally;
        ProtectionStats {
            intercepted: tally.intercepted.load(Ordering::Relaxed),
            accepted: tally.accepted.load(Ordering::Relaxed),
            rejected: tally.rejected.load(Ordering::Relaxed),
            corrected: tally.corrected.load(Ordering::Relaxed),
            blocked: tally.blocked.load(Ordering::Relaxed),
            in_flight: self.shared.counters.in_flight(),
            running: self.is_running(),
            locked_down: self.is_locked_down(),
        }
    }

    pub fn is_locked_down(&self) -> bool {
        self.shared.lockdown.read().is_some()
    }

    pub fn lockdown_reason(&self) -> Option<String> {
        self.shared.lockdown.read().clone()
    }

    /// Leave lockdown. Returns whether the daemon was locked down.
    pub fn reset_lockdown(&self) -> bool {
        let previous = self.shared.lockdown.write().take();
        match previous {
            Some(reason) => {
                info!(%reason, "lockdown cleared");
                self.shared.emit(ProtectionEvent::LockdownCleared { at: now() });
                true
            }
            None => false,
        }
    }

    /// Validate and swap in a new guardian configuration.
    ///
    /// An invalid configuration keeps the previous one active, raises a
    /// CRITICAL alert and locks the daemon down. So does one whose phase
    /// budgets the watchdog's stall threshold would not outlast.
    pub fn update_config(&self, config: GuardianConfig) -> Result<()> {
        if let Err(e) = self.shared.settings.validate_against(&config) {
            self.shared.fail_safe("config", format!("rejected configuration update: {}", e));
            return Err(DaemonError::Config(e));
        }
        if let Err(e) = self.shared.coordinator.config().replace(config) {
            self.shared.fail_safe("config", format!("rejected configuration update: {}", e));
            return Err(DaemonError::Config(e));
        }
        self.shared.emit(ProtectionEvent::ConfigReplaced { at: now() });
        Ok(())
    }

    pub fn set_mode(&self, mode: GuardMode) {
        let config = self.shared.coordinator.config();
        let from = config.mode();
        config.set_mode(mode);
        self.shared.emit(ProtectionEvent::ModeChanged {
            from,
            to: mode,
            at: now(),
        });
    }

    /// Run one action through the pipeline and the correction strategy.
    ///
    /// `execute` receives the action actually being run, which differs from
    /// `action` once a correction is applied. Fails only in lockdown.
    pub async fn intercept<F, Fut>(&self, action: Action, mut execute: F) -> Result<Interception>
    where
        F: FnMut(Action, AttemptContext) -> Fut,
        Fut: Future<Output = std::result::Result<Artifact, ExecutionFailure>>,
    {
        let shared = &self.shared;
        let original_action_id = action.id();
        if let Some(reason) = self.lockdown_reason() {
            shared.tally.blocked.fetch_add(1, Ordering::Relaxed);
            warn!(action_id = %original_action_id, %reason, "action refused in lockdown");
            shared.emit(ProtectionEvent::Blocked {
                action_id: original_action_id,
                reason: reason.clone(),
                at: now(),
            });
            return Err(DaemonError::Lockdown { reason });
        }

        let _in_flight = shared.counters.begin();
        shared.tally.intercepted.fetch_add(1, Ordering::Relaxed);
        shared.emit(ProtectionEvent::Intercepted {
            action_id: original_action_id,
            action_type: action.action_type().to_string(),
            at: now(),
        });

        let report = self.enforce(&action, &mut execute).await;
        let mut interception = Interception {
            original_action_id,
            action,
            correction: None,
            report,
        };

        if blocked_before_execution(&interception.report) {
            match shared.settings.strategy {
                CorrectionStrategy::RejectOnly => {}
                CorrectionStrategy::AutoFixSimple => {
                    self.auto_fix(&mut interception, &mut execute).await;
                }
                CorrectionStrategy::SuggestAndWait => {
                    self.suggest(&mut interception, &mut execute).await;
                }
            }
        }

        let counter = if interception.is_accepted() {
            &shared.tally.accepted
        } else {
            &shared.tally.rejected
        };
        counter.fetch_add(1, Ordering::Relaxed);
        shared.emit(outcome_event(&interception));
        info!(
            action_id = %original_action_id,
            status = %interception.report.status,
            corrected = interception.was_corrected(),
            "interception finished"
        );
        Ok(interception)
    }

    async fn enforce<F, Fut>(&self, action: &Action, execute: &mut F) -> EnforcementReport
    where
        F: FnMut(Action, AttemptContext) -> Fut,
        Fut: Future<Output = std::result::Result<Artifact, ExecutionFailure>>,
    {
        let counters = &self.shared.counters;
        let report = self
            .shared
            .coordinator
            .enforce(action, |attempt| {
                counters.record_progress();
                let attempt = execute(action.clone(), attempt);
                async move {
                    let result = attempt.await;
                    counters.record_progress();
                    result
                }
            })
            .await;
        self.shared.counters.record_progress();
        self.shared.emit(ProtectionEvent::Enforced {
            action_id: report.action_id,
            status: report.status,
            score: report.metrics.overall_score,
            at: now(),
        });
        report
    }

    async fn auto_fix<F, Fut>(&self, interception: &mut Interception, execute: &mut F)
    where
        F: FnMut(Action, AttemptContext) -> Fut,
        Fut: Future<Output = std::result::Result<Artifact, ExecutionFailure>>,
    {
        let Some(correction) = self.shared.catalog.correct(&interception.action) else {
            return;
        };
        self.shared.tally.corrected.fetch_add(1, Ordering::Relaxed);
        info!(
            action_id = %interception.original_action_id,
            corrected_action_id = %correction.action.id(),
            rules = %correction.rules.iter().join(", "),
            "auto-correcting blocked action"
        );
        self.shared.emit(ProtectionEvent::AutoCorrected {
            action_id: interception.original_action_id,
            corrected_action_id: correction.action.id(),
            rules: correction.rule_names(),
            diff: correction.diff.clone(),
            at: now(),
        });
        self.run_correction(interception, correction, execute).await;
    }

    async fn suggest<F, Fut>(&self, interception: &mut Interception, execute: &mut F)
    where
        F: FnMut(Action, AttemptContext) -> Fut,
        Fut: Future<Output = std::result::Result<Artifact, ExecutionFailure>>,
    {
        let Some(decision) = interception.report.blocking_decision().cloned() else {
            return;
        };
        let Some(correction) = self.shared.catalog.correct(&interception.action) else {
            return;
        };
        let action_id = interception.original_action_id;
        self.shared.emit(ProtectionEvent::SuggestionIssued {
            action_id,
            corrected_action_id: correction.action.id(),
            rules: correction.rule_names(),
            at: now(),
        });

        let request = ApprovalRequest {
            action: correction.action.clone(),
            decision,
            suggested_fix: Some(correction.diff.clone()),
        };
        self.shared.counters.record_progress();
        let approved = self
            .shared
            .coordinator
            .request_approval(request, self.shared.settings.suggestion_timeout())
            .await;
        self.shared.counters.record_progress();
        self.shared.emit(ProtectionEvent::SuggestionResolved {
            action_id,
            approved,
            at: now(),
        });
        if !approved {
            info!(%action_id, "suggested correction not approved, keeping rejection");
            return;
        }
        self.shared.tally.corrected.fetch_add(1, Ordering::Relaxed);
        self.run_correction(interception, correction, execute).await;
    }

    async fn run_correction<F, Fut>(
        &self,
        interception: &mut Interception,
        correction: Correction,
        execute: &mut F,
    ) where
        F: FnMut(Action, AttemptContext) -> Fut,
        Fut: Future<Output = std::result::Result<Artifact, ExecutionFailure>>,
    {
        let report = self.enforce(&correction.action, execute).await;
        interception.action = correction.action.clone();
        interception.report = report;
        interception.correction = Some(correction);
    }
}

impl Drop for AutoProtection {
    fn drop(&mut self) {
        if let Some(handle) = self.watchdog.get_mut().take() {
            handle.token.cancel();
        }
    }
}

fn outcome_event(interception: &Interception) -> ProtectionEvent {
    let report = &interception.report;
    let corrected = interception.was_corrected();
    let critical = report
        .decisions
        .iter()
        .filter_map(|d| d.verdict.as_ref())
        .any(|v| v.has_critical());
    ProtectionEvent::Outcome {
        event_id: Uuid::new_v4(),
        action_id: interception.original_action_id,
        action_type: interception.action.action_type().to_string(),
        outcome: report.status,
        auto_corrected: corrected,
        correction_diff: interception
            .correction
            .as_ref()
            .filter(|_| corrected)
            .map(|c| c.diff.clone()),
        alert_level: AlertLevel::for_outcome(report.status, corrected, critical),
        at: now(),
    }
}

/// Blocked by the pre-execution guard, so the callback never ran
fn blocked_before_execution(report: &EnforcementReport) -> bool {
    matches!(
        report.status,
        EnforcementStatus::Rejected | EnforcementStatus::EscalationBlocked
    ) && report.decision_for(GuardKind::Runtime).is_none()
}
