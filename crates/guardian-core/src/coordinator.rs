//! Guardian Coordinator
//!
//! Sequences the three guards around a caller-supplied execution callback:
//! pre-execution check, monitored execution, post-execution review. Every
//! call produces a fresh [`EnforcementReport`]. Escalations go to an optional
//! [`ApprovalGate`]; without one, or when it does not answer in time, the
//! escalated action is blocked.

use crate::action::Action;
use crate::config::{GuardianConfig, SharedConfig};
use crate::engine::ValidationEngine;
use crate::error::Result;
use crate::guards::{
    Artifact, AttemptContext, ExecutionFailure, GuardDecision, GuardKind, GuardOutcome, GuardState,
    GuardStateMachine, PostExecutionGuard, PreExecutionGuard, QualityTier, RuntimeGuard,
    StateTransition,
};
use crate::types::{now, Timestamp};
use crate::verdict::ConstitutionalVerdict;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Observer of guard state changes.
///
/// Hooks are isolated: an error or a panic is logged and counted in the
/// report metrics, and never changes a decision.
///
/// Hooks run synchronously on the task driving `enforce`, in registration
/// order, before the pipeline moves on. They must return quickly; a hook
/// with slow work (disk, network) should queue it and hand it to a task of
/// its own.
pub trait TransitionHook: Send + Sync {
    fn on_transition(&self, action: &Action, transition: &StateTransition) -> Result<()>;
}

/// What an approval gate is asked to rule on
#[derive(Debug, Clone)]
pub struct ApprovalRequest {
    pub action: Action,
    pub decision: GuardDecision,
    pub suggested_fix: Option<String>,
}

/// Resolves escalated decisions, usually by asking a human
#[async_trait]
pub trait ApprovalGate: Send + Sync {
    /// `true` approves the action
    async fn request_approval(&self, request: ApprovalRequest) -> bool;
}

/// An approval request waiting for an answer
#[derive(Debug)]
pub struct PendingApproval {
    pub request: ApprovalRequest,
    respond: oneshot::Sender<bool>,
}

impl PendingApproval {
    pub fn approve(self) {
        let _ = self.respond.send(true);
    }

    pub fn deny(self) {
        let _ = self.respond.send(false);
    }
}

/// Approval gate that forwards requests over a channel to whoever answers
/// them (a UI, a chat bridge, a test). A dropped request counts as denied.
#[derive(Debug, Clone)]
pub struct ChannelApprovalGate {
    requests: mpsc::UnboundedSender<PendingApproval>,
}

impl ChannelApprovalGate {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PendingApproval>) {
        let (requests, receiver) = mpsc::unbounded_channel();
        (Self { requests }, receiver)
    }
}

#[async_trait]
impl ApprovalGate for ChannelApprovalGate {
    async fn request_approval(&self, request: ApprovalRequest) -> bool {
        let (respond, response) = oneshot::channel();
        if self.requests.send(PendingApproval { request, respond }).is_err() {
            warn!("approval channel closed, denying");
            return false;
        }
        response.await.unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnforcementStatus {
    Accepted,
    AcceptedWithWarnings,
    Rejected,
    Interrupted,
    /// Escalated and not approved
    EscalationBlocked,
}

impl EnforcementStatus {
    pub fn is_accepted(self) -> bool {
        matches!(
            self,
            EnforcementStatus::Accepted | EnforcementStatus::AcceptedWithWarnings
        )
    }
}

impl fmt::Display for EnforcementStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EnforcementStatus::Accepted => "ACCEPTED",
            EnforcementStatus::AcceptedWithWarnings => "ACCEPTED_WITH_WARNINGS",
            EnforcementStatus::Rejected => "REJECTED",
            EnforcementStatus::Interrupted => "INTERRUPTED",
            EnforcementStatus::EscalationBlocked => "ESCALATION_BLOCKED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnforcementMetrics {
    pub attempts: u32,
    pub pre_ms: u64,
    pub runtime_ms: u64,
    pub post_ms: u64,
    pub total_ms: u64,
    /// Pre-execution score of the action
    pub overall_score: Option<f64>,
    /// Post-execution score of the artifact
    pub post_score: Option<f64>,
    pub laziness_index: Option<f64>,
    pub quality_tier: Option<QualityTier>,
    pub first_pass_correct: bool,
    pub hook_failures: u32,
}

/// Outcome of one `enforce` call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnforcementReport {
    pub report_id: Uuid,
    pub action_id: Uuid,
    pub status: EnforcementStatus,
    /// Every decision reached, in pipeline order
    pub decisions: Vec<GuardDecision>,
    pub artifact: Option<Artifact>,
    pub errors: Vec<ExecutionFailure>,
    pub final_state: GuardState,
    pub transitions: Vec<StateTransition>,
    pub metrics: EnforcementMetrics,
    pub started_at: Timestamp,
    pub finished_at: Timestamp,
}

impl EnforcementReport {
    pub fn is_accepted(&self) -> bool {
        self.status.is_accepted()
    }

    /// The decision that stopped the pipeline, if one did
    pub fn blocking_decision(&self) -> Option<&GuardDecision> {
        self.decisions
            .iter()
            .find(|d| d.is_blocking() || d.outcome == GuardOutcome::Escalate)
            .filter(|_| !self.is_accepted())
    }

    pub fn decision_for(&self, guard: GuardKind) -> Option<&GuardDecision> {
        self.decisions.iter().find(|d| d.guard == guard)
    }

    /// Pre-execution verdict of the action
    pub fn verdict(&self) -> Option<&ConstitutionalVerdict> {
        self.decision_for(GuardKind::PreExecution)
            .and_then(|d| d.verdict.as_ref())
    }
}

/// State machine plus hook dispatch for one enforcement
struct Lifecycle<'a> {
    action: &'a Action,
    hooks: &'a [Arc<dyn TransitionHook>],
    machine: GuardStateMachine,
    hook_failures: u32,
}

impl<'a> Lifecycle<'a> {
    fn new(action: &'a Action, hooks: &'a [Arc<dyn TransitionHook>]) -> Self {
        Self {
            action,
            hooks,
            machine: GuardStateMachine::new(),
            hook_failures: 0,
        }
    }

    fn advance(&mut self, next: GuardState) {
        let transition = match self.machine.transition(next) {
            Ok(transition) => transition,
            Err(e) => {
                error!(action_id = %self.action.id(), error = %e, "guard lifecycle out of order");
                return;
            }
        };
        for hook in self.hooks {
            match catch_unwind(AssertUnwindSafe(|| hook.on_transition(self.action, &transition))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(to = %transition.to, error = %e, "transition hook failed");
                    self.hook_failures += 1;
                }
                Err(_) => {
                    warn!(to = %transition.to, "transition hook panicked");
                    self.hook_failures += 1;
                }
            }
        }
    }
}

pub struct GuardianCoordinator {
    config: SharedConfig,
    engine: Arc<ValidationEngine>,
    hooks: Vec<Arc<dyn TransitionHook>>,
    approval_gate: Option<Arc<dyn ApprovalGate>>,
}

impl GuardianCoordinator {
    pub fn new(config: SharedConfig) -> Self {
        Self {
            config,
            engine: Arc::new(ValidationEngine::new()),
            hooks: Vec::new(),
            approval_gate: None,
        }
    }

    pub fn with_engine(mut self, engine: ValidationEngine) -> Self {
        self.engine = Arc::new(engine);
        self
    }

    pub fn with_hook(mut self, hook: Arc<dyn TransitionHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn with_approval_gate(mut self, gate: Arc<dyn ApprovalGate>) -> Self {
        self.approval_gate = Some(gate);
        self
    }

    pub fn config(&self) -> &SharedConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<ValidationEngine> {
        &self.engine
    }

    pub fn has_approval_gate(&self) -> bool {
        self.approval_gate.is_some()
    }

    /// Evaluate an action against the current configuration without running it
    pub async fn evaluate(&self, action: &Action) -> ConstitutionalVerdict {
        let config = self.config.snapshot();
        self.engine.evaluate(action, &config).await
    }

    /// Ask the approval gate, failing safe on absence or timeout
    pub async fn request_approval(&self, request: ApprovalRequest, limit: Duration) -> bool {
        let Some(gate) = &self.approval_gate else {
            warn!(action_id = %request.action.id(), "no approval gate configured, blocking escalation");
            return false;
        };
        let action_id = request.action.id();
        match tokio::time::timeout(limit, gate.request_approval(request)).await {
            Ok(approved) => {
                info!(%action_id, approved, "approval gate answered");
                approved
            }
            Err(_) => {
                warn!(%action_id, timeout_ms = limit.as_millis() as u64, "approval timed out, blocking");
                false
            }
        }
    }

    /// Run `execute` under all three guards with the current configuration
    pub async fn enforce<F, Fut>(&self, action: &Action, execute: F) -> EnforcementReport
    where
        F: FnMut(AttemptContext) -> Fut,
        Fut: Future<Output = std::result::Result<Artifact, ExecutionFailure>>,
    {
        let config = self.config.snapshot();
        self.enforce_with_config(action, &config, execute).await
    }

    /// Run `execute` under all three guards with an explicit configuration
    pub async fn enforce_with_config<F, Fut>(
        &self,
        action: &Action,
        config: &GuardianConfig,
        execute: F,
    ) -> EnforcementReport
    where
        F: FnMut(AttemptContext) -> Fut,
        Fut: Future<Output = std::result::Result<Artifact, ExecutionFailure>>,
    {
        let started_at = now();
        let clock = Instant::now();
        let mut lifecycle = Lifecycle::new(action, &self.hooks);
        let mut metrics = EnforcementMetrics::default();
        let mut decisions = Vec::new();
        let mut warned = false;

        lifecycle.advance(GuardState::PreCheck);
        let phase = Instant::now();
        let pre = PreExecutionGuard::new(Arc::clone(&self.engine))
            .check(action, config)
            .await;
        metrics.pre_ms = elapsed_ms(phase);
        metrics.overall_score = pre.verdict.as_ref().map(|v| v.overall_score);

        let status = match pre.outcome {
            GuardOutcome::Reject => Some(EnforcementStatus::Rejected),
            GuardOutcome::Escalate => {
                let request = ApprovalRequest {
                    action: action.clone(),
                    suggested_fix: pre
                        .verdict
                        .as_ref()
                        .and_then(|v| v.worst_violation())
                        .and_then(|v| v.suggested_fix.clone()),
                    decision: pre.clone(),
                };
                if self.request_approval(request, config.approval_timeout()).await {
                    None
                } else {
                    Some(EnforcementStatus::EscalationBlocked)
                }
            }
            GuardOutcome::ApproveWithWarning => {
                warned = true;
                None
            }
            GuardOutcome::Approve | GuardOutcome::Interrupt => None,
        };
        decisions.push(pre);
        if let Some(status) = status {
            lifecycle.advance(GuardState::Rejected);
            return finish(action, lifecycle, status, decisions, None, Vec::new(), metrics, started_at, clock);
        }

        lifecycle.advance(GuardState::Running);
        lifecycle.advance(GuardState::RuntimeMonitored);
        let phase = Instant::now();
        let outcome = RuntimeGuard::from_config(config).monitor(execute).await;
        metrics.runtime_ms = elapsed_ms(phase);
        metrics.attempts = outcome.attempts;
        let runtime_outcome = outcome.decision.outcome;
        decisions.push(outcome.decision);
        let errors = outcome.errors;

        let artifact = match (runtime_outcome, outcome.artifact) {
            (GuardOutcome::Interrupt, _) | (_, None) => {
                lifecycle.advance(GuardState::Interrupted);
                return finish(
                    action,
                    lifecycle,
                    EnforcementStatus::Interrupted,
                    decisions,
                    None,
                    errors,
                    metrics,
                    started_at,
                    clock,
                );
            }
            (_, Some(artifact)) => artifact,
        };
        warned |= runtime_outcome == GuardOutcome::ApproveWithWarning;
        lifecycle.advance(GuardState::Completed);

        lifecycle.advance(GuardState::PostCheck);
        let phase = Instant::now();
        let post = PostExecutionGuard::new(Arc::clone(&self.engine))
            .review(action, &artifact, outcome.first_attempt_succeeded, config)
            .await;
        metrics.post_ms = elapsed_ms(phase);
        if let Some(quality) = &post.quality {
            metrics.post_score = Some(quality.score);
            metrics.laziness_index = Some(quality.laziness_index);
            metrics.quality_tier = Some(quality.tier);
            metrics.first_pass_correct = quality.first_pass_correct;
        }

        let status = match post.outcome {
            GuardOutcome::Reject => {
                lifecycle.advance(GuardState::Rejected);
                EnforcementStatus::Rejected
            }
            outcome => {
                lifecycle.advance(GuardState::Accepted);
                if warned || outcome == GuardOutcome::ApproveWithWarning {
                    EnforcementStatus::AcceptedWithWarnings
                } else {
                    EnforcementStatus::Accepted
                }
            }
        };
        decisions.push(post);
        finish(action, lifecycle, status, decisions, Some(artifact), errors, metrics, started_at, clock)
    }
}

impl fmt::Debug for GuardianCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuardianCoordinator")
            .field("config", &self.config)
            .field("engine", &self.engine)
            .field("hooks", &self.hooks.len())
            .field("approval_gate", &self.approval_gate.is_some())
            .finish()
    }
}

fn elapsed_ms(since: Instant) -> u64 {
    since.elapsed().as_millis() as u64
}

#[allow(clippy::too_many_arguments)]
fn finish(
    action: &Action,
    lifecycle: Lifecycle<'_>,
    status: EnforcementStatus,
    decisions: Vec<GuardDecision>,
    artifact: Option<Artifact>,
    errors: Vec<ExecutionFailure>,
    mut metrics: EnforcementMetrics,
    started_at: Timestamp,
    clock: Instant,
) -> EnforcementReport {
    metrics.total_ms = elapsed_ms(clock);
    metrics.hook_failures = lifecycle.hook_failures;
    let final_state = lifecycle.machine.state();
    info!(
        action_id = %action.id(),
        %status,
        state = %final_state,
        attempts = metrics.attempts,
        total_ms = metrics.total_ms,
        "enforcement finished"
    );
    EnforcementReport {
        report_id: Uuid::new_v4(),
        action_id: action.id(),
        status,
        decisions,
        artifact,
        errors,
        final_state,
        transitions: lifecycle.machine.into_trail(),
        metrics,
        started_at,
        finished_at: now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GuardMode;
    use crate::error::GuardianError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn coordinator(config: GuardianConfig) -> GuardianCoordinator {
        GuardianCoordinator::new(SharedConfig::new(config).unwrap())
    }

    struct Approving(bool);

    #[async_trait]
    impl ApprovalGate for Approving {
        async fn request_approval(&self, _: ApprovalRequest) -> bool {
            self.0
        }
    }

    struct Silent;

    #[async_trait]
    impl ApprovalGate for Silent {
        async fn request_approval(&self, _: ApprovalRequest) -> bool {
            tokio::time::sleep(Duration::from_secs(10)).await;
            true
        }
    }

    struct Faulty {
        panics: bool,
        seen: AtomicU32,
    }

    impl TransitionHook for Faulty {
        fn on_transition(&self, _: &Action, _: &StateTransition) -> Result<()> {
            self.seen.fetch_add(1, Ordering::SeqCst);
            if self.panics {
                panic!("hook bug");
            }
            Err(GuardianError::Daemon("audit sink unavailable".to_string()))
        }
    }

    #[tokio::test]
    async fn test_clean_action_is_accepted() {
        let report = coordinator(GuardianConfig::default())
            .enforce(&Action::shell("echo hello"), |_ctx| async {
                Ok(Artifact::output("hello"))
            })
            .await;
        assert_eq!(report.status, EnforcementStatus::Accepted);
        assert_eq!(report.final_state, GuardState::Accepted);
        assert_eq!(report.transitions.len(), 6);
        assert_eq!(report.decisions.len(), 3);
        assert_eq!(report.metrics.attempts, 1);
        assert!(report.metrics.first_pass_correct);
        assert_eq!(report.artifact.unwrap().content, "hello");
    }

    #[tokio::test]
    async fn test_rejected_action_never_runs() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let report = coordinator(GuardianConfig::default().with_mode(GuardMode::Strict))
            .enforce(&Action::shell("rm -rf /"), move |_ctx| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(Artifact::output("")) }
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(report.status, EnforcementStatus::Rejected);
        assert_eq!(report.final_state, GuardState::Rejected);
        assert_eq!(report.decisions.len(), 1);
        assert!(report.blocking_decision().is_some());
    }

    #[tokio::test]
    async fn test_escalation_without_gate_is_blocked() {
        let report = coordinator(GuardianConfig::default().with_human_in_the_loop(true))
            .enforce(&Action::shell("echo hello"), |_ctx| async {
                Ok(Artifact::output("hello"))
            })
            .await;
        assert_eq!(report.status, EnforcementStatus::EscalationBlocked);
        assert_eq!(report.final_state, GuardState::Rejected);
    }

    #[tokio::test]
    async fn test_escalation_resolved_by_gate() {
        let config = GuardianConfig::default().with_human_in_the_loop(true);
        let approved = coordinator(config.clone())
            .with_approval_gate(Arc::new(Approving(true)))
            .enforce(&Action::shell("echo hello"), |_ctx| async {
                Ok(Artifact::output("hello"))
            })
            .await;
        assert!(approved.is_accepted());

        let denied = coordinator(config)
            .with_approval_gate(Arc::new(Approving(false)))
            .enforce(&Action::shell("echo hello"), |_ctx| async {
                Ok(Artifact::output("hello"))
            })
            .await;
        assert_eq!(denied.status, EnforcementStatus::EscalationBlocked);
    }

    #[tokio::test]
    async fn test_silent_gate_times_out_to_blocked() {
        let config = GuardianConfig::default()
            .with_human_in_the_loop(true)
            .with_approval_timeout(Duration::from_millis(50));
        let report = coordinator(config)
            .with_approval_gate(Arc::new(Silent))
            .enforce(&Action::shell("echo hello"), |_ctx| async {
                Ok(Artifact::output("hello"))
            })
            .await;
        assert_eq!(report.status, EnforcementStatus::EscalationBlocked);
    }

    #[tokio::test]
    async fn test_channel_gate_round_trip() {
        let (gate, mut requests) = ChannelApprovalGate::new();
        let answer = tokio::spawn(async move {
            let pending = requests.recv().await.unwrap();
            assert_eq!(pending.request.decision.outcome, GuardOutcome::Escalate);
            pending.approve();
        });
        let report = coordinator(GuardianConfig::default().with_human_in_the_loop(true))
            .with_approval_gate(Arc::new(gate))
            .enforce(&Action::shell("echo hello"), |_ctx| async {
                Ok(Artifact::output("hello"))
            })
            .await;
        answer.await.unwrap();
        assert!(report.is_accepted());
    }

    #[tokio::test]
    async fn test_faulty_hooks_never_change_the_outcome() {
        let erroring = Arc::new(Faulty {
            panics: false,
            seen: AtomicU32::new(0),
        });
        let panicking = Arc::new(Faulty {
            panics: true,
            seen: AtomicU32::new(0),
        });
        let report = coordinator(GuardianConfig::default())
            .with_hook(erroring.clone())
            .with_hook(panicking.clone())
            .enforce(&Action::shell("echo hello"), |_ctx| async {
                Ok(Artifact::output("hello"))
            })
            .await;
        assert_eq!(report.status, EnforcementStatus::Accepted);
        assert_eq!(erroring.seen.load(Ordering::SeqCst), 6);
        assert_eq!(panicking.seen.load(Ordering::SeqCst), 6);
        assert_eq!(report.metrics.hook_failures, 12);
    }

    #[derive(Default)]
    struct Recorder {
        states: parking_lot::Mutex<Vec<GuardState>>,
    }

    impl TransitionHook for Recorder {
        fn on_transition(&self, _: &Action, transition: &StateTransition) -> Result<()> {
            self.states.lock().push(transition.to);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_hooks_run_inline_before_the_pipeline_moves_on() {
        let recorder = Arc::new(Recorder::default());
        let seen_by_execution = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let snapshot = Arc::clone(&seen_by_execution);
        let observed = Arc::clone(&recorder);
        let report = coordinator(GuardianConfig::default())
            .with_hook(recorder.clone())
            .enforce(&Action::shell("echo hello"), move |_ctx| {
                *snapshot.lock() = observed.states.lock().clone();
                async { Ok(Artifact::output("hello")) }
            })
            .await;

        assert_eq!(report.status, EnforcementStatus::Accepted);
        let expected: Vec<GuardState> = report.transitions.iter().map(|t| t.to).collect();
        assert_eq!(*recorder.states.lock(), expected);
        let before_execution = seen_by_execution.lock().clone();
        assert!(!before_execution.is_empty());
        assert!(expected.starts_with(&before_execution));
        assert!(before_execution.len() < expected.len());
    }

    #[tokio::test]
    async fn test_repeated_failure_is_interrupted() {
        let report = coordinator(GuardianConfig::default())
            .enforce(&Action::shell("make build"), |_ctx| async {
                Err(ExecutionFailure::parse("ValueError: X"))
            })
            .await;
        assert_eq!(report.status, EnforcementStatus::Interrupted);
        assert_eq!(report.final_state, GuardState::Interrupted);
        assert_eq!(report.metrics.attempts, 2);
        assert_eq!(report.errors.len(), 2);
        assert!(report.artifact.is_none());
    }
}
