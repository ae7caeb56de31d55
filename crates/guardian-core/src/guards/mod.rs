//! Guard pipeline
//!
//! Three checkpoints around an execution: the pre-execution guard judges the
//! proposed action, the runtime guard supervises the attempts, and the
//! post-execution guard judges what was produced. Their progress is tracked
//! by [`GuardStateMachine`]:
//!
//! ```text
//! Idle -> PreCheck -> Rejected
//!                  -> Running -> RuntimeMonitored -> Interrupted
//!                                                 -> Completed -> PostCheck -> Rejected
//!                                                                           -> Accepted
//! ```

pub mod post_execution;
pub mod pre_execution;
pub mod runtime;

pub use post_execution::{PostExecutionGuard, QualityAssessment, QualityTier};
pub use pre_execution::PreExecutionGuard;
pub use runtime::{
    Artifact, ArtifactKind, AttemptContext, ExecutionFailure, InterruptReason, RuntimeGuard,
    RuntimeOutcome,
};

use crate::error::{GuardianError, Result};
use crate::types::{now, Timestamp};
use crate::verdict::ConstitutionalVerdict;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which checkpoint produced a decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardKind {
    PreExecution,
    Runtime,
    PostExecution,
}

impl fmt::Display for GuardKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GuardKind::PreExecution => "pre-execution",
            GuardKind::Runtime => "runtime",
            GuardKind::PostExecution => "post-execution",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GuardOutcome {
    Approve,
    Reject,
    ApproveWithWarning,
    Escalate,
    Interrupt,
}

impl GuardOutcome {
    /// The action may go ahead
    pub fn proceeds(self) -> bool {
        matches!(self, GuardOutcome::Approve | GuardOutcome::ApproveWithWarning)
    }

    /// The pipeline stops here
    pub fn is_blocking(self) -> bool {
        matches!(self, GuardOutcome::Reject | GuardOutcome::Interrupt)
    }
}

impl fmt::Display for GuardOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GuardOutcome::Approve => "APPROVE",
            GuardOutcome::Reject => "REJECT",
            GuardOutcome::ApproveWithWarning => "APPROVE_WITH_WARNING",
            GuardOutcome::Escalate => "ESCALATE",
            GuardOutcome::Interrupt => "INTERRUPT",
        };
        f.write_str(name)
    }
}

/// A guard's ruling with its reasoning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardDecision {
    pub guard: GuardKind,
    pub outcome: GuardOutcome,
    pub reasoning: String,
    pub verdict: Option<ConstitutionalVerdict>,
    pub interrupt: Option<InterruptReason>,
    pub quality: Option<QualityAssessment>,
    pub decided_at: Timestamp,
}

impl GuardDecision {
    fn new(guard: GuardKind, outcome: GuardOutcome, reasoning: impl Into<String>) -> Self {
        let reasoning = reasoning.into();
        let reasoning = if reasoning.trim().is_empty() {
            format!("{} guard returned {} without stating a reason", guard, outcome)
        } else {
            reasoning
        };
        Self {
            guard,
            outcome,
            reasoning,
            verdict: None,
            interrupt: None,
            quality: None,
            decided_at: now(),
        }
    }

    pub fn approve(guard: GuardKind, reasoning: impl Into<String>) -> Self {
        Self::new(guard, GuardOutcome::Approve, reasoning)
    }

    pub fn approve_with_warning(guard: GuardKind, reasoning: impl Into<String>) -> Self {
        Self::new(guard, GuardOutcome::ApproveWithWarning, reasoning)
    }

    /// Rejection; empty reasoning is replaced with a generated one
    pub fn reject(guard: GuardKind, reasoning: impl Into<String>) -> Self {
        Self::new(guard, GuardOutcome::Reject, reasoning)
    }

    pub fn escalate(guard: GuardKind, reasoning: impl Into<String>) -> Self {
        Self::new(guard, GuardOutcome::Escalate, reasoning)
    }

    /// Runtime interruption; the reason doubles as reasoning when none is given
    pub fn interrupt(reason: InterruptReason, reasoning: impl Into<String>) -> Self {
        let reasoning = reasoning.into();
        let reasoning = if reasoning.trim().is_empty() {
            reason.to_string()
        } else {
            reasoning
        };
        let mut decision = Self::new(GuardKind::Runtime, GuardOutcome::Interrupt, reasoning);
        decision.interrupt = Some(reason);
        decision
    }

    pub fn with_verdict(mut self, verdict: ConstitutionalVerdict) -> Self {
        self.verdict = Some(verdict);
        self
    }

    pub fn with_quality(mut self, quality: QualityAssessment) -> Self {
        self.quality = Some(quality);
        self
    }

    pub fn is_blocking(&self) -> bool {
        self.outcome.is_blocking()
    }
}

/// Lifecycle of one enforced action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardState {
    Idle,
    PreCheck,
    Rejected,
    Running,
    RuntimeMonitored,
    Interrupted,
    Completed,
    PostCheck,
    Accepted,
}

impl GuardState {
    pub fn can_transition_to(self, next: GuardState) -> bool {
        use GuardState::*;
        matches!(
            (self, next),
            (Idle, PreCheck)
                | (PreCheck, Rejected)
                | (PreCheck, Running)
                | (Running, RuntimeMonitored)
                | (RuntimeMonitored, Interrupted)
                | (RuntimeMonitored, Completed)
                | (Completed, PostCheck)
                | (PostCheck, Rejected)
                | (PostCheck, Accepted)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            GuardState::Rejected | GuardState::Interrupted | GuardState::Accepted
        )
    }
}

impl fmt::Display for GuardState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: GuardState,
    pub to: GuardState,
    pub at: Timestamp,
}

/// Current state plus the trail of every transition taken
#[derive(Debug, Clone)]
pub struct GuardStateMachine {
    state: GuardState,
    trail: Vec<StateTransition>,
}

impl GuardStateMachine {
    pub fn new() -> Self {
        Self {
            state: GuardState::Idle,
            trail: Vec::new(),
        }
    }

    pub fn state(&self) -> GuardState {
        self.state
    }

    pub fn trail(&self) -> &[StateTransition] {
        &self.trail
    }

    /// Move to `next`, refusing edges the lifecycle does not allow
    pub fn transition(&mut self, next: GuardState) -> Result<StateTransition> {
        if !self.state.can_transition_to(next) {
            return Err(GuardianError::InvalidTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        let transition = StateTransition {
            from: self.state,
            to: next,
            at: now(),
        };
        self.state = next;
        self.trail.push(transition);
        Ok(transition)
    }

    pub fn into_trail(self) -> Vec<StateTransition> {
        self.trail
    }
}

impl Default for GuardStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let mut machine = GuardStateMachine::new();
        for state in [
            GuardState::PreCheck,
            GuardState::Running,
            GuardState::RuntimeMonitored,
            GuardState::Completed,
            GuardState::PostCheck,
            GuardState::Accepted,
        ] {
            machine.transition(state).unwrap();
        }
        assert_eq!(machine.state(), GuardState::Accepted);
        assert!(machine.state().is_terminal());
        assert_eq!(machine.trail().len(), 6);
    }

    #[test]
    fn test_illegal_transition_is_an_error() {
        let mut machine = GuardStateMachine::new();
        let err = machine.transition(GuardState::Running).unwrap_err();
        assert!(matches!(err, GuardianError::InvalidTransition { .. }));
        assert_eq!(machine.state(), GuardState::Idle);

        machine.transition(GuardState::PreCheck).unwrap();
        machine.transition(GuardState::Rejected).unwrap();
        assert!(machine.transition(GuardState::Running).is_err());
    }

    #[test]
    fn test_terminal_states_have_no_exits() {
        use GuardState::*;
        let all = [
            Idle, PreCheck, Rejected, Running, RuntimeMonitored, Interrupted, Completed, PostCheck,
            Accepted,
        ];
        for terminal in all.iter().filter(|s| s.is_terminal()) {
            assert!(all.iter().all(|next| !terminal.can_transition_to(*next)));
        }
    }

    #[test]
    fn test_reject_reasoning_is_never_empty() {
        let decision = GuardDecision::reject(GuardKind::PreExecution, "  ");
        assert!(!decision.reasoning.trim().is_empty());
        assert!(decision.is_blocking());

        let interrupt = GuardDecision::interrupt(
            InterruptReason::IterationLimit {
                max_iterations: 2,
                attempts: 2,
            },
            "",
        );
        assert!(interrupt.reasoning.contains('2'));
        assert_eq!(interrupt.outcome, GuardOutcome::Interrupt);
    }

    #[test]
    fn test_outcome_serializes_screaming() {
        let json = serde_json::to_string(&GuardOutcome::ApproveWithWarning).unwrap();
        assert_eq!(json, "\"APPROVE_WITH_WARNING\"");
    }
}
