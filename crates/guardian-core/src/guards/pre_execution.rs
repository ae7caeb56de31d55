//! Pre-execution guard: judge the action before anything runs

use super::{GuardDecision, GuardKind};
use crate::action::Action;
use crate::config::{GuardMode, GuardianConfig};
use crate::engine::ValidationEngine;
use crate::verdict::ConstitutionalVerdict;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone)]
pub struct PreExecutionGuard {
    engine: Arc<ValidationEngine>,
}

impl PreExecutionGuard {
    pub fn new(engine: Arc<ValidationEngine>) -> Self {
        Self { engine }
    }

    /// Evaluate the action and rule on it
    pub async fn check(&self, action: &Action, config: &GuardianConfig) -> GuardDecision {
        let verdict = self.engine.evaluate(action, config).await;
        let decision = Self::decide(verdict, config);
        info!(
            action_id = %action.id(),
            outcome = %decision.outcome,
            mode = %config.mode,
            "pre-execution decision"
        );
        decision
    }

    /// Map a verdict to a decision.
    ///
    /// | verdict | condition | outcome |
    /// |---|---|---|
    /// | failed | STRICT mode or any CRITICAL | REJECT |
    /// | failed | within `escalation_margin` of the threshold | ESCALATE |
    /// | failed | otherwise | APPROVE_WITH_WARNING |
    /// | passed | `human_in_the_loop` | ESCALATE |
    /// | passed | STRICT and below threshold + margin | ESCALATE |
    /// | passed | otherwise | APPROVE |
    pub fn decide(verdict: ConstitutionalVerdict, config: &GuardianConfig) -> GuardDecision {
        let score = verdict.overall_score;
        let threshold = verdict.threshold;
        let margin = config.escalation_margin;
        let strict = config.mode == GuardMode::Strict;
        let summary = format!(
            "score {:.2} against threshold {:.2} in {} mode",
            score, threshold, config.mode
        );
        let worst = verdict
            .worst_violation()
            .map(|v| format!("; worst: [{}] {}: {}", v.severity, v.rule, v.message))
            .unwrap_or_default();

        let decision = if !verdict.passed {
            if verdict.has_critical() {
                GuardDecision::reject(
                    GuardKind::PreExecution,
                    format!(
                        "blocked by {} critical violation(s), {}{}",
                        verdict.critical_count(),
                        summary,
                        worst
                    ),
                )
            } else if strict {
                GuardDecision::reject(
                    GuardKind::PreExecution,
                    format!("below threshold, {}{}", summary, worst),
                )
            } else if (score - threshold).abs() <= margin {
                GuardDecision::escalate(
                    GuardKind::PreExecution,
                    format!("borderline, {}{}", summary, worst),
                )
            } else {
                GuardDecision::approve_with_warning(
                    GuardKind::PreExecution,
                    format!("below threshold, proceeding with warning, {}{}", summary, worst),
                )
            }
        } else if config.human_in_the_loop {
            GuardDecision::escalate(
                GuardKind::PreExecution,
                format!("passed, human review required, {}", summary),
            )
        } else if strict && score < threshold + margin {
            GuardDecision::escalate(
                GuardKind::PreExecution,
                format!("passed narrowly, {}", summary),
            )
        } else {
            GuardDecision::approve(GuardKind::PreExecution, format!("passed, {}", summary))
        };
        decision.with_verdict(verdict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guards::GuardOutcome;
    use crate::types::{now, Principle, Severity};
    use crate::verdict::Violation;
    use uuid::Uuid;

    fn verdict(score: f64, threshold: f64, critical: bool) -> ConstitutionalVerdict {
        let violations = if critical {
            vec![Violation::new(
                Principle::UserSovereignty,
                Severity::Critical,
                "catastrophic-operation",
                "deletes the root filesystem",
            )]
        } else {
            Vec::new()
        };
        ConstitutionalVerdict {
            action_id: Uuid::new_v4(),
            overall_score: score,
            threshold,
            passed: score >= threshold && !critical,
            violations,
            results: Vec::new(),
            evaluated_at: now(),
        }
    }

    fn outcome(score: f64, critical: bool, config: &GuardianConfig) -> GuardOutcome {
        PreExecutionGuard::decide(verdict(score, config.threshold(), critical), config).outcome
    }

    #[test]
    fn test_critical_always_rejects() {
        for mode in [GuardMode::Strict, GuardMode::Balanced, GuardMode::Permissive] {
            let config = GuardianConfig::default().with_mode(mode);
            assert_eq!(outcome(0.0, true, &config), GuardOutcome::Reject);
        }
    }

    #[test]
    fn test_failed_by_mode() {
        let strict = GuardianConfig::default().with_mode(GuardMode::Strict);
        assert_eq!(outcome(0.6, false, &strict), GuardOutcome::Reject);

        let balanced = GuardianConfig::default();
        assert_eq!(outcome(0.68, false, &balanced), GuardOutcome::Escalate);
        assert_eq!(outcome(0.4, false, &balanced), GuardOutcome::ApproveWithWarning);
    }

    #[test]
    fn test_passed_outcomes() {
        let balanced = GuardianConfig::default();
        assert_eq!(outcome(0.9, false, &balanced), GuardOutcome::Approve);

        let reviewed = GuardianConfig::default().with_human_in_the_loop(true);
        assert_eq!(outcome(1.0, false, &reviewed), GuardOutcome::Escalate);

        let strict = GuardianConfig::default().with_mode(GuardMode::Strict);
        assert_eq!(outcome(0.92, false, &strict), GuardOutcome::Escalate);
        assert_eq!(outcome(1.0, false, &strict), GuardOutcome::Approve);
    }

    #[test]
    fn test_decision_carries_verdict_and_reason() {
        let config = GuardianConfig::default().with_mode(GuardMode::Strict);
        let decision = PreExecutionGuard::decide(verdict(0.0, 0.9, true), &config);
        assert!(decision.reasoning.contains("catastrophic-operation"));
        assert!(decision.verdict.is_some());
    }

    #[tokio::test]
    async fn test_check_runs_the_engine() {
        let guard = PreExecutionGuard::new(Arc::new(ValidationEngine::new()));
        let config = GuardianConfig::default().with_mode(GuardMode::Strict);
        let decision = guard.check(&Action::shell("rm -rf /"), &config).await;
        assert_eq!(decision.outcome, GuardOutcome::Reject);
        assert_eq!(decision.verdict.unwrap().overall_score, 0.0);
    }
}
