//! Post-execution guard: judge what the execution produced

use super::runtime::{Artifact, ArtifactKind};
use super::{GuardDecision, GuardKind};
use crate::action::{context_keys, Action, ActionType};
use crate::analysis::patterns::{scan_lines, LAZY_PATTERN};
use crate::config::{GuardMode, GuardianConfig};
use crate::engine::ValidationEngine;
use crate::verdict::ConstitutionalVerdict;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::info;

/// Action type given to execution output when it is judged
pub const EXECUTION_OUTPUT: &str = "execution_output";

/// Quality tiers, worst first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QualityTier {
    Unacceptable,
    Poor,
    Acceptable,
    Good,
    Excellent,
}

impl fmt::Display for QualityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QualityTier::Unacceptable => "UNACCEPTABLE",
            QualityTier::Poor => "POOR",
            QualityTier::Acceptable => "ACCEPTABLE",
            QualityTier::Good => "GOOD",
            QualityTier::Excellent => "EXCELLENT",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityAssessment {
    pub tier: QualityTier,
    /// Incomplete patterns per 1000 lines
    pub laziness_index: f64,
    pub incomplete_patterns: usize,
    /// Succeeded on the first attempt and passed the re-evaluation
    pub first_pass_correct: bool,
    pub score: f64,
}

impl QualityAssessment {
    /// Grade an artifact from its verdict and content
    pub fn assess(verdict: &ConstitutionalVerdict, content: &str, first_attempt_succeeded: bool) -> Self {
        let incomplete_patterns = scan_lines(content, &LAZY_PATTERN).len();
        let lines = content.lines().count().max(1);
        let laziness_index = incomplete_patterns as f64 * 1000.0 / lines as f64;
        let first_pass_correct = first_attempt_succeeded && verdict.passed;
        let score = verdict.overall_score;

        let tier = if verdict.has_critical() || score < 0.5 {
            QualityTier::Unacceptable
        } else if score < 0.7 || laziness_index > 10.0 {
            QualityTier::Poor
        } else if score < 0.85 || laziness_index > 2.0 {
            QualityTier::Acceptable
        } else if score >= 0.95 && incomplete_patterns == 0 && first_pass_correct {
            QualityTier::Excellent
        } else {
            QualityTier::Good
        };

        Self {
            tier,
            laziness_index,
            incomplete_patterns,
            first_pass_correct,
            score,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PostExecutionGuard {
    engine: Arc<ValidationEngine>,
}

impl PostExecutionGuard {
    pub fn new(engine: Arc<ValidationEngine>) -> Self {
        Self { engine }
    }

    /// The action the artifact is judged as.
    ///
    /// Code keeps the original action's context; output is judged as plain
    /// text so it is never parsed in the original's language.
    pub fn artifact_action(action: &Action, artifact: &Artifact) -> Action {
        match artifact.kind {
            ArtifactKind::Code if action.action_type().carries_code() => {
                action.derive_with_content(artifact.content.as_str())
            }
            ArtifactKind::Code => action.derive_as(ActionType::CodeGeneration, artifact.content.as_str()),
            ArtifactKind::Output => Action::new(
                ActionType::Custom(EXECUTION_OUTPUT.to_string()),
                artifact.content.as_str(),
            )
            .with_context(context_keys::DERIVED_FROM, action.id().to_string()),
        }
    }

    /// Re-evaluate the artifact and grade it
    pub async fn review(
        &self,
        action: &Action,
        artifact: &Artifact,
        first_attempt_succeeded: bool,
        config: &GuardianConfig,
    ) -> GuardDecision {
        let derived = Self::artifact_action(action, artifact);
        let verdict = self.engine.evaluate(&derived, config).await;
        let decision = Self::decide(verdict, &artifact.content, first_attempt_succeeded, config);
        info!(
            action_id = %action.id(),
            outcome = %decision.outcome,
            tier = %decision.quality.as_ref().map(|q| q.tier.to_string()).unwrap_or_default(),
            "post-execution decision"
        );
        decision
    }

    /// Map a tier to a decision: UNACCEPTABLE rejects, POOR rejects in
    /// STRICT mode and warns otherwise, ACCEPTABLE warns.
    pub fn decide(
        verdict: ConstitutionalVerdict,
        content: &str,
        first_attempt_succeeded: bool,
        config: &GuardianConfig,
    ) -> GuardDecision {
        let quality = QualityAssessment::assess(&verdict, content, first_attempt_succeeded);
        let summary = format!(
            "{} quality, score {:.2}, laziness {:.1}/kloc",
            quality.tier, quality.score, quality.laziness_index
        );
        let worst = verdict
            .worst_violation()
            .map(|v| format!("; worst: [{}] {}: {}", v.severity, v.rule, v.message))
            .unwrap_or_default();

        let decision = match quality.tier {
            QualityTier::Unacceptable => {
                GuardDecision::reject(GuardKind::PostExecution, format!("{}{}", summary, worst))
            }
            QualityTier::Poor if config.mode == GuardMode::Strict => {
                GuardDecision::reject(GuardKind::PostExecution, format!("{}{}", summary, worst))
            }
            QualityTier::Poor | QualityTier::Acceptable => {
                GuardDecision::approve_with_warning(GuardKind::PostExecution, format!("{}{}", summary, worst))
            }
            QualityTier::Good | QualityTier::Excellent => {
                GuardDecision::approve(GuardKind::PostExecution, summary)
            }
        };
        decision.with_verdict(verdict).with_quality(quality)
    }
}
