//! Violations, per-principle results and the aggregated verdict

use crate::config::{GuardianConfig, SeverityWeights};
use crate::types::{now, Location, Principle, Severity, Timestamp};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use uuid::Uuid;

/// Rule id used when a validator itself fails
pub const VALIDATOR_FAILURE_RULE: &str = "validator-failure";

/// Rule id used when source cannot be parsed
pub const UNPARSEABLE_RULE: &str = "unparseable";

/// A single rule breach found by a validator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub principle: Principle,
    pub severity: Severity,
    /// Stable rule identifier, e.g. `stub-function`
    pub rule: String,
    pub message: String,
    pub location: Option<Location>,
    pub suggested_fix: Option<String>,
}

impl Violation {
    pub fn new(
        principle: Principle,
        severity: Severity,
        rule: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            principle,
            severity,
            rule: rule.into(),
            message: message.into(),
            location: None,
            suggested_fix: None,
        }
    }

    pub fn at(mut self, location: Location) -> Self {
        self.location = Some(location);
        self
    }

    pub fn with_fix(mut self, fix: impl Into<String>) -> Self {
        self.suggested_fix = Some(fix.into());
        self
    }

    pub fn is_critical(&self) -> bool {
        self.severity.is_critical()
    }
}

/// Score for a set of violations: `1 - sum(weight) / normalizer`, clipped to [0, 1]
pub fn score_violations(violations: &[Violation], weights: &SeverityWeights, normalizer: f64) -> f64 {
    let penalty: f64 = violations.iter().map(|v| weights.weight(v.severity)).sum();
    (1.0 - penalty / normalizer).clamp(0.0, 1.0)
}

/// Orders violations by severity (descending) then location
fn sort_by_severity(violations: &mut [Violation]) {
    violations.sort_by(|a, b| {
        b.severity
            .cmp(&a.severity)
            .then_with(|| a.location.cmp(&b.location))
    });
}

/// Outcome of one validator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub principle: Principle,
    pub passed: bool,
    pub score: f64,
    pub violations: Vec<Violation>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl ValidationResult {
    /// Score the violations and decide pass/fail against the active threshold
    pub fn from_violations(
        principle: Principle,
        mut violations: Vec<Violation>,
        config: &GuardianConfig,
    ) -> Self {
        sort_by_severity(&mut violations);
        let score = score_violations(
            &violations,
            &config.severity_weights,
            config.score_normalizer,
        );
        let has_critical = violations.iter().any(Violation::is_critical);
        Self {
            principle,
            passed: score >= config.threshold() && !has_critical,
            score,
            violations,
            metadata: BTreeMap::new(),
        }
    }

    /// Fail-closed result carrying one CRITICAL violation
    pub fn failed_closed(principle: Principle, rule: &str, reason: impl Into<String>) -> Self {
        Self {
            principle,
            passed: false,
            score: 0.0,
            violations: vec![Violation::new(principle, Severity::Critical, rule, reason)],
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn critical_count(&self) -> usize {
        self.violations.iter().filter(|v| v.is_critical()).count()
    }

    /// Re-establish the invariants on a result produced by foreign code
    pub(crate) fn normalized(mut self, principle: Principle) -> Self {
        self.principle = principle;
        self.score = if self.score.is_finite() {
            self.score.clamp(0.0, 1.0)
        } else {
            0.0
        };
        for violation in &mut self.violations {
            violation.principle = principle;
        }
        sort_by_severity(&mut self.violations);
        if self.critical_count() > 0 {
            self.passed = false;
        }
        self
    }
}

/// Aggregated judgement of an action across all enabled principles
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstitutionalVerdict {
    pub action_id: Uuid,
    pub overall_score: f64,
    pub threshold: f64,
    pub passed: bool,
    /// All violations, ordered by principle then severity descending
    pub violations: Vec<Violation>,
    pub results: Vec<ValidationResult>,
    pub evaluated_at: Timestamp,
}

impl ConstitutionalVerdict {
    /// Aggregate per-principle results.
    ///
    /// Plain mean by default, weighted mean when weights are configured. With
    /// the critical veto on, any CRITICAL violation forces the score to 0.0.
    pub fn aggregate(action_id: Uuid, mut results: Vec<ValidationResult>, config: &GuardianConfig) -> Self {
        results.sort_by_key(|r| r.principle);

        let (weighted, total) = results.iter().fold((0.0, 0.0), |(sum, total), result| {
            let weight = config.principle_weight(result.principle);
            (sum + result.score * weight, total + weight)
        });
        let mean = if total > 0.0 { weighted / total } else { 0.0 };

        let violations: Vec<Violation> = results
            .iter()
            .flat_map(|r| r.violations.iter().cloned())
            .sorted_by(|a, b| {
                a.principle
                    .cmp(&b.principle)
                    .then_with(|| b.severity.cmp(&a.severity))
            })
            .collect();
        let has_critical = violations.iter().any(Violation::is_critical);

        let overall_score = if has_critical && config.critical_veto {
            0.0
        } else {
            mean.clamp(0.0, 1.0)
        };
        let threshold = config.threshold();

        Self {
            action_id,
            overall_score,
            threshold,
            passed: !results.is_empty() && overall_score >= threshold && !has_critical,
            violations,
            results,
            evaluated_at: now(),
        }
    }

    pub fn critical_count(&self) -> usize {
        self.violations.iter().filter(|v| v.is_critical()).count()
    }

    pub fn has_critical(&self) -> bool {
        self.critical_count() > 0
    }

    pub fn result_for(&self, principle: Principle) -> Option<&ValidationResult> {
        self.results.iter().find(|r| r.principle == principle)
    }

    pub fn score_for(&self, principle: Principle) -> Option<f64> {
        self.result_for(principle).map(|r| r.score)
    }

    pub fn violations_for(&self, principle: Principle) -> impl Iterator<Item = &Violation> {
        self.violations
            .iter()
            .filter(move |v| v.principle == principle)
    }

    /// Highest-severity violation, if any
    pub fn worst_violation(&self) -> Option<&Violation> {
        self.violations.iter().max_by_key(|v| v.severity)
    }

    /// Human-readable account of why the action passed or was blocked
    pub fn explain(&self) -> String {
        let mut out = String::new();
        let status = if self.passed { "PASSED" } else { "BLOCKED" };
        let _ = writeln!(
            out,
            "{} (score {:.2}, threshold {:.2}, {} critical)",
            status,
            self.overall_score,
            self.threshold,
            self.critical_count()
        );
        for result in &self.results {
            let _ = writeln!(
                out,
                "  {:<20} {:.2} {}",
                result.principle.name(),
                result.score,
                if result.passed { "ok" } else { "fail" }
            );
            for violation in &result.violations {
                let location = violation
                    .location
                    .map(|l| format!(" at {}", l))
                    .unwrap_or_default();
                let _ = writeln!(
                    out,
                    "    [{}] {}{}: {}",
                    violation.severity, violation.rule, location, violation.message
                );
                if let Some(fix) = &violation.suggested_fix {
                    let _ = writeln!(out, "      fix: {}", fix);
                }
            }
        }
        out
    }
}
