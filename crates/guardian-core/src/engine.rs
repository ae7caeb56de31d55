//! Validation Engine
//!
//! Fans an action out to every enabled validator on the blocking pool,
//! bounds each one by `validator_timeout`, and folds the results into a
//! [`ConstitutionalVerdict`]. A validator that errors, panics or runs out of
//! time costs only its own principle: that principle scores 0.0 with a
//! CRITICAL `validator-failure` violation and the others carry on.

use crate::action::Action;
use crate::config::GuardianConfig;
use crate::error::ValidationError;
use crate::types::Principle;
use crate::validators::{self, Validator};
use crate::verdict::{ConstitutionalVerdict, ValidationResult, VALIDATOR_FAILURE_RULE};
use futures::future::join_all;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinError;
use tokio::time::{error::Elapsed, timeout};
use tracing::{debug, info, warn};

/// Runs the validator table against actions
#[derive(Clone)]
pub struct ValidationEngine {
    validators: Vec<Arc<dyn Validator>>,
}

impl ValidationEngine {
    /// Engine over the built-in validator table
    pub fn new() -> Self {
        Self {
            validators: validators::registry(),
        }
    }

    /// Replace the validator for its principle
    pub fn with_validator(mut self, validator: Arc<dyn Validator>) -> Self {
        let principle = validator.principle();
        match self.validators.iter_mut().find(|v| v.principle() == principle) {
            Some(slot) => *slot = validator,
            None => self.validators.push(validator),
        }
        self
    }

    pub fn principles(&self) -> Vec<Principle> {
        self.validators.iter().map(|v| v.principle()).collect()
    }

    fn enabled<'a>(
        &'a self,
        config: &'a GuardianConfig,
    ) -> impl Iterator<Item = &'a Arc<dyn Validator>> + 'a {
        self.validators
            .iter()
            .filter(move |v| config.is_enabled(v.principle()))
    }

    /// Evaluate an action with every enabled validator running concurrently
    pub async fn evaluate(&self, action: &Action, config: &GuardianConfig) -> ConstitutionalVerdict {
        let started = Instant::now();
        let limit = config.validator_timeout();
        let shared_action = Arc::new(action.clone());
        let shared_config = Arc::new(config.clone());

        let runs = self.enabled(config).map(|validator| {
            let principle = validator.principle();
            let validator = Arc::clone(validator);
            let action = Arc::clone(&shared_action);
            let config = Arc::clone(&shared_config);
            async move {
                let task = tokio::task::spawn_blocking(move || validator.validate(&action, &config));
                let outcome = timeout(limit, task).await;
                settle(principle, outcome, limit.as_millis() as u64)
            }
        });
        let results = join_all(runs).await;

        let verdict = ConstitutionalVerdict::aggregate(action.id(), results, config);
        info!(
            action_id = %action.id(),
            score = verdict.overall_score,
            passed = verdict.passed,
            criticals = verdict.critical_count(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "action evaluated"
        );
        verdict
    }

    /// Evaluate on the calling thread, one validator after another.
    ///
    /// For hosts without a tokio runtime. A validator cannot be preempted
    /// here, so one that overruns `validator_timeout` is failed after it
    /// returns.
    pub fn evaluate_blocking(&self, action: &Action, config: &GuardianConfig) -> ConstitutionalVerdict {
        let limit = config.validator_timeout();
        let results = self
            .enabled(config)
            .map(|validator| {
                let principle = validator.principle();
                let started = Instant::now();
                let outcome = catch_unwind(AssertUnwindSafe(|| validator.validate(action, config)));
                let result = match outcome {
                    Ok(_) if started.elapsed() > limit => Err(ValidationError::TimedOut {
                        principle: principle.to_string(),
                        timeout_ms: limit.as_millis() as u64,
                    }),
                    Ok(result) => result,
                    Err(_) => Err(ValidationError::Panicked {
                        principle: principle.to_string(),
                    }),
                };
                recover(principle, result)
            })
            .collect();
        ConstitutionalVerdict::aggregate(action.id(), results, config)
    }
}

impl Default for ValidationEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ValidationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidationEngine")
            .field("principles", &self.principles())
            .finish()
    }
}

/// Collapse the nested outcome of a timed, spawned validator run
fn settle(
    principle: Principle,
    outcome: Result<Result<Result<ValidationResult, ValidationError>, JoinError>, Elapsed>,
    timeout_ms: u64,
) -> ValidationResult {
    let result = match outcome {
        Ok(Ok(result)) => result,
        Ok(Err(join_error)) => Err(if join_error.is_panic() {
            ValidationError::Panicked {
                principle: principle.to_string(),
            }
        } else {
            ValidationError::Failed {
                principle: principle.to_string(),
                reason: join_error.to_string(),
            }
        }),
        Err(_) => Err(ValidationError::TimedOut {
            principle: principle.to_string(),
            timeout_ms,
        }),
    };
    recover(principle, result)
}

/// A validator fault becomes a fail-closed result for its principle
fn recover(principle: Principle, result: Result<ValidationResult, ValidationError>) -> ValidationResult {
    match result {
        Ok(result) => {
            debug!(%principle, score = result.score, passed = result.passed, "validator finished");
            result.normalized(principle)
        }
        Err(e) => {
            warn!(%principle, error = %e, "validator failed, scoring principle as 0.0");
            ValidationResult::failed_closed(principle, VALIDATOR_FAILURE_RULE, e.to_string())
        }
    }
}
