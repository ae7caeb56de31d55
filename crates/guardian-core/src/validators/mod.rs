//! Rule validators
//!
//! One stateless validator per [`Principle`]. Validators read the action,
//! reduce it to [`SourceFacts`] and turn findings into [`Violation`]s. A
//! validator never errors on bad input: content that cannot be parsed fails
//! closed with a CRITICAL `unparseable` violation.

mod completeness;
mod efficiency;
mod sovereignty;
mod systemic;
mod transparency;
mod truth;

pub use completeness::CompletenessValidator;
pub use efficiency::EfficiencyValidator;
pub use sovereignty::SovereigntyValidator;
pub use systemic::SystemicImpactValidator;
pub use transparency::TransparencyValidator;
pub use truth::TruthValidator;

use crate::action::{context_keys, Action};
use crate::analysis::{self, patterns, SourceFacts};
use crate::config::{CompiledOperation, GuardianConfig};
use crate::error::ValidationError;
use crate::types::{Location, Principle, Severity};
use crate::verdict::{ValidationResult, Violation, UNPARSEABLE_RULE};
use std::sync::Arc;

/// A rule category check
pub trait Validator: Send + Sync {
    fn principle(&self) -> Principle;

    /// Judge an action. `Err` signals a fault in the validator itself.
    fn validate(
        &self,
        action: &Action,
        config: &GuardianConfig,
    ) -> Result<ValidationResult, ValidationError>;
}

/// Built-in validator for a principle
pub fn builtin(principle: Principle) -> Arc<dyn Validator> {
    match principle {
        Principle::Completeness => Arc::new(CompletenessValidator),
        Principle::Transparency => Arc::new(TransparencyValidator),
        Principle::Truth => Arc::new(TruthValidator),
        Principle::UserSovereignty => Arc::new(SovereigntyValidator),
        Principle::SystemicImpact => Arc::new(SystemicImpactValidator),
        Principle::ResourceEfficiency => Arc::new(EfficiencyValidator),
    }
}

/// The full built-in table, in principle order
pub fn registry() -> Vec<Arc<dyn Validator>> {
    Principle::ALL.iter().copied().map(builtin).collect()
}

/// Facts for an action, or the fail-closed result when its content cannot be parsed
pub(crate) fn facts_or_fail(
    principle: Principle,
    action: &Action,
) -> Result<SourceFacts, ValidationResult> {
    analysis::inspect(action).map_err(|e| {
        tracing::debug!(%principle, action_id = %action.id(), error = %e, "content unparseable");
        ValidationResult::failed_closed(principle, UNPARSEABLE_RULE, e.to_string())
    })
}

/// Test code by declaration: the `test_scope` flag or a test target path
pub(crate) fn is_test_action(action: &Action) -> bool {
    action.context().flag(context_keys::TEST_SCOPE)
        || action
            .context()
            .strings(context_keys::TARGET_FILES)
            .iter()
            .any(|path| patterns::is_test_path(path))
}

/// Compiled dangerous-operation catalog; a bad pattern is a validator fault
pub(crate) fn catalog(
    principle: Principle,
    config: &GuardianConfig,
) -> Result<Vec<CompiledOperation>, ValidationError> {
    config
        .compile_catalog()
        .map_err(|e| ValidationError::Failed {
            principle: principle.to_string(),
            reason: e.to_string(),
        })
}

/// Line spans of functions satisfying a predicate
pub(crate) fn function_spans(
    facts: &SourceFacts,
    predicate: impl Fn(&analysis::FunctionFact) -> bool,
) -> Vec<(usize, usize)> {
    facts
        .functions()
        .filter(|(function, _)| predicate(function))
        .map(|(function, at)| (at.line, at.line + function.line_count.saturating_sub(1)))
        .collect()
}

pub(crate) fn within(spans: &[(usize, usize)], line: usize) -> bool {
    spans.iter().any(|(start, end)| (*start..=*end).contains(&line))
}

/// Collects violations for one principle
pub(crate) struct Findings {
    principle: Principle,
    violations: Vec<Violation>,
}

impl Findings {
    pub fn new(principle: Principle) -> Self {
        Self {
            principle,
            violations: Vec::new(),
        }
    }

    pub fn add(
        &mut self,
        severity: Severity,
        rule: &str,
        message: impl Into<String>,
        location: Option<Location>,
        fix: Option<&str>,
    ) {
        let mut violation = Violation::new(self.principle, severity, rule, message);
        violation.location = location;
        violation.suggested_fix = fix.map(str::to_string);
        self.violations.push(violation);
    }

    pub fn finish(self, config: &GuardianConfig, facts: &SourceFacts) -> ValidationResult {
        ValidationResult::from_violations(self.principle, self.violations, config)
            .with_metadata("language", facts.language.to_string())
            .with_metadata("lines", facts.line_count)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn rules(result: &ValidationResult) -> Vec<&str> {
        result.violations.iter().map(|v| v.rule.as_str()).collect()
    }

    pub fn run(validator: &dyn Validator, action: &Action) -> ValidationResult {
        validator
            .validate(action, &GuardianConfig::default())
            .expect("built-in validators do not error")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_covers_every_principle() {
        let principles: Vec<Principle> = registry().iter().map(|v| v.principle()).collect();
        assert_eq!(principles, Principle::ALL.to_vec());
    }

    #[test]
    fn test_unparseable_content_fails_closed_everywhere() {
        let action = Action::code("def broken(:\n    pass\n").with_context(context_keys::LANGUAGE, "python");
        for validator in registry() {
            let result = validator.validate(&action, &GuardianConfig::default()).unwrap();
            assert!(!result.passed, "{} passed", validator.principle());
            assert_eq!(result.score, 0.0);
            assert_eq!(result.violations[0].severity, Severity::Critical);
            assert_eq!(result.violations[0].rule, UNPARSEABLE_RULE);
        }
    }

    #[test]
    fn test_test_scope_from_flag_or_path() {
        assert!(is_test_action(&Action::code("x").with_context(context_keys::TEST_SCOPE, true)));
        assert!(is_test_action(&Action::file_edit("tests/test_api.py", "x = 1")));
        assert!(!is_test_action(&Action::file_edit("src/api.py", "x = 1")));
    }
}
