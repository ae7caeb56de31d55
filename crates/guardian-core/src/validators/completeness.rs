//! Completeness: is the work actually finished?

use super::{catalog, facts_or_fail, function_spans, is_test_action, within, Findings, Validator};
use crate::action::{Action, ActionType};
use crate::analysis::patterns::{scan_lines, FALLIBLE_CALL, INCOMPLETE_MARKER, NOT_IMPLEMENTED};
use crate::analysis::{Pattern, SourceFacts};
use crate::config::GuardianConfig;
use crate::error::ValidationError;
use crate::types::{Principle, Severity};
use crate::verdict::ValidationResult;

#[derive(Debug, Clone, Copy, Default)]
pub struct CompletenessValidator;

impl Validator for CompletenessValidator {
    fn principle(&self) -> Principle {
        Principle::Completeness
    }

    fn validate(
        &self,
        action: &Action,
        config: &GuardianConfig,
    ) -> Result<ValidationResult, ValidationError> {
        let facts = match facts_or_fail(self.principle(), action) {
            Ok(facts) => facts,
            Err(failed) => return Ok(failed),
        };
        let test_action = is_test_action(action);
        let mut findings = Findings::new(self.principle());

        markers(action.content(), &facts, test_action, &mut findings);
        error_handling(&facts, test_action, &mut findings);

        for operation in catalog(self.principle(), config)? {
            let Some(callee) = &operation.callee else { continue };
            for (call, at) in facts.calls() {
                if callee.is_match(&call.callee) && !call.in_try && !call.in_test_scope {
                    findings.add(
                        Severity::Medium,
                        "unhandled-destructive-path",
                        format!(
                            "`{}` ({}) runs without handling its failure",
                            call.callee, operation.operation.name
                        ),
                        Some(at),
                        Some("wrap the call in error handling and report partial failure"),
                    );
                }
            }
        }

        if facts.language.is_structural() {
            coverage(action, &facts, test_action, &mut findings);
        }

        Ok(findings.finish(config, &facts))
    }
}

fn markers(content: &str, facts: &SourceFacts, test_action: bool, findings: &mut Findings) {
    for (at, marker) in scan_lines(content, &INCOMPLETE_MARKER) {
        findings.add(
            Severity::Medium,
            "incomplete-marker",
            format!("`{}` marker left in content", marker),
            Some(at),
            Some("finish the work or remove the marker"),
        );
    }

    let abstract_spans = function_spans(facts, |f| f.abstract_like);
    for (at, text) in scan_lines(content, &NOT_IMPLEMENTED) {
        if within(&abstract_spans, at.line) || test_action || facts.in_test_scope(at.line) {
            continue;
        }
        findings.add(
            Severity::High,
            "not-implemented",
            format!("`{}` leaves behaviour unimplemented", text),
            Some(at),
            Some("implement the behaviour"),
        );
    }
}

fn error_handling(facts: &SourceFacts, test_action: bool, findings: &mut Findings) {
    let handling: Vec<&str> = facts
        .functions()
        .filter(|(f, _)| f.handles_errors)
        .map(|(f, _)| f.name.as_str())
        .collect();

    for (call, at) in facts.calls() {
        if !FALLIBLE_CALL.is_match(&call.callee) || call.in_try || call.in_test_scope || test_action {
            continue;
        }
        let handled = call
            .enclosing_function
            .as_deref()
            .map_or(false, |name| handling.contains(&name));
        if !handled {
            findings.add(
                Severity::Medium,
                "missing-error-handling",
                format!("`{}` can fail and nothing handles it", call.callee),
                Some(at),
                Some("handle or propagate the error explicitly"),
            );
        }
    }

    for finding in &facts.findings {
        match finding.pattern {
            Pattern::SwallowedError => findings.add(
                Severity::Medium,
                "swallowed-error",
                "error handler discards the error",
                Some(finding.location),
                Some("log, re-raise or return the error"),
            ),
            Pattern::BareExcept => findings.add(
                Severity::Low,
                "bare-except",
                "handler catches every exception",
                Some(finding.location),
                Some("catch the specific exception types"),
            ),
            Pattern::Unwrap {
                ref method,
                in_test_scope,
            } if !in_test_scope && !test_action => findings.add(
                Severity::Low,
                "unwrap-outside-tests",
                format!("`.{}()` panics instead of handling the error", method),
                Some(finding.location),
                Some("propagate with `?` or handle the error"),
            ),
            _ => {}
        }
    }
}

/// Tests and documentation for generated code
fn coverage(action: &Action, facts: &SourceFacts, test_action: bool, findings: &mut Findings) {
    let implemented = facts
        .functions()
        .any(|(f, _)| f.public && f.stub.is_none() && !f.in_test_scope);
    if *action.action_type() == ActionType::CodeGeneration
        && implemented
        && !test_action
        && !facts.has_tests()
    {
        findings.add(
            Severity::Medium,
            "missing-tests",
            "generated code ships without tests",
            None,
            Some("add tests covering the public functions"),
        );
    }

    let has_functions = facts.functions().next().is_some();
    let documented = facts.has(|p| matches!(p, Pattern::ModuleDoc))
        || facts.functions().any(|(f, _)| f.is_documented());
    if has_functions && !documented {
        findings.add(
            Severity::Low,
            "missing-docs",
            "no module or function documentation",
            None,
            Some("document what the module provides"),
        );
    }
}
