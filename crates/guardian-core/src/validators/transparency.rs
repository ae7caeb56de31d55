//! Transparency: can a reader tell what the code promises?

use super::{facts_or_fail, is_test_action, Findings, Validator};
use crate::action::Action;
use crate::analysis::patterns::{CONTRACT_DOC, DEPRECATION_MENTION};
use crate::analysis::Pattern;
use crate::config::GuardianConfig;
use crate::error::ValidationError;
use crate::types::{Principle, Severity};
use crate::verdict::ValidationResult;

/// Error messages shorter than this say nothing useful
const MIN_MESSAGE_LEN: usize = 8;

#[derive(Debug, Clone, Copy, Default)]
pub struct TransparencyValidator;

impl Validator for TransparencyValidator {
    fn principle(&self) -> Principle {
        Principle::Transparency
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
        let mut findings = Findings::new(self.principle());
        if !facts.language.is_structural() {
            return Ok(findings.finish(config, &facts));
        }
        let test_action = is_test_action(action);

        for (function, at) in facts.functions() {
            if !function.public || function.in_test_scope || function.is_dunder() {
                continue;
            }
            if !function.is_documented() {
                findings.add(
                    Severity::Low,
                    "undocumented-public-function",
                    format!("public function `{}` has no documentation", function.name),
                    Some(at),
                    Some("describe what the function does"),
                );
            }
            let doc = function.doc.as_deref().unwrap_or("");
            if !function.annotated && !CONTRACT_DOC.is_match(doc) {
                findings.add(
                    Severity::Low,
                    "undeclared-contract",
                    format!(
                        "`{}` declares neither types nor documented arguments and return value",
                        function.name
                    ),
                    Some(at),
                    Some("add type annotations or document arguments and return value"),
                );
            }
            if DEPRECATION_MENTION.is_match(doc) && !function.deprecated {
                findings.add(
                    Severity::Medium,
                    "undeclared-deprecation",
                    format!("`{}` is described as deprecated but not marked so", function.name),
                    Some(at),
                    Some("mark the deprecation so callers are warned"),
                );
            }
        }

        if facts.line_count >= config.version_marker_min_lines
            && !facts.has(|p| matches!(p, Pattern::VersionMarker))
        {
            findings.add(
                Severity::Low,
                "missing-version-marker",
                format!("{}-line module carries no version marker", facts.line_count),
                None,
                Some("record the module version"),
            );
        }

        for finding in &facts.findings {
            let Pattern::Raise {
                exception,
                message,
                literal,
            } = &finding.pattern
            else {
                continue;
            };
            if test_action || facts.in_test_scope(finding.location.line) {
                continue;
            }
            let vague = match message {
                None => true,
                Some(text) => *literal && text.trim().len() < MIN_MESSAGE_LEN,
            };
            if vague {
                findings.add(
                    Severity::Low,
                    "vague-error-message",
                    format!("`{}` is raised without a descriptive message", exception),
                    Some(finding.location),
                    Some("say what failed and with which input"),
                );
            }
        }

        Ok(findings.finish(config, &facts))
    }
}
