//! Systemic impact: what else breaks when this lands?

use super::{facts_or_fail, is_test_action, Findings, Validator};
use crate::action::{context_keys, Action, ActionType};
use crate::analysis::patterns::{DEPENDENCY_COMMAND, IMPACT_NOTE};
use crate::analysis::{self, shell, GlobalKind, Pattern, SourceFacts, SourceLanguage};
use crate::config::GuardianConfig;
use crate::error::ValidationError;
use crate::types::{Location, Principle, Severity};
use crate::verdict::ValidationResult;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemicImpactValidator;

impl Validator for SystemicImpactValidator {
    fn principle(&self) -> Principle {
        Principle::SystemicImpact
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
        let context = action.context();
        let impact_documented =
            context.has_text(context_keys::IMPACT_ANALYSIS) || IMPACT_NOTE.is_match(action.content());
        let previous = context.str(context_keys::PREVIOUS_CONTENT);

        let edits_existing = *action.action_type() == ActionType::FileEdit || previous.is_some();
        if edits_existing && !impact_documented {
            findings.add(
                Severity::Medium,
                "missing-impact-analysis",
                "edit of existing code without a documented impact analysis",
                None,
                Some("state which callers and modules the change affects"),
            );
        }

        if facts.language == SourceLanguage::Shell && !impact_documented {
            for segment in shell::segments(action.content()) {
                if DEPENDENCY_COMMAND.is_match(&segment.text) {
                    findings.add(
                        Severity::Medium,
                        "undocumented-dependency-change",
                        format!("`{}` changes dependencies without an impact analysis", segment.text),
                        Some(Location::new(segment.line, segment.column)),
                        Some("document why the dependency changes and what depends on it"),
                    );
                }
            }
        }

        if let Some(previous) = previous.filter(|_| facts.language.is_structural()) {
            breaking_changes(previous, &facts, &mut findings);
        }

        if !is_test_action(action) {
            shared_state(&facts, &mut findings);
        }

        Ok(findings.finish(config, &facts))
    }
}

/// Public functions that disappeared or changed arity
fn breaking_changes(previous: &str, current: &SourceFacts, findings: &mut Findings) {
    let before = match analysis::analyze(previous, current.language) {
        Ok(facts) => facts,
        Err(e) => {
            tracing::debug!(error = %e, "previous content unparseable, skipping signature comparison");
            return;
        }
    };
    let now: BTreeMap<&str, (usize, Location)> = current
        .functions()
        .filter(|(f, _)| f.public && !f.in_test_scope)
        .map(|(f, at)| (f.name.as_str(), (f.params.len(), at)))
        .collect();

    for (old, _) in before.functions().filter(|(f, _)| f.public && !f.in_test_scope) {
        match now.get(old.name.as_str()) {
            None => findings.add(
                Severity::High,
                "breaking-removal",
                format!("public function `{}` was removed", old.name),
                None,
                Some("keep a deprecated shim or update every caller"),
            ),
            Some((arity, at)) if *arity != old.params.len() => findings.add(
                Severity::High,
                "breaking-signature-change",
                format!(
                    "`{}` went from {} to {} parameters",
                    old.name,
                    old.params.len(),
                    arity
                ),
                Some(*at),
                Some("add new parameters with defaults or update every caller"),
            ),
            Some(_) => {}
        }
    }
}

fn shared_state(facts: &SourceFacts, findings: &mut Findings) {
    for finding in &facts.findings {
        let Pattern::MutableGlobal { name, kind } = &finding.pattern else {
            continue;
        };
        if facts.in_test_scope(finding.location.line) {
            continue;
        }
        let severity = match kind {
            GlobalKind::StaticMut => Severity::High,
            GlobalKind::MutableLiteral | GlobalKind::GlobalStatement => Severity::Medium,
            GlobalKind::SyncStatic => Severity::Low,
        };
        findings.add(
            severity,
            "shared-mutable-state",
            format!("`{}` is mutable state shared across the module", name),
            Some(finding.location),
            Some("pass state explicitly or encapsulate it"),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validators::test_support::{rules, run};

    #[test]
    fn test_file_edit_needs_impact_analysis() {
        let edit = Action::file_edit("src/calc.py", "def add(a, b):\n    return a + b\n");
        assert_eq!(rules(&run(&SystemicImpactValidator, &edit)), vec!["missing-impact-analysis"]);

        let documented = edit.with_context(context_keys::IMPACT_ANALYSIS, "only used by cli.py");
        assert!(run(&SystemicImpactValidator, &documented).violations.is_empty());
    }

    #[test]
    fn test_breaking_changes_against_previous_content() {
        let action = Action::file_edit("src/calc.py", "def add(a, b, c):\n    return a + b + c\n")
            .with_context(
                context_keys::PREVIOUS_CONTENT,
                "def add(a, b):\n    return a + b\n\n\ndef sub(a, b):\n    return a - b\n",
            )
            .with_context(context_keys::IMPACT_ANALYSIS, "callers in cli.py updated");
        let result = run(&SystemicImpactValidator, &action);
        let mut rules = rules(&result);
        rules.sort_unstable();
        assert_eq!(rules, vec!["breaking-removal", "breaking-signature-change"]);
        assert!(!result.passed);
    }

    #[test]
    fn test_dependency_commands() {
        let result = run(&SystemicImpactValidator, &Action::shell("pip install requests && pytest"));
        assert_eq!(rules(&result), vec!["undocumented-dependency-change"]);
    }

    #[test]
    fn test_shared_mutable_state() {
        let python = Action::code("cache = {}\nLIMITS = [1, 2]\n")
            .with_context(context_keys::LANGUAGE, "python");
        assert_eq!(rules(&run(&SystemicImpactValidator, &python)), vec!["shared-mutable-state"]);

        let rust = Action::code("static mut COUNT: u32 = 0;\n").with_context(context_keys::LANGUAGE, "rust");
        let result = run(&SystemicImpactValidator, &rust);
        assert_eq!(result.violations[0].severity, Severity::High);
    }
}
