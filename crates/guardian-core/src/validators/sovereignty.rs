//! User sovereignty: destructive or outbound operations need the user's say-so

use super::{catalog, facts_or_fail, Findings, Validator};
use crate::action::{context_keys, Action};
use crate::analysis::patterns::{has_consent_note, SHELL_EXEC};
use crate::analysis::shell::{self, ShellSegment};
use crate::analysis::{CallFact, SourceLanguage};
use crate::config::{CompiledOperation, DangerCategory, GuardianConfig};
use crate::error::ValidationError;
use crate::types::{Location, Principle, Severity};
use crate::verdict::ValidationResult;
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    /// Query text that mutates or is assembled at runtime
    static ref RISKY_QUERY: Regex = Regex::new(
        r#"(?i)\b(drop|delete|truncate|alter|update)\b|\bf["']|\+|%|\.format\(|\$\{"#
    ).unwrap();
}

/// A finding before it is attached to a location
struct Judgement {
    severity: Severity,
    rule: &'static str,
    message: String,
    fix: &'static str,
}

/// Everything a judgement depends on besides the segment or call itself
struct Context<'a> {
    catalog: &'a [CompiledOperation],
    network_callees: Regex,
    network_commands: Regex,
    consent: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SovereigntyValidator;

impl Validator for SovereigntyValidator {
    fn principle(&self) -> Principle {
        Principle::UserSovereignty
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
        let catalog = catalog(self.principle(), config)?;
        let (network_callees, network_commands) =
            config
                .compile_network_patterns()
                .map_err(|e| ValidationError::Failed {
                    principle: self.principle().to_string(),
                    reason: e.to_string(),
                })?;
        let context = Context {
            catalog: &catalog,
            network_callees,
            network_commands,
            consent: action.context().flag(context_keys::NETWORK_CONSENT)
                || has_consent_note(action.content()),
        };
        let mut findings = Findings::new(self.principle());

        if facts.language == SourceLanguage::Shell {
            let confirmed = action.context().flag(context_keys::USER_CONFIRMED);
            judge_shell(action.content(), confirmed, None, &context, &mut findings);
        } else {
            for (call, at) in facts.calls() {
                if call.in_test_scope {
                    continue;
                }
                if let Some(judgement) = judge_call(call, &context) {
                    findings.add(
                        judgement.severity,
                        judgement.rule,
                        judgement.message,
                        Some(at),
                        Some(judgement.fix),
                    );
                }
                if SHELL_EXEC.is_match(&call.callee) {
                    for command in &call.string_args {
                        judge_shell(command, call.guarded, Some(at), &context, &mut findings);
                    }
                }
            }
        }

        Ok(findings.finish(config, &facts))
    }
}

/// Shell content; `at` pins every finding to the call site that runs it
fn judge_shell(
    content: &str,
    guarded: bool,
    at: Option<Location>,
    context: &Context<'_>,
    findings: &mut Findings,
) {
    if shell::is_fork_bomb(content) {
        findings.add(
            Severity::Critical,
            "catastrophic-operation",
            "fork bomb exhausts the process table",
            at.or(Some(Location::line(1))),
            Some("remove the command"),
        );
        return;
    }
    for segment in shell::segments(content) {
        if let Some(judgement) = judge_segment(&segment, guarded, context) {
            findings.add(
                judgement.severity,
                judgement.rule,
                judgement.message,
                at.or(Some(Location::new(segment.line, segment.column))),
                Some(judgement.fix),
            );
        }
    }
}

/// The most severe finding for one simple command
fn judge_segment(segment: &ShellSegment, guarded: bool, context: &Context<'_>) -> Option<Judgement> {
    if shell::is_catastrophic_delete(segment) {
        return Some(Judgement {
            severity: Severity::Critical,
            rule: "catastrophic-operation",
            message: format!("`{}` deletes a system or home root", segment.text),
            fix: "remove the command; target a specific project directory instead",
        });
    }

    let guarded = guarded || segment.gated || segment.is_interactive();
    let mut judgements = Vec::new();
    if !guarded {
        judgements.extend(
            context
                .catalog
                .iter()
                .filter(|op| op.command.as_ref().map_or(false, |re| re.is_match(&segment.text)))
                .map(|op| {
                    destructive(
                        &op.operation.name,
                        op.operation.severity,
                        &segment.text,
                        op.operation.category,
                    )
                }),
        );
    }
    if !context.consent && context.network_commands.is_match(&segment.text) {
        judgements.push(network(&segment.text));
    }
    judgements.into_iter().max_by_key(|j| j.severity)
}

fn judge_call(call: &CallFact, context: &Context<'_>) -> Option<Judgement> {
    let mut judgements = Vec::new();
    if !call.guarded {
        for op in context.catalog {
            let Some(callee) = &op.callee else { continue };
            if !callee.is_match(&call.callee) {
                continue;
            }
            if op.operation.category == DangerCategory::RawQuery
                && !RISKY_QUERY.is_match(&call.arguments)
            {
                continue;
            }
            judgements.push(destructive(
                &op.operation.name,
                op.operation.severity,
                &call.callee,
                op.operation.category,
            ));
        }
    }
    if !context.consent && context.network_callees.is_match(&call.callee) {
        judgements.push(network(&call.callee));
    }
    judgements.into_iter().max_by_key(|j| j.severity)
}

fn destructive(name: &str, severity: Severity, what: &str, category: DangerCategory) -> Judgement {
    let fix = match category {
        DangerCategory::RecursiveDelete => "ask for confirmation first, e.g. `rm -ri` or a confirm() guard",
        DangerCategory::RawQuery => "use parameterized queries behind an explicit confirmation",
        DangerCategory::ForcePush => "use `--force-with-lease` after confirming with the user",
        DangerCategory::PermissionBlanket => "grant the narrowest permissions needed, e.g. 755",
        DangerCategory::ProcessKill | DangerCategory::DiskFormat | DangerCategory::HistoryRewrite => {
            "guard the operation behind an explicit user confirmation"
        }
    };
    Judgement {
        severity,
        rule: "unconfirmed-destructive-operation",
        message: format!("`{}` ({}) runs without user confirmation", what, name),
        fix,
    }
}

fn network(what: &str) -> Judgement {
    Judgement {
        severity: Severity::Medium,
        rule: "undocumented-network-consent",
        message: format!("`{}` reaches the network without documented consent", what),
        fix: "record the user's consent for outbound traffic",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validators::test_support::{rules, run};

    fn python(source: &str) -> Action {
        Action::code(source).with_context(context_keys::LANGUAGE, "python")
    }

    #[test]
    fn test_root_delete_is_one_critical() {
        let result = run(&SovereigntyValidator, &Action::shell("rm -rf /"));
        assert_eq!(result.violations.len(), 1);
        assert_eq!(result.violations[0].severity, Severity::Critical);
        assert_eq!(result.violations[0].rule, "catastrophic-operation");
        assert_eq!(result.score, 0.0);
    }

    #[test]
    fn test_project_delete_needs_confirmation() {
        let action = Action::shell("rm -rf build/");
        let result = run(&SovereigntyValidator, &action);
        assert_eq!(rules(&result), vec!["unconfirmed-destructive-operation"]);
        assert_eq!(result.violations[0].severity, Severity::High);

        let confirmed = Action::shell("rm -rf build/").with_context(context_keys::USER_CONFIRMED, true);
        assert!(run(&SovereigntyValidator, &confirmed).violations.is_empty());
        assert!(run(&SovereigntyValidator, &Action::shell("rm -ri build/")).violations.is_empty());
    }

    #[test]
    fn test_one_finding_per_segment() {
        let result = run(
            &SovereigntyValidator,
            &Action::shell("git push --force origin main && curl https://example.org/hook"),
        );
        assert_eq!(
            rules(&result),
            vec!["unconfirmed-destructive-operation", "undocumented-network-consent"]
        );
    }

    #[test]
    fn test_guarded_rmtree_passes() {
        let guarded = "import shutil\n\n\ndef wipe(path, confirmed):\n    if confirmed:\n        shutil.rmtree(path)\n";
        assert!(run(&SovereigntyValidator, &python(guarded)).violations.is_empty());

        let unguarded = "import shutil\n\n\ndef wipe(path):\n    shutil.rmtree(path)\n";
        assert_eq!(
            rules(&run(&SovereigntyValidator, &python(unguarded))),
            vec!["unconfirmed-destructive-operation"]
        );
    }

    #[test]
    fn test_raw_query_only_when_risky() {
        let safe = "def get(cur, uid):\n    cur.execute(\"SELECT * FROM users WHERE id = ?\", (uid,))\n";
        assert!(run(&SovereigntyValidator, &python(safe)).violations.is_empty());

        let risky = "def drop(cur, table):\n    cur.execute(f\"DROP TABLE {table}\")\n";
        assert_eq!(run(&SovereigntyValidator, &python(risky)).violations.len(), 1);
    }

    #[test]
    fn test_shell_strings_inside_code() {
        let source = "import os\n\n\ndef nuke():\n    os.system(\"rm -rf /\")\n";
        let result = run(&SovereigntyValidator, &python(source));
        assert_eq!(result.critical_count(), 1);
        assert_eq!(result.violations[0].location, Some(Location::new(5, 5)));
    }

    #[test]
    fn test_network_consent() {
        let source = "import requests\n\n\ndef ping(url):\n    return requests.get(url)\n";
        assert_eq!(
            rules(&run(&SovereigntyValidator, &python(source))),
            vec!["undocumented-network-consent"]
        );
        let consented = python(source).with_context(context_keys::NETWORK_CONSENT, true);
        assert!(run(&SovereigntyValidator, &consented).violations.is_empty());
    }

    #[test]
    fn test_consent_note_must_grant_consent() {
        let noted = "import requests


# guardian: consent
def ping(url):
    return requests.get(url)
";
        assert!(run(&SovereigntyValidator, &python(noted)).violations.is_empty());

        let denied = "import requests


# the user did not give consent
def ping(url):
    return requests.get(url)
";
        assert_eq!(
            rules(&run(&SovereigntyValidator, &python(denied))),
            vec!["undocumented-network-consent"]
        );
    }

    #[test]
    fn test_negated_or_else_branch_confirmation_is_not_a_guard() {
        let sources = [
            "import shutil


def wipe(path, confirmed):
    if not confirmed:
        shutil.rmtree(path)
",
            "import shutil


def wipe(path, force):
    if force:
        shutil.rmtree(path)
",
            "import shutil


def wipe(path, confirmed):
    if confirmed == False:
        shutil.rmtree(path)
",
            "import shutil


def wipe(path, confirmed):
    if confirmed:
        print(path)
    else:
        shutil.rmtree(path)
",
        ];
        for source in sources {
            assert_eq!(
                rules(&run(&SovereigntyValidator, &python(source))),
                vec!["unconfirmed-destructive-operation"],
                "{}",
                source
            );
        }

        let guard_clause = "import shutil


def wipe(path, approved):
    if not approved:
        return
    shutil.rmtree(path)
";
        assert!(run(&SovereigntyValidator, &python(guard_clause)).violations.is_empty());
    }

    #[test]
    fn test_shell_tests_and_loose_separators_do_not_gate() {
        for command in [
            "[ -d build ] && rm -rf build/",
            "test 1; rm -rf build/",
            "read -p 'sure?' ok; rm -rf build/",
            "read -p 'sure?' ok || rm -rf build/",
        ] {
            assert_eq!(
                rules(&run(&SovereigntyValidator, &Action::shell(command))),
                vec!["unconfirmed-destructive-operation"],
                "{}",
                command
            );
        }
        let prompted = Action::shell("read -p 'sure?' ok && [ \"$ok\" = y ] && rm -rf build/");
        assert!(run(&SovereigntyValidator, &prompted).violations.is_empty());
    }

    #[test]
    fn test_root_spellings_are_catastrophic() {
        for command in ["rm -rf /.", "rm -rf //", "rm -rf /./", "rm -rf /usr/../", "rm -rf ~/./"] {
            let result = run(&SovereigntyValidator, &Action::shell(command));
            assert_eq!(rules(&result), vec!["catastrophic-operation"], "{}", command);
            assert_eq!(result.critical_count(), 1);
        }
    }
}
