//! Fix catalog for auto-correction
//!
//! A small, fixed set of textual rewrites that turn a blocked action into a
//! safer one. Rewrites are line-local. Content that deletes a system root or
//! forks without bound is never rewritten: there is no safe version of it.

use guardian_core::analysis::patterns::LOCAL_HOST;
use guardian_core::analysis::{shell, SourceLanguage};
use guardian_core::Action;
use lazy_static::lazy_static;
use regex::{Captures, Regex};
use std::fmt::Write as _;
use tracing::debug;

lazy_static! {
    static ref RECURSIVE_RM: Regex =
        Regex::new(r"(?m)(\bgit[ \t]+)?\brm((?:[ \t]+-[a-zA-Z]+)+)").unwrap();
    static ref CHMOD_777: Regex = Regex::new(r"(?m)\bchmod([ \t]+-R)?[ \t]+0?777\b").unwrap();
    static ref FORCE_PUSH: Regex =
        Regex::new(r"(?m)(\bgit[ \t]+push\b[^\n;&|]*?[ \t])(--force|-f)([ \t]|$)").unwrap();
    static ref PLAIN_HTTP: Regex = Regex::new(r#"\bhttp://[^\s'"<>)`]+"#).unwrap();
    static ref BARE_EXCEPT: Regex = Regex::new(r"(?m)^([ \t]*)except[ \t]*:").unwrap();
    static ref PASSWORD_LITERAL: Regex = Regex::new(
        r#"(?mi)^([ \t]*)([a-z0-9_]*(?:password|passwd|secret|api_?key|token)[a-z0-9_]*)[ \t]*=[ \t]*['"][^'"\n]{4,}['"]"#
    )
    .unwrap();
    static ref IMPORT_OS: Regex = Regex::new(r"(?m)^import os\s*$").unwrap();
    static ref STRING_LITERAL: Regex = Regex::new(r#""([^"\n]*)"|'([^'\n]*)'"#).unwrap();
}

/// Content a rewrite applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    Shell,
    Python,
    Any,
}

#[derive(Clone, Copy)]
struct Rewrite {
    rule: &'static str,
    scope: Scope,
    apply: fn(&str) -> String,
}

/// A corrected action with what changed
#[derive(Debug, Clone)]
pub struct Correction {
    /// Derived from the original, with a fresh id
    pub action: Action,
    pub rules: Vec<&'static str>,
    pub diff: String,
}

impl Correction {
    pub fn rule_names(&self) -> Vec<String> {
        self.rules.iter().map(|rule| rule.to_string()).collect()
    }
}

#[derive(Clone)]
pub struct FixCatalog {
    rewrites: Vec<Rewrite>,
}

impl std::fmt::Debug for FixCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixCatalog")
            .field("rules", &self.rules())
            .finish()
    }
}

impl Default for FixCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

impl FixCatalog {
    pub fn builtin() -> Self {
        Self {
            rewrites: vec![
                Rewrite {
                    rule: "interactive-delete",
                    scope: Scope::Shell,
                    apply: interactive_delete,
                },
                Rewrite {
                    rule: "narrow-permissions",
                    scope: Scope::Shell,
                    apply: narrow_permissions,
                },
                Rewrite {
                    rule: "force-with-lease",
                    scope: Scope::Shell,
                    apply: force_with_lease,
                },
                Rewrite {
                    rule: "https-endpoint",
                    scope: Scope::Any,
                    apply: https_endpoint,
                },
                Rewrite {
                    rule: "specific-except",
                    scope: Scope::Python,
                    apply: specific_except,
                },
                Rewrite {
                    rule: "secret-from-environment",
                    scope: Scope::Python,
                    apply: secret_from_environment,
                },
            ],
        }
    }

    /// Rule names in the order they are applied
    pub fn rules(&self) -> Vec<&'static str> {
        self.rewrites.iter().map(|r| r.rule).collect()
    }

    /// Apply every rewrite that fits the action's language.
    ///
    /// `None` when nothing changed or the content is beyond repair.
    pub fn correct(&self, action: &Action) -> Option<Correction> {
        let content = action.content();
        if is_unfixable(content) {
            debug!(action_id = %action.id(), "content is beyond the fix catalog");
            return None;
        }
        let language = SourceLanguage::detect(action);

        let mut corrected = content.to_string();
        let mut rules = Vec::new();
        for rewrite in &self.rewrites {
            let applies = match rewrite.scope {
                Scope::Shell => language == SourceLanguage::Shell,
                Scope::Python => language == SourceLanguage::Python,
                Scope::Any => true,
            };
            if !applies {
                continue;
            }
            let next = (rewrite.apply)(&corrected);
            if next != corrected {
                rules.push(rewrite.rule);
                corrected = next;
            }
        }
        if rules.is_empty() {
            return None;
        }

        Some(Correction {
            diff: line_diff(content, &corrected),
            action: action.derive_with_content(corrected),
            rules,
        })
    }
}

/// Fork bombs and root deletions, in the content or in any string literal of it
fn is_unfixable(content: &str) -> bool {
    let catastrophic = |text: &str| {
        shell::is_fork_bomb(text) || shell::segments(text).iter().any(shell::is_catastrophic_delete)
    };
    catastrophic(content)
        || STRING_LITERAL.captures_iter(content).any(|caps| {
            caps.get(1)
                .or_else(|| caps.get(2))
                .map_or(false, |literal| catastrophic(literal.as_str()))
        })
}

/// `rm -rf x` becomes `rm -ri x`: force is dropped, interactive added.
/// `git rm` has no interactive flag and is left alone.
fn interactive_delete(content: &str) -> String {
    RECURSIVE_RM
        .replace_all(content, |caps: &Captures<'_>| {
            if caps.get(1).is_some() {
                return caps[0].to_string();
            }
            let flags: String = caps[2]
                .split_whitespace()
                .flat_map(|group| group.trim_start_matches('-').chars())
                .collect();
            if !flags.contains(|c: char| c == 'r' || c == 'R') {
                return caps[0].to_string();
            }
            let mut kept: String = flags.chars().filter(|c| *c != 'f').collect();
            if !kept.contains(|c: char| c == 'i' || c == 'I') {
                kept.push('i');
            }
            format!("rm -{}", kept)
        })
        .into_owned()
}

fn narrow_permissions(content: &str) -> String {
    CHMOD_777
        .replace_all(content, |caps: &Captures<'_>| {
            format!("chmod{} 755", caps.get(1).map_or("", |m| m.as_str()))
        })
        .into_owned()
}

fn force_with_lease(content: &str) -> String {
    FORCE_PUSH
        .replace_all(content, "${1}--force-with-lease${3}")
        .into_owned()
}

fn https_endpoint(content: &str) -> String {
    PLAIN_HTTP
        .replace_all(content, |caps: &Captures<'_>| {
            let url = &caps[0];
            if LOCAL_HOST.is_match(url) {
                url.to_string()
            } else {
                format!("https://{}", &url["http://".len()..])
            }
        })
        .into_owned()
}

fn specific_except(content: &str) -> String {
    BARE_EXCEPT
        .replace_all(content, "${1}except Exception:")
        .into_owned()
}

fn secret_from_environment(content: &str) -> String {
    let replaced = PASSWORD_LITERAL.replace_all(content, |caps: &Captures<'_>| {
        format!(
            "{}{} = os.environ[\"{}\"]",
            &caps[1],
            &caps[2],
            caps[2].to_ascii_uppercase()
        )
    });
    if replaced == content || IMPORT_OS.is_match(&replaced) {
        return replaced.into_owned();
    }
    insert_import(&replaced, "import os")
}

/// Insert an import after any shebang and module docstring
fn insert_import(content: &str, import: &str) -> String {
    let lines: Vec<&str> = content.lines().collect();
    let mut at = 0;
    if lines.first().map_or(false, |l| l.starts_with("#!")) {
        at = 1;
    }
    if let Some(first) = lines.get(at) {
        let trimmed = first.trim_start();
        if let Some(quote) = ["\"\"\"", "'''"].into_iter().find(|q| trimmed.starts_with(*q)) {
            let closes_on_first = trimmed[quote.len()..].contains(quote);
            at = if closes_on_first {
                at + 1
            } else {
                lines[at + 1..]
                    .iter()
                    .position(|l| l.contains(quote))
                    .map_or(lines.len(), |offset| at + offset + 2)
            };
        }
    }

    let mut out: Vec<&str> = Vec::with_capacity(lines.len() + 1);
    out.extend_from_slice(&lines[..at]);
    out.push(import);
    out.extend_from_slice(&lines[at..]);
    let mut joined = out.join("\n");
    if content.ends_with('\n') {
        joined.push('\n');
    }
    joined
}

/// Largest changed region, in line pairs, that gets a longest-common-subsequence table
const LCS_CELL_LIMIT: usize = 250_000;

/// Line diff of two texts.
///
/// Shared leading and trailing lines are context. The changed middle is
/// diffed by longest common subsequence while its table stays under
/// [`LCS_CELL_LIMIT`]; past that, equal-length middles are paired line by
/// line and anything else is shown as one removed and one added block.
pub fn line_diff(original: &str, corrected: &str) -> String {
    let a: Vec<&str> = original.lines().collect();
    let b: Vec<&str> = corrected.lines().collect();
    let prefix = a.iter().zip(&b).take_while(|(x, y)| x == y).count();
    let suffix = a[prefix..]
        .iter()
        .rev()
        .zip(b[prefix..].iter().rev())
        .take_while(|(x, y)| x == y)
        .count();
    let (old, new) = (&a[prefix..a.len() - suffix], &b[prefix..b.len() - suffix]);

    let mut diff = String::from("--- original\n+++ corrected\n");
    for line in &a[..prefix] {
        let _ = writeln!(diff, " {}", line);
    }
    if (old.len() + 1).saturating_mul(new.len() + 1) <= LCS_CELL_LIMIT {
        lcs_diff(old, new, &mut diff);
    } else if old.len() == new.len() {
        for (before, after) in old.iter().zip(new) {
            if before == after {
                let _ = writeln!(diff, " {}", before);
            } else {
                let _ = writeln!(diff, "-{}\n+{}", before, after);
            }
        }
    } else {
        for line in old {
            let _ = writeln!(diff, "-{}", line);
        }
        for line in new {
            let _ = writeln!(diff, "+{}", line);
        }
    }
    for line in &a[a.len() - suffix..] {
        let _ = writeln!(diff, " {}", line);
    }
    diff
}

fn lcs_diff(a: &[&str], b: &[&str], diff: &mut String) {
    let mut lcs = vec![vec![0usize; b.len() + 1]; a.len() + 1];
    for i in (0..a.len()).rev() {
        for j in (0..b.len()).rev() {
            lcs[i][j] = if a[i] == b[j] {
                lcs[i + 1][j + 1] + 1
            } else {
                lcs[i + 1][j].max(lcs[i][j + 1])
            };
        }
    }

    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        if a[i] == b[j] {
            let _ = writeln!(diff, " {}", a[i]);
            i += 1;
            j += 1;
        } else if lcs[i + 1][j] >= lcs[i][j + 1] {
            let _ = writeln!(diff, "-{}", a[i]);
            i += 1;
        } else {
            let _ = writeln!(diff, "+{}", b[j]);
            j += 1;
        }
    }
    for line in &a[i..] {
        let _ = writeln!(diff, "-{}", line);
    }
    for line in &b[j..] {
        let _ = writeln!(diff, "+{}", line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use guardian_core::context_keys;

    fn python(source: &str) -> Action {
        Action::code(source).with_context(context_keys::LANGUAGE, "python")
    }

    fn corrected(action: &Action) -> Option<String> {
        FixCatalog::builtin()
            .correct(action)
            .map(|c| c.action.content().to_string())
    }

    #[test]
    fn test_recursive_delete_becomes_interactive() {
        let action = Action::shell("rm -rf build/");
        let correction = FixCatalog::builtin().correct(&action).unwrap();
        assert_eq!(correction.action.content(), "rm -ri build/");
        assert_eq!(correction.rules, vec!["interactive-delete"]);
        assert_eq!(correction.action.derived_from(), Some(action.id()));
        assert!(correction.diff.contains("-rm -rf build/"));
        assert!(correction.diff.contains("+rm -ri build/"));

        assert_eq!(
            corrected(&Action::shell("rm -r -f dist && ls")).as_deref(),
            Some("rm -ri dist && ls")
        );
    }

    #[test]
    fn test_non_recursive_rm_is_left_alone() {
        assert_eq!(corrected(&Action::shell("rm -f out.log")), None);
    }

    #[test]
    fn test_git_rm_is_not_given_an_interactive_flag() {
        assert_eq!(corrected(&Action::shell("git rm -r --cached build/")), None);
        assert_eq!(
            corrected(&Action::shell("git rm -r old/ && rm -rf old/")).as_deref(),
            Some("git rm -r old/ && rm -ri old/")
        );
    }

    #[test]
    fn test_catastrophic_content_is_refused() {
        assert!(corrected(&Action::shell("rm -rf /")).is_none());
        assert!(corrected(&Action::shell("chmod 777 x && rm -rf ~")).is_none());
        assert!(corrected(&Action::shell(":(){ :|:& };:")).is_none());
        assert!(corrected(&python("import os\n\nos.system(\"rm -rf /\")\n")).is_none());
    }

    #[test]
    fn test_shell_rewrites() {
        assert_eq!(
            corrected(&Action::shell("chmod -R 777 public")).as_deref(),
            Some("chmod -R 755 public")
        );
        assert_eq!(
            corrected(&Action::shell("git push --force origin main")).as_deref(),
            Some("git push --force-with-lease origin main")
        );
        assert_eq!(
            corrected(&Action::shell("git push origin main -f")).as_deref(),
            Some("git push origin main --force-with-lease")
        );
        assert_eq!(corrected(&Action::shell("git push --force-with-lease origin main")), None);
    }

    #[test]
    fn test_only_remote_http_is_upgraded() {
        let action = Action::shell("curl http://api.acme.io/v1 http://localhost:8080/health");
        assert_eq!(
            corrected(&action).as_deref(),
            Some("curl https://api.acme.io/v1 http://localhost:8080/health")
        );
    }

    #[test]
    fn test_python_rewrites() {
        let source = "\"\"\"Client.\"\"\"\nimport json\n\npassword = \"hunter22\"\n\ntry:\n    json.loads(\"{}\")\nexcept:\n    raise\n";
        let correction = FixCatalog::builtin().correct(&python(source)).unwrap();
        assert_eq!(
            correction.rules,
            vec!["specific-except", "secret-from-environment"]
        );
        let content = correction.action.content();
        assert!(content.starts_with("\"\"\"Client.\"\"\"\nimport os\nimport json\n"));
        assert!(content.contains("password = os.environ[\"PASSWORD\"]"));
        assert!(content.contains("except Exception:"));
    }

    #[test]
    fn test_shell_rewrites_skip_python() {
        let source = "def clean():\n    \"\"\"Remove build output.\"\"\"\n    return \"chmod 777 build\"\n";
        assert_eq!(corrected(&python(source)), None);
    }

    #[test]
    fn test_line_diff() {
        let diff = line_diff("a\nb\nc\n", "a\nB\nc\nd\n");
        assert_eq!(diff, "--- original\n+++ corrected\n a\n-b\n+B\n c\n+d\n");
    }

    #[test]
    fn test_line_diff_of_large_files_stays_small() {
        let original: String = (0..20_000).map(|i| format!("value_{} = {}\n", i, i)).collect();
        let corrected = format!("import os\n{}", original.replacen("value_7 = 7", "value_7 = 8", 1));
        let diff = line_diff(&original, &corrected);
        let changed: Vec<&str> = diff
            .lines()
            .skip(2)
            .filter(|l| l.starts_with('+') || l.starts_with('-'))
            .collect();
        assert_eq!(changed, vec!["+import os", "-value_7 = 7", "+value_7 = 8"]);
        assert_eq!(diff.lines().count(), 2 + 20_000 + 2);
    }

    #[test]
    fn test_line_diff_past_the_table_limit() {
        let old: String = (0..1_000).map(|i| format!("a{}\n", i)).collect();
        let paired: String = (0..1_000).map(|i| format!("b{}\n", i)).collect();
        let diff = line_diff(&old, &paired);
        assert!(diff.starts_with("--- original\n+++ corrected\n-a0\n+b0\n-a1\n+b1\n"));

        let longer: String = (0..1_001).map(|i| format!("b{}\n", i)).collect();
        let diff = line_diff(&old, &longer);
        let removed = diff.lines().filter(|l| l.starts_with("-a")).count();
        let added = diff.lines().filter(|l| l.starts_with("+b")).count();
        assert_eq!((removed, added), (1_000, 1_001));
        assert!(diff.contains("-a999\n+b0\n"));
    }
}
