//! Shell command tokenizer
//!
//! Splits a command line into simple commands on `;`, `&&`, `||`, `|`, `&`
//! and newlines, respecting quotes. Good enough to find the program and
//! flags of each segment; it is not a shell grammar.

use super::{CallFact, Pattern, SourceFacts, SourceLanguage};
use crate::types::Location;
use lazy_static::lazy_static;
use regex::Regex;

/// Wrappers skipped when looking for the program of a segment
const WRAPPERS: &[&str] = &["env", "nohup", "exec", "command", "time", "xargs"];

/// Prompts that gate the segments chained after them with `&&`
const GATES: &[&str] = &["read", "select"];

/// Delete targets that take the whole system or home directory with them,
/// alone or as `<root>/*`
const CRITICAL_ROOTS: &[&str] = &[
    "/", "~", "$HOME", "${HOME}", "/home", "/usr", "/etc", "/var", "/boot", "/bin", "/lib",
    "/root",
];

lazy_static! {
    static ref FORK_BOMB: Regex =
        Regex::new(r":\s*\(\s*\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;?\s*:|\w+\s*\(\s*\)\s*\{\s*\w+\s*\|\s*\w+\s*&\s*\}").unwrap();
    static ref ASSIGNMENT: Regex = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*=").unwrap();
}

/// One simple command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellSegment {
    /// Segment text, trimmed
    pub text: String,
    pub line: usize,
    pub column: usize,
    /// Program after env assignments and wrappers, empty if none
    pub program: String,
    pub args: Vec<String>,
    pub sudo: bool,
    /// Chained with `&&` after a `read`/`select` prompt on the same line
    pub gated: bool,
}

impl ShellSegment {
    fn new(text: &str, line: usize, column: usize, gated: bool) -> Self {
        let mut words = words(text).into_iter().peekable();
        let mut sudo = false;
        while let Some(word) = words.peek() {
            if ASSIGNMENT.is_match(word) || WRAPPERS.contains(&word.as_str()) {
                words.next();
            } else if word == "sudo" {
                sudo = true;
                words.next();
                while words.peek().map_or(false, |w| w.starts_with('-')) {
                    words.next();
                }
            } else {
                break;
            }
        }
        let program = words.next().unwrap_or_default();
        Self {
            text: text.trim().to_string(),
            line,
            column,
            program,
            args: words.collect(),
            sudo,
            gated,
        }
    }

    /// Short flag clusters and long flags, e.g. `-rf` or `--force`
    pub fn flags(&self) -> impl Iterator<Item = &str> {
        self.args
            .iter()
            .map(String::as_str)
            .filter(|a| a.starts_with('-') && a.len() > 1)
    }

    /// Non-flag arguments
    pub fn operands(&self) -> impl Iterator<Item = &str> {
        self.args
            .iter()
            .map(String::as_str)
            .filter(|a| !a.starts_with('-'))
    }

    fn has_short_flag(&self, letters: &[char]) -> bool {
        self.flags()
            .filter(|f| !f.starts_with("--"))
            .any(|f| f.chars().skip(1).any(|c| letters.contains(&c)))
    }

    fn has_long_flag(&self, name: &str) -> bool {
        self.flags().any(|f| f == name)
    }

    pub fn is_recursive_delete(&self) -> bool {
        self.program == "rm" && (self.has_short_flag(&['r', 'R']) || self.has_long_flag("--recursive"))
    }

    /// The command asks before acting (`rm -i`, `mv -i`, `cp -i`)
    pub fn is_interactive(&self) -> bool {
        matches!(self.program.as_str(), "rm" | "mv" | "cp")
            && (self.has_short_flag(&['i', 'I']) || self.has_long_flag("--interactive"))
    }
}

/// Split shell content into simple commands
pub fn segments(content: &str) -> Vec<ShellSegment> {
    let mut segments = Vec::new();
    for (index, line) in content.lines().enumerate() {
        let line_no = index + 1;
        let mut gated = false;
        for (column, text, chained) in split_line(line) {
            if text.trim().is_empty() {
                gated = false;
                continue;
            }
            let segment = ShellSegment::new(text, line_no, column, gated);
            gated = chained && (segment.gated || GATES.contains(&segment.program.as_str()));
            segments.push(segment);
        }
    }
    segments
}

/// Whether the content contains a fork bomb
pub fn is_fork_bomb(content: &str) -> bool {
    FORK_BOMB.is_match(content)
}

/// Recursive delete of a system or home root
pub fn is_catastrophic_delete(segment: &ShellSegment) -> bool {
    segment.is_recursive_delete()
        && (segment.has_long_flag("--no-preserve-root")
            || segment.operands().any(is_critical_target))
}

fn is_critical_target(target: &str) -> bool {
    let normalized = normalize_target(target);
    let root = match normalized.strip_suffix("/*") {
        Some("") => "/",
        Some(parent) => parent,
        None => normalized.as_str(),
    };
    CRITICAL_ROOTS.contains(&root)
}

/// Lexically normalize a path: collapse repeated `/`, drop `.` segments,
/// resolve `..` and strip the trailing `/`
fn normalize_target(target: &str) -> String {
    let mut parts = target.split('/');
    let prefix = parts.next().unwrap_or_default();
    let mut stack: Vec<&str> = Vec::new();
    for part in parts {
        match part {
            "" | "." => {}
            ".." => {
                stack.pop();
            }
            _ => stack.push(part),
        }
    }
    match (prefix, stack.is_empty()) {
        ("", true) => "/".to_string(),
        (prefix, true) => prefix.to_string(),
        (prefix, false) => format!("{}/{}", prefix, stack.join("/")),
    }
}

/// Shell content as call facts, one per segment
pub fn analyze(source: &str) -> SourceFacts {
    let mut facts = SourceFacts {
        language: SourceLanguage::Shell,
        line_count: source.lines().count(),
        ..SourceFacts::default()
    };
    for (index, line) in source.lines().enumerate() {
        if let Some(comment) = line.trim_start().strip_prefix('#') {
            facts.push(
                Pattern::Comment {
                    text: comment.trim().to_string(),
                },
                Location::line(index + 1),
            );
        }
    }
    for segment in segments(source) {
        if segment.program.is_empty() {
            continue;
        }
        let location = Location::new(segment.line, segment.column);
        let guarded = segment.gated || segment.is_interactive();
        facts.push(
            Pattern::Call(CallFact {
                callee: segment.program.clone(),
                arguments: segment.args.join(" "),
                string_args: vec![segment.text],
                guarded,
                in_try: false,
                in_test_scope: false,
                enclosing_function: None,
            }),
            location,
        );
    }
    facts
}

/// Split one line on unquoted separators, returning 1-based columns and
/// whether the part is followed by `&&`.
/// Everything after an unquoted `#` that starts a word is a comment.
fn split_line(line: &str) -> Vec<(usize, &str, bool)> {
    let mut parts = Vec::new();
    let mut quote: Option<char> = None;
    let mut start = 0;
    let mut previous = ' ';
    let mut chars = line.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"' | '`') => quote = Some(c),
            (None, '#') if previous.is_whitespace() => {
                parts.push((start, &line[start..i], false));
                return finish(line, parts);
            }
            (None, ';' | '|' | '&') => {
                let doubled = chars.peek().map_or(false, |&(_, next)| next == c && c != ';');
                parts.push((start, &line[start..i], doubled && c == '&'));
                if doubled {
                    chars.next();
                }
                start = i + if doubled { 2 } else { 1 };
            }
            _ => {}
        }
        previous = c;
    }
    parts.push((start, &line[start..], false));
    finish(line, parts)
}

fn finish<'a>(line: &'a str, parts: Vec<(usize, &'a str, bool)>) -> Vec<(usize, &'a str, bool)> {
    parts
        .into_iter()
        .map(|(start, text, chained)| {
            let offset = text.len() - text.trim_start().len();
            (line[..start + offset].chars().count() + 1, text, chained)
        })
        .collect()
}

/// Whitespace-separated words with quotes removed
fn words(text: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut in_word = false;
    for c in text.chars() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), c) => current.push(c),
            (None, '\'' | '"') => {
                quote = Some(c);
                in_word = true;
            }
            (None, c) if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            (None, c) => {
                current.push(c);
                in_word = true;
            }
        }
    }
    if in_word {
        words.push(current);
    }
    words
}
