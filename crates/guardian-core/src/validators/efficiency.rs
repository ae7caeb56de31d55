//! Resource efficiency: size, duplication and accidental quadratic work

use super::{facts_or_fail, Findings, Validator};
use crate::action::Action;
use crate::analysis::collapse;
use crate::config::GuardianConfig;
use crate::error::ValidationError;
use crate::types::{fingerprint, Location, Principle, Severity};
use crate::verdict::ValidationResult;
use std::collections::HashMap;

/// Normalized lines shorter than this never count towards duplication
const MIN_SIGNIFICANT_LEN: usize = 4;

const COMMENT_PREFIXES: &[&str] = &["#", "//", "/*", "*", "--"];

#[derive(Debug, Clone, Copy, Default)]
pub struct EfficiencyValidator;

impl Validator for EfficiencyValidator {
    fn principle(&self) -> Principle {
        Principle::ResourceEfficiency
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
        let content = action.content();

        let lines = content.lines().filter(|l| !l.trim().is_empty()).count();
        if lines > config.max_lines {
            let severity = if lines > config.max_lines * 2 {
                Severity::High
            } else {
                Severity::Medium
            };
            findings.add(
                severity,
                "over-length-budget",
                format!("{} lines exceed the budget of {}", lines, config.max_lines),
                None,
                Some("split the change into smaller modules"),
            );
        }

        for region in duplicate_regions(content, config.duplicate_window) {
            findings.add(
                Severity::Medium,
                "duplicated-block",
                format!(
                    "{} lines repeat the block starting at line {}",
                    region.length, region.original_line
                ),
                Some(Location::line(region.line)),
                Some("extract the repeated block into a function"),
            );
        }

        for (fact, at) in facts.loops() {
            if fact.nested_same_iterable && !facts.in_test_scope(at.line) {
                findings.add(
                    Severity::Medium,
                    "quadratic-nested-loop",
                    format!("nested loop iterates `{}` again", fact.iterable),
                    Some(at),
                    Some("index the collection once or use a set/map lookup"),
                );
            }
        }

        Ok(findings.finish(config, &facts))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct DuplicateRegion {
    /// First line of the repeat
    line: usize,
    /// First line of the block it repeats
    original_line: usize,
    /// Significant lines in the repeat
    length: usize,
}

/// Significant lines with their 1-based numbers
fn significant_lines(content: &str) -> Vec<(usize, String)> {
    content
        .lines()
        .enumerate()
        .map(|(index, line)| (index + 1, collapse(line)))
        .filter(|(_, line)| {
            line.len() >= MIN_SIGNIFICANT_LEN && !COMMENT_PREFIXES.iter().any(|p| line.starts_with(p))
        })
        .collect()
}

/// Non-overlapping repeats of `window` consecutive significant lines,
/// extended as far as the repeat keeps matching
fn duplicate_regions(content: &str, window: usize) -> Vec<DuplicateRegion> {
    let lines = significant_lines(content);
    let mut regions = Vec::new();
    if window == 0 || lines.len() < window * 2 {
        return regions;
    }

    let mut seen: HashMap<String, usize> = HashMap::new();
    let mut i = 0;
    while i + window <= lines.len() {
        let block = lines[i..i + window]
            .iter()
            .map(|(_, line)| line.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let key = fingerprint(&block);
        match seen.get(&key) {
            Some(&first) if first + window <= i => {
                let mut length = window;
                while i + length < lines.len()
                    && first + length < i
                    && lines[first + length].1 == lines[i + length].1
                {
                    length += 1;
                }
                regions.push(DuplicateRegion {
                    line: lines[i].0,
                    original_line: lines[first].0,
                    length,
                });
                i += length;
            }
            Some(_) => i += 1,
            None => {
                seen.insert(key, i);
                i += 1;
            }
        }
    }
    regions
}
