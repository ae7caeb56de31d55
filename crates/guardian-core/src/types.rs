//! Core types for Guardian
//!
//! This module defines the fundamental types used across the pipeline:
//! - Principles (the six rule categories)
//! - Severities
//! - Source locations
//! - Timestamps and content fingerprints

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Rule category judged by exactly one validator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Principle {
    Completeness,
    Transparency,
    Truth,
    UserSovereignty,
    SystemicImpact,
    ResourceEfficiency,
}

impl Principle {
    /// All principles in reporting order
    pub const ALL: [Principle; 6] = [
        Principle::Completeness,
        Principle::Transparency,
        Principle::Truth,
        Principle::UserSovereignty,
        Principle::SystemicImpact,
        Principle::ResourceEfficiency,
    ];

    /// Stable snake_case name, as used in configuration files
    pub fn name(self) -> &'static str {
        match self {
            Principle::Completeness => "completeness",
            Principle::Transparency => "transparency",
            Principle::Truth => "truth",
            Principle::UserSovereignty => "user_sovereignty",
            Principle::SystemicImpact => "systemic_impact",
            Principle::ResourceEfficiency => "resource_efficiency",
        }
    }

    /// Parse a principle name; accepts `-` or `_` separators, any case
    pub fn from_name(name: &str) -> Option<Principle> {
        let normalized = name.trim().to_ascii_lowercase().replace('-', "_");
        Principle::ALL
            .into_iter()
            .find(|principle| principle.name() == normalized)
    }
}

impl fmt::Display for Principle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Violation severity, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn is_critical(self) -> bool {
        matches!(self, Severity::Critical)
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        };
        f.write_str(label)
    }
}

/// Position in analyzed source (1-based)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Location {
    pub line: usize,
    pub column: usize,
}

impl Location {
    pub fn new(line: usize, column: usize) -> Self {
        Self { line, column }
    }

    /// Location at the start of a line
    pub fn line(line: usize) -> Self {
        Self { line, column: 1 }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// Timestamp type alias
pub type Timestamp = DateTime<Utc>;

/// Get current timestamp
pub fn now() -> Timestamp {
    Utc::now()
}

/// Hex-encoded blake3 fingerprint of some content
pub fn fingerprint(content: &str) -> String {
    blake3::hash(content.as_bytes()).to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_principle_names_round_trip() {
        for principle in Principle::ALL {
            assert_eq!(Principle::from_name(principle.name()), Some(principle));
        }
        assert_eq!(
            Principle::from_name("User-Sovereignty"),
            Some(Principle::UserSovereignty)
        );
        assert_eq!(Principle::from_name("speed"), None);
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Medium > Severity::Low);
        assert!(Severity::Critical.is_critical());
        assert!(!Severity::High.is_critical());
    }

    #[test]
    fn test_severity_serde_uppercase() {
        let json = serde_json::to_string(&Severity::Critical).unwrap();
        assert_eq!(json, "\"CRITICAL\"");
    }

    #[test]
    fn test_fingerprint_is_stable() {
        assert_eq!(fingerprint("abc"), fingerprint("abc"));
        assert_ne!(fingerprint("abc"), fingerprint("abd"));
        assert_eq!(fingerprint("abc").len(), 64);
    }
}
