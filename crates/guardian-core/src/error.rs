//! Error types for Guardian Core
//!
//! Guard interrupts and critical blocks are not errors: they are decisions
//! carried by [`crate::guards::GuardDecision`]. The types here cover
//! configuration faults, validator infrastructure faults and analysis faults.

use thiserror::Error;

/// Result type alias for Guardian operations
pub type Result<T> = std::result::Result<T, GuardianError>;

/// Main error type for Guardian operations
#[derive(Error, Debug)]
pub enum GuardianError {
    /// Configuration errors, fatal at construction time
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A single validator failed
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Source could not be analyzed
    #[error("Analysis error: {0}")]
    Analysis(#[from] AnalysisError),

    /// Illegal guard state machine edge
    #[error("Invalid guard state transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Fault reported by a host daemon
    #[error("Daemon error: {0}")]
    Daemon(String),

    /// Generic error with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        source: Box<GuardianError>,
    },
}

/// Errors raised while validating or loading a [`crate::config::GuardianConfig`]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Threshold for {mode} must be in range [0.0, 1.0], got {value}")]
    InvalidThreshold { mode: String, value: f64 },

    #[error("Weight for {principle} must be finite and >= 0, got {value}")]
    InvalidWeight { principle: String, value: f64 },

    #[error("Unknown principle in configuration: {0}")]
    UnknownPrinciple(String),

    #[error("All enabled principles have zero weight")]
    ZeroWeights,

    #[error("No validators enabled")]
    NoValidatorsEnabled,

    #[error("Severity weights must be finite and non-negative")]
    InvalidSeverityWeights,

    #[error("Score normalizer must be > 0, got {0}")]
    InvalidNormalizer(f64),

    #[error("Escalation margin must be in range [0.0, 1.0], got {0}")]
    InvalidMargin(f64),

    #[error("{field} must be greater than zero")]
    ZeroLimit { field: &'static str },

    #[error("Stall threshold of {threshold_ms}ms must exceed the {phase} budget of {budget_ms}ms")]
    StallThreshold {
        phase: &'static str,
        budget_ms: u64,
        threshold_ms: u64,
    },

    #[error("Invalid dangerous operation pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Unknown guard mode: {0}")]
    UnknownMode(String),

    #[error("Failed to parse configuration: {0}")]
    Parse(String),
}

/// Errors raised by a single validator
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Validator for {principle} failed: {reason}")]
    Failed { principle: String, reason: String },

    #[error("Validator for {principle} timed out after {timeout_ms}ms")]
    TimedOut { principle: String, timeout_ms: u64 },

    #[error("Validator for {principle} panicked")]
    Panicked { principle: String },
}

/// Errors raised by the syntax analysis layer
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AnalysisError {
    #[error("Unparseable {language} source: {reason}")]
    Unparseable { language: String, reason: String },

    #[error("Parser for {language} unavailable: {reason}")]
    ParserUnavailable { language: String, reason: String },

    #[error("Unparseable {language} source: nesting deeper than {limit} levels")]
    TooDeep { language: String, limit: usize },
}

impl GuardianError {
    /// Add context to an error
    pub fn context(self, context: impl Into<String>) -> Self {
        Self::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }
}

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to a Result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add lazy context to a Result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.context(f()))
    }
}
