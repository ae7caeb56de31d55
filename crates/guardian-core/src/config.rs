//! Guardian configuration
//!
//! `GuardianConfig` is plain data loaded from TOML or built in code. At
//! runtime it lives behind a [`SharedConfig`], which validates every update and
//! swaps it in atomically so readers always see one whole configuration.

use crate::error::{ConfigError, Result};
use crate::types::{Principle, Severity};
use arc_swap::ArcSwap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Environment variable overriding the configured guard mode
pub const MODE_ENV_VAR: &str = "GUARDIAN_MODE";

/// Strictness of the guard pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuardMode {
    Strict,
    Balanced,
    Permissive,
}

impl Default for GuardMode {
    fn default() -> Self {
        GuardMode::Balanced
    }
}

impl fmt::Display for GuardMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GuardMode::Strict => "STRICT",
            GuardMode::Balanced => "BALANCED",
            GuardMode::Permissive => "PERMISSIVE",
        };
        f.write_str(name)
    }
}

impl FromStr for GuardMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strict" => Ok(GuardMode::Strict),
            "balanced" => Ok(GuardMode::Balanced),
            "permissive" => Ok(GuardMode::Permissive),
            other => Err(ConfigError::UnknownMode(other.to_string())),
        }
    }
}

/// Pass threshold per guard mode
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModeThresholds {
    pub strict: f64,
    pub balanced: f64,
    pub permissive: f64,
}

impl Default for ModeThresholds {
    fn default() -> Self {
        Self {
            strict: 0.9,
            balanced: 0.7,
            permissive: 0.5,
        }
    }
}

impl ModeThresholds {
    pub fn for_mode(&self, mode: GuardMode) -> f64 {
        match mode {
            GuardMode::Strict => self.strict,
            GuardMode::Balanced => self.balanced,
            GuardMode::Permissive => self.permissive,
        }
    }
}

/// Score penalty per violation severity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeverityWeights {
    pub low: f64,
    pub medium: f64,
    pub high: f64,
    pub critical: f64,
}

impl Default for SeverityWeights {
    fn default() -> Self {
        Self {
            low: 1.0,
            medium: 3.0,
            high: 6.0,
            critical: 10.0,
        }
    }
}

impl SeverityWeights {
    pub fn weight(&self, severity: Severity) -> f64 {
        match severity {
            Severity::Low => self.low,
            Severity::Medium => self.medium,
            Severity::High => self.high,
            Severity::Critical => self.critical,
        }
    }

    fn is_valid(&self) -> bool {
        [self.low, self.medium, self.high, self.critical]
            .iter()
            .all(|w| w.is_finite() && *w >= 0.0)
    }
}

/// Limits enforced by the runtime guard
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeLimits {
    /// Failed attempts allowed before interrupting
    pub max_iterations: u32,
    /// Wall-clock budget for the whole execution, in milliseconds
    pub timeout_ms: u64,
    /// Repeats of one error signature that count as a circular error
    pub circular_threshold: u32,
    /// Size of the rolling error-signature window
    pub error_window: usize,
    /// Time granted to a cancelled callback to return on its own
    pub cancel_grace_ms: u64,
}

impl Default for RuntimeLimits {
    fn default() -> Self {
        Self {
            max_iterations: 2,
            timeout_ms: 30_000,
            circular_threshold: 2,
            error_window: 8,
            cancel_grace_ms: 500,
        }
    }
}

impl RuntimeLimits {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }
}

/// Family of a dangerous operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DangerCategory {
    RecursiveDelete,
    RawQuery,
    ProcessKill,
    DiskFormat,
    ForcePush,
    HistoryRewrite,
    PermissionBlanket,
}

/// One entry of the dangerous-operation catalog.
///
/// `command` is matched against shell command segments, `callee` against the
/// callee text of syntax-tree call sites.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DangerousOperation {
    pub name: String,
    pub category: DangerCategory,
    pub severity: Severity,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub callee: Option<String>,
}

impl DangerousOperation {
    fn new(
        name: &str,
        category: DangerCategory,
        severity: Severity,
        command: Option<&str>,
        callee: Option<&str>,
    ) -> Self {
        Self {
            name: name.to_string(),
            category,
            severity,
            command: command.map(str::to_string),
            callee: callee.map(str::to_string),
        }
    }

    /// Built-in catalog
    pub fn default_catalog() -> Vec<DangerousOperation> {
        use DangerCategory::*;
        vec![
            Self::new(
                "recursive-delete",
                RecursiveDelete,
                Severity::High,
                Some(r"^\s*(sudo\s+)?rm\s+(.*\s)?-(-recursive|[a-zA-Z]*[rR][a-zA-Z]*)\b"),
                Some(r"^(shutil\.rmtree|os\.removedirs|(std::)?fs::remove_dir_all|fs\.rmSync|fs\.rmdirSync|rimraf)$"),
            ),
            Self::new(
                "raw-query",
                RawQuery,
                Severity::High,
                Some(r"(?i)\b(psql|mysql|sqlite3)\b.*\b(drop|delete|truncate)\b"),
                Some(r"(^|\.)(execute|executemany|executescript|exec_driver_sql|raw)$"),
            ),
            Self::new(
                "process-kill",
                ProcessKill,
                Severity::Medium,
                Some(r"^\s*(sudo\s+)?(kill|pkill|killall)\b"),
                Some(r"^(os\.kill|os\.killpg|signal\.pthread_kill|process\.kill|libc::kill)$"),
            ),
            Self::new(
                "disk-format",
                DiskFormat,
                Severity::Critical,
                Some(r"^\s*(sudo\s+)?(mkfs(\.\w+)?|fdisk|wipefs)\b|\bdd\b.*\bof=/dev/"),
                None,
            ),
            Self::new(
                "force-push",
                ForcePush,
                Severity::High,
                Some(r"\bgit\s+push\b.*(--force(\s|$)|\s-f(\s|$))"),
                None,
            ),
            Self::new(
                "history-rewrite",
                HistoryRewrite,
                Severity::Medium,
                Some(r"\bgit\s+(reset\s+--hard|clean\s+-[a-zA-Z]*f)\b"),
                None,
            ),
            Self::new(
                "permission-blanket",
                PermissionBlanket,
                Severity::Medium,
                Some(r"\bchmod\s+(-R\s+)?0?777\b"),
                Some(r"^(os\.chmod|fs\.chmodSync)$"),
            ),
        ]
    }
}

/// A catalog entry with its patterns compiled
#[derive(Debug, Clone)]
pub struct CompiledOperation {
    pub operation: DangerousOperation,
    pub command: Option<Regex>,
    pub callee: Option<Regex>,
}

fn compile(pattern: &str) -> std::result::Result<Regex, ConfigError> {
    Regex::new(pattern).map_err(|e| ConfigError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })
}

/// Main guardian configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardianConfig {
    /// Active guard mode
    pub mode: GuardMode,

    /// Pass thresholds per mode
    pub thresholds: ModeThresholds,

    /// Overrides the mode threshold when set
    pub threshold_override: Option<f64>,

    /// Principles whose validators run
    pub enabled_principles: Vec<Principle>,

    /// Optional weights keyed by principle name; empty means plain mean
    pub principle_weights: BTreeMap<String, f64>,

    /// Penalty per severity
    pub severity_weights: SeverityWeights,

    /// Divisor turning summed penalties into a score drop
    pub score_normalizer: f64,

    /// Any CRITICAL violation forces the overall score to 0.0
    pub critical_veto: bool,

    /// Distance from the threshold within which decisions escalate
    pub escalation_margin: f64,

    /// Escalate every passing action to a human
    pub human_in_the_loop: bool,

    /// Per-validator time budget, in milliseconds
    pub validator_timeout_ms: u64,

    /// Time an approval gate has to answer, in milliseconds
    pub approval_timeout_ms: u64,

    /// Runtime guard limits
    pub runtime: RuntimeLimits,

    /// Length budget for a single action
    pub max_lines: usize,

    /// Window size (normalized lines) for duplicate detection
    pub duplicate_window: usize,

    /// Minimum module length that requires a version marker
    pub version_marker_min_lines: usize,

    /// Dangerous-operation catalog
    pub dangerous_operations: Vec<DangerousOperation>,

    /// Callee pattern identifying outbound network calls
    pub network_callees: String,

    /// Shell pattern identifying outbound network commands
    pub network_commands: String,
}

impl Default for GuardianConfig {
    fn default() -> Self {
        Self {
            mode: GuardMode::default(),
            thresholds: ModeThresholds::default(),
            threshold_override: None,
            enabled_principles: Principle::ALL.to_vec(),
            principle_weights: BTreeMap::new(),
            severity_weights: SeverityWeights::default(),
            score_normalizer: 10.0,
            critical_veto: true,
            escalation_margin: 0.05,
            human_in_the_loop: false,
            validator_timeout_ms: 5_000,
            approval_timeout_ms: 30_000,
            runtime: RuntimeLimits::default(),
            max_lines: 500,
            duplicate_window: 6,
            version_marker_min_lines: 80,
            dangerous_operations: DangerousOperation::default_catalog(),
            network_callees: concat!(
                r"^(requests\.(get|post|put|patch|delete|head|request)|httpx\.\w+|",
                r"urllib\.request\.urlopen|urlopen|fetch|axios(\.\w+)?|",
                r"reqwest::(get|Client::new)|smtplib\.SMTP|socket\.create_connection)$"
            )
            .to_string(),
            network_commands: r"^\s*(sudo\s+)?(curl|wget|scp|rsync|ssh|nc|ftp)\b".to_string(),
        }
    }
}

impl GuardianConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the guard mode
    pub fn with_mode(mut self, mode: GuardMode) -> Self {
        self.mode = mode;
        self
    }

    /// Override the mode threshold
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold_override = Some(threshold);
        self
    }

    /// Restrict the validators that run
    pub fn with_enabled_principles(mut self, principles: impl IntoIterator<Item = Principle>) -> Self {
        self.enabled_principles = principles.into_iter().collect();
        self
    }

    /// Set the aggregation weight of one principle
    pub fn with_principle_weight(mut self, principle: Principle, weight: f64) -> Self {
        self.principle_weights
            .insert(principle.name().to_string(), weight);
        self
    }

    pub fn with_human_in_the_loop(mut self, enabled: bool) -> Self {
        self.human_in_the_loop = enabled;
        self
    }

    pub fn with_escalation_margin(mut self, margin: f64) -> Self {
        self.escalation_margin = margin;
        self
    }

    pub fn with_validator_timeout(mut self, timeout: Duration) -> Self {
        self.validator_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_approval_timeout(mut self, timeout: Duration) -> Self {
        self.approval_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.runtime.max_iterations = max_iterations;
        self
    }

    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.runtime.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_max_lines(mut self, max_lines: usize) -> Self {
        self.max_lines = max_lines;
        self
    }

    /// Effective pass threshold
    pub fn threshold(&self) -> f64 {
        self.threshold_override
            .unwrap_or_else(|| self.thresholds.for_mode(self.mode))
    }

    pub fn is_enabled(&self, principle: Principle) -> bool {
        self.enabled_principles.contains(&principle)
    }

    /// Aggregation weight of a principle (1.0 when unset)
    pub fn principle_weight(&self, principle: Principle) -> f64 {
        self.principle_weights
            .get(principle.name())
            .copied()
            .unwrap_or(1.0)
    }

    pub fn validator_timeout(&self) -> Duration {
        Duration::from_millis(self.validator_timeout_ms)
    }

    pub fn approval_timeout(&self) -> Duration {
        Duration::from_millis(self.approval_timeout_ms)
    }

    /// Compile the dangerous-operation catalog
    pub fn compile_catalog(&self) -> std::result::Result<Vec<CompiledOperation>, ConfigError> {
        self.dangerous_operations
            .iter()
            .map(|operation| {
                Ok(CompiledOperation {
                    operation: operation.clone(),
                    command: operation.command.as_deref().map(compile).transpose()?,
                    callee: operation.callee.as_deref().map(compile).transpose()?,
                })
            })
            .collect()
    }

    /// Compile the outbound-network patterns (callee, command)
    pub fn compile_network_patterns(&self) -> std::result::Result<(Regex, Regex), ConfigError> {
        Ok((compile(&self.network_callees)?, compile(&self.network_commands)?))
    }

    /// Check every invariant the pipeline relies on
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        let thresholds = [
            ("STRICT", self.thresholds.strict),
            ("BALANCED", self.thresholds.balanced),
            ("PERMISSIVE", self.thresholds.permissive),
        ];
        for (mode, value) in thresholds {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::InvalidThreshold {
                    mode: mode.to_string(),
                    value,
                });
            }
        }
        if let Some(value) = self.threshold_override {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::InvalidThreshold {
                    mode: "override".to_string(),
                    value,
                });
            }
        }

        if self.enabled_principles.is_empty() {
            return Err(ConfigError::NoValidatorsEnabled);
        }

        for (name, weight) in &self.principle_weights {
            if Principle::from_name(name).is_none() {
                return Err(ConfigError::UnknownPrinciple(name.clone()));
            }
            if !weight.is_finite() || *weight < 0.0 {
                return Err(ConfigError::InvalidWeight {
                    principle: name.clone(),
                    value: *weight,
                });
            }
        }
        let total_weight: f64 = self
            .enabled_principles
            .iter()
            .map(|p| self.principle_weight(*p))
            .sum();
        if total_weight <= 0.0 {
            return Err(ConfigError::ZeroWeights);
        }

        if !self.severity_weights.is_valid() {
            return Err(ConfigError::InvalidSeverityWeights);
        }
        if !self.score_normalizer.is_finite() || self.score_normalizer <= 0.0 {
            return Err(ConfigError::InvalidNormalizer(self.score_normalizer));
        }
        if !(0.0..=1.0).contains(&self.escalation_margin) {
            return Err(ConfigError::InvalidMargin(self.escalation_margin));
        }

        let limits = [
            ("validator_timeout_ms", self.validator_timeout_ms == 0),
            ("approval_timeout_ms", self.approval_timeout_ms == 0),
            ("runtime.max_iterations", self.runtime.max_iterations == 0),
            ("runtime.timeout_ms", self.runtime.timeout_ms == 0),
            ("runtime.circular_threshold", self.runtime.circular_threshold == 0),
            ("runtime.error_window", self.runtime.error_window == 0),
            ("max_lines", self.max_lines == 0),
            ("duplicate_window", self.duplicate_window == 0),
        ];
        if let Some((field, _)) = limits.iter().find(|(_, is_zero)| *is_zero) {
            return Err(ConfigError::ZeroLimit { field: *field });
        }

        self.compile_catalog()?;
        self.compile_network_patterns()?;
        Ok(())
    }

    /// Parse a TOML document; missing keys take their defaults
    pub fn from_toml_str(document: &str) -> std::result::Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(document).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file, then apply `GUARDIAN_MODE`
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config = Self::from_toml_str(&content)?;
        let mode = std::env::var(MODE_ENV_VAR).ok();
        Ok(config.with_mode_override(mode.as_deref())?)
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Apply a mode given as text (typically the environment override)
    pub fn with_mode_override(mut self, mode: Option<&str>) -> std::result::Result<Self, ConfigError> {
        if let Some(mode) = mode.filter(|m| !m.trim().is_empty()) {
            self.mode = mode.parse()?;
        }
        Ok(self)
    }
}

/// Configuration shared between the coordinator, the daemon and its watchdog.
///
/// Readers take a snapshot per call; writers validate and swap atomically.
#[derive(Clone)]
pub struct SharedConfig {
    inner: Arc<ArcSwap<GuardianConfig>>,
}

impl SharedConfig {
    /// Validate and wrap a configuration
    pub fn new(config: GuardianConfig) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(ArcSwap::from_pointee(config)),
        })
    }

    /// Current configuration. Lock-free.
    pub fn snapshot(&self) -> Arc<GuardianConfig> {
        self.inner.load_full()
    }

    /// Validate then atomically replace the configuration.
    ///
    /// On error the previous configuration stays active.
    pub fn replace(&self, config: GuardianConfig) -> std::result::Result<(), ConfigError> {
        config.validate()?;
        self.inner.store(Arc::new(config));
        tracing::info!("guardian configuration replaced");
        Ok(())
    }

    /// Switch guard mode without touching anything else
    pub fn set_mode(&self, mode: GuardMode) {
        self.inner.rcu(|current| {
            let mut next = GuardianConfig::clone(current);
            next.mode = mode;
            next
        });
        tracing::info!(%mode, "guard mode switched");
    }

    pub fn mode(&self) -> GuardMode {
        self.inner.load().mode
    }
}

impl fmt::Debug for SharedConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedConfig")
            .field("mode", &self.mode())
            .finish_non_exhaustive()
    }
}
