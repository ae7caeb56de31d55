//! Daemon settings

use guardian_core::{ConfigError, GuardianConfig};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// What to do when the pipeline blocks an action that has a known fix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CorrectionStrategy {
    /// Report the rejection as is
    #[default]
    RejectOnly,
    /// Apply the fix catalog and re-run the pipeline on the corrected action
    AutoFixSimple,
    /// Offer the fix to the approval gate and wait for an answer
    SuggestAndWait,
}

impl fmt::Display for CorrectionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CorrectionStrategy::RejectOnly => "REJECT_ONLY",
            CorrectionStrategy::AutoFixSimple => "AUTO_FIX_SIMPLE",
            CorrectionStrategy::SuggestAndWait => "SUGGEST_AND_WAIT",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtectionConfig {
    pub strategy: CorrectionStrategy,
    pub suggestion_timeout_ms: u64,
    pub watchdog_interval_ms: u64,
    /// Budget for the canary evaluation run on every tick
    pub canary_timeout_ms: u64,
    /// In-flight work without progress for this long counts as a stall; it
    /// must exceed every phase budget, see [`ProtectionConfig::longest_phase`]
    pub stall_threshold_ms: u64,
    pub event_capacity: usize,
    pub audit_capacity: usize,
}

impl Default for ProtectionConfig {
    fn default() -> Self {
        Self {
            strategy: CorrectionStrategy::default(),
            suggestion_timeout_ms: 30_000,
            watchdog_interval_ms: 1_000,
            canary_timeout_ms: 2_000,
            stall_threshold_ms: 60_000,
            event_capacity: 256,
            audit_capacity: 1_000,
        }
    }
}

impl ProtectionConfig {
    pub fn with_strategy(mut self, strategy: CorrectionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_suggestion_timeout(mut self, timeout: Duration) -> Self {
        self.suggestion_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_watchdog_interval(mut self, interval: Duration) -> Self {
        self.watchdog_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_canary_timeout(mut self, timeout: Duration) -> Self {
        self.canary_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_stall_threshold(mut self, threshold: Duration) -> Self {
        self.stall_threshold_ms = threshold.as_millis() as u64;
        self
    }

    pub fn suggestion_timeout(&self) -> Duration {
        Duration::from_millis(self.suggestion_timeout_ms)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_interval_ms)
    }

    pub fn canary_timeout(&self) -> Duration {
        Duration::from_millis(self.canary_timeout_ms)
    }

    pub fn stall_threshold(&self) -> Duration {
        Duration::from_millis(self.stall_threshold_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let limits = [
            ("suggestion_timeout_ms", self.suggestion_timeout_ms as usize),
            ("watchdog_interval_ms", self.watchdog_interval_ms as usize),
            ("canary_timeout_ms", self.canary_timeout_ms as usize),
            ("stall_threshold_ms", self.stall_threshold_ms as usize),
            ("event_capacity", self.event_capacity),
            ("audit_capacity", self.audit_capacity),
        ];
        match limits.iter().find(|(_, value)| *value == 0) {
            Some((field, _)) => Err(ConfigError::ZeroLimit { field: *field }),
            None => Ok(()),
        }
    }

    /// The longest stretch an intercepted action may legitimately go without
    /// recording progress. Progress is recorded when an action starts, around
    /// every execution attempt, after each pipeline run and around a
    /// suggestion, so the phases between those points are what count.
    pub fn longest_phase(&self, guardian: &GuardianConfig) -> (&'static str, Duration) {
        let phases = [
            (
                "pre-check and approval",
                guardian.validator_timeout() + guardian.approval_timeout(),
            ),
            (
                "runtime",
                guardian.runtime.timeout() + guardian.runtime.cancel_grace(),
            ),
            ("post-check", guardian.validator_timeout()),
            ("suggestion", self.suggestion_timeout()),
        ];
        phases
            .into_iter()
            .fold(("none", Duration::ZERO), |longest, phase| {
                if phase.1 > longest.1 {
                    phase
                } else {
                    longest
                }
            })
    }

    /// [`ProtectionConfig::validate`], plus a stall threshold longer than any
    /// phase the guardian configuration allows
    pub fn validate_against(&self, guardian: &GuardianConfig) -> Result<(), ConfigError> {
        self.validate()?;
        let (phase, budget) = self.longest_phase(guardian);
        if self.stall_threshold() <= budget {
            return Err(ConfigError::StallThreshold {
                phase,
                budget_ms: budget.as_millis() as u64,
                threshold_ms: self.stall_threshold_ms,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(ProtectionConfig::default().validate().is_ok());
        assert_eq!(ProtectionConfig::default().strategy, CorrectionStrategy::RejectOnly);
    }

    #[test]
    fn test_zero_limit_is_rejected() {
        let config = ProtectionConfig::default().with_watchdog_interval(Duration::ZERO);
        assert_eq!(
            config.validate(),
            Err(ConfigError::ZeroLimit {
                field: "watchdog_interval_ms"
            })
        );
    }

    #[test]
    fn test_default_stall_threshold_outlasts_every_phase() {
        let guardian = GuardianConfig::default();
        let settings = ProtectionConfig::default();
        assert_eq!(
            settings.longest_phase(&guardian),
            ("pre-check and approval", Duration::from_secs(35))
        );
        assert!(settings.validate_against(&guardian).is_ok());
    }

    #[test]
    fn test_stall_threshold_inside_a_phase_is_rejected() {
        let guardian = GuardianConfig::default();
        let settings = ProtectionConfig::default().with_stall_threshold(Duration::from_secs(35));
        assert_eq!(
            settings.validate_against(&guardian),
            Err(ConfigError::StallThreshold {
                phase: "pre-check and approval",
                budget_ms: 35_000,
                threshold_ms: 35_000,
            })
        );

        let settings = ProtectionConfig::default()
            .with_suggestion_timeout(Duration::from_secs(90))
            .with_stall_threshold(Duration::from_secs(60));
        assert!(matches!(
            settings.validate_against(&guardian),
            Err(ConfigError::StallThreshold {
                phase: "suggestion",
                ..
            })
        ));
    }

    #[test]
    fn test_strategy_names() {
        let json = serde_json::to_string(&CorrectionStrategy::AutoFixSimple).unwrap();
        assert_eq!(json, "\"AUTO_FIX_SIMPLE\"");
        let parsed: ProtectionConfig =
            serde_json::from_str(r#"{"strategy": "SUGGEST_AND_WAIT"}"#).unwrap();
        assert_eq!(parsed.strategy, CorrectionStrategy::SuggestAndWait);
        assert_eq!(parsed.audit_capacity, 1_000);
    }
}
