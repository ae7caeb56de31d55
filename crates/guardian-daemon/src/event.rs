//! Protection events and alerts
//!
//! Events describe what happened to intercepted actions and to the daemon
//! itself; they feed the broadcast stream and the audit trail. Alerts are the
//! separate, much quieter stream meant for whoever operates the host.

use guardian_core::types::now;
use guardian_core::{EnforcementStatus, GuardMode, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProtectionEvent {
    Started {
        at: Timestamp,
    },
    Stopped {
        at: Timestamp,
    },
    Intercepted {
        action_id: Uuid,
        action_type: String,
        at: Timestamp,
    },
    /// One pipeline run finished; a corrected action gets a second one
    Enforced {
        action_id: Uuid,
        status: EnforcementStatus,
        score: Option<f64>,
        at: Timestamp,
    },
    /// The single summary record of an intercepted action, emitted last
    Outcome {
        event_id: Uuid,
        action_id: Uuid,
        action_type: String,
        /// Status of the action that ran last, the original or its correction
        outcome: EnforcementStatus,
        auto_corrected: bool,
        correction_diff: Option<String>,
        alert_level: AlertLevel,
        at: Timestamp,
    },
    AutoCorrected {
        action_id: Uuid,
        corrected_action_id: Uuid,
        rules: Vec<String>,
        diff: String,
        at: Timestamp,
    },
    SuggestionIssued {
        action_id: Uuid,
        corrected_action_id: Uuid,
        rules: Vec<String>,
        at: Timestamp,
    },
    SuggestionResolved {
        action_id: Uuid,
        approved: bool,
        at: Timestamp,
    },
    /// Refused without running the pipeline
    Blocked {
        action_id: Uuid,
        reason: String,
        at: Timestamp,
    },
    ModeChanged {
        from: GuardMode,
        to: GuardMode,
        at: Timestamp,
    },
    ConfigReplaced {
        at: Timestamp,
    },
    LockdownEntered {
        reason: String,
        at: Timestamp,
    },
    LockdownCleared {
        at: Timestamp,
    },
}

impl ProtectionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ProtectionEvent::Started { .. } => "started",
            ProtectionEvent::Stopped { .. } => "stopped",
            ProtectionEvent::Intercepted { .. } => "intercepted",
            ProtectionEvent::Enforced { .. } => "enforced",
            ProtectionEvent::Outcome { .. } => "outcome",
            ProtectionEvent::AutoCorrected { .. } => "auto_corrected",
            ProtectionEvent::SuggestionIssued { .. } => "suggestion_issued",
            ProtectionEvent::SuggestionResolved { .. } => "suggestion_resolved",
            ProtectionEvent::Blocked { .. } => "blocked",
            ProtectionEvent::ModeChanged { .. } => "mode_changed",
            ProtectionEvent::ConfigReplaced { .. } => "config_replaced",
            ProtectionEvent::LockdownEntered { .. } => "lockdown_entered",
            ProtectionEvent::LockdownCleared { .. } => "lockdown_cleared",
        }
    }

    /// The action an event is about, if any
    pub fn action_id(&self) -> Option<Uuid> {
        match self {
            ProtectionEvent::Intercepted { action_id, .. }
            | ProtectionEvent::Enforced { action_id, .. }
            | ProtectionEvent::Outcome { action_id, .. }
            | ProtectionEvent::AutoCorrected { action_id, .. }
            | ProtectionEvent::SuggestionIssued { action_id, .. }
            | ProtectionEvent::SuggestionResolved { action_id, .. }
            | ProtectionEvent::Blocked { action_id, .. } => Some(*action_id),
            _ => None,
        }
    }

    pub fn at(&self) -> Timestamp {
        match self {
            ProtectionEvent::Started { at }
            | ProtectionEvent::Stopped { at }
            | ProtectionEvent::Intercepted { at, .. }
            | ProtectionEvent::Enforced { at, .. }
            | ProtectionEvent::Outcome { at, .. }
            | ProtectionEvent::AutoCorrected { at, .. }
            | ProtectionEvent::SuggestionIssued { at, .. }
            | ProtectionEvent::SuggestionResolved { at, .. }
            | ProtectionEvent::Blocked { at, .. }
            | ProtectionEvent::ModeChanged { at, .. }
            | ProtectionEvent::ConfigReplaced { at }
            | ProtectionEvent::LockdownEntered { at, .. }
            | ProtectionEvent::LockdownCleared { at } => *at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
}

impl AlertLevel {
    /// Level of an interception outcome: clean acceptance is informational,
    /// warnings and corrections are worth a look, a CRITICAL block is critical
    pub fn for_outcome(status: EnforcementStatus, corrected: bool, critical: bool) -> AlertLevel {
        match status {
            EnforcementStatus::Accepted if !corrected => AlertLevel::Info,
            EnforcementStatus::Accepted | EnforcementStatus::AcceptedWithWarnings => {
                AlertLevel::Warning
            }
            _ if critical => AlertLevel::Critical,
            _ => AlertLevel::Warning,
        }
    }
}

impl fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AlertLevel::Info => "INFO",
            AlertLevel::Warning => "WARNING",
            AlertLevel::Critical => "CRITICAL",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtectionAlert {
    pub id: Uuid,
    pub level: AlertLevel,
    /// Component that raised it, e.g. `watchdog`
    pub source: String,
    pub message: String,
    pub raised_at: Timestamp,
}

impl ProtectionAlert {
    pub fn new(level: AlertLevel, source: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            level,
            source: source.into(),
            message: message.into(),
            raised_at: now(),
        }
    }

    pub fn critical(source: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(AlertLevel::Critical, source, message)
    }

    pub fn is_critical(&self) -> bool {
        self.level == AlertLevel::Critical
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_with_kind_tag() {
        let event = ProtectionEvent::LockdownEntered {
            reason: "watchdog stall".to_string(),
            at: now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "lockdown_entered");
        assert_eq!(event.name(), "lockdown_entered");
        assert_eq!(event.action_id(), None);
    }

    #[test]
    fn test_outcome_levels() {
        use EnforcementStatus::*;
        assert_eq!(AlertLevel::for_outcome(Accepted, false, false), AlertLevel::Info);
        assert_eq!(AlertLevel::for_outcome(Accepted, true, false), AlertLevel::Warning);
        assert_eq!(AlertLevel::for_outcome(AcceptedWithWarnings, false, false), AlertLevel::Warning);
        assert_eq!(AlertLevel::for_outcome(Rejected, false, false), AlertLevel::Warning);
        assert_eq!(AlertLevel::for_outcome(Rejected, false, true), AlertLevel::Critical);
        assert_eq!(AlertLevel::for_outcome(Interrupted, true, true), AlertLevel::Critical);
    }

    #[test]
    fn test_alert_levels_order() {
        assert!(AlertLevel::Critical > AlertLevel::Warning);
        assert!(ProtectionAlert::critical("watchdog", "stalled").is_critical());
    }
}
