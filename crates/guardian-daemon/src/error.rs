//! Error types for the protection daemon

use guardian_core::{ConfigError, GuardianError};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DaemonError>;

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("Auto-protection is already running")]
    AlreadyRunning,

    #[error("Auto-protection is not running")]
    NotRunning,

    /// Every action is rejected until the lockdown is reset
    #[error("Protection is in lockdown: {reason}")]
    Lockdown { reason: String },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Coordinator error: {0}")]
    Coordinator(#[from] GuardianError),

    #[error("No tokio runtime available to start the watchdog")]
    NoRuntime,
}

impl DaemonError {
    /// Whether the action was refused rather than the daemon failing
    pub fn is_rejection(&self) -> bool {
        matches!(self, DaemonError::Lockdown { .. })
    }
}

impl From<DaemonError> for GuardianError {
    fn from(error: DaemonError) -> Self {
        match error {
            DaemonError::Coordinator(inner) => inner,
            DaemonError::Config(inner) => GuardianError::Config(inner),
            other => GuardianError::Daemon(other.to_string()),
        }
    }
}
