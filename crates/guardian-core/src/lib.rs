//! Guardian Core - principle validation and guarded execution
//!
//! Every proposed operation (generated code, a file edit, a shell command)
//! is an [`Action`]. Six validators judge it against one principle each:
//!
//! 1. **Completeness**: no unfinished markers, errors handled, tests present
//! 2. **Transparency**: public surface documented, contracts and deprecations declared
//! 3. **Truth**: no placeholders, stand-in data, embedded secrets or stub functions
//! 4. **User sovereignty**: destructive and outbound operations need consent
//! 5. **Systemic impact**: edits explain their impact and do not silently break callers
//! 6. **Resource efficiency**: bounded size, no duplicated blocks, no accidental quadratic loops
//!
//! The [`ValidationEngine`] runs them concurrently and folds their results into
//! a [`ConstitutionalVerdict`]. The [`GuardianCoordinator`] wraps an execution
//! callback with three guards (pre-execution, runtime, post-execution) and
//! returns an [`EnforcementReport`].
//!
//! # Quick Start
//!
//! ```no_run
//! use guardian_core::{Action, Artifact, GuardianConfig, GuardianCoordinator, SharedConfig};
//!
//! # async fn run() -> guardian_core::Result<()> {
//! let config = SharedConfig::new(GuardianConfig::default())?;
//! let coordinator = GuardianCoordinator::new(config);
//!
//! let action = Action::shell("cargo fmt --check");
//! let report = coordinator
//!     .enforce(&action, |_attempt| async { Ok(Artifact::output("ok")) })
//!     .await;
//!
//! println!("{}", report.status);
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(rust_2018_idioms, missing_debug_implementations, clippy::all)]

pub mod action;
pub mod analysis;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod guards;
pub mod telemetry;
pub mod types;
pub mod validators;
pub mod verdict;

pub use action::{context_keys, Action, ActionContext, ActionType};
pub use config::{GuardMode, GuardianConfig, SharedConfig};
pub use coordinator::{
    ApprovalGate, ApprovalRequest, ChannelApprovalGate, EnforcementMetrics, EnforcementReport,
    EnforcementStatus, GuardianCoordinator, PendingApproval, TransitionHook,
};
pub use engine::ValidationEngine;
pub use error::{ConfigError, GuardianError, Result, ResultExt, ValidationError};
pub use guards::{
    Artifact, AttemptContext, ExecutionFailure, GuardDecision, GuardKind, GuardOutcome, GuardState,
    InterruptReason, QualityTier, StateTransition,
};
pub use types::{Location, Principle, Severity, Timestamp};
pub use validators::Validator;
pub use verdict::{ConstitutionalVerdict, ValidationResult, Violation};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
