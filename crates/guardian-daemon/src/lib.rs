//! Guardian Daemon - always-on auto-protection
//!
//! Wraps a [`guardian_core::GuardianCoordinator`] so that every action a host
//! dispatches is validated before it runs:
//!
//! - [`ProtectedDispatcher`] routes a host [`Dispatcher`] through
//!   [`AutoProtection::intercept`]
//! - blocked actions are rejected, auto-corrected or offered as a suggestion,
//!   per [`CorrectionStrategy`]
//! - a [`Watchdog`] task locks the daemon down when the pipeline stalls or
//!   its validators fail
//! - [`ProtectionEvent`]s and [`ProtectionAlert`]s are broadcast and kept in a
//!   bounded [`AuditTrail`]
//!
//! # Quick Start
//!
//! ```no_run
//! use guardian_core::{Action, Artifact, GuardianConfig, GuardianCoordinator, SharedConfig};
//! use guardian_daemon::{AutoProtection, CorrectionStrategy, ProtectionConfig};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let coordinator = GuardianCoordinator::new(SharedConfig::new(GuardianConfig::default())?);
//! let settings = ProtectionConfig::default().with_strategy(CorrectionStrategy::AutoFixSimple);
//! let protection = AutoProtection::new(Arc::new(coordinator), settings)?;
//! protection.start()?;
//!
//! let interception = protection
//!     .intercept(Action::shell("rm -rf build/"), |action, _attempt| async move {
//!         Ok(Artifact::output(format!("ran {}", action.content())))
//!     })
//!     .await?;
//! println!("{}", interception.report.status);
//!
//! protection.stop().await?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(rust_2018_idioms, missing_debug_implementations, clippy::all)]

pub mod audit;
pub mod config;
pub mod correction;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod protection;
pub mod watchdog;

pub use audit::AuditTrail;
pub use config::{CorrectionStrategy, ProtectionConfig};
pub use correction::{line_diff, Correction, FixCatalog};
pub use dispatch::{Dispatcher, ProtectedDispatcher};
pub use error::{DaemonError, Result};
pub use event::{AlertLevel, ProtectionAlert, ProtectionEvent};
pub use protection::{AutoProtection, Interception, ProtectionStats};
pub use watchdog::{InFlight, PipelineCounters, Watchdog, WatchdogFault};
