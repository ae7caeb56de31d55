//! Runtime guard
//!
//! Drives the execution callback attempt by attempt. Each attempt gets an
//! [`AttemptContext`] carrying a cancellation token that a timer task trips at
//! the deadline. Failures are reduced to normalized signatures in a rolling
//! window: the same signature coming back with no diagnosis recorded in
//! between is a circular error and interrupts the run.

use super::{GuardDecision, GuardKind};
use crate::config::{GuardianConfig, RuntimeLimits};
use crate::types::{now, Timestamp};
use lazy_static::lazy_static;
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

lazy_static! {
    static ref QUOTED: Regex = Regex::new(r#"'[^']*'|"[^"]*"|`[^`]*`"#).unwrap();
    static ref PATH: Regex = Regex::new(r"(?:[A-Za-z]:)?(?:[\\/][\w.\-]+)+[\\/]?").unwrap();
    static ref HEX: Regex = Regex::new(r"\b0x[0-9a-fA-F]+\b|\b[0-9a-fA-F]{8,}\b").unwrap();
    static ref DIGITS: Regex = Regex::new(r"\d+").unwrap();
    static ref WHITESPACE: Regex = Regex::new(r"\s+").unwrap();
    static ref KIND_PREFIX: Regex = Regex::new(r"^\s*([A-Za-z_][\w.:]*)\s*:\s*(.*)$").unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// Source code, judged again as code
    Code,
    /// Command or program output
    Output,
}

/// What a successful attempt produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub content: String,
    pub kind: ArtifactKind,
    pub produced_at: Timestamp,
}

impl Artifact {
    pub fn code(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            kind: ArtifactKind::Code,
            produced_at: now(),
        }
    }

    pub fn output(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            kind: ArtifactKind::Output,
            produced_at: now(),
        }
    }
}

/// A failed attempt as reported by the callback
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ExecutionFailure {
    pub kind: String,
    pub message: String,
}

impl ExecutionFailure {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Split `"ValueError: bad input"` into kind and message.
    ///
    /// Text without a recognizable kind prefix gets the kind `Error`.
    pub fn parse(text: &str) -> Self {
        match KIND_PREFIX.captures(text) {
            Some(caps) => Self::new(&caps[1], caps[2].trim()),
            None => Self::new("Error", text.trim()),
        }
    }

    /// Normalized form used for circular-error detection.
    ///
    /// Quoted strings, paths, hex values and numbers are collapsed to
    /// placeholders and the result is case-folded, so two failures that
    /// differ only in those details share a signature.
    pub fn signature(&self) -> String {
        let text = format!("{}: {}", self.kind, self.message);
        let text = QUOTED.replace_all(&text, "<str>");
        let text = PATH.replace_all(&text, "<path>");
        let text = HEX.replace_all(&text, "<hex>");
        let text = DIGITS.replace_all(&text, "<n>");
        let text = WHITESPACE.replace_all(text.trim(), " ");
        text.to_lowercase()
    }
}

/// Handle given to the callback for one attempt
#[derive(Debug, Clone)]
pub struct AttemptContext {
    attempt: u32,
    token: CancellationToken,
    diagnoses: Arc<Mutex<Vec<String>>>,
}

impl AttemptContext {
    fn new(attempt: u32, token: CancellationToken, diagnoses: Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            attempt,
            token,
            diagnoses,
        }
    }

    /// 1-based attempt number
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the guard cancels the run
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Record that the cause of the last failure was diagnosed.
    ///
    /// A diagnosis resets circular-error detection: a repeat of the previous
    /// failure after a diagnosis is treated as a new attempt at a fix.
    pub fn record_diagnosis(&self, diagnosis: impl Into<String>) {
        let diagnosis = diagnosis.into();
        debug!(attempt = self.attempt, %diagnosis, "diagnosis recorded");
        self.diagnoses.lock().push(diagnosis);
    }
}

/// Why the runtime guard stopped the execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InterruptReason {
    CircularError { signature: String, repeats: u32 },
    IterationLimit { max_iterations: u32, attempts: u32 },
    Timeout { elapsed_ms: u64, limit_ms: u64 },
}

impl fmt::Display for InterruptReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterruptReason::CircularError { signature, repeats } => write!(
                f,
                "circular error: `{}` repeated {} times without a new diagnosis",
                signature, repeats
            ),
            InterruptReason::IterationLimit {
                max_iterations,
                attempts,
            } => write!(
                f,
                "iteration limit reached: {} failed attempts of {} allowed",
                attempts, max_iterations
            ),
            InterruptReason::Timeout {
                elapsed_ms,
                limit_ms,
            } => write!(
                f,
                "execution timed out after {}ms (limit {}ms)",
                elapsed_ms, limit_ms
            ),
        }
    }
}

/// Rolling window of recent error signatures
#[derive(Debug, Clone)]
struct ErrorWindow {
    signatures: VecDeque<String>,
    capacity: usize,
}

impl ErrorWindow {
    fn new(capacity: usize) -> Self {
        Self {
            signatures: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Push a signature and return how often it now occurs in the window
    fn push(&mut self, signature: String) -> u32 {
        if self.signatures.len() == self.capacity {
            self.signatures.pop_front();
        }
        let repeats = self.signatures.iter().filter(|s| **s == signature).count() as u32 + 1;
        self.signatures.push_back(signature);
        repeats
    }

    fn clear(&mut self) {
        self.signatures.clear();
    }
}

/// Everything the runtime guard observed
#[derive(Debug, Clone)]
pub struct RuntimeOutcome {
    pub decision: GuardDecision,
    pub artifact: Option<Artifact>,
    pub attempts: u32,
    pub elapsed: Duration,
    pub errors: Vec<ExecutionFailure>,
    pub first_attempt_succeeded: bool,
    pub diagnoses: Vec<String>,
}

enum AttemptEnd {
    Finished(Result<Artifact, ExecutionFailure>),
    DeadlinePassed { returned: bool },
}

#[derive(Debug, Clone)]
pub struct RuntimeGuard {
    limits: RuntimeLimits,
}

impl RuntimeGuard {
    pub fn new(limits: RuntimeLimits) -> Self {
        Self { limits }
    }

    pub fn from_config(config: &GuardianConfig) -> Self {
        Self::new(config.runtime.clone())
    }

    pub fn limits(&self) -> &RuntimeLimits {
        &self.limits
    }

    /// Run `execute` until it succeeds or a limit interrupts it
    pub async fn monitor<F, Fut>(&self, mut execute: F) -> RuntimeOutcome
    where
        F: FnMut(AttemptContext) -> Fut,
        Fut: Future<Output = Result<Artifact, ExecutionFailure>>,
    {
        let limits = &self.limits;
        let started = Instant::now();
        let root = CancellationToken::new();
        let timer = {
            let token = root.clone();
            let limit = limits.timeout();
            tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                token.cancel();
            })
        };

        let diagnoses = Arc::new(Mutex::new(Vec::new()));
        let mut window = ErrorWindow::new(limits.error_window);
        let mut seen_diagnoses = 0;
        let mut errors = Vec::new();
        let mut attempts = 0u32;
        let mut artifact = None;

        let decision = loop {
            if root.is_cancelled() {
                break self.timed_out(started);
            }
            let failures = errors.len() as u32;
            if failures >= limits.max_iterations {
                break GuardDecision::interrupt(
                    InterruptReason::IterationLimit {
                        max_iterations: limits.max_iterations,
                        attempts: failures,
                    },
                    "",
                );
            }

            attempts += 1;
            let context = AttemptContext::new(attempts, root.child_token(), Arc::clone(&diagnoses));
            let run = execute(context);
            tokio::pin!(run);

            let end = tokio::select! {
                biased;
                result = &mut run => AttemptEnd::Finished(result),
                _ = root.cancelled() => {
                    let returned = tokio::time::timeout(limits.cancel_grace(), &mut run).await.is_ok();
                    AttemptEnd::DeadlinePassed { returned }
                }
            };

            match end {
                AttemptEnd::Finished(Ok(produced)) => {
                    let reasoning = if errors.is_empty() {
                        format!("completed on attempt {}", attempts)
                    } else {
                        format!(
                            "completed on attempt {} after {} failure(s), last: {}",
                            attempts,
                            errors.len(),
                            errors.last().map(ToString::to_string).unwrap_or_default()
                        )
                    };
                    artifact = Some(produced);
                    break if errors.is_empty() {
                        GuardDecision::approve(GuardKind::Runtime, reasoning)
                    } else {
                        GuardDecision::approve_with_warning(GuardKind::Runtime, reasoning)
                    };
                }
                AttemptEnd::Finished(Err(failure)) => {
                    warn!(attempt = attempts, error = %failure, "attempt failed");
                    let recorded = diagnoses.lock().len();
                    if recorded > seen_diagnoses {
                        window.clear();
                        seen_diagnoses = recorded;
                    }
                    let signature = failure.signature();
                    let repeats = window.push(signature.clone());
                    errors.push(failure);
                    if repeats >= limits.circular_threshold {
                        break GuardDecision::interrupt(
                            InterruptReason::CircularError { signature, repeats },
                            "",
                        );
                    }
                }
                AttemptEnd::DeadlinePassed { returned } => {
                    if !returned {
                        warn!(attempt = attempts, "callback ignored cancellation, abandoning it");
                    }
                    break self.timed_out(started);
                }
            }
        };
        timer.abort();

        let elapsed = started.elapsed();
        info!(
            outcome = %decision.outcome,
            attempts,
            elapsed_ms = elapsed.as_millis() as u64,
            "runtime guard finished"
        );
        let diagnoses = diagnoses.lock().clone();
        RuntimeOutcome {
            first_attempt_succeeded: artifact.is_some() && attempts == 1,
            decision,
            artifact,
            attempts,
            elapsed,
            errors,
            diagnoses,
        }
    }

    fn timed_out(&self, started: Instant) -> GuardDecision {
        GuardDecision::interrupt(
            InterruptReason::Timeout {
                elapsed_ms: started.elapsed().as_millis() as u64,
                limit_ms: self.limits.timeout_ms,
            },
            "",
        )
    }
}
