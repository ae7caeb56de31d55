//! Interception hook for host dispatchers

use crate::error::Result;
use crate::protection::{AutoProtection, Interception};
use async_trait::async_trait;
use guardian_core::{Action, Artifact, AttemptContext, ExecutionFailure};
use std::sync::Arc;

/// Whatever actually carries out actions in the host: a shell runner, a
/// file writer, a code generator.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(
        &self,
        action: &Action,
        attempt: AttemptContext,
    ) -> std::result::Result<Artifact, ExecutionFailure>;
}

/// A dispatcher whose every action goes through [`AutoProtection`] first
#[derive(Debug)]
pub struct ProtectedDispatcher<D> {
    inner: Arc<D>,
    protection: Arc<AutoProtection>,
}

impl<D> Clone for ProtectedDispatcher<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            protection: Arc::clone(&self.protection),
        }
    }
}

impl<D: Dispatcher> ProtectedDispatcher<D> {
    pub fn new(inner: D, protection: Arc<AutoProtection>) -> Self {
        Self {
            inner: Arc::new(inner),
            protection,
        }
    }

    /// The inner dispatcher only ever sees actions the pipeline let through
    pub async fn dispatch(&self, action: Action) -> Result<Interception> {
        let inner = Arc::clone(&self.inner);
        self.protection
            .intercept(action, move |action, attempt| {
                let inner = Arc::clone(&inner);
                async move { inner.dispatch(&action, attempt).await }
            })
            .await
    }

    pub fn inner(&self) -> &D {
        &self.inner
    }

    pub fn protection(&self) -> &Arc<AutoProtection> {
        &self.protection
    }
}
