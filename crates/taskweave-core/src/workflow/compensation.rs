//! Compensation handlers and the rollback unwind.
//!
//! When an execution fails fatally, its rollback stack is popped in strict
//! reverse order and each entry is handed to the handler registered for the
//! entry's step type. Missing handlers and failing handlers are logged and
//! reported; neither stops the unwind.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::{Map, Value};
use taskweave_types::execution::{RollbackEntry, RollbackReport};
use taskweave_types::workflow::StepType;
use thiserror::Error;
use uuid::Uuid;

/// A compensation handler could not undo its step.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("rollback failed: {0}")]
pub struct CompensationError(pub String);

/// What a compensation handler sees of the failed execution.
#[derive(Debug, Clone)]
pub struct CompensationContext {
    pub workflow_id: String,
    pub execution_id: Uuid,
    /// Execution context at the time of failure.
    pub context: Arc<Map<String, Value>>,
}

// ---------------------------------------------------------------------------
// CompensationHandler trait
// ---------------------------------------------------------------------------

/// Reverse action for one step type.
pub trait CompensationHandler: Send + Sync {
    fn compensate(
        &self,
        entry: &RollbackEntry,
        ctx: &CompensationContext,
    ) -> impl Future<Output = Result<(), CompensationError>> + Send;
}

/// Object-safe version of [`CompensationHandler`] with boxed futures.
pub trait CompensationHandlerDyn: Send + Sync {
    fn compensate_boxed<'a>(
        &'a self,
        entry: &'a RollbackEntry,
        ctx: &'a CompensationContext,
    ) -> Pin<Box<dyn Future<Output = Result<(), CompensationError>> + Send + 'a>>;
}

impl<T: CompensationHandler> CompensationHandlerDyn for T {
    fn compensate_boxed<'a>(
        &'a self,
        entry: &'a RollbackEntry,
        ctx: &'a CompensationContext,
    ) -> Pin<Box<dyn Future<Output = Result<(), CompensationError>> + Send + 'a>> {
        Box::pin(self.compensate(entry, ctx))
    }
}

/// Type-erased compensation handler.
#[derive(Clone)]
pub struct BoxCompensationHandler {
    inner: Arc<dyn CompensationHandlerDyn>,
}

impl BoxCompensationHandler {
    pub fn new<T: CompensationHandler + 'static>(handler: T) -> Self {
        Self {
            inner: Arc::new(handler),
        }
    }

    pub async fn compensate(
        &self,
        entry: &RollbackEntry,
        ctx: &CompensationContext,
    ) -> Result<(), CompensationError> {
        self.inner.compensate_boxed(entry, ctx).await
    }
}

// ---------------------------------------------------------------------------
// CompensationRegistry
// ---------------------------------------------------------------------------

/// Compensation handlers keyed by step type.
#[derive(Clone, Default)]
pub struct CompensationRegistry {
    handlers: HashMap<StepType, BoxCompensationHandler>,
}

impl CompensationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H: CompensationHandler + 'static>(&mut self, step_type: StepType, handler: H) {
        self.handlers
            .insert(step_type, BoxCompensationHandler::new(handler));
    }

    pub fn with<H: CompensationHandler + 'static>(mut self, step_type: StepType, handler: H) -> Self {
        self.register(step_type, handler);
        self
    }

    pub fn get(&self, step_type: StepType) -> Option<&BoxCompensationHandler> {
        self.handlers.get(&step_type)
    }

    /// Drain `stack` from the top, compensating each entry.
    ///
    /// The stack is empty afterwards regardless of individual outcomes.
    pub async fn unwind(
        &self,
        stack: &mut Vec<RollbackEntry>,
        ctx: &CompensationContext,
    ) -> RollbackReport {
        let mut report = RollbackReport::default();

        while let Some(entry) = stack.pop() {
            let Some(handler) = self.get(entry.step_type) else {
                tracing::warn!(
                    execution_id = %ctx.execution_id,
                    step_id = entry.step_id.as_str(),
                    step_type = %entry.step_type,
                    "no compensation handler registered, skipping"
                );
                report.skipped.push(entry.step_id);
                continue;
            };

            match handler.compensate(&entry, ctx).await {
                Ok(()) => {
                    tracing::debug!(
                        execution_id = %ctx.execution_id,
                        step_id = entry.step_id.as_str(),
                        "step compensated"
                    );
                    report.compensated.push(entry.step_id);
                }
                Err(e) => {
                    tracing::warn!(
                        execution_id = %ctx.execution_id,
                        step_id = entry.step_id.as_str(),
                        error = %e,
                        "compensation failed, continuing unwind"
                    );
                    report.failed.push((entry.step_id, e.to_string()));
                }
            }
        }

        report
    }
}

impl std::fmt::Debug for CompensationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompensationRegistry")
            .field("step_types", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
