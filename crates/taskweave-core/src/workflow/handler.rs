//! Step handler port and the per-variant dispatch table.
//!
//! Follows the same blanket-impl pattern as the other ports in this crate:
//! 1. `StepHandler` uses RPITIT for its async method
//! 2. An object-safe `StepHandlerDyn` trait with boxed futures is
//!    blanket-implemented for every `T: StepHandler`
//! 3. `BoxStepHandler` wraps the trait object and delegates
//!
//! `StepHandlerRegistry` is a fixed-size array indexed by
//! [`StepType::index`], so dispatch is an exhaustive match, not a map lookup.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use taskweave_types::execution::StepResult;
use taskweave_types::workflow::{StepSpec, StepType};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors a step handler (or post-processor) can report.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StepError {
    #[error("step failed: {0}")]
    Failed(String),

    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("step cancelled")]
    Cancelled,
}

// ---------------------------------------------------------------------------
// StepContext
// ---------------------------------------------------------------------------

/// Everything a handler sees of the execution it runs in.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub workflow_id: String,
    pub execution_id: Uuid,
    pub step_id: String,
    /// The step's parameters with templates resolved.
    pub parameters: Value,
    /// Snapshot of the execution context at dispatch time.
    pub context: Arc<Map<String, Value>>,
    pub cancel: CancellationToken,
    pub deadline: Option<Instant>,
}

impl StepContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Time left before the execution deadline, if one is set.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Fetch a required string parameter.
    pub fn param_str(&self, key: &str) -> Result<&str, StepError> {
        self.parameters
            .get(key)
            .and_then(Value::as_str)
            .ok_or_else(|| {
                StepError::InvalidParameters(format!(
                    "step '{}' requires string parameter '{}'",
                    self.step_id, key
                ))
            })
    }
}

// ---------------------------------------------------------------------------
// StepHandler trait
// ---------------------------------------------------------------------------

/// A capability that executes one step variant.
pub trait StepHandler: Send + Sync {
    fn handle(
        &self,
        step: &StepSpec,
        ctx: &StepContext,
    ) -> impl Future<Output = Result<StepResult, StepError>> + Send;
}

/// Object-safe version of [`StepHandler`] with boxed futures.
pub trait StepHandlerDyn: Send + Sync {
    fn handle_boxed<'a>(
        &'a self,
        step: &'a StepSpec,
        ctx: &'a StepContext,
    ) -> Pin<Box<dyn Future<Output = Result<StepResult, StepError>> + Send + 'a>>;
}

/// Blanket implementation: any `StepHandler` automatically implements `StepHandlerDyn`.
impl<T: StepHandler> StepHandlerDyn for T {
    fn handle_boxed<'a>(
        &'a self,
        step: &'a StepSpec,
        ctx: &'a StepContext,
    ) -> Pin<Box<dyn Future<Output = Result<StepResult, StepError>> + Send + 'a>> {
        Box::pin(self.handle(step, ctx))
    }
}

/// Type-erased step handler.
///
/// Cloning shares the underlying handler, so fan-out tasks can own one.
#[derive(Clone)]
pub struct BoxStepHandler {
    inner: Arc<dyn StepHandlerDyn>,
}

impl BoxStepHandler {
    pub fn new<T: StepHandler + 'static>(handler: T) -> Self {
        Self {
            inner: Arc::new(handler),
        }
    }

    pub async fn handle(&self, step: &StepSpec, ctx: &StepContext) -> Result<StepResult, StepError> {
        self.inner.handle_boxed(step, ctx).await
    }
}

impl std::fmt::Debug for BoxStepHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("BoxStepHandler")
    }
}

// ---------------------------------------------------------------------------
// Closure handlers
// ---------------------------------------------------------------------------

/// Adapts an async closure into a [`StepHandler`].
///
/// The closure receives owned copies of the step and its context.
pub struct FnStepHandler<F> {
    f: F,
}

/// Build a handler from `|step, ctx| async move { ... }`.
pub fn handler_fn<F, Fut>(f: F) -> FnStepHandler<F>
where
    F: Fn(StepSpec, StepContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<StepResult, StepError>> + Send,
{
    FnStepHandler { f }
}

impl<F, Fut> StepHandler for FnStepHandler<F>
where
    F: Fn(StepSpec, StepContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<StepResult, StepError>> + Send,
{
    fn handle(
        &self,
        step: &StepSpec,
        ctx: &StepContext,
    ) -> impl Future<Output = Result<StepResult, StepError>> + Send {
        (self.f)(step.clone(), ctx.clone())
    }
}

// ---------------------------------------------------------------------------
// StepHandlerRegistry
// ---------------------------------------------------------------------------

/// Dispatch table with one slot per [`StepType`] variant.
///
/// `ParallelApiCalls` steps never reach their own slot: the engine fans each
/// unit out to the `ApiCall` handler.
#[derive(Debug, Clone, Default)]
pub struct StepHandlerRegistry {
    slots: [Option<BoxStepHandler>; StepType::COUNT],
}

impl StepHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the handler for a step type.
    pub fn register<H: StepHandler + 'static>(&mut self, step_type: StepType, handler: H) {
        self.slots[step_type.index()] = Some(BoxStepHandler::new(handler));
    }

    /// Builder-style [`register`](Self::register).
    pub fn with<H: StepHandler + 'static>(mut self, step_type: StepType, handler: H) -> Self {
        self.register(step_type, handler);
        self
    }

    pub fn get(&self, step_type: StepType) -> Option<&BoxStepHandler> {
        self.slots[step_type.index()].as_ref()
    }

    pub fn contains(&self, step_type: StepType) -> bool {
        self.get(step_type).is_some()
    }

    /// Step types with a registered handler, in declaration order.
    pub fn registered_types(&self) -> Vec<StepType> {
        StepType::ALL
            .into_iter()
            .filter(|t| self.contains(*t))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
