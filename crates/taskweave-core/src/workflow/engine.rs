//! Workflow execution engine.
//!
//! `WorkflowEngine` owns the workflow catalog, the step handler dispatch
//! table, the compensation registry, the execution registry, and metrics.
//! Each `execute_workflow` call owns exactly one `ExecutionState` and mutates
//! it from a sequential step loop; the only concurrency inside a run is the
//! bounded fan-out of `parallel_api_calls` steps.
//!
//! # Execution flow
//!
//! 1. Resolve the step order: the supplied plan's `ordered_steps`, or the
//!    stable topological order of the definition.
//! 2. For each step: check cancellation and deadline, verify dependencies,
//!    consult the cache, dispatch by step type, then apply the result.
//! 3. A failure is routed by the workflow's error-handling policy: retry and
//!    prompt failures park the execution for `resume_execution`; anything
//!    else unwinds the rollback stack and fails the run.
//! 4. The final output (last result, or the terminating step's result) goes
//!    through the optional post-processor.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use serde_json::{Map, Value};
use taskweave_types::config::EngineConfig;
use taskweave_types::execution::{
    ExecutionFailure, ExecutionMetadata, ExecutionOutcome, ExecutionResult, ExecutionState,
    ExecutionStatus, FailureKind, RollbackEntry, RollbackReport, StepResult,
};
use taskweave_types::metrics::MetricsSnapshot;
use taskweave_types::optimization::{Constraints, OptimizationPlan, StrategyHint};
use taskweave_types::workflow::{
    FailurePolicy, StepSpec, StepType, WorkflowDefinition, WorkflowSummary,
};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::optimizer::{Optimizer, OptimizerError};

use super::cache::{BoxCachePort, CacheContext, CacheOptions, CachePort, cache_key};
use super::compensation::{CompensationContext, CompensationHandler, CompensationRegistry};
use super::context::{TemplateScope, merge_context};
use super::dag::DependencyGraph;
use super::definition::{WorkflowError, discover_workflows, parse_workflow_yaml, validate_definition};
use super::fanout::fan_out;
use super::handler::{StepContext, StepError, StepHandler, StepHandlerRegistry};
use super::metrics::MetricsCollector;
use super::post_process::{BoxPostProcessor, PostProcessor};
use super::registry::{ExecutionRegistry, ParkedExecution};

// ---------------------------------------------------------------------------
// EngineError
// ---------------------------------------------------------------------------

/// Errors from the execution engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The definition failed validation.
    #[error("invalid workflow: {0}")]
    InvalidWorkflow(#[from] WorkflowError),

    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("execution not found: {0}")]
    ExecutionNotFound(Uuid),

    /// The execution exists but is running or already finished.
    #[error("execution {0} is not parked and cannot be resumed")]
    ExecutionNotResumable(Uuid),

    /// A supplied plan does not fit the workflow.
    #[error("invalid plan: {0}")]
    InvalidPlan(String),

    #[error("step '{step_id}' has unmet dependencies: {}", missing.join(", "))]
    DependencyUnmet { step_id: String, missing: Vec<String> },

    #[error("step '{step_id}' failed: {message}")]
    StepExecution { step_id: String, message: String },

    #[error("no handler registered for step '{step_id}' of type {step_type}")]
    UnknownStepType { step_id: String, step_type: StepType },

    /// The post-processor rejected the final output.
    #[error("post-processing failed: {0}")]
    PostProcessing(String),

    #[error("execution cancelled")]
    Cancelled,

    #[error("execution deadline exceeded")]
    DeadlineExceeded,

    #[error("optimizer error: {0}")]
    Optimizer(#[from] OptimizerError),
}

impl EngineError {
    /// Classification used in `ExecutionFailure`.
    fn failure_kind(&self) -> FailureKind {
        match self {
            EngineError::DependencyUnmet { .. } => FailureKind::DependencyUnmet,
            EngineError::UnknownStepType { .. } => FailureKind::UnknownStepType,
            EngineError::Cancelled => FailureKind::Cancelled,
            EngineError::DeadlineExceeded => FailureKind::DeadlineExceeded,
            _ => FailureKind::StepExecution,
        }
    }
}

// ---------------------------------------------------------------------------
// ExecutionOptions
// ---------------------------------------------------------------------------

/// Per-call execution settings. The default runs in topological order with
/// the configured fan-out bound, no deadline, and a token nobody cancels.
#[derive(Debug, Clone, Default)]
pub struct ExecutionOptions {
    /// Follow this plan's step order instead of the topological order.
    pub plan: Option<OptimizationPlan>,
    /// Overrides `EngineConfig::max_parallel_operations` for fan-out steps.
    pub max_parallel_operations: Option<usize>,
    pub cancel: CancellationToken,
    /// Checked before each step.
    pub deadline: Option<Instant>,
}

impl ExecutionOptions {
    pub fn with_plan(mut self, plan: OptimizationPlan) -> Self {
        self.plan = Some(plan);
        self
    }

    pub fn with_max_parallel(mut self, max_parallel_operations: usize) -> Self {
        self.max_parallel_operations = Some(max_parallel_operations);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }
}

/// Cancellation and deadline for one drive of the step loop.
#[derive(Debug, Clone)]
struct RunControl {
    fan_out_limit: usize,
    cancel: CancellationToken,
    deadline: Option<Instant>,
    started: Instant,
}

/// Releases an execution's registry slot if its future is dropped before the
/// step loop returns (caller timeout, `select!`, aborted task).
///
/// The state lives inside the dropped future, so no rollback can run; the
/// execution is counted as failed and logged.
struct RunGuard<'a> {
    engine: &'a WorkflowEngine,
    execution_id: Uuid,
    started: Instant,
    armed: bool,
}

impl<'a> RunGuard<'a> {
    fn new(engine: &'a WorkflowEngine, execution_id: Uuid) -> Self {
        Self {
            engine,
            execution_id,
            started: Instant::now(),
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if !self.armed || !self.engine.executions.abandon(self.execution_id) {
            return;
        }
        let elapsed_ms = self.started.elapsed().as_millis() as u64;
        self.engine.metrics.record_failed(elapsed_ms);
        tracing::warn!(
            execution_id = %self.execution_id,
            elapsed_ms,
            "execution dropped before finishing, rollback skipped"
        );
    }
}

/// Step result plus whether it came from the cache.
struct StepOutcome {
    result: StepResult,
    cached: bool,
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Assembles a [`WorkflowEngine`] from its collaborators.
pub struct WorkflowEngineBuilder {
    config: EngineConfig,
    handlers: StepHandlerRegistry,
    compensations: CompensationRegistry,
    cache: Option<BoxCachePort>,
    post_processor: Option<BoxPostProcessor>,
    optimizer: Optimizer,
}

impl WorkflowEngineBuilder {
    pub fn handler<H: StepHandler + 'static>(mut self, step_type: StepType, handler: H) -> Self {
        self.handlers.register(step_type, handler);
        self
    }

    pub fn handlers(mut self, handlers: StepHandlerRegistry) -> Self {
        self.handlers = handlers;
        self
    }

    pub fn compensation<H: CompensationHandler + 'static>(
        mut self,
        step_type: StepType,
        handler: H,
    ) -> Self {
        self.compensations.register(step_type, handler);
        self
    }

    pub fn cache<C: CachePort + 'static>(mut self, cache: C) -> Self {
        self.cache = Some(BoxCachePort::new(cache));
        self
    }

    pub fn post_processor<P: PostProcessor + 'static>(mut self, processor: P) -> Self {
        self.post_processor = Some(BoxPostProcessor::new(processor));
        self
    }

    pub fn optimizer(mut self, optimizer: Optimizer) -> Self {
        self.optimizer = optimizer;
        self
    }

    pub fn build(self) -> WorkflowEngine {
        WorkflowEngine {
            executions: ExecutionRegistry::new(self.config.history_capacity),
            config: self.config,
            workflows: DashMap::new(),
            handlers: self.handlers,
            compensations: self.compensations,
            cache: self.cache,
            post_processor: self.post_processor,
            optimizer: self.optimizer,
            metrics: MetricsCollector::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

/// Dependency-aware workflow executor.
pub struct WorkflowEngine {
    config: EngineConfig,
    workflows: DashMap<String, Arc<WorkflowDefinition>>,
    handlers: StepHandlerRegistry,
    compensations: CompensationRegistry,
    cache: Option<BoxCachePort>,
    post_processor: Option<BoxPostProcessor>,
    optimizer: Optimizer,
    executions: ExecutionRegistry,
    metrics: MetricsCollector,
}

impl WorkflowEngine {
    pub fn builder(config: EngineConfig) -> WorkflowEngineBuilder {
        WorkflowEngineBuilder {
            config,
            handlers: StepHandlerRegistry::new(),
            compensations: CompensationRegistry::new(),
            cache: None,
            post_processor: None,
            optimizer: Optimizer::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // -- Catalog ------------------------------------------------------------

    /// Validate and register a definition, replacing any with the same ID.
    pub fn register_workflow(
        &self,
        definition: WorkflowDefinition,
    ) -> Result<Arc<WorkflowDefinition>, EngineError> {
        validate_definition(&definition)?;
        let definition = Arc::new(definition);
        let replaced = self
            .workflows
            .insert(definition.id.clone(), Arc::clone(&definition))
            .is_some();
        tracing::info!(
            workflow = definition.id.as_str(),
            steps = definition.steps.len(),
            replaced,
            "workflow registered"
        );
        Ok(definition)
    }

    /// Parse, validate, and register a YAML definition.
    pub fn load_workflow_yaml(&self, yaml: &str) -> Result<Arc<WorkflowDefinition>, EngineError> {
        self.register_workflow(parse_workflow_yaml(yaml)?)
    }

    /// Register every valid workflow file under `dir`. Returns how many were loaded.
    pub fn load_workflow_dir(&self, dir: &Path) -> Result<usize, EngineError> {
        let found = discover_workflows(dir)?;
        let count = found.len();
        for (path, definition) in found {
            tracing::debug!(?path, workflow = definition.id.as_str(), "loading workflow file");
            self.register_workflow(definition)?;
        }
        Ok(count)
    }

    pub fn get_workflow(&self, workflow_id: &str) -> Result<Arc<WorkflowDefinition>, EngineError> {
        self.workflows
            .get(workflow_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| EngineError::WorkflowNotFound(workflow_id.to_string()))
    }

    /// Summaries of all registered workflows, sorted by ID.
    pub fn list_workflows(&self) -> Vec<WorkflowSummary> {
        let mut summaries: Vec<WorkflowSummary> = self
            .workflows
            .iter()
            .map(|entry| entry.value().summary())
            .collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        summaries
    }

    // -- Optimization -------------------------------------------------------

    /// Plan a registered workflow under `constraints`.
    pub fn optimize_workflow(
        &self,
        workflow_id: &str,
        constraints: &Constraints,
        hint: StrategyHint,
    ) -> Result<OptimizationPlan, EngineError> {
        let definition = self.get_workflow(workflow_id)?;
        Ok(self.optimizer.optimize(&definition, constraints, hint)?)
    }

    /// Hint for automatic strategy selection with the configured target.
    pub fn default_hint(&self) -> StrategyHint {
        StrategyHint::auto(self.config.default_target)
    }

    // -- Inspection ---------------------------------------------------------

    pub fn get_stats(&self) -> MetricsSnapshot {
        self.metrics.snapshot(self.executions.active_count())
    }

    /// Parked state of an execution, or its final state if it finished.
    pub fn execution(&self, execution_id: Uuid) -> Option<ExecutionState> {
        self.executions.get(execution_id)
    }

    /// Finished executions, oldest first.
    pub fn history(&self) -> Vec<ExecutionState> {
        self.executions.history()
    }

    // -- Execution ----------------------------------------------------------

    /// Run a registered workflow to completion, suspension, or failure.
    ///
    /// Returns `Err` only when no execution could be started: unknown
    /// workflow, invalid definition, or a plan that does not fit. Every
    /// started execution yields an `ExecutionResult`, including failed ones.
    pub async fn execute_workflow(
        &self,
        workflow_id: &str,
        initial_context: Map<String, Value>,
        options: ExecutionOptions,
    ) -> Result<ExecutionResult, EngineError> {
        let definition = self.get_workflow(workflow_id)?;
        let graph = DependencyGraph::from_definition(&definition)?;

        let mut metadata = ExecutionMetadata::default();
        let order = match &options.plan {
            Some(plan) => {
                let order = plan_order(&definition, &graph, plan)?;
                metadata.strategy = Some(plan.strategy);
                metadata.repairs = plan.repairs.clone();
                metadata.skipped_steps = definition
                    .steps
                    .iter()
                    .filter(|s| !order.contains(&s.id))
                    .map(|s| s.id.clone())
                    .collect();
                order
            }
            None => graph.topological_order(),
        };

        let execution_id = Uuid::now_v7();
        let state = ExecutionState::new(execution_id, workflow_id, order, initial_context);
        self.executions.start(execution_id, workflow_id);
        self.metrics.record_started();
        let guard = RunGuard::new(self, execution_id);

        tracing::info!(
            execution_id = %execution_id,
            workflow = workflow_id,
            steps = state.order.len(),
            strategy = metadata.strategy.map(|s| s.as_str()),
            "workflow execution started"
        );

        let control = RunControl {
            fan_out_limit: options
                .max_parallel_operations
                .unwrap_or(self.config.max_parallel_operations)
                .max(1),
            cancel: options.cancel,
            deadline: options.deadline,
            started: Instant::now(),
        };
        let result = self.drive(&definition, state, metadata, control).await;
        guard.disarm();
        Ok(result)
    }

    /// Resume a parked execution at the step that failed.
    ///
    /// `input` is merged into the execution context first, so a prompt can be
    /// answered and a retry can carry corrected values. `options` supplies the
    /// cancellation token and deadline for the resumed run; without a new
    /// deadline the original one still applies. A resumed execution keeps its
    /// step order, so `options.plan` must be `None`.
    pub async fn resume_execution(
        &self,
        execution_id: Uuid,
        input: Map<String, Value>,
        options: ExecutionOptions,
    ) -> Result<ExecutionResult, EngineError> {
        if options.plan.is_some() {
            return Err(EngineError::InvalidPlan(
                "a resumed execution keeps its original step order".to_string(),
            ));
        }
        let workflow_id = self
            .executions
            .workflow_of(execution_id)
            .ok_or(EngineError::ExecutionNotFound(execution_id))?;
        let definition = self.get_workflow(&workflow_id)?;

        let ParkedExecution {
            mut state,
            metadata,
            fan_out_limit,
            deadline,
            ..
        } = self.executions.take_parked(execution_id)?;
        let guard = RunGuard::new(self, execution_id);

        merge_context(&mut state.context, &input);
        state.updated_at = Utc::now();

        tracing::info!(
            execution_id = %execution_id,
            workflow = workflow_id.as_str(),
            step = state.current_step().unwrap_or_default(),
            "resuming parked execution"
        );

        let control = RunControl {
            fan_out_limit: options
                .max_parallel_operations
                .map_or(fan_out_limit, |limit| limit.max(1)),
            cancel: options.cancel,
            deadline: options.deadline.or(deadline),
            started: Instant::now(),
        };
        let result = self.drive(&definition, state, metadata, control).await;
        guard.disarm();
        Ok(result)
    }

    /// Abandon parked executions idle longer than the configured TTL.
    ///
    /// Each one is rolled back, marked failed, and moved to history.
    /// Returns how many were swept.
    pub async fn sweep_expired(&self) -> usize {
        let ttl = Duration::from_secs(self.config.execution_ttl_secs);
        let expired = self.executions.take_expired(ttl);
        let count = expired.len();

        for parked in expired {
            let mut state = parked.state;
            tracing::warn!(
                execution_id = %state.execution_id,
                workflow = state.workflow_id.as_str(),
                idle_secs = parked.parked_at.elapsed().as_secs(),
                "abandoning expired parked execution"
            );
            self.rollback(&mut state).await;
            state.status = ExecutionStatus::Failed;
            state.updated_at = Utc::now();
            let elapsed_ms = (state.updated_at - state.started_at)
                .num_milliseconds()
                .max(0) as u64;
            self.metrics.record_failed(elapsed_ms);
            self.executions.finish(state);
        }
        count
    }

    /// Run `sweep_expired` every `interval` until `cancel` fires.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let swept = engine.sweep_expired().await;
                        if swept > 0 {
                            tracing::debug!(swept, "sweeper pass complete");
                        }
                    }
                }
            }
        })
    }

    // -- Step loop ----------------------------------------------------------

    async fn drive(
        &self,
        definition: &WorkflowDefinition,
        mut state: ExecutionState,
        mut metadata: ExecutionMetadata,
        control: RunControl,
    ) -> ExecutionResult {
        let mut output = state
            .completed_steps
            .last()
            .and_then(|id| state.step_results.get(id))
            .map(|r| r.result.clone());
        let mut outcome = ExecutionOutcome::Completed;

        while let Some(step_id) = state.current_step().map(str::to_string) {
            let Some(step) = definition.step(&step_id) else {
                let err = EngineError::StepExecution {
                    message: "step is not part of the workflow".to_string(),
                    step_id: step_id.clone(),
                };
                return self
                    .fail(state, metadata, Some(step_id), err, &control)
                    .await;
            };

            let step_outcome = match self.check_control(&control) {
                Ok(()) => self.run_step(definition, step, &state, &control).await,
                Err(e) => Err(e),
            };

            match step_outcome {
                Ok(StepOutcome { result, cached }) => {
                    if cached {
                        metadata.cache_hits.push(step_id.clone());
                    }
                    let terminate = result.terminate;
                    output = Some(result.result.clone());
                    self.apply_success(step, &mut state, result, cached).await;
                    if terminate {
                        tracing::info!(
                            execution_id = %state.execution_id,
                            step_id = step_id.as_str(),
                            "step requested early termination"
                        );
                        outcome = ExecutionOutcome::Terminated { step_id };
                        break;
                    }
                }
                Err(err) => {
                    let policy = match &err {
                        EngineError::StepExecution { .. } => {
                            definition.error_handling.policy_for(&step_id)
                        }
                        _ => FailurePolicy::Fatal,
                    };
                    return match policy {
                        FailurePolicy::Fatal => {
                            self.fail(state, metadata, Some(step_id), err, &control)
                                .await
                        }
                        FailurePolicy::Retry => {
                            let outcome = ExecutionOutcome::RetryRequested {
                                step_id,
                                reason: err.to_string(),
                            };
                            self.park(state, metadata, outcome, &control)
                        }
                        FailurePolicy::Prompt => {
                            let outcome = ExecutionOutcome::RequiresUserInput {
                                step_id,
                                reason: err.to_string(),
                            };
                            self.park(state, metadata, outcome, &control)
                        }
                    };
                }
            }
        }

        let mut output = output.unwrap_or(Value::Null);
        if let Some(processor) = &self.post_processor {
            match processor.process(definition, &state, output).await {
                Ok(processed) => output = processed,
                Err(e) => {
                    let err = EngineError::PostProcessing(e.to_string());
                    return self.fail(state, metadata, None, err, &control).await;
                }
            }
        }

        state.status = ExecutionStatus::Completed;
        state.updated_at = Utc::now();
        let elapsed_ms = elapsed_ms(&control);
        self.metrics.record_completed(elapsed_ms);

        tracing::info!(
            execution_id = %state.execution_id,
            workflow = state.workflow_id.as_str(),
            steps_completed = state.completed_steps.len(),
            elapsed_ms,
            "workflow execution completed"
        );

        let result = ExecutionResult {
            success: true,
            execution_id: state.execution_id,
            workflow_id: state.workflow_id.clone(),
            outcome,
            result: Some(output),
            error: None,
            execution_time_ms: elapsed_ms,
            steps_completed: state.completed_steps.clone(),
            metadata,
        };
        self.executions.finish(state);
        result
    }

    fn check_control(&self, control: &RunControl) -> Result<(), EngineError> {
        if control.cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        if control.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(EngineError::DeadlineExceeded);
        }
        Ok(())
    }

    /// Verify dependencies, consult the cache, and dispatch one step.
    async fn run_step(
        &self,
        definition: &WorkflowDefinition,
        step: &StepSpec,
        state: &ExecutionState,
        control: &RunControl,
    ) -> Result<StepOutcome, EngineError> {
        let missing: Vec<String> = definition
            .prerequisites(&step.id)
            .into_iter()
            .filter(|dep| !state.is_completed(dep))
            .collect();
        if !missing.is_empty() {
            return Err(EngineError::DependencyUnmet {
                step_id: step.id.clone(),
                missing,
            });
        }

        if let Some(result) = self.cache_lookup(definition, step, state).await {
            tracing::debug!(
                execution_id = %state.execution_id,
                step_id = step.id.as_str(),
                "cache hit"
            );
            return Ok(StepOutcome {
                result,
                cached: true,
            });
        }

        let scope = TemplateScope {
            workflow_id: &definition.id,
            execution_id: state.execution_id,
            context: &state.context,
            step_results: &state.step_results,
        };
        let ctx = StepContext {
            workflow_id: definition.id.clone(),
            execution_id: state.execution_id,
            step_id: step.id.clone(),
            parameters: scope.resolve(&step.parameters),
            context: Arc::new(state.context.clone()),
            cancel: control.cancel.clone(),
            deadline: control.deadline,
        };

        tracing::debug!(
            execution_id = %state.execution_id,
            step_id = step.id.as_str(),
            step_type = %step.step_type,
            "dispatching step"
        );

        let unknown = || EngineError::UnknownStepType {
            step_id: step.id.clone(),
            step_type: step.step_type,
        };
        let dispatched = match step.step_type {
            StepType::ParallelApiCalls => {
                let handler = self.handlers.get(StepType::ApiCall).ok_or_else(unknown)?;
                fan_out(handler, step, &ctx, control.fan_out_limit).await
            }
            StepType::Authentication
            | StepType::ApiCall
            | StepType::UserInput
            | StepType::Validation
            | StepType::Computation
            | StepType::Conditional
            | StepType::ReportGeneration
            | StepType::Confirmation
            | StepType::Finalization
            | StepType::DataProcessing
            | StepType::Delivery => {
                let handler = self.handlers.get(step.step_type).ok_or_else(unknown)?;
                handler.handle(step, &ctx).await
            }
        };

        match dispatched {
            Ok(result) if result.success => Ok(StepOutcome {
                result,
                cached: false,
            }),
            Ok(result) => Err(EngineError::StepExecution {
                step_id: step.id.clone(),
                message: format!("step reported failure: {}", result.result),
            }),
            Err(StepError::Cancelled) => Err(EngineError::Cancelled),
            Err(e) => Err(EngineError::StepExecution {
                step_id: step.id.clone(),
                message: e.to_string(),
            }),
        }
    }

    async fn cache_lookup(
        &self,
        definition: &WorkflowDefinition,
        step: &StepSpec,
        state: &ExecutionState,
    ) -> Option<StepResult> {
        let (Some(cache), Some(policy)) = (&self.cache, &step.cache) else {
            return None;
        };
        let key = cache_key(&definition.id, &step.id, policy, &state.context);
        let ctx = CacheContext {
            workflow_id: definition.id.clone(),
            step_id: step.id.clone(),
            classification: policy.classification,
        };

        match cache.get(&key, &ctx).await {
            Ok(Some(value)) => match serde_json::from_value::<StepResult>(value) {
                Ok(result) if result.success => Some(StepResult {
                    rollback_data: None,
                    ..result
                }),
                Ok(_) => None,
                Err(e) => {
                    tracing::warn!(step_id = step.id.as_str(), error = %e, "ignoring malformed cache entry");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(step_id = step.id.as_str(), error = %e, "cache lookup failed, running uncached");
                None
            }
        }
    }

    /// Merge, record, push rollback entry, and store in cache.
    async fn apply_success(
        &self,
        step: &StepSpec,
        state: &mut ExecutionState,
        mut result: StepResult,
        cached: bool,
    ) {
        // Keyed on the context the step ran with, before its own updates.
        let cache_slot = match (&self.cache, &step.cache) {
            (Some(cache), Some(policy)) if !cached => Some((
                cache,
                policy,
                cache_key(&state.workflow_id, &step.id, policy, &state.context),
            )),
            _ => None,
        };
        merge_context(&mut state.context, &result.context_updates);

        if !step.rollbackable {
            result.rollback_data = None;
        } else if !cached {
            state.rollback_stack.push(RollbackEntry {
                step_id: step.id.clone(),
                step_type: step.step_type,
                rollback_data: result.rollback_data.clone().unwrap_or(Value::Null),
            });
        }

        if let Some((cache, policy, key)) = cache_slot {
            let stored = StepResult {
                rollback_data: None,
                ..result.clone()
            };
            match serde_json::to_value(&stored) {
                Ok(value) => {
                    if let Err(e) = cache.set(&key, value, CacheOptions::from_policy(policy)).await {
                        tracing::warn!(step_id = step.id.as_str(), error = %e, "cache store failed");
                    }
                }
                Err(e) => {
                    tracing::warn!(step_id = step.id.as_str(), error = %e, "step result not cacheable");
                }
            }
        }

        state.step_results.insert(step.id.clone(), result);
        state.completed_steps.push(step.id.clone());
        state.current_step_index += 1;
        state.updated_at = Utc::now();
    }

    fn park(
        &self,
        mut state: ExecutionState,
        metadata: ExecutionMetadata,
        outcome: ExecutionOutcome,
        control: &RunControl,
    ) -> ExecutionResult {
        state.updated_at = Utc::now();
        let elapsed_ms = elapsed_ms(control);
        self.metrics.record_suspended();

        tracing::info!(
            execution_id = %state.execution_id,
            workflow = state.workflow_id.as_str(),
            outcome = ?outcome,
            "workflow execution parked"
        );

        let result = ExecutionResult {
            success: false,
            execution_id: state.execution_id,
            workflow_id: state.workflow_id.clone(),
            outcome: outcome.clone(),
            result: None,
            error: None,
            execution_time_ms: elapsed_ms,
            steps_completed: state.completed_steps.clone(),
            metadata: metadata.clone(),
        };
        self.executions.park(ParkedExecution {
            state,
            outcome,
            metadata,
            fan_out_limit: control.fan_out_limit,
            deadline: control.deadline,
            parked_at: Instant::now(),
        });
        result
    }

    async fn fail(
        &self,
        mut state: ExecutionState,
        mut metadata: ExecutionMetadata,
        step_id: Option<String>,
        err: EngineError,
        control: &RunControl,
    ) -> ExecutionResult {
        tracing::warn!(
            execution_id = %state.execution_id,
            workflow = state.workflow_id.as_str(),
            step_id = step_id.as_deref(),
            error = %err,
            "workflow execution failed"
        );

        metadata.rollback = self.rollback(&mut state).await;
        state.status = ExecutionStatus::Failed;
        state.updated_at = Utc::now();
        let elapsed_ms = elapsed_ms(control);
        self.metrics.record_failed(elapsed_ms);

        let result = ExecutionResult {
            success: false,
            execution_id: state.execution_id,
            workflow_id: state.workflow_id.clone(),
            outcome: ExecutionOutcome::Failed,
            result: None,
            error: Some(ExecutionFailure {
                step_id,
                kind: err.failure_kind(),
                message: err.to_string(),
            }),
            execution_time_ms: elapsed_ms,
            steps_completed: state.completed_steps.clone(),
            metadata,
        };
        self.executions.finish(state);
        result
    }

    /// Unwind the rollback stack, if there is anything to compensate.
    async fn rollback(&self, state: &mut ExecutionState) -> Option<RollbackReport> {
        if state.rollback_stack.is_empty() {
            return None;
        }
        let ctx = CompensationContext {
            workflow_id: state.workflow_id.clone(),
            execution_id: state.execution_id,
            context: Arc::new(state.context.clone()),
        };
        let report = self
            .compensations
            .unwind(&mut state.rollback_stack, &ctx)
            .await;
        self.metrics.record_rollback(report.failed.len());
        tracing::info!(
            execution_id = %state.execution_id,
            compensated = report.compensated.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            "rollback finished"
        );
        Some(report)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn elapsed_ms(control: &RunControl) -> u64 {
    control.started.elapsed().as_millis() as u64
}

/// Validate a plan against its workflow and return its step order.
fn plan_order(
    definition: &WorkflowDefinition,
    graph: &DependencyGraph,
    plan: &OptimizationPlan,
) -> Result<Vec<String>, EngineError> {
    if plan.workflow_id != definition.id {
        return Err(EngineError::InvalidPlan(format!(
            "plan is for workflow '{}', not '{}'",
            plan.workflow_id, definition.id
        )));
    }
    if let Some(unknown) = plan
        .ordered_steps
        .iter()
        .find(|id| graph.index_of(id).is_none())
    {
        return Err(EngineError::InvalidPlan(format!(
            "plan references unknown step '{}'",
            unknown
        )));
    }
    if !graph.respects_order(&plan.ordered_steps) {
        return Err(EngineError::InvalidPlan(
            "plan order repeats a step or runs a step before its prerequisites".to_string(),
        ));
    }
    Ok(plan.ordered_steps.clone())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
