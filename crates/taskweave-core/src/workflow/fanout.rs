//! Bounded fan-out for parallel-call-group steps.
//!
//! A `parallel_api_calls` step lists independent units in
//! `parameters.operations` as `{id, parameters}`. Each unit becomes one task
//! on a `JoinSet`, gated by a `Semaphore` so at most `max_parallel` units run
//! at once, and is dispatched to the `api_call` handler.
//!
//! The join is fail-fast: the first failing unit fails the whole step. The
//! remaining tasks are detached, not aborted, so they run to completion in
//! the background and their results are discarded.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Map, Value, json};
use taskweave_types::execution::StepResult;
use taskweave_types::workflow::{StepSpec, StepType};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use super::handler::{BoxStepHandler, StepContext, StepError};

/// One independent unit of a parallel-call-group step.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FanOutUnit {
    pub id: String,
    #[serde(default)]
    pub parameters: Value,
}

/// Read the unit list from a step's resolved parameters.
pub fn parse_units(step_id: &str, parameters: &Value) -> Result<Vec<FanOutUnit>, StepError> {
    let operations = parameters.get("operations").ok_or_else(|| {
        StepError::InvalidParameters(format!(
            "parallel step '{}' has no 'operations' array",
            step_id
        ))
    })?;
    let units: Vec<FanOutUnit> = serde_json::from_value(operations.clone()).map_err(|e| {
        StepError::InvalidParameters(format!(
            "parallel step '{}' has malformed operations: {}",
            step_id, e
        ))
    })?;

    let mut seen = std::collections::HashSet::new();
    if let Some(dup) = units.iter().find(|u| !seen.insert(u.id.as_str())) {
        return Err(StepError::InvalidParameters(format!(
            "parallel step '{}' declares operation '{}' twice",
            step_id, dup.id
        )));
    }
    Ok(units)
}

/// Run every unit of `step` through `handler`, at most `max_parallel` at a time.
///
/// On success the aggregated result is `[{id, result}, ...]` in declaration
/// order, context updates are merged in the same order, and for rollbackable
/// steps `rollback_data` collects each unit's rollback data.
pub async fn fan_out(
    handler: &BoxStepHandler,
    step: &StepSpec,
    ctx: &StepContext,
    max_parallel: usize,
) -> Result<StepResult, StepError> {
    let units = parse_units(&step.id, &ctx.parameters)?;
    let semaphore = Arc::new(Semaphore::new(max_parallel.max(1)));
    let mut join_set = JoinSet::new();

    for (index, unit) in units.iter().enumerate() {
        let handler = handler.clone();
        let semaphore = Arc::clone(&semaphore);

        let mut unit_step = StepSpec::new(format!("{}.{}", step.id, unit.id), StepType::ApiCall)
            .with_parameters(unit.parameters.clone());
        unit_step.rollbackable = step.rollbackable;

        let mut unit_ctx = ctx.clone();
        unit_ctx.step_id = unit_step.id.clone();
        unit_ctx.parameters = unit.parameters.clone();

        join_set.spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|_| StepError::Cancelled)?;
            if unit_ctx.is_cancelled() {
                return Err(StepError::Cancelled);
            }
            let result = handler.handle(&unit_step, &unit_ctx).await?;
            Ok::<_, StepError>((index, result))
        });
    }

    let mut results: Vec<Option<StepResult>> = vec![None; units.len()];
    while let Some(joined) = join_set.join_next().await {
        let outcome = joined
            .map_err(|e| StepError::Failed(format!("operation task panicked: {}", e)))
            .and_then(|r| r);

        let failure = match outcome {
            Ok((index, result)) if result.success => {
                results[index] = Some(result);
                continue;
            }
            Ok((index, result)) => StepError::Failed(format!(
                "operation '{}' failed: {}",
                units[index].id, result.result
            )),
            Err(e) => e,
        };

        tracing::debug!(
            step_id = step.id.as_str(),
            in_flight = join_set.len(),
            "parallel operation failed, detaching siblings"
        );
        join_set.detach_all();
        return Err(failure);
    }

    let mut aggregated = Vec::with_capacity(units.len());
    let mut context_updates = Map::new();
    let mut rollback = Vec::new();
    for (unit, result) in units.iter().zip(results) {
        let Some(result) = result else {
            return Err(StepError::Failed(format!(
                "operation '{}' produced no result",
                unit.id
            )));
        };
        context_updates.extend(result.context_updates);
        if let Some(data) = result.rollback_data {
            rollback.push(json!({ "id": unit.id, "rollback_data": data }));
        }
        aggregated.push(json!({ "id": unit.id, "result": result.result }));
    }

    let mut step_result = StepResult::ok(Value::Array(aggregated));
    step_result.context_updates = context_updates;
    if step.rollbackable {
        step_result.rollback_data = Some(Value::Array(rollback));
    }
    Ok(step_result)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
