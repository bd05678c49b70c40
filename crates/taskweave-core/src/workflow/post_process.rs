//! Post-processor port: transforms a finished execution's final output.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;
use taskweave_types::execution::ExecutionState;
use taskweave_types::workflow::WorkflowDefinition;

use super::handler::StepError;

/// Shapes the final output of a completed (or terminated) execution.
pub trait PostProcessor: Send + Sync {
    fn process(
        &self,
        definition: &WorkflowDefinition,
        state: &ExecutionState,
        output: Value,
    ) -> impl Future<Output = Result<Value, StepError>> + Send;
}

/// Object-safe version of [`PostProcessor`] with boxed futures.
pub trait PostProcessorDyn: Send + Sync {
    fn process_boxed<'a>(
        &'a self,
        definition: &'a WorkflowDefinition,
        state: &'a ExecutionState,
        output: Value,
    ) -> Pin<Box<dyn Future<Output = Result<Value, StepError>> + Send + 'a>>;
}

impl<T: PostProcessor> PostProcessorDyn for T {
    fn process_boxed<'a>(
        &'a self,
        definition: &'a WorkflowDefinition,
        state: &'a ExecutionState,
        output: Value,
    ) -> Pin<Box<dyn Future<Output = Result<Value, StepError>> + Send + 'a>> {
        Box::pin(self.process(definition, state, output))
    }
}

/// Type-erased post-processor.
#[derive(Clone)]
pub struct BoxPostProcessor {
    inner: Arc<dyn PostProcessorDyn>,
}

impl BoxPostProcessor {
    pub fn new<T: PostProcessor + 'static>(processor: T) -> Self {
        Self {
            inner: Arc::new(processor),
        }
    }

    pub async fn process(
        &self,
        definition: &WorkflowDefinition,
        state: &ExecutionState,
        output: Value,
    ) -> Result<Value, StepError> {
        self.inner.process_boxed(definition, state, output).await
    }
}
