//! Workflow definition types for Taskweave.
//!
//! A `WorkflowDefinition` is the immutable description of a task graph: an
//! ordered list of typed steps, their dependency edges, and the policy that
//! decides what happens when a step fails. Definitions are authored as YAML
//! or built in code, validated once at load time, and then shared read-only
//! across every execution of the workflow.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// The canonical workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Stable workflow identifier (e.g. "monthly-statement").
    pub id: String,
    /// Human-readable workflow name.
    pub name: String,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Semantic version string (e.g. "1.0.0").
    #[serde(default = "default_version")]
    pub version: String,
    /// Ordered list of steps forming the workflow DAG.
    pub steps: Vec<StepSpec>,
    /// Additional dependency edges keyed by step ID (step -> prerequisites).
    ///
    /// Merged with each step's own `dependencies` list.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub dependencies: HashMap<String, Vec<String>>,
    /// What to do when a step fails.
    #[serde(default)]
    pub error_handling: ErrorHandlingPolicy,
    /// Extensible metadata.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

impl WorkflowDefinition {
    /// Look up a step by ID.
    pub fn step(&self, step_id: &str) -> Option<&StepSpec> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    /// All prerequisites of a step: its own `dependencies` plus any
    /// workflow-level edges, deduplicated and in first-seen order.
    pub fn prerequisites(&self, step_id: &str) -> Vec<String> {
        let mut seen = BTreeSet::new();
        let own = self
            .step(step_id)
            .map(|s| s.dependencies.as_slice())
            .unwrap_or_default();
        let extra = self
            .dependencies
            .get(step_id)
            .map(|d| d.as_slice())
            .unwrap_or_default();

        own.iter()
            .chain(extra.iter())
            .filter(|dep| seen.insert(dep.as_str()))
            .cloned()
            .collect()
    }

    /// Summary view for listings.
    pub fn summary(&self) -> WorkflowSummary {
        WorkflowSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            version: self.version.clone(),
            step_count: self.steps.len(),
        }
    }
}

/// Lightweight listing entry for a registered workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowSummary {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub version: String,
    pub step_count: usize,
}

// ---------------------------------------------------------------------------
// Error handling policy
// ---------------------------------------------------------------------------

/// Per-workflow policy deciding how a failed step is surfaced.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorHandlingPolicy {
    /// Step IDs whose failure is reported as "retry requested".
    #[serde(default)]
    pub retry_on: BTreeSet<String>,
    /// Step IDs whose failure is converted into a user-input prompt.
    #[serde(default)]
    pub prompt_on: BTreeSet<String>,
}

impl ErrorHandlingPolicy {
    /// Resolve the failure policy for a step. `retry_on` wins over `prompt_on`.
    pub fn policy_for(&self, step_id: &str) -> FailurePolicy {
        if self.retry_on.contains(step_id) {
            FailurePolicy::Retry
        } else if self.prompt_on.contains(step_id) {
            FailurePolicy::Prompt
        } else {
            FailurePolicy::Fatal
        }
    }
}

/// What the engine does with a failed step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Surface "retry requested" without mutating execution state.
    Retry,
    /// Surface a user-input request instead of an error.
    Prompt,
    /// Abort the workflow and roll back.
    Fatal,
}

// ---------------------------------------------------------------------------
// Step specification
// ---------------------------------------------------------------------------

/// A single step in the workflow DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSpec {
    /// Step ID, unique within a workflow.
    pub id: String,
    /// Human-readable step name (defaults to the ID when omitted).
    #[serde(default)]
    pub name: String,
    /// The capability variant that executes this step.
    #[serde(rename = "type")]
    pub step_type: StepType,
    /// Parameter template passed to the handler after resolution.
    #[serde(default = "empty_parameters")]
    pub parameters: serde_json::Value,
    /// Cache policy. A step is cacheable exactly when this is present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<CachePolicy>,
    /// Whether a compensation entry is pushed when this step succeeds.
    #[serde(default)]
    pub rollbackable: bool,
    /// Step IDs this step depends on.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Planning estimate used by the optimizer (per-type default when absent).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimate: Option<StepEstimate>,
}

fn empty_parameters() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

impl StepSpec {
    /// Build a step with defaults for everything but ID and type.
    pub fn new(id: impl Into<String>, step_type: StepType) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            step_type,
            parameters: empty_parameters(),
            cache: None,
            rollbackable: false,
            dependencies: Vec::new(),
            estimate: None,
        }
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_parameters(mut self, parameters: serde_json::Value) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_estimate(mut self, estimate: StepEstimate) -> Self {
        self.estimate = Some(estimate);
        self
    }

    pub fn with_cache(mut self, cache: CachePolicy) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn rollbackable(mut self) -> Self {
        self.rollbackable = true;
        self
    }

    pub fn is_cacheable(&self) -> bool {
        self.cache.is_some()
    }

    /// Display name, falling back to the ID.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }

    /// The explicit estimate, or the per-type default.
    pub fn effective_estimate(&self) -> StepEstimate {
        self.estimate
            .clone()
            .unwrap_or_else(|| self.step_type.default_estimate())
    }
}

/// The closed set of step capability variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Authentication,
    ApiCall,
    ParallelApiCalls,
    UserInput,
    Validation,
    Computation,
    Conditional,
    ReportGeneration,
    Confirmation,
    Finalization,
    DataProcessing,
    Delivery,
}

impl StepType {
    /// Number of variants; sizes the engine's dispatch table.
    pub const COUNT: usize = 12;

    /// Every variant, in declaration order.
    pub const ALL: [StepType; Self::COUNT] = [
        StepType::Authentication,
        StepType::ApiCall,
        StepType::ParallelApiCalls,
        StepType::UserInput,
        StepType::Validation,
        StepType::Computation,
        StepType::Conditional,
        StepType::ReportGeneration,
        StepType::Confirmation,
        StepType::Finalization,
        StepType::DataProcessing,
        StepType::Delivery,
    ];

    /// Dense index of this variant in `ALL`.
    pub const fn index(self) -> usize {
        match self {
            StepType::Authentication => 0,
            StepType::ApiCall => 1,
            StepType::ParallelApiCalls => 2,
            StepType::UserInput => 3,
            StepType::Validation => 4,
            StepType::Computation => 5,
            StepType::Conditional => 6,
            StepType::ReportGeneration => 7,
            StepType::Confirmation => 8,
            StepType::Finalization => 9,
            StepType::DataProcessing => 10,
            StepType::Delivery => 11,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            StepType::Authentication => "authentication",
            StepType::ApiCall => "api_call",
            StepType::ParallelApiCalls => "parallel_api_calls",
            StepType::UserInput => "user_input",
            StepType::Validation => "validation",
            StepType::Computation => "computation",
            StepType::Conditional => "conditional",
            StepType::ReportGeneration => "report_generation",
            StepType::Confirmation => "confirmation",
            StepType::Finalization => "finalization",
            StepType::DataProcessing => "data_processing",
            StepType::Delivery => "delivery",
        }
    }

    /// Default planning estimate for steps that do not declare one.
    ///
    /// Network-bound variants are slower and less reliable than local ones;
    /// authentication and finalization carry the highest priority so plan
    /// repair never drops them before optional work.
    pub fn default_estimate(self) -> StepEstimate {
        let (duration_ms, cost, reliability, priority) = match self {
            StepType::Authentication => (500, 1.0, 0.99, 10),
            StepType::ApiCall => (1_000, 2.0, 0.95, 5),
            StepType::ParallelApiCalls => (2_000, 5.0, 0.92, 5),
            StepType::UserInput => (5_000, 0.0, 0.99, 8),
            StepType::Validation => (200, 0.5, 0.999, 7),
            StepType::Computation => (300, 0.5, 0.999, 4),
            StepType::Conditional => (50, 0.1, 0.999, 6),
            StepType::ReportGeneration => (1_500, 1.5, 0.98, 3),
            StepType::Confirmation => (3_000, 0.0, 0.99, 8),
            StepType::Finalization => (500, 1.0, 0.99, 9),
            StepType::DataProcessing => (800, 1.0, 0.98, 4),
            StepType::Delivery => (1_200, 1.5, 0.97, 2),
        };
        StepEstimate {
            duration_ms,
            cost,
            reliability,
            priority,
        }
    }
}

impl std::fmt::Display for StepType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Cache policy
// ---------------------------------------------------------------------------

/// Memoization settings for a cacheable step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachePolicy {
    /// Time-to-live of a cached result in seconds.
    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,
    /// Context keys that participate in the cache key.
    #[serde(default)]
    pub key_fields: Vec<String>,
    /// Sensitivity class forwarded to the cache port.
    #[serde(default)]
    pub classification: DataClassification,
}

fn default_cache_ttl() -> u64 {
    300
}

impl CachePolicy {
    pub fn new<I, S>(ttl_secs: u64, key_fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ttl_secs,
            key_fields: key_fields.into_iter().map(Into::into).collect(),
            classification: DataClassification::default(),
        }
    }
}

/// Data sensitivity class of a cached value. Interpreted by the cache port.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataClassification {
    Public,
    #[default]
    Internal,
    Sensitive,
}

// ---------------------------------------------------------------------------
// Planning estimate
// ---------------------------------------------------------------------------

/// Planning-time estimate of a step's duration, cost, and reliability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepEstimate {
    /// Estimated wall-clock duration in milliseconds.
    pub duration_ms: u64,
    /// Estimated cost in abstract units.
    #[serde(default)]
    pub cost: f64,
    /// Probability of success in `[0, 1]`.
    #[serde(default = "default_reliability")]
    pub reliability: f64,
    /// Importance; lower-priority steps are dropped first by plan repair.
    #[serde(default)]
    pub priority: u32,
}

fn default_reliability() -> f64 {
    1.0
}

impl StepEstimate {
    pub fn new(duration_ms: u64, cost: f64) -> Self {
        Self {
            duration_ms,
            cost,
            reliability: 1.0,
            priority: 0,
        }
    }

    pub fn with_reliability(mut self, reliability: f64) -> Self {
        self.reliability = reliability;
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
