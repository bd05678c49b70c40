//! Shared domain types for Taskweave.
//!
//! Workflow definitions, execution state and results, optimizer plans and
//! constraints, metrics snapshots, and engine configuration.
//!
//! Zero infrastructure dependencies -- only serde, serde_json, uuid, chrono.

pub mod config;
pub mod execution;
pub mod metrics;
pub mod optimization;
pub mod workflow;
