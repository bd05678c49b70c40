//! Workflow engine core: definitions, dependency graph, and the step loop.
//!
//! - `definition` -- YAML parsing, validation, filesystem load/save
//! - `dag` -- dependency graph, cycle detection, reachability queries
//! - `context` -- template resolution against the execution context
//! - `handler` -- step handler port and per-variant dispatch table
//! - `fanout` -- bounded parallel execution of parallel-call-group steps
//! - `cache` -- result cache port and key derivation
//! - `compensation` -- rollback handlers and stack unwinding
//! - `post_process` -- final output transformation port
//! - `registry` -- running/parked execution tracking and history
//! - `metrics` -- process-lifetime counters
//! - `engine` -- `WorkflowEngine`, which ties the above together

pub mod cache;
pub mod compensation;
pub mod context;
pub mod dag;
pub mod definition;
pub mod engine;
pub mod fanout;
pub mod handler;
pub mod metrics;
pub mod post_process;
pub mod registry;
