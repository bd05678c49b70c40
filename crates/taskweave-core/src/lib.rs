//! Execution engine and plan optimizer for Taskweave.
//!
//! Defines the ports (step handlers, compensation, cache, post-processing)
//! that embedders implement. Depends only on `taskweave-types` -- never on
//! `taskweave-infra` or any storage crate.

pub mod optimizer;
pub mod workflow;
