//! Observability setup for Taskweave: tracing subscriber initialization with
//! optional OpenTelemetry export.

pub mod tracing_setup;
