//! Engine configuration types for Taskweave.
//!
//! `EngineConfig` represents the top-level `taskweave.toml`. Every field has
//! a default, so an empty file (or no file) yields a working configuration.

use serde::{Deserialize, Serialize};

use crate::optimization::{Constraints, OptimizationTarget};

/// Top-level configuration for a workflow engine instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Fan-out bound for parallel-call-group steps.
    #[serde(default = "default_max_parallel_operations")]
    pub max_parallel_operations: usize,

    /// Seconds a parked execution may stay idle before it is abandoned.
    #[serde(default = "default_execution_ttl_secs")]
    pub execution_ttl_secs: u64,

    /// Number of finished executions retained in history.
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,

    /// Constraints used when the caller does not provide any.
    #[serde(default)]
    pub default_constraints: Constraints,

    /// Optimization target used for automatic strategy selection.
    #[serde(default)]
    pub default_target: OptimizationTarget,

    /// Logging setup.
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_max_parallel_operations() -> usize {
    5
}

fn default_execution_ttl_secs() -> u64 {
    3_600
}

fn default_history_capacity() -> usize {
    100
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel_operations: default_max_parallel_operations(),
            execution_ttl_secs: default_execution_ttl_secs(),
            history_capacity: default_history_capacity(),
            default_constraints: Constraints::default(),
            default_target: OptimizationTarget::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Tracing subscriber settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
    /// Export spans through OpenTelemetry (stdout exporter).
    #[serde(default)]
    pub otel: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            otel: false,
        }
    }
}

/// Output format of the `fmt` layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_default_values() {
        let config = EngineConfig::default();
        assert_eq!(config.max_parallel_operations, 5);
        assert_eq!(config.execution_ttl_secs, 3_600);
        assert_eq!(config.history_capacity, 100);
        assert_eq!(config.default_target, OptimizationTarget::Balanced);
        assert_eq!(config.logging.format, LogFormat::Pretty);
    }

    #[test]
    fn test_engine_config_deserialize_with_defaults() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config.max_parallel_operations, 5);
        assert_eq!(config.default_constraints.max_parallel_operations, 3);
        assert_eq!(config.logging.level, "info");
        assert!(!config.logging.otel);
    }

    #[test]
    fn test_engine_config_deserialize_with_values() {
        let toml_str = r#"
max_parallel_operations = 8
execution_ttl_secs = 120
default_target = "speed"

[default_constraints]
max_parallel_operations = 4
max_total_cost = 25.0
min_reliability = 0.9

[logging]
level = "taskweave_core=debug"
format = "json"
otel = true
"#;
        let config: EngineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.max_parallel_operations, 8);
        assert_eq!(config.execution_ttl_secs, 120);
        assert_eq!(config.history_capacity, 100);
        assert_eq!(config.default_target, OptimizationTarget::Speed);
        assert_eq!(config.default_constraints.max_parallel_operations, 4);
        assert_eq!(config.default_constraints.max_total_cost, Some(25.0));
        assert_eq!(config.default_constraints.max_execution_time_ms, None);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert!(config.logging.otel);
    }
}
