//! Profiler configuration
//!
//! Settings come from `PROF_*` environment variables when the profiler is
//! loaded into a host, or are built directly by the CLI and tests.
//! [`ProfilerConfig::validate`] resolves combinations that cannot work
//! together before the engine starts.

use crate::domain::ConfigError;
use exectrace_common::DEFAULT_SAMPLING_TIMEOUT_MS;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

pub const ENV_EXECUTION_TRACE: &str = "PROF_EXECUTION_TRACE";
pub const ENV_COLLECT_METHOD: &str = "PROF_COLLECT_METHOD";
pub const ENV_SAMPLING_TIMEOUT: &str = "PROF_SAMPLING_TIMEOUT";
pub const ENV_HIGH_GRAN: &str = "PROF_HIGH_GRAN";
pub const ENV_LINE_TRACE: &str = "PROF_LINE_TRACE";
pub const ENV_TRACE_FILENAME: &str = "PROF_TRACE_FILENAME";

/// How call stacks are collected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CollectionMethod {
    /// Names functions but does not track stacks.
    None,
    /// A sample on every stack change.
    Instrumentation,
    /// A sample per thread per sampling interval.
    #[default]
    Sampling,
}

impl FromStr for CollectionMethod {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "instrumentation" => Ok(Self::Instrumentation),
            "sampling" => Ok(Self::Sampling),
            _ => Err(()),
        }
    }
}

impl fmt::Display for CollectionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::Instrumentation => "instrumentation",
            Self::Sampling => "sampling",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfilerConfig {
    pub execution_trace_enabled: bool,
    pub collection_method: CollectionMethod,
    pub sampling_timeout_ms: u64,
    /// Signal-driven sampling between stack changes.
    pub high_granularity_enabled: bool,
    /// Instruction-pointer refinement of the top frame.
    pub line_trace_enabled: bool,
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        Self {
            execution_trace_enabled: false,
            collection_method: CollectionMethod::Sampling,
            sampling_timeout_ms: DEFAULT_SAMPLING_TIMEOUT_MS,
            high_granularity_enabled: true,
            line_trace_enabled: false,
        }
    }
}

fn parse_bool(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue { var, value: value.to_string(), expected: "a boolean" }),
    }
}

impl ProfilerConfig {
    /// Reads the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Reads the configuration through `lookup`; unset variables keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(value) = lookup(ENV_EXECUTION_TRACE) {
            config.execution_trace_enabled = parse_bool(ENV_EXECUTION_TRACE, &value)?;
        }
        if let Some(value) = lookup(ENV_COLLECT_METHOD) {
            config.collection_method = value.trim().parse().map_err(|()| ConfigError::InvalidValue {
                var: ENV_COLLECT_METHOD,
                value: value.clone(),
                expected: "none, instrumentation or sampling",
            })?;
        }
        if let Some(value) = lookup(ENV_SAMPLING_TIMEOUT) {
            config.sampling_timeout_ms = value.trim().parse().map_err(|_| ConfigError::InvalidValue {
                var: ENV_SAMPLING_TIMEOUT,
                value: value.clone(),
                expected: "milliseconds",
            })?;
        }
        if let Some(value) = lookup(ENV_HIGH_GRAN) {
            config.high_granularity_enabled = parse_bool(ENV_HIGH_GRAN, &value)?;
        }
        if let Some(value) = lookup(ENV_LINE_TRACE) {
            config.line_trace_enabled = parse_bool(ENV_LINE_TRACE, &value)?;
        }

        Ok(config)
    }

    /// Resolves conflicting settings.
    ///
    /// Returns the effective configuration and one warning per adjustment.
    #[must_use]
    pub fn validate(&self) -> (Self, Vec<String>) {
        let mut config = self.clone();
        let mut warnings = Vec::new();

        if !config.execution_trace_enabled {
            config.collection_method = CollectionMethod::None;
            config.high_granularity_enabled = false;
            config.line_trace_enabled = false;
            return (config, warnings);
        }

        if config.sampling_timeout_ms == 0 {
            warnings.push("sampling interval of 0 ms raised to 1 ms".to_string());
            config.sampling_timeout_ms = 1;
        }

        if config.high_granularity_enabled && config.collection_method != CollectionMethod::Sampling {
            warnings.push(format!(
                "high granularity sampling needs the sampling collection method (got {}); disabled",
                config.collection_method
            ));
            config.high_granularity_enabled = false;
        }

        if config.line_trace_enabled && config.collection_method == CollectionMethod::None {
            warnings.push("line tracing needs stack collection; disabled".to_string());
            config.line_trace_enabled = false;
        }

        (config, warnings)
    }
}

/// Where trace records go.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TraceLogOutput {
    #[default]
    Stdout,
    Stderr,
    File(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TraceLogConfig {
    pub output: TraceLogOutput,
}

impl TraceLogConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// `stdout` and `stderr` select the streams, anything else is a file path.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let output = match lookup(ENV_TRACE_FILENAME).as_deref().map(str::trim) {
            None | Some("" | "stdout") => TraceLogOutput::Stdout,
            Some("stderr") => TraceLogOutput::Stderr,
            Some(path) => TraceLogOutput::File(PathBuf::from(path)),
        };
        Self { output }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ProfilerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, ProfilerConfig::default());
        assert!(!config.execution_trace_enabled);
        assert_eq!(config.collection_method, CollectionMethod::Sampling);
        assert_eq!(config.sampling_timeout_ms, 10);
        assert!(config.high_granularity_enabled);
    }

    #[test]
    fn test_reads_all_variables() {
        let config = ProfilerConfig::from_lookup(lookup(&[
            (ENV_EXECUTION_TRACE, "yes"),
            (ENV_COLLECT_METHOD, "Instrumentation"),
            (ENV_SAMPLING_TIMEOUT, "25"),
            (ENV_HIGH_GRAN, "off"),
            (ENV_LINE_TRACE, "1"),
        ]))
        .unwrap();
        assert!(config.execution_trace_enabled);
        assert_eq!(config.collection_method, CollectionMethod::Instrumentation);
        assert_eq!(config.sampling_timeout_ms, 25);
        assert!(!config.high_granularity_enabled);
        assert!(config.line_trace_enabled);
    }

    #[test]
    fn test_rejects_invalid_values() {
        let err = ProfilerConfig::from_lookup(lookup(&[(ENV_HIGH_GRAN, "maybe")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { var: ENV_HIGH_GRAN, .. }));
        assert!(ProfilerConfig::from_lookup(lookup(&[(ENV_COLLECT_METHOD, "magic")])).is_err());
        assert!(ProfilerConfig::from_lookup(lookup(&[(ENV_SAMPLING_TIMEOUT, "-5")])).is_err());
    }

    #[test]
    fn test_validate_clamps_interval_and_drops_high_granularity() {
        let config = ProfilerConfig {
            execution_trace_enabled: true,
            collection_method: CollectionMethod::Instrumentation,
            sampling_timeout_ms: 0,
            high_granularity_enabled: true,
            line_trace_enabled: false,
        };
        let (effective, warnings) = config.validate();
        assert_eq!(effective.sampling_timeout_ms, 1);
        assert!(!effective.high_granularity_enabled);
        assert_eq!(warnings.len(), 2);
    }

    #[test]
    fn test_validate_disabled_tracing_turns_everything_off() {
        let (effective, warnings) = ProfilerConfig::default().validate();
        assert_eq!(effective.collection_method, CollectionMethod::None);
        assert!(!effective.high_granularity_enabled);
        assert!(warnings.is_empty());
    }

    #[test]
    fn test_trace_log_output_selection() {
        assert_eq!(TraceLogConfig::from_lookup(lookup(&[])).output, TraceLogOutput::Stdout);
        assert_eq!(
            TraceLogConfig::from_lookup(lookup(&[(ENV_TRACE_FILENAME, "stderr")])).output,
            TraceLogOutput::Stderr
        );
        assert_eq!(
            TraceLogConfig::from_lookup(lookup(&[(ENV_TRACE_FILENAME, "/tmp/out.log")])).output,
            TraceLogOutput::File(PathBuf::from("/tmp/out.log"))
        );
    }

    #[test]
    fn test_config_serializes_method_in_lowercase() {
        let json = serde_json::to_string(&ProfilerConfig::default()).unwrap();
        assert!(json.contains("\"sampling\""));
    }
}
