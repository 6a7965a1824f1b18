//! Structured error types for exectrace
//!
//! Using thiserror for automatic Display implementation and error chaining.

use exectrace_common::ParseError;
use std::path::PathBuf;
use thiserror::Error;

/// Status code reported by the host when a query is made at a point where it
/// cannot be answered (for example the OS thread of a thread still starting).
pub const UNSUPPORTED_CALL_SEQUENCE: u32 = 0x8013_1363;

/// Failure of a metadata query or registration call made against the host.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HostError {
    #[error("call is not supported by the host at this point")]
    UnsupportedCallSequence,

    #[error("host does not provide {0}")]
    NotAvailable(&'static str),

    #[error("host call failed with status 0x{code:08x}")]
    Failed { code: u32 },
}

impl HostError {
    /// Host status code carried by this error.
    #[must_use]
    pub fn status_code(&self) -> u32 {
        match self {
            Self::UnsupportedCallSequence => UNSUPPORTED_CALL_SEQUENCE,
            Self::NotAvailable(_) => crate::profiler::HostStatus::Fail.code(),
            Self::Failed { code } => *code,
        }
    }
}

#[derive(Error, Debug)]
pub enum ProfilerError {
    #[error("another profiler instance is already active in this process")]
    AlreadyActive,

    #[error("{call} failed: {source}")]
    Host {
        call: &'static str,
        #[source]
        source: HostError,
    },

    #[error("host interface version {version} is not supported")]
    UnsupportedInterface { version: u32 },

    #[error("failed to install sampling signal handler: {0}")]
    SignalSetup(String),

    #[error("failed to start {name} thread: {source}")]
    ThreadSpawn {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("function handle belongs to another engine")]
    ForeignFunctionHandle,

    #[error("invariant violated: {0}")]
    Invariant(&'static str),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    TraceLog(#[from] TraceLogError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ProfilerError {
    /// Wraps a host failure with the name of the call that produced it.
    #[must_use]
    pub fn host(call: &'static str, source: HostError) -> Self {
        Self::Host { call, source }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {var}: expected {expected}")]
    InvalidValue { var: &'static str, value: String, expected: &'static str },
}

#[derive(Error, Debug)]
pub enum TraceLogError {
    #[error("failed to open trace log {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum ReplayError {
    #[error("failed to open trace log {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("line {line}: {reason}")]
    Parse { line: usize, reason: ParseError },

    #[error("line {line}: sample keeps {prefix} frames but thread has only {depth}")]
    PrefixOutOfRange { line: usize, prefix: u32, depth: usize },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum ExportError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
