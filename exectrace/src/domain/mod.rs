//! Domain model for exectrace
//!
//! This module contains core domain types and errors that provide:
//! - Compile-time safety via newtype pattern
//! - Self-documenting function signatures
//! - Structured error handling

pub mod errors;
pub mod types;

// Re-export common types for convenience
pub use types::{EngineId, HostFunctionId, HostObjectId, HostThreadId, OsThreadId};

pub use errors::{
    ConfigError, ExportError, HostError, ProfilerError, ReplayError, TraceLogError,
    UNSUPPORTED_CALL_SEQUENCE,
};
