//! Call-stack tracing engine
//!
//! - [`stack_channel`]: per-thread single-producer event log and its diffing reader
//! - [`common_trace`]: thread registry, current-thread lookup, load events
//! - [`execution_trace`]: host call events, sampling and log threads
//! - [`notify`] and [`signal`]: the async-signal-safe pieces

pub mod common_trace;
pub mod execution_trace;
pub mod notify;
pub mod signal;
pub mod stack_channel;

pub use common_trace::CommonTrace;
pub use execution_trace::ExecutionTrace;
pub use stack_channel::{CanRealloc, StackChannel, StackEvent};
