//! Long-lived records the engine keeps per host thread and per function.

pub mod function_info;
pub mod thread_info;

pub use function_info::{FunctionDetails, FunctionHandle, FunctionInfo};
pub use thread_info::ThreadInfo;
