//! # Shared Data Structures (Engine ↔ Offline Tooling)
//!
//! Defines the vocabulary shared between the in-process execution-trace engine
//! and the tools that read its output afterwards. The engine writes trace log
//! records through [`TraceRecord`]'s `Display`; the replay tooling reads them
//! back through its `FromStr`.
//!
//! ## Key Types
//!
//! - [`InternalId`] - Dense per-registry identifier printed in every record
//! - [`SampleInfo`] - Ticks and coalesced count attached to a stack sample
//! - [`StackTraceDiff`] - Prefix length plus diverged frames versus the previous sample
//! - [`TraceRecord`] - One line of the trace log

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod record;

pub use record::{ParseError, TraceRecord};

use alloc::vec::Vec;
use core::fmt;

// ============================================================================
// Engine Constants
// ============================================================================

/// Initial capacity of every stack channel ring buffer (events).
///
/// Must be a power of two. Growth doubles it.
pub const STACK_CHANNEL_START_CAPACITY: usize = 128;

/// Name of the pseudo-function pushed while the thread runs native code.
pub const UNMANAGED_FUNCTION_NAME: &str = "UNMANAGED";

/// Name of the pseudo-function pushed while the JIT compiles a method.
pub const JIT_FUNCTION_NAME: &str = "JIT";

/// Placeholder used whenever host metadata cannot be obtained.
pub const UNKNOWN_NAME: &str = "UNKNOWN";

/// Offset from `SIGRTMIN` of the per-thread sampling signal.
pub const SAMPLE_SIGNAL_OFFSET: i32 = 3;

/// Default interval between sampling-thread wakeups, in milliseconds.
pub const DEFAULT_SAMPLING_TIMEOUT_MS: u64 = 10;

// ============================================================================
// Host Event Mask
// ============================================================================

/// Event-mask bits requested from the host.
///
/// Values follow the host's monitoring flags so the mask can be handed over
/// unchanged.
pub mod event_mask {
    pub const FUNCTION_UNLOADS: u32 = 0x0000_0001;
    pub const CLASS_LOADS: u32 = 0x0000_0002;
    pub const MODULE_LOADS: u32 = 0x0000_0004;
    pub const ASSEMBLY_LOADS: u32 = 0x0000_0008;
    pub const APPDOMAIN_LOADS: u32 = 0x0000_0010;
    pub const JIT_COMPILATION: u32 = 0x0000_0020;
    pub const EXCEPTIONS: u32 = 0x0000_0040;
    pub const THREADS: u32 = 0x0000_0200;
    pub const CODE_TRANSITIONS: u32 = 0x0000_0800;
    pub const ENTERLEAVE: u32 = 0x0000_1000;
    pub const CACHE_SEARCHES: u32 = 0x0000_8000;

    /// Events needed by thread bookkeeping and load records.
    pub const COMMON_TRACE: u32 =
        APPDOMAIN_LOADS | ASSEMBLY_LOADS | MODULE_LOADS | CLASS_LOADS | THREADS;

    /// Events needed to name functions and follow JIT activity.
    pub const EXECUTION_TRACE: u32 = JIT_COMPILATION | CACHE_SEARCHES | FUNCTION_UNLOADS;

    /// Extra events needed when the call stack itself is tracked.
    pub const CALL_STACK: u32 = ENTERLEAVE | CODE_TRANSITIONS | EXCEPTIONS;
}

// ============================================================================
// Shared Data Structures
// ============================================================================

/// Dense identifier assigned by a registry in insertion order.
///
/// Stays valid for the lifetime of the engine even after the host identifier
/// it was created for has been unlinked and recycled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct InternalId(pub u32);

impl fmt::Display for InternalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

/// Sample header produced by the stack channel reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SampleInfo {
    /// Milliseconds since the profiler attached.
    pub ticks: u32,
    /// Sampling-thread generations folded into this sample (0 = unknown).
    pub count: u32,
}

/// One reconstructed stack frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Frame {
    pub function: InternalId,
    /// Instruction pointer inside the function, 0 when unknown.
    pub ip: u64,
}

impl Frame {
    #[must_use]
    pub fn new(function: InternalId, ip: u64) -> Self {
        Self { function, ip }
    }
}

/// Difference between a thread's stack at this sample and at the previous one.
///
/// Only frames beyond `match_prefix` are carried. A consumer keeps its own
/// previous snapshot, truncates it to `match_prefix`, optionally refines the
/// IP of the last kept frame with `ip`, then appends `frames`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StackTraceDiff {
    /// Frames shared with the previous sample (from the bottom).
    pub match_prefix: u32,
    /// Depth of the stack at this sample.
    pub stack_size: u32,
    /// New IP of frame `match_prefix - 1`, 0 when unchanged.
    pub ip: u64,
    pub frames: Vec<Frame>,
}

/// Native code range of a compiled function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CodeRange {
    pub start: u64,
    pub size: u32,
}

impl CodeRange {
    /// Returns true if `ip` falls inside this range.
    #[must_use]
    pub fn contains(&self, ip: u64) -> bool {
        ip >= self.start && ip - self.start < u64::from(self.size)
    }
}

/// IL offset to native offset mapping entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IlToNativeMapping {
    pub il_offset: u32,
    pub native_start: u32,
    pub native_end: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_internal_id_display_is_padded() {
        assert_eq!(InternalId(0x2a).to_string(), "0x0000002a");
    }

    #[test]
    fn test_code_range_contains() {
        let range = CodeRange { start: 0x1000, size: 0x20 };
        assert!(range.contains(0x1000));
        assert!(range.contains(0x101f));
        assert!(!range.contains(0x1020));
        assert!(!range.contains(0x0fff));
    }

    #[test]
    fn test_event_mask_groups_do_not_overlap() {
        assert_eq!(event_mask::COMMON_TRACE & event_mask::EXECUTION_TRACE, 0);
        assert_eq!(event_mask::EXECUTION_TRACE & event_mask::CALL_STACK, 0);
    }
}
