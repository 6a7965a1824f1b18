//! Domain types providing compile-time safety and self-documentation
//!
//! The host hands out several kinds of opaque pointer-sized identifiers.
//! Wrapping each kind prevents passing a function id where a thread id is
//! expected and keeps hook signatures readable.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Host logical-thread identifier
///
/// Not the same as the OS thread id: a logical thread may migrate between
/// native threads during its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostThreadId(pub u64);

impl fmt::Display for HostThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "thread:0x{:x}", self.0)
    }
}

/// Host function identifier
///
/// Recycled by the host after a function is unloaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostFunctionId(pub u64);

impl fmt::Display for HostFunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "function:0x{:x}", self.0)
    }
}

/// Kernel thread id of the native thread currently running a logical thread.
///
/// Zero means "not attached to an OS thread".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct OsThreadId(pub u32);

impl OsThreadId {
    /// Returns true if the logical thread is attached to a native thread.
    #[must_use]
    pub fn is_attached(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for OsThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TID:{}", self.0)
    }
}

/// Identity of one engine instance.
///
/// Records and thread-local caches remember which engine created them, so a
/// cache filled by a torn-down engine is never trusted by its successor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EngineId(pub u64);

impl EngineId {
    /// Allocates a process-unique id. Zero is never returned.
    #[must_use]
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for EngineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "engine#{}", self.0)
    }
}

/// Host-side identifiers of load events (app domains, assemblies, modules, classes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostObjectId(pub u64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_ids_are_unique_and_nonzero() {
        let a = EngineId::next();
        let b = EngineId::next();
        assert_ne!(a, b);
        assert_ne!(a.0, 0);
    }

    #[test]
    fn test_os_thread_attachment() {
        assert!(!OsThreadId::default().is_attached());
        assert!(OsThreadId(4711).is_attached());
    }

    #[test]
    fn test_display() {
        assert_eq!(HostThreadId(0x10).to_string(), "thread:0x10");
        assert_eq!(HostFunctionId(0xff).to_string(), "function:0xff");
        assert_eq!(OsThreadId(12).to_string(), "TID:12");
    }
}
