//! Per-thread records
//!
//! One [`ThreadInfo`] per logical host thread. The record outlives the host
//! id mapping: after `thread_destroyed` the registry unlinks the id but keeps
//! the record, since a queued log notification or an in-flight sample may
//! still point at it.

use crate::domain::{EngineId, HostThreadId, OsThreadId};
use crate::trace::notify::LogLink;
use crate::trace::stack_channel::StackChannel;
use exectrace_common::InternalId;
use std::sync::atomic::{compiler_fence, AtomicBool, AtomicU32, AtomicU64, Ordering};

pub struct ThreadInfo {
    pub host_id: HostThreadId,
    pub internal_id: InternalId,
    pub engine: EngineId,
    pub channel: StackChannel,
    os_thread_id: AtomicU32,
    /// `pthread_t` of the native thread running this logical thread, 0 if none.
    native_handle: AtomicU64,
    /// Bumped by the sampling thread each interval.
    gen_ticks: AtomicU32,
    /// Generation last turned into a sample.
    fix_ticks: AtomicU32,
    /// False while the writer is mutating the channel.
    interruptible: AtomicBool,
    pub(crate) log_link: LogLink,
}

impl ThreadInfo {
    #[must_use]
    pub fn new(host_id: HostThreadId, internal_id: InternalId, engine: EngineId) -> Self {
        Self {
            host_id,
            internal_id,
            engine,
            channel: StackChannel::new(),
            os_thread_id: AtomicU32::new(0),
            native_handle: AtomicU64::new(0),
            gen_ticks: AtomicU32::new(0),
            fix_ticks: AtomicU32::new(0),
            interruptible: AtomicBool::new(true),
            log_link: LogLink::new(),
        }
    }

    pub fn os_thread_id(&self) -> OsThreadId {
        OsThreadId(self.os_thread_id.load(Ordering::Relaxed))
    }

    pub fn set_os_thread_id(&self, os_thread_id: OsThreadId) {
        self.os_thread_id.store(os_thread_id.0, Ordering::Relaxed);
    }

    pub fn native_handle(&self) -> u64 {
        self.native_handle.load(Ordering::Acquire)
    }

    pub fn set_native_handle(&self, handle: u64) {
        self.native_handle.store(handle, Ordering::Release);
    }

    /// Detaches the record from any native thread.
    pub fn clear_native(&self) {
        self.os_thread_id.store(0, Ordering::Relaxed);
        self.native_handle.store(0, Ordering::Release);
    }

    /// Attached to a native thread the sampling thread may signal.
    pub fn is_live(&self) -> bool {
        self.native_handle() != 0
    }

    pub fn gen_ticks(&self) -> u32 {
        self.gen_ticks.load(Ordering::Acquire)
    }

    /// Starts a new sampling generation. Wraps on overflow.
    pub fn advance_generation(&self) {
        self.gen_ticks.fetch_add(1, Ordering::AcqRel);
    }

    pub fn fix_ticks(&self) -> u32 {
        self.fix_ticks.load(Ordering::Relaxed)
    }

    pub fn set_fix_ticks(&self, ticks: u32) {
        self.fix_ticks.store(ticks, Ordering::Relaxed);
    }

    pub fn is_interruptible(&self) -> bool {
        self.interruptible.load(Ordering::Relaxed)
    }

    /// Opens or closes the window in which the signal handler may sample.
    ///
    /// Only the thread itself calls this, and only its own signal handler
    /// reads it, so a compiler fence is enough to order it against the
    /// channel writes it brackets.
    pub fn set_interruptible(&self, interruptible: bool) {
        compiler_fence(Ordering::SeqCst);
        self.interruptible.store(interruptible, Ordering::Relaxed);
        compiler_fence(Ordering::SeqCst);
    }
}

impl std::fmt::Debug for ThreadInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadInfo")
            .field("host_id", &self.host_id)
            .field("internal_id", &self.internal_id)
            .field("os_thread_id", &self.os_thread_id())
            .field("native_handle", &self.native_handle())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_thread_is_detached_and_interruptible() {
        let thread = ThreadInfo::new(HostThreadId(0x10), InternalId(3), EngineId(1));
        assert!(!thread.is_live());
        assert!(!thread.os_thread_id().is_attached());
        assert!(thread.is_interruptible());
        assert_eq!(thread.gen_ticks(), thread.fix_ticks());
    }

    #[test]
    fn test_clear_native_detaches() {
        let thread = ThreadInfo::new(HostThreadId(0x10), InternalId(3), EngineId(1));
        thread.set_os_thread_id(OsThreadId(4242));
        thread.set_native_handle(0xabc);
        assert!(thread.is_live());
        thread.clear_native();
        assert!(!thread.is_live());
        assert_eq!(thread.os_thread_id(), OsThreadId(0));
    }

    #[test]
    fn test_generation_wraps() {
        let thread = ThreadInfo::new(HostThreadId(1), InternalId(0), EngineId(1));
        thread.gen_ticks.store(u32::MAX, Ordering::Relaxed);
        thread.advance_generation();
        assert_eq!(thread.gen_ticks(), 0);
        assert_eq!(thread.gen_ticks().wrapping_sub(u32::MAX), 1);
    }
}
