//! POSIX plumbing for high-granularity sampling
//!
//! The sampling thread interrupts each monitored thread with a real-time
//! signal (`SIGRTMIN + 3`); the handler then samples that thread's own stack
//! channel. Everything reachable from the handler here is async-signal-safe:
//! atomics, register reads from the interrupted context, and `errno` handling.

#![allow(unsafe_code)]

use crate::domain::ProfilerError;
use exectrace_common::SAMPLE_SIGNAL_OFFSET;
use std::io;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

/// Raw `sa_sigaction` handler signature.
pub type SignalHandler = extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void);

/// Signal number used to request a sample.
#[must_use]
pub fn sample_signal() -> libc::c_int {
    libc::SIGRTMIN() + SAMPLE_SIGNAL_OFFSET
}

/// Installs `handler` for the sample signal.
///
/// Refuses to replace a disposition other than the default (or `handler`
/// itself), so an application that owns the signal keeps it.
pub fn install_sample_handler(handler: SignalHandler) -> Result<(), ProfilerError> {
    let signal = sample_signal();
    let handler_addr = handler as usize;

    // SAFETY: plain libc calls on zero-initialised `sigaction` structs.
    unsafe {
        let mut current: libc::sigaction = std::mem::zeroed();
        if libc::sigaction(signal, ptr::null(), &mut current) != 0 {
            return Err(ProfilerError::SignalSetup(format!("sigaction query: {}", io::Error::last_os_error())));
        }
        if current.sa_sigaction != libc::SIG_DFL && current.sa_sigaction != handler_addr {
            return Err(ProfilerError::SignalSetup(format!("signal {signal} already has a handler")));
        }

        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = handler_addr;
        action.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;
        libc::sigemptyset(&mut action.sa_mask);
        if libc::sigaction(signal, &action, ptr::null_mut()) != 0 {
            return Err(ProfilerError::SignalSetup(format!("sigaction install: {}", io::Error::last_os_error())));
        }
    }
    Ok(())
}

/// Delivers the sample signal to a native thread.
pub fn send_sample_signal(native_handle: u64) -> io::Result<()> {
    // SAFETY: `pthread_kill` reports a stale handle as ESRCH rather than faulting
    // for threads that have been joined or detached and exited.
    let rc = unsafe { libc::pthread_kill(native_handle as libc::pthread_t, sample_signal()) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(rc))
    }
}

/// Handle of the calling native thread, as stored in thread records.
#[must_use]
pub fn current_native_handle() -> u64 {
    // SAFETY: always safe to call.
    unsafe { libc::pthread_self() as u64 }
}

/// Instruction pointer of the code the signal interrupted, 0 if unknown.
///
/// # Safety
///
/// `context` must be the third argument passed to an `SA_SIGINFO` handler.
pub unsafe fn interrupted_ip(context: *mut libc::c_void) -> u64 {
    if context.is_null() {
        return 0;
    }
    let uc = context.cast::<libc::ucontext_t>();
    read_ip(&*uc)
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
fn read_ip(uc: &libc::ucontext_t) -> u64 {
    uc.uc_mcontext.gregs[libc::REG_RIP as usize] as u64
}

#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
fn read_ip(uc: &libc::ucontext_t) -> u64 {
    uc.uc_mcontext.pc
}

#[cfg(not(any(
    all(target_os = "linux", target_arch = "x86_64"),
    all(target_os = "linux", target_arch = "aarch64")
)))]
fn read_ip(_uc: &libc::ucontext_t) -> u64 {
    0
}

/// Restores `errno` on drop, so the interrupted code never sees the handler's.
pub struct ErrnoGuard(libc::c_int);

impl ErrnoGuard {
    #[must_use]
    pub fn save() -> Self {
        // SAFETY: `__errno_location` returns the calling thread's errno slot.
        Self(unsafe { *libc::__errno_location() })
    }
}

impl Drop for ErrnoGuard {
    fn drop(&mut self) {
        // SAFETY: see `save`.
        unsafe { *libc::__errno_location() = self.0 };
    }
}

/// Process-scoped pointer through which a signal handler reaches its target.
///
/// At most one target is installed at a time. [`HandlerSlot::release`] waits
/// until no handler is still using the target, so the target may be dropped
/// as soon as it returns.
pub struct HandlerSlot<T> {
    target: AtomicPtr<T>,
    in_flight: AtomicUsize,
}

impl<T> HandlerSlot<T> {
    #[must_use]
    pub const fn new() -> Self {
        Self { target: AtomicPtr::new(ptr::null_mut()), in_flight: AtomicUsize::new(0) }
    }

    /// Installs `target`. Fails if another target is installed.
    ///
    /// The caller must call [`HandlerSlot::release`] before `target` moves or drops.
    pub fn claim(&self, target: &T) -> bool {
        let ptr = ptr::from_ref(target).cast_mut();
        self.target.compare_exchange(ptr::null_mut(), ptr, Ordering::SeqCst, Ordering::SeqCst).is_ok()
    }

    /// Removes `target` and waits for running handlers to leave it.
    pub fn release(&self, target: &T) {
        let ptr = ptr::from_ref(target).cast_mut();
        if self.target.compare_exchange(ptr, ptr::null_mut(), Ordering::SeqCst, Ordering::SeqCst).is_err() {
            return;
        }
        while self.in_flight.load(Ordering::SeqCst) != 0 {
            std::thread::yield_now();
        }
    }

    /// Runs `f` on the installed target, if any. Async-signal-safe.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let ptr = self.target.load(Ordering::SeqCst);
        // SAFETY: a non-null target stays alive until `release` has observed
        // `in_flight == 0`, which cannot happen before the decrement below.
        let result = if ptr.is_null() { None } else { Some(f(unsafe { &*ptr })) };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

impl<T> Default for HandlerSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_signal_is_realtime() {
        let signal = sample_signal();
        assert!(signal >= libc::SIGRTMIN());
        assert!(signal <= libc::SIGRTMAX());
    }

    #[test]
    fn test_handler_slot_single_claim() {
        let slot = HandlerSlot::new();
        let first = 1u32;
        let second = 2u32;
        assert!(slot.claim(&first));
        assert!(!slot.claim(&second));
        assert_eq!(slot.with(|value| *value), Some(1));

        // Releasing a target that is not installed is a no-op.
        slot.release(&second);
        assert_eq!(slot.with(|value| *value), Some(1));

        slot.release(&first);
        assert_eq!(slot.with(|value| *value), None);
        assert!(slot.claim(&second));
        slot.release(&second);
    }

    #[test]
    fn test_errno_guard_restores_errno() {
        unsafe { *libc::__errno_location() = libc::EINTR };
        {
            let _guard = ErrnoGuard::save();
            unsafe { *libc::__errno_location() = libc::EAGAIN };
        }
        assert_eq!(io::Error::last_os_error().raw_os_error(), Some(libc::EINTR));
    }

    #[test]
    fn test_interrupted_ip_of_null_context() {
        assert_eq!(unsafe { interrupted_ip(ptr::null_mut()) }, 0);
    }

    #[test]
    fn test_current_native_handle_is_nonzero() {
        assert_ne!(current_native_handle(), 0);
    }
}
