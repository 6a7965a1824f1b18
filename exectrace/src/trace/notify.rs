//! Wakeups for the log thread
//!
//! Writers (including signal handlers) announce "this thread has samples" by
//! pushing the thread's record onto a lock-free intrusive list and writing a
//! byte to a non-blocking pipe. The log thread polls the pipe, takes the
//! whole list at once and serves threads in notification order.
//!
//! A record is on the list at most once; its `queued` flag is cleared just
//! before the log thread drains it, so samples written during the drain
//! re-enqueue it.
//!
//! Both sides publish first and check second, separated by a `SeqCst` fence:
//! the writer bumps its pending-sample count, then tests `queued`; the log
//! thread clears `queued`, then reads the pending count. At least one of them
//! sees the other's write, so a sample is either drained now or re-enqueued.

#![allow(unsafe_code)]

use crate::info::ThreadInfo;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::ptr;
use std::sync::atomic::{fence, AtomicBool, AtomicPtr, Ordering};
use std::time::Duration;

/// Intrusive list link embedded in every [`ThreadInfo`].
pub struct LogLink {
    queued: AtomicBool,
    next: AtomicPtr<ThreadInfo>,
}

impl LogLink {
    #[must_use]
    pub const fn new() -> Self {
        Self { queued: AtomicBool::new(false), next: AtomicPtr::new(ptr::null_mut()) }
    }
}

impl Default for LogLink {
    fn default() -> Self {
        Self::new()
    }
}

pub struct LogNotifier {
    head: AtomicPtr<ThreadInfo>,
    stop: AtomicBool,
    read_end: OwnedFd,
    write_end: OwnedFd,
}

impl LogNotifier {
    pub fn new() -> io::Result<Self> {
        let mut fds = [0 as libc::c_int; 2];
        // SAFETY: `fds` has room for the two descriptors pipe2 writes.
        if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) } != 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: both descriptors were just created and are owned by nobody else.
        let (read_end, write_end) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
        Ok(Self { head: AtomicPtr::new(ptr::null_mut()), stop: AtomicBool::new(false), read_end, write_end })
    }

    /// Queues `thread` for draining. Async-signal-safe.
    ///
    /// `thread` must stay alive until the log thread has drained it. Call
    /// after publishing the samples the notification is about.
    pub fn notify(&self, thread: &ThreadInfo) {
        fence(Ordering::SeqCst);
        if thread.log_link.queued.swap(true, Ordering::AcqRel) {
            return;
        }
        let node = ptr::from_ref(thread).cast_mut();
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            thread.log_link.next.store(head, Ordering::Relaxed);
            match self.head.compare_exchange_weak(head, node, Ordering::Release, Ordering::Relaxed) {
                Ok(_) => break,
                Err(current) => head = current,
            }
        }
        self.wake();
    }

    /// Asks the log thread to finish queued work and exit.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
        self.wake();
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    fn wake(&self) {
        let byte = 1u8;
        // SAFETY: writes one byte from a live stack variable. A full pipe
        // (EAGAIN) already guarantees a pending wakeup.
        unsafe {
            libc::write(self.write_end.as_raw_fd(), ptr::from_ref(&byte).cast(), 1);
        }
    }

    /// Blocks until a wakeup arrives or `timeout` passes (`None` waits forever).
    ///
    /// Consumes all pending wakeup bytes.
    pub fn wait(&self, timeout: Option<Duration>) -> io::Result<()> {
        let timeout_ms = timeout.map_or(-1, |timeout| libc::c_int::try_from(timeout.as_millis()).unwrap_or(libc::c_int::MAX));
        let mut poll_fd = libc::pollfd { fd: self.read_end.as_raw_fd(), events: libc::POLLIN, revents: 0 };
        // SAFETY: one valid pollfd.
        let rc = unsafe { libc::poll(&mut poll_fd, 1, timeout_ms) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }

        let mut scratch = [0u8; 64];
        loop {
            // SAFETY: reads into a live stack buffer of the given length.
            let read = unsafe { libc::read(self.read_end.as_raw_fd(), scratch.as_mut_ptr().cast(), scratch.len()) };
            if read <= 0 {
                break;
            }
        }
        Ok(())
    }

    /// Takes every queued thread and visits them oldest first.
    ///
    /// Returns the number of threads visited.
    ///
    /// # Safety
    ///
    /// Every thread passed to [`LogNotifier::notify`] must still be alive.
    pub unsafe fn drain(&self, mut visit: impl FnMut(&ThreadInfo)) -> usize {
        let mut node = self.head.swap(ptr::null_mut(), Ordering::Acquire);
        let mut batch = Vec::new();
        while let Some(thread) = node.as_ref() {
            node = thread.log_link.next.load(Ordering::Relaxed);
            batch.push(thread);
        }
        batch.reverse();

        for thread in &batch {
            thread.log_link.queued.swap(false, Ordering::AcqRel);
            fence(Ordering::SeqCst);
            visit(thread);
        }
        batch.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EngineId, HostThreadId};
    use exectrace_common::InternalId;

    fn thread(id: u32) -> ThreadInfo {
        ThreadInfo::new(HostThreadId(u64::from(id)), InternalId(id), EngineId(0))
    }

    #[test]
    fn test_drain_visits_in_notification_order_once() {
        let notifier = LogNotifier::new().unwrap();
        let threads: Vec<ThreadInfo> = (1..=3).map(thread).collect();
        notifier.notify(&threads[1]);
        notifier.notify(&threads[0]);
        notifier.notify(&threads[1]);
        notifier.notify(&threads[2]);

        let mut seen = Vec::new();
        let visited = unsafe { notifier.drain(|thread| seen.push(thread.internal_id.0)) };
        assert_eq!(visited, 3);
        assert_eq!(seen, vec![2, 1, 3]);
        assert_eq!(unsafe { notifier.drain(|_| {}) }, 0);
    }

    #[test]
    fn test_drained_thread_can_be_requeued() {
        let notifier = LogNotifier::new().unwrap();
        let record = thread(7);
        notifier.notify(&record);
        assert_eq!(unsafe { notifier.drain(|_| {}) }, 1);
        notifier.notify(&record);
        assert_eq!(unsafe { notifier.drain(|_| {}) }, 1);
    }

    #[test]
    fn test_concurrent_notify_during_drain_is_never_lost() {
        use std::sync::atomic::AtomicUsize;

        const SAMPLES: usize = 20_000;
        let notifier = LogNotifier::new().unwrap();
        let record = thread(3);
        let published = AtomicUsize::new(0);
        let writer_done = AtomicBool::new(false);
        let mut consumed = 0;

        std::thread::scope(|scope| {
            scope.spawn(|| {
                for _ in 0..SAMPLES {
                    published.fetch_add(1, Ordering::Release);
                    notifier.notify(&record);
                }
                writer_done.store(true, Ordering::Release);
            });

            // Consume only what a drain visit can see, like the log thread.
            loop {
                let done = writer_done.load(Ordering::Acquire);
                notifier.wait(Some(Duration::from_millis(10))).unwrap();
                let visited = unsafe { notifier.drain(|_| consumed = published.load(Ordering::Acquire)) };
                if consumed == SAMPLES || (done && visited == 0) {
                    break;
                }
            }
        });

        assert_eq!(consumed, SAMPLES);
        assert_eq!(unsafe { notifier.drain(|_| {}) }, 0);
    }

    #[test]
    fn test_wait_returns_after_notification_and_timeout() {
        let notifier = LogNotifier::new().unwrap();
        let record = thread(1);
        notifier.notify(&record);
        notifier.wait(None).unwrap();
        // Wakeup bytes were consumed, so this one times out.
        notifier.wait(Some(Duration::from_millis(1))).unwrap();
        assert!(!notifier.stop_requested());
        notifier.request_stop();
        notifier.wait(None).unwrap();
        assert!(notifier.stop_requested());
    }
}
