//! Per-thread call-stack event channel
//!
//! The profiled thread (the writer) records every call, return and sample
//! request into a ring buffer of [`StackEvent`]s. The log thread (the reader)
//! replays those events into stack snapshots and emits, per sample, only the
//! part of the stack that changed since the previous sample.
//!
//! Writer-side coalescing keeps the steady state cheap: a call that returns
//! before the next sample leaves no trace in the buffer, consecutive returns
//! are run-length encoded, and IP refinements fold into the event they refine.
//!
//! # Protocol invariants
//!
//! - The buffer is never empty: its tail is always a defined event, a no-op
//!   (`Pop { count: 0 }`) when nothing is pending.
//! - Every `Sample` event is immediately followed by a no-op, so the writer
//!   only ever rewrites events the reader cannot reach yet.
//! - The writer is the profiled thread, including its own signal handler;
//!   the reader is the log thread. Neither role is ever shared.
//!
//! ```text
//! writer:  [PUSH a][PUSH b][SAMPLE 5,1][POP 1][PUSH c][SAMPLE 9,1][nop]
//!                                                                   ^ tail, rewritten in place
//! reader:  a b      -> "0:2 a b"
//!          a c      -> "1:2 c"
//! ```

#![allow(unsafe_code)]

use crate::info::function_info::FunctionHandle;
use crate::storage::RingBuffer;
use exectrace_common::{Frame, InternalId, SampleInfo, StackTraceDiff, STACK_CHANNEL_START_CAPACITY};
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

/// One encoded stack mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackEvent {
    Push { ip: u64, function: InternalId },
    /// Removes `count` frames. `count == 0` is the no-op placeholder.
    Pop { count: u32 },
    /// Changes the IP of the top frame.
    ChIp { ip: u64 },
    Sample(SampleInfo),
}

impl StackEvent {
    pub const NOP: Self = Self::Pop { count: 0 };

    #[must_use]
    pub fn is_nop(self) -> bool {
        self == Self::NOP
    }

    fn kind(self) -> EventKind {
        match self {
            Self::Push { .. } => EventKind::Push,
            Self::Pop { .. } => EventKind::Pop,
            Self::ChIp { .. } => EventKind::ChIp,
            Self::Sample(_) => EventKind::Sample,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventKind {
    Push,
    Pop,
    ChIp,
    Sample,
}

/// Whether a writer operation may allocate to make room.
///
/// Must be [`CanRealloc::No`] inside a signal handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanRealloc {
    No,
    Yes,
}

struct WriterState {
    stack: Vec<FunctionHandle>,
    /// Kind of the event that replaced the no-op after the last sample.
    first_action: EventKind,
    /// Pushes still encoded since the last sample.
    push_count: usize,
}

pub struct StackChannel {
    buffer: RingBuffer<StackEvent>,
    /// Held by growth and by the reader's drain.
    growth: Mutex<()>,
    growth_planned: AtomicBool,
    pending_samples: AtomicUsize,
    writer: UnsafeCell<WriterState>,
    reader: UnsafeCell<Vec<Frame>>,
}

// SAFETY: `writer` is touched only by the writer role and `reader` only by the
// reader role (callers uphold this through the `unsafe` method contracts);
// the buffer follows its own single-writer/single-reader contract.
unsafe impl Send for StackChannel {}
// SAFETY: see `Send`.
unsafe impl Sync for StackChannel {}

impl Default for StackChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl StackChannel {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(STACK_CHANNEL_START_CAPACITY)
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let buffer = RingBuffer::with_capacity(capacity.max(2));
        // SAFETY: nobody else can see the buffer yet.
        unsafe { buffer.push_back(StackEvent::NOP) };
        Self {
            buffer,
            growth: Mutex::new(()),
            growth_planned: AtomicBool::new(false),
            pending_samples: AtomicUsize::new(0),
            writer: UnsafeCell::new(WriterState {
                stack: Vec::new(),
                first_action: EventKind::Pop,
                push_count: 0,
            }),
            reader: UnsafeCell::new(Vec::new()),
        }
    }

    /// Samples written but not yet consumed by the reader.
    pub fn pending_samples(&self) -> usize {
        self.pending_samples.load(Ordering::Acquire)
    }

    /// Encoded events currently held, including the trailing no-op.
    pub fn encoded_len(&self) -> usize {
        self.buffer.len()
    }

    // ------------------------------------------------------------------
    // Writer role
    // ------------------------------------------------------------------

    #[allow(clippy::mut_from_ref)]
    unsafe fn writer(&self) -> &mut WriterState {
        &mut *self.writer.get()
    }

    fn tail(&self) -> StackEvent {
        // SAFETY: only called from writer-role methods.
        unsafe { self.buffer.back() }.unwrap_or(StackEvent::NOP)
    }

    /// Makes sure `count` more events fit.
    ///
    /// With [`CanRealloc::No`] this only checks; with [`CanRealloc::Yes`] it
    /// grows when space is short or growth was planned earlier.
    unsafe fn ensure_capacity(&self, can_realloc: CanRealloc, count: usize) -> bool {
        let short = self.buffer.free_space() < count;
        match can_realloc {
            CanRealloc::No => !short,
            CanRealloc::Yes => {
                if short || self.growth_planned.load(Ordering::Relaxed) {
                    let _guard = self.growth.lock().unwrap_or_else(PoisonError::into_inner);
                    self.growth_planned.store(false, Ordering::Relaxed);
                    loop {
                        self.buffer.grow();
                        if self.buffer.free_space() >= count {
                            break;
                        }
                    }
                }
                true
            }
        }
    }

    /// Records a call into `function`.
    ///
    /// # Safety
    ///
    /// Writer role, outside signal handlers (may allocate). `function` must
    /// stay valid while it is on the stack.
    pub unsafe fn push(&self, function: FunctionHandle) {
        let writer = self.writer();
        writer.stack.push(function);

        let event = StackEvent::Push { ip: 0, function: function.info().internal_id };
        let tail = self.tail();
        if tail.is_nop() {
            self.buffer.replace_back(event);
            writer.first_action = EventKind::Push;
        } else {
            debug_assert!(tail.kind() != EventKind::Sample, "SAMPLE at channel tail");
            self.ensure_capacity(CanRealloc::Yes, 1);
            self.buffer.push_back(event);
        }
        writer.push_count += 1;
    }

    /// Records a return from the top frame.
    ///
    /// # Safety
    ///
    /// Writer role, outside signal handlers. The writer stack must not be empty.
    pub unsafe fn pop(&self) {
        let writer = self.writer();
        debug_assert!(!writer.stack.is_empty(), "pop from an empty writer stack");
        writer.stack.pop();

        match self.tail() {
            StackEvent::Push { .. } => {
                if writer.push_count == 1 && writer.first_action == EventKind::Push {
                    // The call started and ended between two samples.
                    self.buffer.replace_back(StackEvent::NOP);
                    writer.first_action = EventKind::Pop;
                } else {
                    self.buffer.pop_back();
                }
                writer.push_count = writer.push_count.saturating_sub(1);
            }
            StackEvent::Pop { count } => self.buffer.replace_back(StackEvent::Pop { count: count + 1 }),
            StackEvent::ChIp { .. } => {
                if writer.first_action == EventKind::ChIp {
                    self.buffer.replace_back(StackEvent::Pop { count: 1 });
                    writer.first_action = EventKind::Pop;
                } else {
                    // A non-leading CHIP always follows a POP.
                    debug_assert!(writer.first_action == EventKind::Pop);
                    self.buffer.pop_back();
                    match self.tail() {
                        StackEvent::Pop { count } => self.buffer.replace_back(StackEvent::Pop { count: count + 1 }),
                        other => {
                            debug_assert!(false, "CHIP preceded by {other:?}");
                            self.ensure_capacity(CanRealloc::Yes, 1);
                            self.buffer.push_back(StackEvent::Pop { count: 1 });
                        }
                    }
                }
            }
            StackEvent::Sample(_) => {
                debug_assert!(false, "SAMPLE at channel tail");
                self.ensure_capacity(CanRealloc::Yes, 1);
                self.buffer.push_back(StackEvent::Pop { count: 1 });
            }
        }
    }

    /// Refines the IP of the top frame.
    ///
    /// Returns false, without touching anything, when the event does not fit
    /// and `can_realloc` is [`CanRealloc::No`].
    ///
    /// # Safety
    ///
    /// Writer role. The writer stack must not be empty.
    pub unsafe fn chip(&self, ip: u64, can_realloc: CanRealloc) -> bool {
        let writer = self.writer();
        debug_assert!(!writer.stack.is_empty(), "chip on an empty writer stack");

        match self.tail() {
            tail if tail.is_nop() => {
                self.buffer.replace_back(StackEvent::ChIp { ip });
                writer.first_action = EventKind::ChIp;
            }
            StackEvent::Push { function, .. } => self.buffer.replace_back(StackEvent::Push { ip, function }),
            StackEvent::ChIp { .. } => self.buffer.replace_back(StackEvent::ChIp { ip }),
            tail => {
                debug_assert!(tail.kind() != EventKind::Sample, "SAMPLE at channel tail");
                if !self.ensure_capacity(can_realloc, 1) {
                    return false;
                }
                self.buffer.push_back(StackEvent::ChIp { ip });
            }
        }
        true
    }

    /// Closes the current span with a sample.
    ///
    /// Appends `SAMPLE` followed by a no-op. Returns false, without touching
    /// anything, when both do not fit and `can_realloc` is [`CanRealloc::No`].
    ///
    /// # Safety
    ///
    /// Writer role.
    pub unsafe fn sample(&self, ticks: u32, count: u32, can_realloc: CanRealloc) -> bool {
        let writer = self.writer();
        let event = StackEvent::Sample(SampleInfo { ticks, count });

        let tail = self.tail();
        if tail.is_nop() {
            if !self.ensure_capacity(can_realloc, 1) {
                return false;
            }
            self.buffer.replace_back(event);
        } else {
            debug_assert!(tail.kind() != EventKind::Sample, "SAMPLE at channel tail");
            if !self.ensure_capacity(can_realloc, 2) {
                return false;
            }
            self.buffer.push_back(event);
        }
        self.buffer.push_back(StackEvent::NOP);

        writer.first_action = EventKind::Pop;
        writer.push_count = 0;
        self.pending_samples.fetch_add(1, Ordering::Release);
        true
    }

    /// Asks the next allocating writer operation to grow the buffer.
    ///
    /// Async-signal-safe.
    pub fn plan_to_increase_capacity(&self) {
        self.growth_planned.store(true, Ordering::Relaxed);
    }

    /// # Safety
    ///
    /// Writer role.
    pub unsafe fn stack_size(&self) -> usize {
        self.writer().stack.len()
    }

    /// # Safety
    ///
    /// Writer role.
    pub unsafe fn top(&self) -> Option<FunctionHandle> {
        self.writer().stack.last().copied()
    }

    // ------------------------------------------------------------------
    // Reader role
    // ------------------------------------------------------------------

    /// Consumes events up to the next sample and returns it with its diff.
    ///
    /// Returns `None` when no sample is pending.
    ///
    /// # Safety
    ///
    /// Reader role.
    pub unsafe fn next_sample(&self) -> Option<(SampleInfo, StackTraceDiff)> {
        if self.pending_samples() == 0 {
            return None;
        }

        let stack = &mut *self.reader.get();
        let _guard = self.growth.lock().unwrap_or_else(PoisonError::into_inner);

        let mut watermark = stack.len();
        let mut ip = 0;
        let mut info = None;
        while let Some(event) = self.buffer.pop_front() {
            match event {
                StackEvent::Push { ip, function } => stack.push(Frame::new(function, ip)),
                StackEvent::Pop { count } => {
                    debug_assert!(count != 0, "no-op reached the reader");
                    debug_assert!(count as usize <= stack.len(), "POP below stack bottom");
                    stack.truncate(stack.len().saturating_sub(count as usize));
                    if stack.len() < watermark {
                        watermark = stack.len();
                        // The refined frame is gone.
                        ip = 0;
                    }
                }
                StackEvent::ChIp { ip: new_ip } => {
                    debug_assert!(!stack.is_empty(), "CHIP on an empty reader stack");
                    if let Some(top) = stack.last_mut() {
                        top.ip = new_ip;
                        // Frames past the watermark carry their own IP.
                        if watermark == stack.len() {
                            ip = new_ip;
                        }
                    }
                }
                StackEvent::Sample(sample) => {
                    info = Some(sample);
                    break;
                }
            }
        }

        let Some(info) = info else {
            debug_assert!(false, "pending sample missing from the buffer");
            return None;
        };
        self.pending_samples.fetch_sub(1, Ordering::Release);

        let diff = StackTraceDiff {
            match_prefix: u32::try_from(watermark).unwrap_or(u32::MAX),
            stack_size: u32::try_from(stack.len()).unwrap_or(u32::MAX),
            ip,
            frames: stack[watermark..].to_vec(),
        };
        Some((info, diff))
    }
}
