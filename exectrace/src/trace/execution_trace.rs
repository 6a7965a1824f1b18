//! Execution trace engine
//!
//! Turns host call events into per-thread stack channels and stack samples.
//!
//! # Architecture
//!
//! ```text
//!  managed threads (writers)          sampling thread          log thread (reader)
//!  ────────────────────────           ───────────────          ───────────────────
//!  enter/leave/JIT/transitions        every interval:          wait for wakeup
//!      │                              gen_ticks += 1           drain notified threads
//!      ├─► StackChannel push/pop      signal thread ──┐        next_sample() → diff
//!      └─► sample on stack change                     │        dump `str sam`
//!                                   signal handler ◄──┘
//!                                   ChIP + sample (no alloc)
//!                                   notify log thread
//! ```
//!
//! A thread only samples itself: either right before/after a stack change,
//! or from its own signal handler while it is between channel operations.

#![allow(unsafe_code)]

use crate::config::{CollectionMethod, ProfilerConfig};
use crate::domain::{EngineId, HostFunctionId, ProfilerError};
use crate::host::{HostCapabilities, HostRuntime, JitCacheResult, TransitionReason};
use crate::info::{FunctionDetails, FunctionHandle, FunctionInfo, ThreadInfo};
use crate::storage::Registry;
use crate::trace::common_trace::CommonTrace;
use crate::trace::notify::LogNotifier;
use crate::trace::signal::{self, ErrnoGuard, HandlerSlot};
use crate::trace::stack_channel::{CanRealloc, StackChannel};
use crate::tracelog::TraceLog;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use exectrace_common::{event_mask, TraceRecord, JIT_FUNCTION_NAME, UNMANAGED_FUNCTION_NAME};
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Engine reached by the sampling signal handler.
static ACTIVE_SAMPLER: HandlerSlot<ExecutionState> = HandlerSlot::new();

extern "C" fn sample_signal_handler(_signal: libc::c_int, _info: *mut libc::siginfo_t, context: *mut libc::c_void) {
    let _errno = ErrnoGuard::save();
    ACTIVE_SAMPLER.with(|state| state.handle_sample(context));
}

/// Stack change applied by [`ExecutionState::update_call_stack`].
#[derive(Debug, Clone, Copy)]
enum StackUpdate {
    /// `caller_ip` refines the caller's frame first (line tracing).
    Push { function: FunctionHandle, caller_ip: Option<u64> },
    Pop,
}

/// State shared by hooks, the sampling thread, the log thread and the signal handler.
struct ExecutionState {
    engine: EngineId,
    host: Arc<dyn HostRuntime>,
    caps: HostCapabilities,
    log: Arc<dyn TraceLog>,
    common: Arc<CommonTrace>,
    functions: Registry<HostFunctionId, FunctionInfo>,
    unmanaged: Arc<FunctionInfo>,
    jit: Arc<FunctionInfo>,
    notifier: LogNotifier,
    enabled: AtomicBool,
    track_stack: AtomicBool,
    /// Instrumentation: a sample after every stack change.
    sample_every_change: AtomicBool,
    line_trace: AtomicBool,
    high_granularity: AtomicBool,
    started: Instant,
}

#[derive(Default)]
struct Workers {
    sampling: Option<JoinHandle<()>>,
    sampling_stop: Option<Sender<()>>,
    log: Option<JoinHandle<()>>,
    claimed_signal: bool,
}

pub struct ExecutionTrace {
    state: Arc<ExecutionState>,
    workers: Mutex<Workers>,
}

impl ExecutionTrace {
    pub fn new(
        engine: EngineId,
        host: Arc<dyn HostRuntime>,
        caps: HostCapabilities,
        log: Arc<dyn TraceLog>,
        common: Arc<CommonTrace>,
    ) -> Result<Self, ProfilerError> {
        let functions = Registry::new();
        let unmanaged = functions.add(|iid| FunctionInfo::pseudo(iid, UNMANAGED_FUNCTION_NAME, engine));
        let jit = functions.add(|iid| FunctionInfo::pseudo(iid, JIT_FUNCTION_NAME, engine));

        let state = ExecutionState {
            engine,
            host,
            caps,
            log,
            common,
            functions,
            unmanaged,
            jit,
            notifier: LogNotifier::new()?,
            enabled: AtomicBool::new(false),
            track_stack: AtomicBool::new(false),
            sample_every_change: AtomicBool::new(false),
            line_trace: AtomicBool::new(false),
            high_granularity: AtomicBool::new(false),
            started: Instant::now(),
        };
        Ok(Self { state: Arc::new(state), workers: Mutex::new(Workers::default()) })
    }

    /// Applies `config` and starts the worker threads.
    ///
    /// Returns the host events the engine needs. Settings the host or the
    /// process cannot support are downgraded with a warning.
    pub fn start(&self, config: &ProfilerConfig) -> Result<u32, ProfilerError> {
        if !config.execution_trace_enabled {
            return Ok(0);
        }
        let state = &self.state;
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);

        let mut method = config.collection_method;
        let mut mask = event_mask::EXECUTION_TRACE;
        if method != CollectionMethod::None {
            if !state.caps.enter_leave_hooks {
                warn!(
                    "Host interface version {} has no enter/leave hooks; call stacks will not be collected",
                    state.caps.version
                );
                method = CollectionMethod::None;
            } else if let Err(err) = state.host.install_call_hooks() {
                error!("Failed to install enter/leave hooks: {err}");
                method = CollectionMethod::None;
            } else {
                mask |= event_mask::CALL_STACK;
            }
        }
        state.track_stack.store(method != CollectionMethod::None, Ordering::Relaxed);
        state.sample_every_change.store(method == CollectionMethod::Instrumentation, Ordering::Relaxed);
        state.line_trace.store(config.line_trace_enabled && method != CollectionMethod::None, Ordering::Relaxed);

        let mut high_granularity = config.high_granularity_enabled && method == CollectionMethod::Sampling;
        if high_granularity {
            if ACTIVE_SAMPLER.claim(state) {
                workers.claimed_signal = true;
                if let Err(err) = signal::install_sample_handler(sample_signal_handler) {
                    warn!("High granularity sampling disabled: {err}");
                    high_granularity = false;
                }
            } else {
                warn!("High granularity sampling disabled: another engine owns the sampling signal");
                high_granularity = false;
            }
        }
        state.high_granularity.store(high_granularity, Ordering::Relaxed);

        state.dump(&state.unmanaged.name_record())?;
        state.dump(&state.jit.name_record())?;
        state.enabled.store(true, Ordering::Release);

        let log_state = Arc::clone(state);
        workers.log = Some(
            std::thread::Builder::new()
                .name("exectrace-log".to_string())
                .spawn(move || log_state.run_log_thread())
                .map_err(|source| ProfilerError::ThreadSpawn { name: "log", source })?,
        );

        if method == CollectionMethod::Sampling {
            let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);
            let interval = Duration::from_millis(config.sampling_timeout_ms.max(1));
            let sampling_state = Arc::clone(state);
            workers.sampling = Some(
                std::thread::Builder::new()
                    .name("exectrace-sampling".to_string())
                    .spawn(move || sampling_state.run_sampling_thread(interval, &stop_rx))
                    .map_err(|source| ProfilerError::ThreadSpawn { name: "sampling", source })?,
            );
            workers.sampling_stop = Some(stop_tx);
        }

        info!(
            "Execution trace started: method={method}, interval={}ms, high_granularity={high_granularity}, line_trace={}",
            config.sampling_timeout_ms,
            state.line_trace.load(Ordering::Relaxed)
        );
        Ok(mask)
    }

    /// Stops the worker threads and flushes pending samples. Idempotent.
    pub fn shutdown(&self) {
        let state = &self.state;
        state.enabled.store(false, Ordering::Release);
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(stop) = workers.sampling_stop.take() {
            let _ = stop.try_send(());
        }
        if let Some(handle) = workers.sampling.take() {
            if handle.join().is_err() {
                error!("Sampling thread panicked");
            }
        }
        if workers.claimed_signal {
            ACTIVE_SAMPLER.release(state);
            workers.claimed_signal = false;
        }
        if let Some(handle) = workers.log.take() {
            state.notifier.request_stop();
            if handle.join().is_err() {
                error!("Log thread panicked");
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.state.enabled.load(Ordering::Acquire)
    }

    /// Method in effect after start-up downgrades.
    pub fn collection_method(&self) -> CollectionMethod {
        let state = &self.state;
        if !state.track_stack.load(Ordering::Relaxed) {
            CollectionMethod::None
        } else if state.sample_every_change.load(Ordering::Relaxed) {
            CollectionMethod::Instrumentation
        } else {
            CollectionMethod::Sampling
        }
    }

    pub fn high_granularity(&self) -> bool {
        self.state.high_granularity.load(Ordering::Relaxed)
    }

    /// Number of function records ever created, pseudo-functions included.
    pub fn function_record_count(&self) -> usize {
        self.state.functions.record_count()
    }

    /// Handle the host passes back on every enter/leave/tailcall of `function`.
    pub fn function_id_map(&self, function: HostFunctionId) -> FunctionHandle {
        FunctionHandle::new(&self.state.place_function(function))
    }

    pub fn enter(&self, function: FunctionHandle, caller_ip: u64) -> Result<(), ProfilerError> {
        let state = &self.state;
        state.check_handle(function)?;
        if !state.tracks_stack() {
            return Ok(());
        }
        let caller_ip = state.line_trace.load(Ordering::Relaxed).then_some(caller_ip);
        state.update_call_stack(StackUpdate::Push { function, caller_ip })
    }

    pub fn leave(&self, function: FunctionHandle) -> Result<(), ProfilerError> {
        let state = &self.state;
        state.check_handle(function)?;
        if !state.tracks_stack() {
            return Ok(());
        }
        state.update_call_stack(StackUpdate::Pop)
    }

    pub fn tailcall(&self, function: FunctionHandle) -> Result<(), ProfilerError> {
        self.leave(function)
    }

    pub fn jit_compilation_started(&self, function: HostFunctionId) -> Result<(), ProfilerError> {
        let state = &self.state;
        if !state.is_active() {
            return Ok(());
        }
        if state.tracks_stack() {
            let jit = FunctionHandle::new(&state.jit);
            state.update_call_stack(StackUpdate::Push { function: jit, caller_ip: None })?;
        }
        state.place_function(function);
        Ok(())
    }

    pub fn jit_compilation_finished(&self, function: HostFunctionId, status: u32) -> Result<(), ProfilerError> {
        let state = &self.state;
        if !state.is_active() {
            return Ok(());
        }
        let info = state.place_function(function);
        let identity = state.host.function_identity(function);
        let details = info.details_or_init(|| FunctionDetails::query(state.host.as_ref(), state.caps, function));
        let ids = identity.clone().unwrap_or_default();

        state.dump(&TraceRecord::JitCompilationFinished {
            function_id: function.0,
            function: info.internal_id,
            class_id: ids.class_id,
            module_id: ids.module_id,
            token: ids.token,
            status,
            code: details.code.clone(),
            il_map: details.il_map.clone(),
        })?;
        state.dump(&info.name_record())?;

        if state.tracks_stack() {
            state.update_call_stack(StackUpdate::Pop)?;
        }
        identity.map(drop).map_err(|err| ProfilerError::host("GetFunctionInfo", err))
    }

    /// Returns whether the host should use the precompiled code.
    pub fn jit_cached_function_search_started(&self, function: HostFunctionId) -> Result<bool, ProfilerError> {
        if self.state.is_active() {
            self.state.place_function(function);
        }
        Ok(true)
    }

    pub fn jit_cached_function_search_finished(
        &self,
        function: HostFunctionId,
        result: JitCacheResult,
    ) -> Result<(), ProfilerError> {
        let state = &self.state;
        if !state.is_active() || result == JitCacheResult::NotFound {
            return Ok(());
        }
        let info = state.place_function(function);
        let identity = state.host.function_identity(function);
        let details = info.details_or_init(|| FunctionDetails::query(state.host.as_ref(), state.caps, function));
        let ids = identity.clone().unwrap_or_default();

        state.dump(&TraceRecord::CachedFunctionFound {
            function_id: function.0,
            function: info.internal_id,
            class_id: ids.class_id,
            module_id: ids.module_id,
            token: ids.token,
            code: details.code.clone(),
            il_map: details.il_map.clone(),
        })?;
        state.dump(&info.name_record())?;
        identity.map(drop).map_err(|err| ProfilerError::host("GetFunctionInfo", err))
    }

    pub fn unmanaged_to_managed_transition(
        &self,
        _function: HostFunctionId,
        reason: TransitionReason,
    ) -> Result<(), ProfilerError> {
        let state = &self.state;
        if reason == TransitionReason::Return && state.tracks_stack() {
            state.update_call_stack(StackUpdate::Pop)?;
        }
        Ok(())
    }

    pub fn managed_to_unmanaged_transition(
        &self,
        _function: HostFunctionId,
        reason: TransitionReason,
    ) -> Result<(), ProfilerError> {
        let state = &self.state;
        if reason == TransitionReason::Call && state.tracks_stack() {
            let unmanaged = FunctionHandle::new(&state.unmanaged);
            state.update_call_stack(StackUpdate::Push { function: unmanaged, caller_ip: None })?;
        }
        Ok(())
    }

    pub fn exception_unwind_function_leave(&self) -> Result<(), ProfilerError> {
        let state = &self.state;
        if state.tracks_stack() {
            state.update_call_stack(StackUpdate::Pop)?;
        }
        Ok(())
    }

    pub fn function_unload_started(&self, function: HostFunctionId) -> Result<(), ProfilerError> {
        if self.state.functions.unlink(function).is_none() {
            debug!("Unloaded {function} was never mapped");
        }
        Ok(())
    }
}

impl Drop for ExecutionTrace {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl ExecutionState {
    fn dump(&self, record: &TraceRecord) -> Result<(), ProfilerError> {
        self.log.dump(record)?;
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    fn tracks_stack(&self) -> bool {
        self.is_active() && self.track_stack.load(Ordering::Relaxed)
    }

    fn place_function(&self, function: HostFunctionId) -> Arc<FunctionInfo> {
        let (info, _) = self.functions.place_with(function, |iid| FunctionInfo::new(iid, function, self.engine));
        info
    }

    fn check_handle(&self, function: FunctionHandle) -> Result<(), ProfilerError> {
        if function.engine() == self.engine {
            Ok(())
        } else {
            Err(ProfilerError::ForeignFunctionHandle)
        }
    }

    fn ticks(&self) -> u32 {
        u32::try_from(self.started.elapsed().as_millis()).unwrap_or(u32::MAX)
    }

    /// Closes the span with a sample and wakes the log thread.
    ///
    /// # Safety
    ///
    /// Writer role on `thread.channel`.
    unsafe fn sample(&self, thread: &ThreadInfo, count: u32, can_realloc: CanRealloc) -> bool {
        if thread.channel.sample(self.ticks(), count, can_realloc) {
            self.notifier.notify(thread);
            true
        } else {
            false
        }
    }

    /// Samples if the sampling thread started a generation since the last
    /// sample, or unconditionally with `force`.
    ///
    /// # Safety
    ///
    /// Writer role on `thread.channel`, outside signal handlers.
    unsafe fn sample_on_stack_change(&self, thread: &ThreadInfo, force: bool) {
        let generation = thread.gen_ticks();
        let fixed = thread.fix_ticks();
        if force || generation != fixed {
            self.sample(thread, generation.wrapping_sub(fixed), CanRealloc::Yes);
            thread.set_fix_ticks(generation);
        }
    }

    fn update_call_stack(&self, update: StackUpdate) -> Result<(), ProfilerError> {
        let thread = self.common.current_thread_info()?;
        let channel: &StackChannel = &thread.channel;
        let force = self.sample_every_change.load(Ordering::Relaxed);

        thread.set_interruptible(false);
        // SAFETY: this is the thread's own channel and its signal handler is
        // kept out by the interruptible flag, so this is the only writer.
        let result = unsafe {
            self.sample_on_stack_change(thread, false);
            let result = match update {
                StackUpdate::Push { function, caller_ip } => {
                    if let Some(ip) = caller_ip {
                        if channel.stack_size() > 0 {
                            channel.chip(ip, CanRealloc::Yes);
                        }
                    }
                    channel.push(function);
                    Ok(())
                }
                StackUpdate::Pop if channel.stack_size() == 0 => {
                    Err(ProfilerError::Invariant("return without a matching call"))
                }
                StackUpdate::Pop => {
                    channel.pop();
                    Ok(())
                }
            };
            self.sample_on_stack_change(thread, force);
            result
        };
        thread.set_interruptible(true);
        result
    }

    /// Sampling signal body. Runs on the interrupted thread.
    ///
    /// Async-signal-safe: no allocation, no locks, no logging.
    fn handle_sample(&self, context: *mut libc::c_void) {
        if !self.is_active() {
            return;
        }
        let Some(thread) = self.common.current_thread_info_in_signal() else {
            return;
        };
        // A record cached here may have moved to another native thread.
        if !thread.is_interruptible() || thread.native_handle() != signal::current_native_handle() {
            return;
        }
        let generation = thread.gen_ticks();
        let fixed = thread.fix_ticks();
        if generation == fixed {
            return;
        }

        let channel = &thread.channel;
        // SAFETY: the interrupted thread is between channel operations, so the
        // handler is the only writer. Nothing here allocates.
        let enough_space = unsafe {
            let mut enough_space = true;
            if self.line_trace.load(Ordering::Relaxed) && channel.stack_size() > 0 {
                let range = channel.top().and_then(|top| top.info().first_code_range()).filter(|range| range.size != 0);
                if let Some(range) = range {
                    let ip = signal::interrupted_ip(context);
                    enough_space = channel.chip(if range.contains(ip) { ip } else { 0 }, CanRealloc::No);
                }
            }
            enough_space && self.sample(thread, generation.wrapping_sub(fixed), CanRealloc::No)
        };
        if !enough_space {
            channel.plan_to_increase_capacity();
        }
        thread.set_fix_ticks(generation);
    }

    fn run_sampling_thread(&self, interval: Duration, stop: &Receiver<()>) {
        debug!("Sampling thread started ({}ms)", interval.as_millis());
        loop {
            match stop.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
            if !self.is_active() {
                break;
            }
            let high_granularity = self.high_granularity.load(Ordering::Relaxed);
            self.common.for_each_thread(|thread| {
                if !thread.is_live() {
                    return;
                }
                thread.advance_generation();
                if high_granularity {
                    if let Err(err) = signal::send_sample_signal(thread.native_handle()) {
                        debug!("Failed to signal {}: {err}", thread.host_id);
                    }
                }
            });
        }
        debug!("Sampling thread stopped");
    }

    fn run_log_thread(&self) {
        debug!("Log thread started");
        loop {
            let stopping = self.notifier.stop_requested();
            if let Err(err) = self.notifier.wait(if stopping { Some(Duration::ZERO) } else { None }) {
                error!("Log thread wait failed: {err}");
                break;
            }
            // SAFETY: notified threads are registry records, alive while `self` is.
            let drained = unsafe { self.notifier.drain(|thread| self.drain_samples(thread)) };
            if stopping && drained == 0 {
                break;
            }
        }
        if let Err(err) = self.log.flush() {
            error!("Failed to flush trace log: {err}");
        }
        debug!("Log thread stopped");
    }

    fn drain_samples(&self, thread: &ThreadInfo) {
        let mut pending = thread.channel.pending_samples();
        while pending > 0 {
            // SAFETY: the log thread is the only reader of every channel.
            let Some((sample, diff)) = (unsafe { thread.channel.next_sample() }) else {
                break;
            };
            if let Err(err) = self.dump(&TraceRecord::StackSample { thread: thread.internal_id, sample, diff }) {
                error!("Failed to write sample of {}: {err}", thread.host_id);
            }
            pending -= 1;
        }
    }
}
