//! Host-facing profiler object
//!
//! [`Profiler`] is what a host talks to. It owns one engine (common trace +
//! execution trace), enforces that only one engine is attached per process,
//! and turns every callback result into a [`HostStatus`]. Errors and panics
//! are logged here and never cross into the host.

use crate::config::ProfilerConfig;
use crate::domain::{EngineId, HostFunctionId, HostObjectId, HostThreadId, OsThreadId, ProfilerError};
use crate::host::{HostCapabilities, HostRuntime, JitCacheResult, TransitionReason};
use crate::info::FunctionHandle;
use crate::trace::{CommonTrace, ExecutionTrace};
use crate::tracelog::TraceLog;
use log::{error, info, trace, warn};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Set while a [`Profiler`] is attached somewhere in this process.
static ACTIVE: AtomicBool = AtomicBool::new(false);

/// Status returned to the host from every callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostStatus {
    Ok,
    Fail,
    OutOfMemory,
    /// Broken invariant or panic.
    Unexpected,
    /// Refuses activation (another instance is attached).
    CancelActivation,
    /// A host call failed with this status.
    HostFailure(u32),
}

impl HostStatus {
    /// Numeric status code as the host understands it.
    #[must_use]
    pub const fn code(self) -> u32 {
        match self {
            Self::Ok => 0,
            Self::Fail => 0x8000_4005,
            Self::OutOfMemory => 0x8007_000E,
            Self::Unexpected => 0x8000_FFFF,
            Self::CancelActivation => 0x8013_1375,
            Self::HostFailure(code) => code,
        }
    }

    #[must_use]
    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }
}

impl From<&ProfilerError> for HostStatus {
    fn from(err: &ProfilerError) -> Self {
        match err {
            ProfilerError::AlreadyActive => Self::CancelActivation,
            ProfilerError::Host { source, .. } => Self::HostFailure(source.status_code()),
            ProfilerError::Invariant(_) | ProfilerError::ForeignFunctionHandle => Self::Unexpected,
            ProfilerError::ThreadSpawn { source, .. } | ProfilerError::Io(source)
                if source.kind() == std::io::ErrorKind::OutOfMemory =>
            {
                Self::OutOfMemory
            }
            _ => Self::Fail,
        }
    }
}

/// Process-wide single-instance token.
struct ActivationClaim;

impl ActivationClaim {
    fn acquire() -> Result<Self, ProfilerError> {
        ACTIVE
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| Self)
            .map_err(|_| ProfilerError::AlreadyActive)
    }
}

impl Drop for ActivationClaim {
    fn drop(&mut self) {
        ACTIVE.store(false, Ordering::Release);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

/// Runs a callback body, containing errors and panics.
fn guard(callback: &'static str, body: impl FnOnce() -> Result<(), ProfilerError>) -> HostStatus {
    trace!("{callback}()");
    match panic::catch_unwind(AssertUnwindSafe(body)) {
        Ok(Ok(())) => HostStatus::Ok,
        Ok(Err(err)) => {
            error!("{callback}: {err}");
            HostStatus::from(&err)
        }
        Err(payload) => {
            error!("{callback}: panicked: {}", panic_message(payload.as_ref()));
            HostStatus::Unexpected
        }
    }
}

pub struct Profiler {
    config: ProfilerConfig,
    caps: HostCapabilities,
    log: Arc<dyn TraceLog>,
    common: Arc<CommonTrace>,
    execution: ExecutionTrace,
    // Dropped last so a successor cannot attach while this engine still runs.
    _claim: ActivationClaim,
}

impl Profiler {
    /// Attaches a new engine to `host`.
    ///
    /// Fails with [`ProfilerError::AlreadyActive`] while another profiler is
    /// attached in this process. Unsupported settings are downgraded with a
    /// warning instead of failing.
    pub fn attach(host: Arc<dyn HostRuntime>, config: ProfilerConfig, log: Arc<dyn TraceLog>) -> Result<Self, ProfilerError> {
        let claim = ActivationClaim::acquire()?;
        let caps = HostCapabilities::probe(host.as_ref())?;

        let (config, warnings) = config.validate();
        for warning in &warnings {
            warn!("{warning}");
        }

        let engine = EngineId::next();
        let common = Arc::new(CommonTrace::new(engine, Arc::clone(&host), Arc::clone(&log), config.execution_trace_enabled));
        let execution = ExecutionTrace::new(engine, Arc::clone(&host), caps, Arc::clone(&log), Arc::clone(&common))?;

        let mut mask = host.event_mask().map_err(|err| ProfilerError::host("GetEventMask", err))?;
        mask |= common.event_mask();
        match execution.start(&config) {
            Ok(execution_mask) => mask |= execution_mask,
            Err(err) => {
                error!("Execution trace disabled: {err}");
                execution.shutdown();
            }
        }
        host.set_event_mask(mask).map_err(|err| ProfilerError::host("SetEventMask", err))?;

        info!("Profiler attached ({engine}, host interface v{}, event mask 0x{mask:08x})", caps.version);
        Ok(Self { config, caps, log, common, execution, _claim: claim })
    }

    /// Stops the engine's threads and flushes the trace log. Idempotent.
    pub fn shutdown(&self) -> HostStatus {
        guard("Shutdown", || {
            self.execution.shutdown();
            self.log.flush()?;
            Ok(())
        })
    }

    /// Effective configuration after validation.
    pub fn config(&self) -> &ProfilerConfig {
        &self.config
    }

    pub fn capabilities(&self) -> HostCapabilities {
        self.caps
    }

    pub fn execution_trace(&self) -> &ExecutionTrace {
        &self.execution
    }

    pub fn common_trace(&self) -> &CommonTrace {
        &self.common
    }

    // Call hooks

    /// Returns the handle the host passes to [`Profiler::enter`] and friends,
    /// or `None` (hooks stay off for the function) on failure.
    pub fn function_id_map(&self, function: HostFunctionId) -> Option<FunctionHandle> {
        let mut handle = None;
        let status = guard("FunctionIDMap", || {
            handle = Some(self.execution.function_id_map(function));
            Ok(())
        });
        if status.is_ok() {
            handle
        } else {
            None
        }
    }

    pub fn enter(&self, function: FunctionHandle, caller_ip: u64) -> HostStatus {
        guard("Enter", || self.execution.enter(function, caller_ip))
    }

    pub fn leave(&self, function: FunctionHandle) -> HostStatus {
        guard("Leave", || self.execution.leave(function))
    }

    pub fn tailcall(&self, function: FunctionHandle) -> HostStatus {
        guard("Tailcall", || self.execution.tailcall(function))
    }

    // Thread events

    pub fn thread_created(&self, thread: HostThreadId) -> HostStatus {
        guard("ThreadCreated", || self.common.thread_created(thread))
    }

    pub fn thread_destroyed(&self, thread: HostThreadId) -> HostStatus {
        guard("ThreadDestroyed", || self.common.thread_destroyed(thread))
    }

    pub fn thread_assigned_to_os_thread(&self, thread: HostThreadId, os_thread: OsThreadId) -> HostStatus {
        guard("ThreadAssignedToOSThread", || self.common.thread_assigned_to_os_thread(thread, os_thread))
    }

    // Load events

    pub fn app_domain_creation_finished(&self, app_domain: HostObjectId, status: u32) -> HostStatus {
        guard("AppDomainCreationFinished", || self.common.app_domain_creation_finished(app_domain, status))
    }

    pub fn assembly_load_finished(&self, assembly: HostObjectId, status: u32) -> HostStatus {
        guard("AssemblyLoadFinished", || self.common.assembly_load_finished(assembly, status))
    }

    pub fn module_load_finished(&self, module: HostObjectId, status: u32) -> HostStatus {
        guard("ModuleLoadFinished", || self.common.module_load_finished(module, status))
    }

    pub fn module_attached_to_assembly(&self, module: HostObjectId, assembly: HostObjectId) -> HostStatus {
        guard("ModuleAttachedToAssembly", || self.common.module_attached_to_assembly(module, assembly))
    }

    pub fn class_load_finished(&self, class: HostObjectId, status: u32) -> HostStatus {
        guard("ClassLoadFinished", || self.common.class_load_finished(class, status))
    }

    // JIT and code events

    pub fn jit_compilation_started(&self, function: HostFunctionId) -> HostStatus {
        guard("JITCompilationStarted", || self.execution.jit_compilation_started(function))
    }

    pub fn jit_compilation_finished(&self, function: HostFunctionId, status: u32) -> HostStatus {
        guard("JITCompilationFinished", || self.execution.jit_compilation_finished(function, status))
    }

    /// Returns the status and whether the host should use the cached code.
    pub fn jit_cached_function_search_started(&self, function: HostFunctionId) -> (HostStatus, bool) {
        let mut use_cached = true;
        let status = guard("JITCachedFunctionSearchStarted", || {
            use_cached = self.execution.jit_cached_function_search_started(function)?;
            Ok(())
        });
        (status, use_cached)
    }

    pub fn jit_cached_function_search_finished(&self, function: HostFunctionId, result: JitCacheResult) -> HostStatus {
        guard("JITCachedFunctionSearchFinished", || self.execution.jit_cached_function_search_finished(function, result))
    }

    pub fn unmanaged_to_managed_transition(&self, function: HostFunctionId, reason: TransitionReason) -> HostStatus {
        guard("UnmanagedToManagedTransition", || self.execution.unmanaged_to_managed_transition(function, reason))
    }

    pub fn managed_to_unmanaged_transition(&self, function: HostFunctionId, reason: TransitionReason) -> HostStatus {
        guard("ManagedToUnmanagedTransition", || self.execution.managed_to_unmanaged_transition(function, reason))
    }

    pub fn exception_unwind_function_leave(&self) -> HostStatus {
        guard("ExceptionUnwindFunctionLeave", || self.execution.exception_unwind_function_leave())
    }

    pub fn function_unload_started(&self, function: HostFunctionId) -> HostStatus {
        guard("FunctionUnloadStarted", || self.execution.function_unload_started(function))
    }
}

impl Drop for Profiler {
    fn drop(&mut self) {
        self.execution.shutdown();
        if let Err(err) = self.log.flush() {
            error!("Failed to flush trace log: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::HostError;

    #[test]
    fn test_status_codes() {
        assert_eq!(HostStatus::Ok.code(), 0);
        assert!(HostStatus::Ok.is_ok());
        assert!(!HostStatus::Fail.is_ok());
        assert_eq!(HostStatus::HostFailure(0x8013_1363).code(), 0x8013_1363);
    }

    #[test]
    fn test_error_mapping() {
        assert_eq!(HostStatus::from(&ProfilerError::AlreadyActive), HostStatus::CancelActivation);
        assert_eq!(HostStatus::from(&ProfilerError::Invariant("x")), HostStatus::Unexpected);
        assert_eq!(
            HostStatus::from(&ProfilerError::host("GetModuleInfo", HostError::Failed { code: 0x8000_0003 })),
            HostStatus::HostFailure(0x8000_0003)
        );
        let oom = std::io::Error::from(std::io::ErrorKind::OutOfMemory);
        assert_eq!(HostStatus::from(&ProfilerError::ThreadSpawn { name: "log", source: oom }), HostStatus::OutOfMemory);
        assert_eq!(HostStatus::from(&ProfilerError::SignalSetup("busy".to_string())), HostStatus::Fail);
    }

    #[test]
    fn test_guard_contains_errors_and_panics() {
        assert_eq!(guard("Ok", || Ok(())), HostStatus::Ok);
        assert_eq!(guard("Err", || Err(ProfilerError::ForeignFunctionHandle)), HostStatus::Unexpected);
        assert_eq!(guard("Panic", || panic!("boom")), HostStatus::Unexpected);
    }
}
