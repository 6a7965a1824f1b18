//! Thread bookkeeping and load events
//!
//! Owns the thread registry. Every host callback that touches a call stack
//! first resolves the calling thread's [`ThreadInfo`] here; the result is
//! cached in a thread-local so the common case is one TLS read plus one host
//! query to detect logical-thread migration.
//!
//! The signal handler uses the same cache but cannot ask the host anything,
//! so it trusts the cached record as long as it was filled by this engine.

#![allow(unsafe_code)]

use crate::domain::{EngineId, HostError, HostObjectId, HostThreadId, OsThreadId, ProfilerError};
use crate::host::HostRuntime;
use crate::info::ThreadInfo;
use crate::storage::Registry;
use crate::trace::signal;
use crate::tracelog::TraceLog;
use exectrace_common::{event_mask, TraceRecord, UNKNOWN_NAME};
use log::{debug, warn};
use std::cell::Cell;
use std::ptr;
use std::sync::atomic::{compiler_fence, Ordering};
use std::sync::Arc;

/// Last thread record resolved on a native thread, tagged with its engine.
///
/// The two words are written separately, so a signal handler on the same
/// thread may interrupt an update. Writers clear the tag first and set it
/// last; readers load the tag first. A reader that sees a valid tag
/// therefore also sees the pointer stored with it.
struct CachedThread {
    engine: Cell<EngineId>,
    record: Cell<*const ThreadInfo>,
}

impl CachedThread {
    const fn empty() -> Self {
        Self { engine: Cell::new(EngineId(0)), record: Cell::new(ptr::null()) }
    }

    fn load(&self) -> (EngineId, *const ThreadInfo) {
        let engine = self.engine.get();
        compiler_fence(Ordering::SeqCst);
        (engine, self.record.get())
    }

    fn store(&self, engine: EngineId, record: *const ThreadInfo) {
        self.engine.set(EngineId(0));
        compiler_fence(Ordering::SeqCst);
        self.record.set(record);
        compiler_fence(Ordering::SeqCst);
        self.engine.set(engine);
    }
}

thread_local! {
    static CURRENT_THREAD: CachedThread = const { CachedThread::empty() };
}

pub struct CommonTrace {
    engine: EngineId,
    host: Arc<dyn HostRuntime>,
    log: Arc<dyn TraceLog>,
    threads: Registry<HostThreadId, ThreadInfo>,
    enabled: bool,
}

impl CommonTrace {
    pub fn new(engine: EngineId, host: Arc<dyn HostRuntime>, log: Arc<dyn TraceLog>, enabled: bool) -> Self {
        Self { engine, host, log, threads: Registry::new(), enabled }
    }

    pub fn engine(&self) -> EngineId {
        self.engine
    }

    /// Host events this component needs.
    pub fn event_mask(&self) -> u32 {
        if self.enabled {
            event_mask::COMMON_TRACE
        } else {
            0
        }
    }

    fn dump(&self, record: &TraceRecord) -> Result<(), ProfilerError> {
        self.log.dump(record)?;
        Ok(())
    }

    fn place_thread(&self, thread_id: HostThreadId) -> Result<Arc<ThreadInfo>, ProfilerError> {
        let (thread, inserted) =
            self.threads.place_with(thread_id, |iid| ThreadInfo::new(thread_id, iid, self.engine));
        if inserted {
            debug!("New {thread_id} as {}", thread.internal_id);
            self.dump(&TraceRecord::ThreadCreated { thread_id: thread_id.0, thread: thread.internal_id })?;
        }
        Ok(thread)
    }

    /// Record of the logical thread running on the calling native thread.
    ///
    /// Creates the record if the host never reported the thread, and binds
    /// it to this native thread so the sampling thread can signal it.
    pub fn current_thread_info(&self) -> Result<&ThreadInfo, ProfilerError> {
        let (engine, cached) = CURRENT_THREAD.with(CachedThread::load);
        // SAFETY: records are never freed while their registry lives, and the
        // engine tag proves the pointer came from this registry.
        let cached = if engine == self.engine { unsafe { cached.as_ref() } } else { None };

        let thread_id = self.host.current_thread_id().map_err(|err| ProfilerError::host("GetCurrentThreadID", err))?;
        if let Some(thread) = cached {
            if thread.host_id == thread_id {
                return Ok(thread);
            }
        }

        let thread = self.place_thread(thread_id)?;
        let os_thread_id = match self.host.os_thread_id(thread_id) {
            Ok(os_thread_id) => os_thread_id,
            Err(HostError::UnsupportedCallSequence) => OsThreadId::default(),
            Err(err) => {
                warn!("OS thread of {thread_id} unavailable: {err}");
                OsThreadId::default()
            }
        };

        // The previous logical thread no longer runs here.
        if let Some(previous) = cached {
            if previous.os_thread_id() == os_thread_id {
                previous.clear_native();
            }
        }
        thread.set_os_thread_id(os_thread_id);
        thread.set_native_handle(signal::current_native_handle());

        let record = Arc::as_ptr(&thread);
        CURRENT_THREAD.with(|cache| cache.store(self.engine, record));
        // SAFETY: the registry keeps the record alive for as long as `self`.
        Ok(unsafe { &*record })
    }

    /// Cached record for the calling native thread. Async-signal-safe.
    ///
    /// Never creates a record and never asks the host; returns `None` when
    /// the cache is empty or belongs to another engine.
    pub fn current_thread_info_in_signal(&self) -> Option<&ThreadInfo> {
        let (engine, cached) = CURRENT_THREAD.try_with(CachedThread::load).ok()?;
        if engine != self.engine {
            return None;
        }
        // SAFETY: see `current_thread_info`.
        unsafe { cached.as_ref() }
    }

    /// Visits every thread still linked to a host id.
    pub fn for_each_thread(&self, visit: impl FnMut(&ThreadInfo)) {
        self.threads.for_each_linked(visit);
    }

    pub fn thread(&self, thread_id: HostThreadId) -> Option<Arc<ThreadInfo>> {
        self.threads.get(thread_id)
    }

    /// Number of thread records ever created.
    pub fn thread_record_count(&self) -> usize {
        self.threads.record_count()
    }

    pub fn thread_created(&self, thread_id: HostThreadId) -> Result<(), ProfilerError> {
        let (thread, inserted) = self.threads.place_with(thread_id, |iid| ThreadInfo::new(thread_id, iid, self.engine));
        if !inserted {
            debug!("{thread_id} created again, keeping {}", thread.internal_id);
        }
        self.dump(&TraceRecord::ThreadCreated { thread_id: thread_id.0, thread: thread.internal_id })
    }

    pub fn thread_destroyed(&self, thread_id: HostThreadId) -> Result<(), ProfilerError> {
        let Some(thread) = self.threads.unlink(thread_id) else {
            warn!("Destroyed {thread_id} was never registered");
            return Ok(());
        };
        thread.clear_native();
        self.dump(&TraceRecord::ThreadDestroyed { thread: thread.internal_id })
    }

    pub fn thread_assigned_to_os_thread(&self, thread_id: HostThreadId, os_thread_id: OsThreadId) -> Result<(), ProfilerError> {
        let thread = self.place_thread(thread_id)?;
        if thread.os_thread_id() != os_thread_id {
            // Rebound by the next current-thread resolution on the new native thread.
            thread.set_native_handle(0);
        }
        thread.set_os_thread_id(os_thread_id);
        self.dump(&TraceRecord::ThreadAssignedToOsThread { thread: thread.internal_id, os_thread_id: os_thread_id.0 })
    }

    // Load events dump a record even when the metadata query fails; the
    // query error is returned afterwards.

    pub fn app_domain_creation_finished(&self, app_domain: HostObjectId, status: u32) -> Result<(), ProfilerError> {
        let info = self.host.app_domain_info(app_domain);
        let (name, process_id) = match &info {
            Ok(info) => (info.name.clone(), info.process_id),
            Err(_) => (UNKNOWN_NAME.to_string(), 0),
        };
        self.dump(&TraceRecord::AppDomainCreated { app_domain_id: app_domain.0, process_id, status, name })?;
        info.map(drop).map_err(|err| ProfilerError::host("GetAppDomainInfo", err))
    }

    pub fn assembly_load_finished(&self, assembly: HostObjectId, status: u32) -> Result<(), ProfilerError> {
        let info = self.host.assembly_info(assembly);
        let (name, app_domain_id, module_id) = match &info {
            Ok(info) => (info.name.clone(), info.app_domain_id, info.module_id),
            Err(_) => (UNKNOWN_NAME.to_string(), 0, 0),
        };
        self.dump(&TraceRecord::AssemblyLoaded { assembly_id: assembly.0, app_domain_id, module_id, status, name })?;
        info.map(drop).map_err(|err| ProfilerError::host("GetAssemblyInfo", err))
    }

    pub fn module_load_finished(&self, module: HostObjectId, status: u32) -> Result<(), ProfilerError> {
        let info = self.host.module_info(module);
        let (name, base_address, assembly_id) = match &info {
            Ok(info) => (info.name.clone(), info.base_address, info.assembly_id),
            Err(_) => (UNKNOWN_NAME.to_string(), 0, 0),
        };
        self.dump(&TraceRecord::ModuleLoaded { module_id: module.0, base_address, assembly_id, status, name })?;
        info.map(drop).map_err(|err| ProfilerError::host("GetModuleInfo", err))
    }

    pub fn module_attached_to_assembly(&self, module: HostObjectId, assembly: HostObjectId) -> Result<(), ProfilerError> {
        self.dump(&TraceRecord::ModuleAttached { module_id: module.0, assembly_id: assembly.0 })
    }

    pub fn class_load_finished(&self, class: HostObjectId, status: u32) -> Result<(), ProfilerError> {
        let info = self.host.class_info(class);
        let (module_id, type_def_token) = match &info {
            Ok(info) => (info.module_id, info.type_def_token),
            Err(_) => (0, 0),
        };
        self.dump(&TraceRecord::ClassLoaded { class_id: class.0, module_id, type_def_token, status })?;
        info.map(drop).map_err(|err| ProfilerError::host("GetClassIDInfo", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulate::SimulatedHost;
    use crate::tracelog::StreamTraceLog;
    use exectrace_common::InternalId;

    fn common_trace() -> (Arc<SimulatedHost>, Arc<StreamTraceLog<Vec<u8>>>, CommonTrace) {
        let host = Arc::new(SimulatedHost::new(3));
        let log = Arc::new(StreamTraceLog::in_memory());
        let common = CommonTrace::new(EngineId::next(), host.clone(), log.clone(), true);
        (host, log, common)
    }

    #[test]
    fn test_current_thread_is_created_once_and_cached() {
        let (host, log, common) = common_trace();
        let thread_id = host.enter_thread();

        let first = common.current_thread_info().unwrap();
        assert_eq!(first.host_id, thread_id);
        assert!(first.is_live());
        assert!(first.os_thread_id().is_attached());
        let second = common.current_thread_info().unwrap();
        assert!(ptr::eq(first, second));
        assert!(ptr::eq(common.current_thread_info_in_signal().unwrap(), first));

        let records = log.records();
        assert_eq!(records, vec![TraceRecord::ThreadCreated { thread_id: thread_id.0, thread: InternalId(0) }]);
        host.leave_thread();
    }

    #[test]
    fn test_logical_thread_migration_rebinds_native_thread() {
        let (host, _log, common) = common_trace();
        let first_id = host.enter_thread();
        let first = common.current_thread_info().unwrap();

        // Another logical thread takes over this native thread.
        let second_id = host.create_thread();
        host.set_current_thread(second_id);
        let second = common.current_thread_info().unwrap();
        assert_eq!(second.host_id, second_id);
        assert_ne!(first.internal_id, second.internal_id);
        assert!(!first.is_live());
        assert!(second.is_live());
        assert_eq!(common.thread(first_id).unwrap().internal_id, first.internal_id);
        host.leave_thread();
    }

    #[test]
    fn test_signal_lookup_ignores_other_engines() {
        let (host, _log, common) = common_trace();
        host.enter_thread();
        common.current_thread_info().unwrap();

        let other = CommonTrace::new(EngineId::next(), host.clone(), Arc::new(StreamTraceLog::in_memory()), true);
        assert!(other.current_thread_info_in_signal().is_none());
        host.leave_thread();
    }

    #[test]
    fn test_thread_cache_update_is_never_half_visible() {
        let first = thread_record(1);
        let second = thread_record(2);
        let cache = CachedThread::empty();
        assert_eq!(cache.load(), (EngineId(0), ptr::null()));

        cache.store(EngineId(5), ptr::from_ref(&first));
        assert_eq!(cache.load(), (EngineId(5), ptr::from_ref(&first)));

        // The tag is invalid while the pointer changes.
        cache.engine.set(EngineId(0));
        cache.record.set(ptr::from_ref(&second));
        assert_eq!(cache.load().0, EngineId(0));

        cache.store(EngineId(6), ptr::from_ref(&second));
        assert_eq!(cache.load(), (EngineId(6), ptr::from_ref(&second)));
    }

    fn thread_record(id: u32) -> ThreadInfo {
        ThreadInfo::new(HostThreadId(u64::from(id)), InternalId(id), EngineId(0))
    }

    #[test]
    fn test_duplicate_thread_created_keeps_record() {
        let (host, log, common) = common_trace();
        let thread_id = host.create_thread();
        common.thread_created(thread_id).unwrap();
        common.thread_created(thread_id).unwrap();

        assert_eq!(common.thread_record_count(), 1);
        let created = TraceRecord::ThreadCreated { thread_id: thread_id.0, thread: InternalId(0) };
        assert_eq!(log.records(), vec![created.clone(), created]);
    }

    #[test]
    fn test_thread_lifecycle_records() {
        let (host, log, common) = common_trace();
        let thread_id = host.create_thread();
        common.thread_created(thread_id).unwrap();
        common.thread_assigned_to_os_thread(thread_id, OsThreadId(777)).unwrap();
        common.thread_destroyed(thread_id).unwrap();
        // Unknown thread is tolerated.
        common.thread_destroyed(thread_id).unwrap();

        assert!(common.thread(thread_id).is_none());
        assert_eq!(common.thread_record_count(), 1);
        assert_eq!(
            log.records(),
            vec![
                TraceRecord::ThreadCreated { thread_id: thread_id.0, thread: InternalId(0) },
                TraceRecord::ThreadAssignedToOsThread { thread: InternalId(0), os_thread_id: 777 },
                TraceRecord::ThreadDestroyed { thread: InternalId(0) },
            ]
        );
    }

    #[test]
    fn test_recycled_thread_id_gets_new_internal_id() {
        let (_host, _log, common) = common_trace();
        common.thread_created(HostThreadId(0x40)).unwrap();
        common.thread_destroyed(HostThreadId(0x40)).unwrap();
        common.thread_created(HostThreadId(0x40)).unwrap();
        assert_eq!(common.thread(HostThreadId(0x40)).unwrap().internal_id, InternalId(1));
    }

    #[test]
    fn test_load_events_fall_back_to_unknown() {
        let (host, log, common) = common_trace();
        let app_domain = host.define_app_domain("DefaultDomain", 4242);
        common.app_domain_creation_finished(app_domain, 0).unwrap();

        let err = common.module_load_finished(HostObjectId(0xdead), 0).unwrap_err();
        assert!(matches!(err, ProfilerError::Host { call: "GetModuleInfo", .. }));

        assert_eq!(
            log.records(),
            vec![
                TraceRecord::AppDomainCreated {
                    app_domain_id: app_domain.0,
                    process_id: 4242,
                    status: 0,
                    name: "DefaultDomain".to_string(),
                },
                TraceRecord::ModuleLoaded {
                    module_id: 0xdead,
                    base_address: 0,
                    assembly_id: 0,
                    status: 0,
                    name: UNKNOWN_NAME.to_string(),
                },
            ]
        );
    }

    #[test]
    fn test_disabled_common_trace_requests_no_events() {
        let host = Arc::new(SimulatedHost::new(3));
        let common = CommonTrace::new(EngineId::next(), host, Arc::new(StreamTraceLog::in_memory()), false);
        assert_eq!(common.event_mask(), 0);
    }
}
