//! In-process stand-in for a managed runtime
//!
//! [`SimulatedHost`] answers every [`HostRuntime`] query from in-memory
//! tables, and [`Workload`] drives a [`Profiler`] with synthetic call trees
//! on real OS threads. Together they exercise the whole engine (hooks,
//! sampling thread, signals, log thread) without a real runtime.

use crate::domain::{HostError, HostFunctionId, HostObjectId, HostThreadId, OsThreadId};
use crate::host::{
    AppDomainInfo, AssemblyInfo, ClassInfo, FunctionIdentity, HostRuntime, MethodProps, ModuleInfo, TransitionReason,
    TypeDefProps,
};
use crate::info::FunctionHandle;
use crate::profiler::Profiler;
use exectrace_common::{CodeRange, IlToNativeMapping};
use log::{debug, warn};
use std::cell::Cell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

/// Status the simulated host reports for unknown ids.
const E_INVALIDARG: u32 = 0x8007_0057;

/// Base of the fake code address space handed out to functions.
const CODE_BASE: u64 = 0x7f00_0000_0000;
const CODE_SIZE: u32 = 0x800;

thread_local! {
    /// Logical thread the calling native thread is running, 0 if none.
    static CURRENT_THREAD: Cell<u64> = const { Cell::new(0) };
}

#[derive(Debug, Clone)]
struct SimFunction {
    name: String,
    class_token: u32,
    code: CodeRange,
}

#[derive(Debug, Clone)]
enum SimObject {
    AppDomain(AppDomainInfo),
    Assembly(AssemblyInfo),
    Module(ModuleInfo),
    Class(ClassInfo),
}

#[derive(Debug, Default)]
struct Tables {
    types: HashMap<u32, TypeDefProps>,
    functions: HashMap<HostFunctionId, SimFunction>,
    threads: HashMap<HostThreadId, OsThreadId>,
    objects: HashMap<u64, SimObject>,
}

/// [`HostRuntime`] backed by in-memory tables.
pub struct SimulatedHost {
    version: u32,
    tables: RwLock<Tables>,
    event_mask: AtomicU32,
    call_hooks_installed: AtomicBool,
    next_id: AtomicU64,
}

impl SimulatedHost {
    /// A host reporting interface revision `version`.
    #[must_use]
    pub fn new(version: u32) -> Self {
        Self {
            version,
            tables: RwLock::new(Tables::default()),
            event_mask: AtomicU32::new(0),
            call_hooks_installed: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Defines a type and returns its type definition token.
    pub fn define_type(&self, name: &str, enclosing_class: Option<u32>) -> u32 {
        let token = 0x0200_0000 | u32::try_from(self.next_id() & 0x00ff_ffff).unwrap_or(0);
        let props = TypeDefProps { name: name.to_string(), enclosing_class };
        self.write().types.insert(token, props);
        token
    }

    /// Defines a compiled function with one code range. `class_token` 0 makes it global.
    pub fn define_function(&self, name: &str, class_token: u32) -> HostFunctionId {
        let id = self.next_id();
        let function = HostFunctionId(0x1000 + id * 0x10);
        let code = CodeRange { start: CODE_BASE + id * u64::from(CODE_SIZE), size: CODE_SIZE };
        self.write().functions.insert(function, SimFunction { name: name.to_string(), class_token, code });
        function
    }

    pub fn define_app_domain(&self, name: &str, process_id: u64) -> HostObjectId {
        self.define_object(SimObject::AppDomain(AppDomainInfo { name: name.to_string(), process_id }))
    }

    pub fn define_assembly(&self, name: &str, app_domain: HostObjectId, module: HostObjectId) -> HostObjectId {
        self.define_object(SimObject::Assembly(AssemblyInfo {
            name: name.to_string(),
            app_domain_id: app_domain.0,
            module_id: module.0,
        }))
    }

    pub fn define_module(&self, name: &str, base_address: u64, assembly: HostObjectId) -> HostObjectId {
        self.define_object(SimObject::Module(ModuleInfo { name: name.to_string(), base_address, assembly_id: assembly.0 }))
    }

    pub fn define_class(&self, module: HostObjectId, type_def_token: u32) -> HostObjectId {
        self.define_object(SimObject::Class(ClassInfo { module_id: module.0, type_def_token }))
    }

    fn define_object(&self, object: SimObject) -> HostObjectId {
        let id = 0x5000_0000 + self.next_id() * 0x10;
        self.write().objects.insert(id, object);
        HostObjectId(id)
    }

    fn object(&self, id: HostObjectId) -> Result<SimObject, HostError> {
        self.read().objects.get(&id.0).cloned().ok_or(HostError::Failed { code: E_INVALIDARG })
    }

    /// Creates a logical thread without running it anywhere.
    pub fn create_thread(&self) -> HostThreadId {
        let thread = HostThreadId(0x0010_0000 + self.next_id() * 0x100);
        self.write().threads.insert(thread, OsThreadId::default());
        thread
    }

    /// Runs `thread` on the calling native thread.
    pub fn set_current_thread(&self, thread: HostThreadId) {
        // SAFETY: gettid has no preconditions.
        #[allow(unsafe_code)]
        let tid = unsafe { libc::gettid() };
        let os_thread = OsThreadId(u32::try_from(tid).unwrap_or(0));
        self.write().threads.insert(thread, os_thread);
        CURRENT_THREAD.with(|current| current.set(thread.0));
    }

    /// Creates a logical thread and runs it on the calling native thread.
    pub fn enter_thread(&self) -> HostThreadId {
        let thread = self.create_thread();
        self.set_current_thread(thread);
        thread
    }

    /// Detaches the calling native thread from its logical thread.
    pub fn leave_thread(&self) {
        let thread = CURRENT_THREAD.with(|current| current.replace(0));
        if let Some(os_thread) = self.write().threads.get_mut(&HostThreadId(thread)) {
            *os_thread = OsThreadId::default();
        }
    }

    /// Mask last set by the profiler.
    pub fn current_event_mask(&self) -> u32 {
        self.event_mask.load(Ordering::Relaxed)
    }

    pub fn call_hooks_installed(&self) -> bool {
        self.call_hooks_installed.load(Ordering::Relaxed)
    }

    fn function(&self, function: HostFunctionId) -> Result<SimFunction, HostError> {
        self.read().functions.get(&function).cloned().ok_or(HostError::Failed { code: E_INVALIDARG })
    }
}

impl HostRuntime for SimulatedHost {
    fn interface_version(&self) -> u32 {
        self.version
    }

    fn current_thread_id(&self) -> Result<HostThreadId, HostError> {
        match CURRENT_THREAD.with(Cell::get) {
            0 => Err(HostError::Failed { code: E_INVALIDARG }),
            thread => Ok(HostThreadId(thread)),
        }
    }

    fn os_thread_id(&self, thread: HostThreadId) -> Result<OsThreadId, HostError> {
        match self.read().threads.get(&thread) {
            Some(os_thread) if os_thread.is_attached() => Ok(*os_thread),
            Some(_) => Err(HostError::UnsupportedCallSequence),
            None => Err(HostError::Failed { code: E_INVALIDARG }),
        }
    }

    fn event_mask(&self) -> Result<u32, HostError> {
        Ok(self.event_mask.load(Ordering::Relaxed))
    }

    fn set_event_mask(&self, mask: u32) -> Result<(), HostError> {
        self.event_mask.store(mask, Ordering::Relaxed);
        Ok(())
    }

    fn install_call_hooks(&self) -> Result<(), HostError> {
        if self.version < 3 {
            return Err(HostError::NotAvailable("enter/leave hooks"));
        }
        self.call_hooks_installed.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn function_identity(&self, function: HostFunctionId) -> Result<FunctionIdentity, HostError> {
        let sim = self.function(function)?;
        Ok(FunctionIdentity { class_id: u64::from(sim.class_token) << 4, module_id: 0x4000, token: 0x0600_0000 | (sim.code.start >> 11) as u32 })
    }

    fn function_code_ranges(&self, function: HostFunctionId) -> Result<Vec<CodeRange>, HostError> {
        if self.version < 2 {
            return Err(HostError::NotAvailable("multi-range code info"));
        }
        Ok(vec![self.function(function)?.code])
    }

    fn function_code_range(&self, function: HostFunctionId) -> Result<CodeRange, HostError> {
        Ok(self.function(function)?.code)
    }

    fn il_to_native_map(&self, function: HostFunctionId) -> Result<Vec<IlToNativeMapping>, HostError> {
        let code = self.function(function)?.code;
        let half = code.size / 2;
        Ok(vec![
            IlToNativeMapping { il_offset: 0, native_start: 0, native_end: half },
            IlToNativeMapping { il_offset: 0x10, native_start: half, native_end: code.size },
        ])
    }

    fn method_props(&self, function: HostFunctionId) -> Result<MethodProps, HostError> {
        let sim = self.function(function)?;
        Ok(MethodProps { name: sim.name, class_token: sim.class_token })
    }

    fn type_def_props(&self, _function: HostFunctionId, token: u32) -> Result<TypeDefProps, HostError> {
        self.read().types.get(&token).cloned().ok_or(HostError::Failed { code: E_INVALIDARG })
    }

    fn app_domain_info(&self, app_domain: HostObjectId) -> Result<AppDomainInfo, HostError> {
        match self.object(app_domain)? {
            SimObject::AppDomain(info) => Ok(info),
            _ => Err(HostError::Failed { code: E_INVALIDARG }),
        }
    }

    fn assembly_info(&self, assembly: HostObjectId) -> Result<AssemblyInfo, HostError> {
        match self.object(assembly)? {
            SimObject::Assembly(info) => Ok(info),
            _ => Err(HostError::Failed { code: E_INVALIDARG }),
        }
    }

    fn module_info(&self, module: HostObjectId) -> Result<ModuleInfo, HostError> {
        match self.object(module)? {
            SimObject::Module(info) => Ok(info),
            _ => Err(HostError::Failed { code: E_INVALIDARG }),
        }
    }

    fn class_info(&self, class: HostObjectId) -> Result<ClassInfo, HostError> {
        match self.object(class)? {
            SimObject::Class(info) => Ok(info),
            _ => Err(HostError::Failed { code: E_INVALIDARG }),
        }
    }
}

// =============================================================================
// WORKLOAD
// =============================================================================

const CLASS_NAMES: &[(&str, Option<usize>)] = &[
    ("Program", None),
    ("List`1", None),
    ("Dictionary`2", None),
    ("Entry", Some(2)),
    ("JsonParser", None),
];

const METHOD_NAMES: &[&str] =
    &["Main", "Run", "Add", "TryGetValue", "Resize", "Parse", "ReadToken", "Compute", "Hash", "Flush"];

/// Shape of a synthetic multi-threaded program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Workload {
    pub threads: usize,
    /// Maximum call depth per thread.
    pub depth: usize,
    /// Distinct functions to call.
    pub functions: usize,
}

impl Default for Workload {
    fn default() -> Self {
        Self { threads: 4, depth: 12, functions: 16 }
    }
}

/// Metadata a workload registered with the host.
#[derive(Debug, Clone)]
pub struct InstalledWorkload {
    pub functions: Vec<HostFunctionId>,
}

/// Totals reported after a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkloadStats {
    pub threads: usize,
    pub calls: u64,
    pub transitions: u64,
}

/// Small deterministic generator; the workload only needs variety.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self.0.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1_442_695_040_888_963_407);
        self.0 >> 33
    }

    fn below(&mut self, bound: usize) -> usize {
        usize::try_from(self.next()).unwrap_or(0) % bound.max(1)
    }
}

impl Workload {
    /// Defines the workload's types and functions and reports the load events.
    pub fn install(&self, host: &SimulatedHost, profiler: &Profiler) -> InstalledWorkload {
        let app_domain = host.define_app_domain("DefaultDomain", u64::from(std::process::id()));
        profiler.app_domain_creation_finished(app_domain, 0);

        let placeholder = HostObjectId(0);
        let module = host.define_module("Workload.dll", CODE_BASE, placeholder);
        let assembly = host.define_assembly("Workload", app_domain, module);
        profiler.assembly_load_finished(assembly, 0);
        profiler.module_load_finished(module, 0);
        profiler.module_attached_to_assembly(module, assembly);

        let mut tokens: Vec<u32> = Vec::with_capacity(CLASS_NAMES.len());
        for (name, enclosing) in CLASS_NAMES {
            let token = host.define_type(name, enclosing.and_then(|index| tokens.get(index).copied()));
            tokens.push(token);
            profiler.class_load_finished(host.define_class(module, token), 0);
        }

        let functions = (0..self.functions.max(1))
            .map(|index| {
                let class = tokens[index % tokens.len()];
                host.define_function(METHOD_NAMES[index % METHOD_NAMES.len()], class)
            })
            .collect();
        debug!("Workload installed ({} functions)", self.functions);
        InstalledWorkload { functions }
    }

    /// Runs the workload until `stop` is set, one OS thread per logical thread.
    pub fn run(&self, installed: &InstalledWorkload, host: &SimulatedHost, profiler: &Profiler, stop: &AtomicBool) -> WorkloadStats {
        let shared = SharedHandles::default();
        let totals: Vec<WorkloadStats> = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..self.threads.max(1))
                .map(|index| {
                    let shared = &shared;
                    std::thread::Builder::new()
                        .name(format!("workload-{index}"))
                        .spawn_scoped(scope, move || self.run_thread(index, installed, host, profiler, shared, stop))
                })
                .collect();
            workers
                .into_iter()
                .filter_map(|worker| match worker {
                    Ok(handle) => handle.join().ok(),
                    Err(err) => {
                        warn!("Failed to start workload thread: {err}");
                        None
                    }
                })
                .collect()
        });

        totals.into_iter().fold(WorkloadStats::default(), |acc, stats| WorkloadStats {
            threads: acc.threads + stats.threads,
            calls: acc.calls + stats.calls,
            transitions: acc.transitions + stats.transitions,
        })
    }

    /// Runs the workload for `duration`.
    pub fn run_for(&self, installed: &InstalledWorkload, host: &SimulatedHost, profiler: &Profiler, duration: Duration) -> WorkloadStats {
        let stop = AtomicBool::new(false);
        std::thread::scope(|scope| {
            scope.spawn(|| {
                let deadline = Instant::now() + duration;
                while Instant::now() < deadline && !stop.load(Ordering::Relaxed) {
                    std::thread::sleep(Duration::from_millis(5).min(duration));
                }
                stop.store(true, Ordering::Relaxed);
            });
            self.run(installed, host, profiler, &stop)
        })
    }

    fn run_thread(
        &self,
        index: usize,
        installed: &InstalledWorkload,
        host: &SimulatedHost,
        profiler: &Profiler,
        shared: &SharedHandles,
        stop: &AtomicBool,
    ) -> WorkloadStats {
        let thread = host.create_thread();
        profiler.thread_created(thread);
        host.set_current_thread(thread);
        if let Ok(os_thread) = host.os_thread_id(thread) {
            profiler.thread_assigned_to_os_thread(thread, os_thread);
        }

        let mut rng = Lcg(0x9e37_79b9_7f4a_7c15 ^ (index as u64 + 1));
        let mut stack: Vec<(HostFunctionId, FunctionHandle)> = Vec::with_capacity(self.depth);
        let mut stats = WorkloadStats { threads: 1, ..WorkloadStats::default() };

        while !stop.load(Ordering::Relaxed) {
            let roll = rng.below(100);
            if stack.len() < self.depth.max(1) && (stack.is_empty() || roll < 55) {
                let function = installed.functions[rng.below(installed.functions.len())];
                let Some(handle) = shared.handle(function, profiler) else {
                    continue;
                };
                let caller_ip = stack.last().map_or(0, |_| CODE_BASE + rng.below(0x10_0000) as u64);
                profiler.enter(handle, caller_ip);
                stack.push((function, handle));
                stats.calls += 1;
            } else if roll < 60 {
                if let Some(&(function, _)) = stack.last() {
                    profiler.managed_to_unmanaged_transition(function, TransitionReason::Call);
                    spin(rng.below(2_000));
                    profiler.unmanaged_to_managed_transition(function, TransitionReason::Return);
                    stats.transitions += 1;
                }
            } else if let Some((_, handle)) = stack.pop() {
                profiler.leave(handle);
            }
            spin(rng.below(500));
        }

        while let Some((_, handle)) = stack.pop() {
            profiler.leave(handle);
        }
        host.leave_thread();
        profiler.thread_destroyed(thread);
        stats
    }
}

fn spin(iterations: usize) {
    for _ in 0..iterations {
        std::hint::spin_loop();
    }
}

/// Handles shared by all workload threads; a function is compiled and mapped once.
#[derive(Default)]
struct SharedHandles {
    handles: Mutex<HashMap<HostFunctionId, FunctionHandle>>,
}

impl SharedHandles {
    fn handle(&self, function: HostFunctionId, profiler: &Profiler) -> Option<FunctionHandle> {
        let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = handles.get(&function) {
            return Some(*handle);
        }
        // The JIT runs on the first calling thread, as in a real runtime.
        profiler.jit_compilation_started(function);
        profiler.jit_compilation_finished(function, 0);
        let handle = profiler.function_id_map(function)?;
        handles.insert(function, handle);
        Some(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_binding() {
        let host = SimulatedHost::new(3);
        assert!(host.current_thread_id().is_err());
        let thread = host.create_thread();
        assert_eq!(host.os_thread_id(thread), Err(HostError::UnsupportedCallSequence));
        host.set_current_thread(thread);
        assert_eq!(host.current_thread_id(), Ok(thread));
        assert!(host.os_thread_id(thread).unwrap().is_attached());
        host.leave_thread();
        assert!(host.current_thread_id().is_err());
    }

    #[test]
    fn test_function_metadata() {
        let host = SimulatedHost::new(1);
        let class = host.define_type("Program", None);
        let main = host.define_function("Main", class);
        assert_eq!(host.method_props(main).unwrap(), MethodProps { name: "Main".to_string(), class_token: class });
        assert!(host.function_code_ranges(main).is_err());
        assert_eq!(host.function_code_range(main).unwrap().size, CODE_SIZE);
        assert_eq!(host.il_to_native_map(main).unwrap().len(), 2);
        assert!(host.method_props(HostFunctionId(1)).is_err());
    }

    #[test]
    fn test_object_kinds_are_checked() {
        let host = SimulatedHost::new(3);
        let app_domain = host.define_app_domain("Domain", 7);
        assert_eq!(host.app_domain_info(app_domain).unwrap().process_id, 7);
        assert!(host.module_info(app_domain).is_err());
    }

    #[test]
    fn test_call_hooks_need_version_three() {
        assert!(SimulatedHost::new(2).install_call_hooks().is_err());
        let host = SimulatedHost::new(3);
        host.install_call_hooks().unwrap();
        assert!(host.call_hooks_installed());
    }

    #[test]
    fn test_lcg_stays_in_bounds() {
        let mut rng = Lcg(1);
        assert!((0..1000).all(|_| rng.below(7) < 7));
    }
}
