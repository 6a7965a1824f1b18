//! Attach, record and replay against the simulated runtime.
//!
//! A single test function: only one profiler may be attached per process.

use exectrace::analysis::{analyze_hotspots, Replay};
use exectrace::config::{CollectionMethod, ProfilerConfig, TraceLogConfig, TraceLogOutput};
use exectrace::domain::ProfilerError;
use exectrace::host::HostRuntime;
use exectrace::profiler::{HostStatus, Profiler};
use exectrace::simulate::{SimulatedHost, Workload};
use exectrace::tracelog::{open_trace_log, StreamTraceLog, TraceLog};
use exectrace_common::event_mask;
use std::sync::Arc;
use std::time::Duration;

fn instrumentation() -> ProfilerConfig {
    ProfilerConfig {
        execution_trace_enabled: true,
        collection_method: CollectionMethod::Instrumentation,
        high_granularity_enabled: false,
        ..ProfilerConfig::default()
    }
}

fn attach(host: &Arc<SimulatedHost>, config: ProfilerConfig, log: Arc<dyn TraceLog>) -> Result<Profiler, ProfilerError> {
    let runtime: Arc<dyn HostRuntime> = host.clone();
    Profiler::attach(runtime, config, log)
}

#[test]
fn test_profiler_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("trace.log");

    // Record a workload into a file
    let host = Arc::new(SimulatedHost::new(7));
    let log = open_trace_log(&TraceLogConfig { output: TraceLogOutput::File(path.clone()) }).unwrap();
    let profiler = attach(&host, instrumentation(), log).expect("Failed to attach");
    assert!(host.call_hooks_installed());
    assert_ne!(host.current_event_mask() & event_mask::CALL_STACK, 0);
    assert_eq!(profiler.execution_trace().collection_method(), CollectionMethod::Instrumentation);

    // A second engine is refused while the first is attached
    let second = attach(&Arc::new(SimulatedHost::new(7)), instrumentation(), Arc::new(StreamTraceLog::in_memory()));
    let err = second.err().expect("second attach must fail");
    assert!(matches!(err, ProfilerError::AlreadyActive));
    assert_eq!(HostStatus::from(&err), HostStatus::CancelActivation);

    let workload = Workload { threads: 3, depth: 8, functions: 10 };
    let installed = workload.install(&host, &profiler);
    let stats = workload.run_for(&installed, &host, &profiler, Duration::from_millis(200));
    assert_eq!(stats.threads, 3);
    assert!(stats.calls > 0);

    assert_eq!(profiler.shutdown(), HostStatus::Ok);
    assert_eq!(profiler.shutdown(), HostStatus::Ok);
    assert!(!profiler.execution_trace().is_enabled());
    drop(profiler);

    // The recorded log replays cleanly
    let replay = Replay::from_path(&path).expect("Failed to replay recorded trace");
    assert_eq!(replay.process_id, Some(u64::from(std::process::id())));
    assert_eq!(replay.threads.len(), 3);
    assert!(!replay.samples.is_empty());
    assert!(replay.functions.values().any(|name| name == "UNMANAGED"));
    assert!(replay.functions.len() > 2);
    assert!(replay.samples.iter().all(|sample| sample.stack.len() <= 8 + 1));
    assert!(!analyze_hotspots(&replay).is_empty());

    // The claim is released with the engine; an old host without call hooks
    // still attaches, without call stack collection.
    let old_host = Arc::new(SimulatedHost::new(2));
    let memory = Arc::new(StreamTraceLog::in_memory());
    let profiler = attach(&old_host, instrumentation(), memory.clone()).expect("Failed to re-attach");
    assert_eq!(profiler.execution_trace().collection_method(), CollectionMethod::None);
    assert!(!old_host.call_hooks_installed());
    assert_eq!(profiler.shutdown(), HostStatus::Ok);
    drop(profiler);

    // Version 0 is not a host interface at all
    let err = attach(&Arc::new(SimulatedHost::new(0)), instrumentation(), memory).err();
    assert!(matches!(err, Some(ProfilerError::UnsupportedInterface { version: 0 })));
}
