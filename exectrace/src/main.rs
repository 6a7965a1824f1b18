//! # exectrace - Main Entry Point
//!
//! Supports two commands:
//! - **demo**: attach the profiler to a simulated runtime and record a synthetic workload
//! - **replay**: reconstruct stacks from a trace log, report hotspots, optionally export

// Summary output converts counts to f64 for display
#![allow(clippy::cast_precision_loss)]

use anyhow::{Context, Result};
use clap::Parser;
use exectrace::analysis::{analyze_hotspots, Replay};
use exectrace::cli::{Args, Command, DemoArgs, ReplayArgs};
use exectrace::config::{TraceLogConfig, TraceLogOutput};
use exectrace::domain::ProfilerError;
use exectrace::export::ChromeTraceExporter;
use exectrace::host::HostRuntime;
use exectrace::profiler::Profiler;
use exectrace::simulate::{SimulatedHost, Workload};
use exectrace::tracelog::open_trace_log;
use log::info;
use std::fs::File;
use std::io::BufWriter;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_USAGE: i32 = 2;

fn main() {
    env_logger::init();
    std::process::exit(match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            let code = exit_code_for(&e);
            eprintln!("error: {e:#}");
            code
        }
    });
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    // An unsupported --host-version is a usage problem
    let unsupported = err
        .chain()
        .any(|cause| matches!(cause.downcast_ref::<ProfilerError>(), Some(ProfilerError::UnsupportedInterface { .. })));
    if unsupported {
        EXIT_USAGE
    } else {
        EXIT_ERROR
    }
}

#[tokio::main]
async fn run() -> Result<()> {
    let args = Args::parse();
    match args.command {
        Command::Demo(demo) => run_demo(demo, args.quiet).await,
        Command::Replay(replay) => run_replay(&replay, args.quiet),
    }
}

async fn run_demo(args: DemoArgs, quiet: bool) -> Result<()> {
    let log_config = match &args.output {
        Some(path) => TraceLogConfig { output: TraceLogOutput::File(path.clone()) },
        None => TraceLogConfig::default(),
    };
    let log = open_trace_log(&log_config).context("Failed to open trace log")?;

    let host = Arc::new(SimulatedHost::new(args.host_version));
    let host_runtime: Arc<dyn HostRuntime> = host.clone();
    let profiler = Arc::new(
        Profiler::attach(host_runtime, args.profiler_config(), log).context("Failed to attach profiler")?,
    );

    if !quiet {
        eprintln!("exectrace v{}", env!("CARGO_PKG_VERSION"));
        eprintln!(
            "method: {}, interval: {}ms, high granularity: {}",
            profiler.execution_trace().collection_method(),
            profiler.config().sampling_timeout_ms,
            profiler.execution_trace().high_granularity()
        );
        if let Some(path) = &args.output {
            eprintln!("output: {}", path.display());
        }
    }

    let workload = Workload { threads: args.threads, depth: args.depth, functions: args.functions };
    let installed = workload.install(&host, &profiler);
    let stop = Arc::new(AtomicBool::new(false));

    let started = Instant::now();
    let worker = {
        let (host, profiler, stop) = (Arc::clone(&host), Arc::clone(&profiler), Arc::clone(&stop));
        tokio::task::spawn_blocking(move || workload.run(&installed, &host, &profiler, &stop))
    };

    // Setup Ctrl+C handler
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let exit_reason = tokio::select! {
        () = tokio::time::sleep(Duration::from_millis(args.duration_ms)) => "duration limit reached",
        _ = &mut ctrl_c => "interrupted",
    };
    stop.store(true, Ordering::Relaxed);
    let stats = worker.await.context("Workload panicked")?;

    let status = profiler.shutdown();
    info!("Shutdown status: {status:?}");

    if !quiet {
        let elapsed = started.elapsed();
        eprintln!(
            "\n{exit_reason}: {:.1}s, {} threads, {} calls ({:.0}/s), {} transitions, {} functions",
            elapsed.as_secs_f64(),
            stats.threads,
            stats.calls,
            stats.calls as f64 / elapsed.as_secs_f64().max(f64::EPSILON),
            stats.transitions,
            profiler.execution_trace().function_record_count(),
        );
    }
    Ok(())
}

fn run_replay(args: &ReplayArgs, quiet: bool) -> Result<()> {
    let replay = Replay::from_path(&args.trace).with_context(|| format!("Failed to replay {}", args.trace.display()))?;
    let hotspots = analyze_hotspots(&replay);

    if !quiet {
        println!(
            "{} records, {} threads, {} samples over {}ms",
            replay.records,
            replay.threads.len(),
            replay.samples.len(),
            replay.duration_ms()
        );
    }

    println!("{:>7} {:>7}  FUNCTION", "SELF%", "TOTAL%");
    for hotspot in hotspots.iter().take(args.top) {
        println!("{:>7.1} {:>7.1}  {}", hotspot.self_percentage, hotspot.total_percentage, hotspot.name);
    }

    if let Some(export_path) = &args.export {
        let exporter = ChromeTraceExporter::from_replay(&replay);
        let file = File::create(export_path).context("Failed to create trace output file")?;
        exporter.export(BufWriter::new(file)).context("Failed to export trace")?;
        if !quiet {
            println!("saved: {} ({} events)", export_path.display(), exporter.event_count());
        }
    }
    Ok(())
}
