//! CLI argument definitions

use crate::config::{CollectionMethod, ProfilerConfig};
use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};
use exectrace_common::DEFAULT_SAMPLING_TIMEOUT_MS;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "exectrace",
    about = "Execution-trace profiler engine: run it against a simulated runtime or analyze its trace logs",
    after_help = "\
EXAMPLES:
    exectrace demo --threads 8 --output trace.log        Profile a synthetic workload
    exectrace demo --method instrumentation --line-trace
    exectrace replay trace.log --top 20                  Show hotspots of a recorded trace
    exectrace replay trace.log --export trace.json       Convert to Chrome trace format"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

#[derive(Subcommand)]
pub enum Command {
    /// Attach the profiler to a simulated runtime and run a synthetic workload
    Demo(DemoArgs),
    /// Reconstruct stacks from a trace log and report hotspots
    Replay(ReplayArgs),
}

/// Collection method as accepted on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum MethodArg {
    None,
    Instrumentation,
    Sampling,
}

impl From<MethodArg> for CollectionMethod {
    fn from(method: MethodArg) -> Self {
        match method {
            MethodArg::None => Self::None,
            MethodArg::Instrumentation => Self::Instrumentation,
            MethodArg::Sampling => Self::Sampling,
        }
    }
}

#[derive(ClapArgs)]
pub struct DemoArgs {
    /// Workload threads
    #[arg(long, default_value = "4")]
    pub threads: usize,

    /// Maximum call depth per thread
    #[arg(long, default_value = "12")]
    pub depth: usize,

    /// Distinct functions in the workload
    #[arg(long, default_value = "16")]
    pub functions: usize,

    /// Stop after N milliseconds (Ctrl+C stops earlier)
    #[arg(long, default_value = "1000")]
    pub duration_ms: u64,

    /// How call stacks are collected
    #[arg(long, value_enum, default_value = "sampling")]
    pub method: MethodArg,

    /// Sampling interval in milliseconds
    #[arg(long, default_value_t = DEFAULT_SAMPLING_TIMEOUT_MS)]
    pub interval: u64,

    /// Interrupt threads with a signal between stack changes
    #[arg(long)]
    pub high_granularity: bool,

    /// Record instruction pointers inside functions
    #[arg(long)]
    pub line_trace: bool,

    /// Trace log file (stdout if omitted)
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Host interface version reported by the simulated runtime
    #[arg(long, default_value = "7")]
    pub host_version: u32,
}

impl DemoArgs {
    /// Profiler configuration selected by these arguments.
    pub fn profiler_config(&self) -> ProfilerConfig {
        ProfilerConfig {
            execution_trace_enabled: true,
            collection_method: self.method.into(),
            sampling_timeout_ms: self.interval,
            high_granularity_enabled: self.high_granularity,
            line_trace_enabled: self.line_trace,
        }
    }
}

#[derive(ClapArgs)]
pub struct ReplayArgs {
    /// Trace log to analyze
    #[arg(value_name = "FILE")]
    pub trace: PathBuf,

    /// Number of hotspots to show
    #[arg(long, default_value = "10")]
    pub top: usize,

    /// Export reconstructed samples as Chrome trace JSON
    #[arg(long, value_name = "FILE")]
    pub export: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_args_are_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_demo_defaults() {
        let args = Args::parse_from(["exectrace", "demo"]);
        let Command::Demo(demo) = args.command else {
            panic!("expected demo");
        };
        let config = demo.profiler_config();
        assert!(config.execution_trace_enabled);
        assert_eq!(config.collection_method, CollectionMethod::Sampling);
        assert_eq!(config.sampling_timeout_ms, DEFAULT_SAMPLING_TIMEOUT_MS);
        assert!(!config.high_granularity_enabled);
        assert!(demo.output.is_none());
    }

    #[test]
    fn test_replay_args() {
        let args = Args::parse_from(["exectrace", "replay", "trace.log", "--top", "3", "--export", "out.json"]);
        let Command::Replay(replay) = args.command else {
            panic!("expected replay");
        };
        assert_eq!(replay.trace, PathBuf::from("trace.log"));
        assert_eq!(replay.top, 3);
        assert_eq!(replay.export, Some(PathBuf::from("out.json")));
    }

    #[test]
    fn test_method_parsing() {
        let args = Args::parse_from(["exectrace", "demo", "--method", "instrumentation", "--line-trace"]);
        let Command::Demo(demo) = args.command else {
            panic!("expected demo");
        };
        assert_eq!(demo.profiler_config().collection_method, CollectionMethod::Instrumentation);
        assert!(demo.line_trace);
    }
}
