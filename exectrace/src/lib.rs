//! # exectrace - In-Process Execution-Trace Profiler Engine
//!
//! exectrace records per-thread call stacks of a managed runtime with low
//! overhead. The runtime (the *host*) reports calls, returns, JIT activity and
//! thread lifecycle; the engine turns these into diff-encoded stack samples
//! and writes them, together with function and load metadata, to a
//! line-oriented trace log.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      Host Runtime                               │
//! │        (enter/leave hooks, JIT, thread and load events)         │
//! └──────────────┬─────────────────────────────▲────────────────────┘
//!                │ callbacks                   │ metadata queries
//!                ▼                             │ (HostRuntime)
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                 Profiler (this crate)                           │
//! │                                                                 │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐         │
//! │  │ Common Trace │   │  Execution   │──▶│ Stack Channel│ per     │
//! │  │  (threads,   │   │    Trace     │   │ (ring buffer)│ thread  │
//! │  │ load events) │   │   (hooks)    │   └──────┬───────┘         │
//! │  └──────────────┘   └──────┬───────┘          │ samples         │
//! │                            │                  ▼                 │
//! │                   sampling thread     log thread ──▶ TraceLog   │
//! │                   (+ SIGRTMIN+3)                                │
//! └─────────────────────────────────────────────────────────────────┘
//!                                                  │ trace log
//!                                                  ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  Offline tooling: Replay ──▶ Hotspots / Chrome trace export     │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Structure
//!
//! ### Engine
//!
//! - [`profiler`]: the object a host talks to; single instance per process,
//!   every callback returns a [`profiler::HostStatus`]
//! - [`trace`]: execution trace, common trace, stack channels, signal plumbing
//! - [`info`]: per-thread and per-function records
//! - [`storage`]: ring buffer and id registries
//! - [`host`]: the [`host::HostRuntime`] boundary and capability negotiation
//! - [`tracelog`]: trace log sinks
//! - [`config`]: `PROF_*` environment configuration
//!
//! ### Tooling
//!
//! - [`simulate`]: an in-memory host and synthetic workloads
//! - [`analysis`]: trace log replay and hotspot aggregation
//! - [`export`]: Chrome Trace Event Format JSON
//! - [`cli`]: command-line arguments
//!
//! - [`domain`]: core domain types and errors
//!
//! ## Collection Methods
//!
//! ### 1. Instrumentation
//! - A sample after every stack change
//! - **Pros**: Exact call sequence
//! - **Cons**: Trace size grows with call rate
//!
//! ### 2. Sampling (default)
//! - A sampling thread starts a new generation every interval (10 ms by
//!   default); a thread samples itself at its next stack change
//! - With high granularity, the thread is also interrupted by a signal so
//!   long-running frames are sampled without a stack change
//!
//! ## Typical Usage
//!
//! ```bash
//! # Profile a synthetic workload
//! exectrace demo --threads 8 --high-granularity --output trace.log
//!
//! # Analyze it
//! exectrace replay trace.log --top 20 --export trace.json
//! ```
//!
//! ## Key Concepts
//!
//! - **Stack channel**: per-thread event log written by the thread itself and
//!   read by the log thread; consecutive changes between samples collapse
//! - **Stack diff**: each sample carries only the frames beyond the prefix it
//!   shares with the previous sample of the same thread
//! - **Internal id**: dense id of a thread or function record, stable after
//!   the host recycles its own id

pub mod analysis;
pub mod cli;
pub mod config;
pub mod domain;
pub mod export;
pub mod host;
pub mod info;
pub mod profiler;
pub mod simulate;
pub mod storage;
pub mod trace;
pub mod tracelog;
