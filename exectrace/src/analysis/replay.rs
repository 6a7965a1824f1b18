//! Trace log replay
//!
//! Rebuilds full per-thread call stacks from the diff-encoded `str sam`
//! records of a trace log.
//!
//! For every sample the thread's previous snapshot is cut back to the shared
//! prefix, the refined IP (if any) is applied to the last shared frame, and
//! the new frames are appended.

use crate::domain::ReplayError;
use exectrace_common::{Frame, InternalId, TraceRecord};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;

/// One sample with its full stack, bottom frame first.
#[derive(Debug, Clone)]
pub struct ReplayedSample {
    pub thread: InternalId,
    /// Milliseconds since attach.
    pub ticks: u32,
    /// Sampling generations folded into the sample (0 = unknown).
    pub count: u32,
    pub stack: Arc<Vec<Frame>>,
}

impl ReplayedSample {
    /// Weight of the sample in aggregates. Unknown counts weigh 1.
    #[must_use]
    pub fn weight(&self) -> u64 {
        u64::from(self.count.max(1))
    }
}

/// Everything recovered from one trace log.
#[derive(Debug, Default)]
pub struct Replay {
    /// Display names from `fun nam` records.
    pub functions: HashMap<InternalId, String>,
    /// Threads in order of first appearance.
    pub threads: Vec<InternalId>,
    pub samples: Vec<ReplayedSample>,
    /// Process id from the first app domain record, if any.
    pub process_id: Option<u64>,
    /// Lines read, blank lines excluded.
    pub records: usize,
}

impl Replay {
    pub fn from_path(path: &Path) -> Result<Self, ReplayError> {
        let file = File::open(path).map_err(|source| ReplayError::Open { path: path.to_path_buf(), source })?;
        Self::from_reader(BufReader::new(file))
    }

    pub fn from_reader(reader: impl BufRead) -> Result<Self, ReplayError> {
        let mut replay = Self::default();
        let mut snapshots: HashMap<InternalId, Vec<Frame>> = HashMap::new();

        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let number = index + 1;
            let record: TraceRecord = line.parse().map_err(|reason| ReplayError::Parse { line: number, reason })?;
            replay.records += 1;

            match record {
                TraceRecord::FunctionName { function, class_name, name } => {
                    let display = if class_name.is_empty() { name } else { format!("{class_name}::{name}") };
                    replay.functions.insert(function, display);
                }
                TraceRecord::ThreadCreated { thread, .. } => replay.note_thread(thread),
                TraceRecord::AppDomainCreated { process_id, .. } => {
                    replay.process_id.get_or_insert(process_id);
                }
                TraceRecord::StackSample { thread, sample, diff } => {
                    replay.note_thread(thread);
                    let stack = snapshots.entry(thread).or_default();
                    let prefix = diff.match_prefix as usize;
                    if prefix > stack.len() {
                        return Err(ReplayError::PrefixOutOfRange {
                            line: number,
                            prefix: diff.match_prefix,
                            depth: stack.len(),
                        });
                    }
                    stack.truncate(prefix);
                    if diff.ip != 0 {
                        if let Some(frame) = stack.last_mut() {
                            frame.ip = diff.ip;
                        }
                    }
                    stack.extend_from_slice(&diff.frames);

                    replay.samples.push(ReplayedSample {
                        thread,
                        ticks: sample.ticks,
                        count: sample.count,
                        stack: Arc::new(stack.clone()),
                    });
                }
                _ => {}
            }
        }
        Ok(replay)
    }

    fn note_thread(&mut self, thread: InternalId) {
        if !self.threads.contains(&thread) {
            self.threads.push(thread);
        }
    }

    /// Display name of `function`, or its id when it was never named.
    pub fn function_name(&self, function: InternalId) -> String {
        self.functions.get(&function).cloned().unwrap_or_else(|| format!("0x{:x}", function.0))
    }

    /// Samples of one thread, in log order.
    pub fn thread_samples(&self, thread: InternalId) -> impl Iterator<Item = &ReplayedSample> {
        self.samples.iter().filter(move |sample| sample.thread == thread)
    }

    /// Tick of the last sample.
    pub fn duration_ms(&self) -> u32 {
        self.samples.iter().map(|sample| sample.ticks).max().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const LOG: &str = "\
fun nam 0x00000000 \"UNMANAGED\"
fun nam 0x00000002 \"Program::Main\"
fun nam 0x00000003 \"List<T>::Add\"
thr crt 0x0000000000100100 0x00000000
str sam 0x00000000 5 1 0:1 0x2
str sam 0x00000000 15 ? 1:2 0x3:0000000000001234
str sam 0x00000000 25 2 1:2:0000000000000042 0x0
str sam 0x00000000 30 1 0:0
";

    #[test]
    fn test_replay_reconstructs_stacks() {
        let replay = Replay::from_reader(Cursor::new(LOG)).unwrap();
        assert_eq!(replay.records, 8);
        assert_eq!(replay.threads, vec![InternalId(0)]);
        let stacks: Vec<Vec<Frame>> = replay.samples.iter().map(|sample| sample.stack.as_ref().clone()).collect();
        assert_eq!(stacks[0], vec![Frame::new(InternalId(2), 0)]);
        assert_eq!(stacks[1], vec![Frame::new(InternalId(2), 0), Frame::new(InternalId(3), 0x1234)]);
        // The refined IP lands on the last shared frame.
        assert_eq!(stacks[2], vec![Frame::new(InternalId(2), 0x42), Frame::new(InternalId(0), 0)]);
        assert!(stacks[3].is_empty());
        assert_eq!(replay.duration_ms(), 30);
    }

    #[test]
    fn test_unknown_count_weighs_one() {
        let replay = Replay::from_reader(Cursor::new(LOG)).unwrap();
        let weights: Vec<u64> = replay.samples.iter().map(ReplayedSample::weight).collect();
        assert_eq!(weights, vec![1, 1, 2, 1]);
    }

    #[test]
    fn test_function_names_fall_back_to_ids() {
        let replay = Replay::from_reader(Cursor::new(LOG)).unwrap();
        assert_eq!(replay.function_name(InternalId(3)), "List<T>::Add");
        assert_eq!(replay.function_name(InternalId(9)), "0x9");
    }

    #[test]
    fn test_prefix_beyond_stack_is_rejected() {
        let log = "str sam 0x00000001 5 1 2:2 0x2\n";
        let err = Replay::from_reader(Cursor::new(log)).unwrap_err();
        assert!(matches!(err, ReplayError::PrefixOutOfRange { line: 1, prefix: 2, depth: 0 }));
    }

    #[test]
    fn test_parse_errors_carry_line_numbers() {
        let log = "thr dst 0x00000001\n\nbogus line\n";
        let err = Replay::from_reader(Cursor::new(log)).unwrap_err();
        assert!(matches!(err, ReplayError::Parse { line: 3, .. }));
    }
}
