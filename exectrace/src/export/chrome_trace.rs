use crate::analysis::Replay;
use crate::domain::ExportError;
use exectrace_common::{Frame, InternalId};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::io::Write;

/// Chrome Trace Event format
/// Format reference: https://docs.google.com/document/d/1CvAClvFfyA5R-PhYUmn5OOQtYMH4h6I0nSsKchNAySU/preview
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChromeTraceEvent {
    /// Event name (function name)
    name: String,
    /// Category for filtering/coloring
    cat: String,
    /// Phase: "B" = begin, "E" = end, "M" = metadata
    ph: String,
    /// Timestamp in microseconds
    ts: f64,
    pid: u64,
    /// Internal thread id
    tid: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    args: Option<HashMap<String, JsonValue>>,
}

/// Chrome Trace Format container
#[derive(Debug, Serialize)]
struct ChromeTrace {
    #[serde(rename = "traceEvents")]
    trace_events: Vec<ChromeTraceEvent>,
    #[serde(rename = "displayTimeUnit")]
    display_time_unit: String,
}

/// Chrome trace exporter for timeline visualization
///
/// Each thread's consecutive samples become nested begin/end slices: when
/// the stack changes between two samples, frames above the common prefix
/// end and the new frames begin at the later sample's timestamp.
pub struct ChromeTraceExporter {
    events: Vec<ChromeTraceEvent>,
    pid: u64,
}

impl ChromeTraceExporter {
    #[must_use]
    pub fn from_replay(replay: &Replay) -> Self {
        let pid = replay.process_id.unwrap_or(0);
        let mut events = Vec::new();

        for &thread in &replay.threads {
            let mut open: Vec<Frame> = Vec::new();
            let mut last_ts = 0.0;

            for sample in replay.thread_samples(thread) {
                let ts = f64::from(sample.ticks) * 1000.0;
                let common = open
                    .iter()
                    .zip(sample.stack.iter())
                    .take_while(|(open, new)| open.function == new.function)
                    .count();

                while open.len() > common {
                    if let Some(frame) = open.pop() {
                        events.push(Self::slice(replay, "E", frame.function, ts, pid, thread, None));
                    }
                }
                for frame in &sample.stack[common..] {
                    let mut args = HashMap::new();
                    if frame.ip != 0 {
                        args.insert("ip".to_string(), serde_json::json!(format!("0x{:x}", frame.ip)));
                    }
                    args.insert("count".to_string(), serde_json::json!(sample.count));
                    events.push(Self::slice(replay, "B", frame.function, ts, pid, thread, Some(args)));
                    open.push(*frame);
                }
                last_ts = ts;
            }

            while let Some(frame) = open.pop() {
                events.push(Self::slice(replay, "E", frame.function, last_ts, pid, thread, None));
            }
        }

        Self { events, pid }
    }

    fn slice(
        replay: &Replay,
        phase: &str,
        function: InternalId,
        ts: f64,
        pid: u64,
        thread: InternalId,
        args: Option<HashMap<String, JsonValue>>,
    ) -> ChromeTraceEvent {
        ChromeTraceEvent {
            name: replay.function_name(function),
            cat: "execution".to_string(),
            ph: phase.to_string(),
            ts,
            pid,
            tid: thread.0,
            args,
        }
    }

    /// Number of begin/end events.
    #[must_use]
    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    /// Export the trace to any writer (file, stdout, buffer, etc.)
    pub fn export<W: Write>(&self, writer: W) -> Result<(), ExportError> {
        let mut all_events = self.events.clone();

        let mut threads: Vec<u32> = self.events.iter().map(|event| event.tid).collect();
        threads.sort_unstable();
        threads.dedup();

        // Generate thread name metadata events
        for tid in threads {
            let mut args = HashMap::new();
            args.insert("name".to_string(), serde_json::json!(format!("thread 0x{tid:x}")));
            all_events.push(ChromeTraceEvent {
                name: "thread_name".to_string(),
                cat: "__metadata".to_string(),
                ph: "M".to_string(),
                ts: 0.0,
                pid: self.pid,
                tid,
                args: Some(args),
            });
        }

        let trace = ChromeTrace { trace_events: all_events, display_time_unit: "ms".to_string() };
        serde_json::to_writer_pretty(writer, &trace)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const LOG: &str = "\
apd crf 0x0000000000000001 0x0000000000000457 0x00000000 \"DefaultDomain\"
fun nam 0x00000002 \"Program::Main\"
fun nam 0x00000003 \"Program::Run\"
thr crt 0x0000000000100100 0x00000000
str sam 0x00000000 1 1 0:1 0x2
str sam 0x00000000 2 1 1:2 0x3
str sam 0x00000000 4 1 1:1
";

    fn phases(exporter: &ChromeTraceExporter) -> Vec<(String, String, f64)> {
        exporter.events.iter().map(|event| (event.ph.clone(), event.name.clone(), event.ts)).collect()
    }

    #[test]
    fn test_samples_become_nested_slices() {
        let replay = Replay::from_reader(Cursor::new(LOG)).unwrap();
        let exporter = ChromeTraceExporter::from_replay(&replay);
        assert_eq!(
            phases(&exporter),
            vec![
                ("B".to_string(), "Program::Main".to_string(), 1000.0),
                ("B".to_string(), "Program::Run".to_string(), 2000.0),
                ("E".to_string(), "Program::Run".to_string(), 4000.0),
                ("E".to_string(), "Program::Main".to_string(), 4000.0),
            ]
        );
        assert_eq!(exporter.pid, 0x457);
    }

    #[test]
    fn test_export_writes_metadata() {
        let replay = Replay::from_reader(Cursor::new(LOG)).unwrap();
        let mut buffer = Vec::new();
        ChromeTraceExporter::from_replay(&replay).export(&mut buffer).unwrap();

        let parsed: serde_json::Value = serde_json::from_slice(&buffer).unwrap();
        let events = parsed["traceEvents"].as_array().unwrap();
        assert_eq!(events.len(), 5);
        assert_eq!(events[4]["ph"], "M");
        assert_eq!(parsed["displayTimeUnit"], "ms");
    }
}
