//! Trace log sink
//!
//! Records are written one per line in the format defined by
//! [`exectrace_common::TraceRecord`]'s `Display`. Writers from different
//! threads (host callbacks, the log thread) share one sink; each record is
//! written under the sink's lock so lines never interleave.

use crate::config::{TraceLogConfig, TraceLogOutput};
use crate::domain::TraceLogError;
use exectrace_common::TraceRecord;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::sync::{Arc, Mutex, PoisonError};

/// Destination for trace records.
pub trait TraceLog: Send + Sync {
    fn dump(&self, record: &TraceRecord) -> Result<(), TraceLogError>;

    fn flush(&self) -> Result<(), TraceLogError>;
}

/// [`TraceLog`] over any byte stream.
pub struct StreamTraceLog<W> {
    stream: Mutex<W>,
}

impl<W: Write + Send> StreamTraceLog<W> {
    pub fn new(stream: W) -> Self {
        Self { stream: Mutex::new(stream) }
    }
}

impl StreamTraceLog<Vec<u8>> {
    /// Sink that keeps everything in memory.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(Vec::new())
    }

    /// Everything written so far.
    pub fn contents(&self) -> String {
        let buffer = self.stream.lock().unwrap_or_else(PoisonError::into_inner);
        String::from_utf8_lossy(&buffer).into_owned()
    }

    /// Everything written so far, parsed back into records. Unparseable lines are skipped.
    pub fn records(&self) -> Vec<TraceRecord> {
        self.contents().lines().filter_map(|line| line.parse().ok()).collect()
    }
}

impl<W: Write + Send> TraceLog for StreamTraceLog<W> {
    fn dump(&self, record: &TraceRecord) -> Result<(), TraceLogError> {
        let mut stream = self.stream.lock().unwrap_or_else(PoisonError::into_inner);
        writeln!(stream, "{record}")?;
        Ok(())
    }

    fn flush(&self) -> Result<(), TraceLogError> {
        let mut stream = self.stream.lock().unwrap_or_else(PoisonError::into_inner);
        stream.flush()?;
        Ok(())
    }
}

/// Opens the sink selected by `config`.
pub fn open_trace_log(config: &TraceLogConfig) -> Result<Arc<dyn TraceLog>, TraceLogError> {
    let log: Arc<dyn TraceLog> = match &config.output {
        TraceLogOutput::Stdout => Arc::new(StreamTraceLog::new(io::stdout())),
        TraceLogOutput::Stderr => Arc::new(StreamTraceLog::new(io::stderr())),
        TraceLogOutput::File(path) => {
            let file = File::create(path).map_err(|source| TraceLogError::Open { path: path.clone(), source })?;
            Arc::new(StreamTraceLog::new(BufWriter::new(file)))
        }
    };
    Ok(log)
}

#[cfg(test)]
mod tests {
    use super::*;
    use exectrace_common::InternalId;

    #[test]
    fn test_in_memory_sink_writes_lines() {
        let log = StreamTraceLog::in_memory();
        log.dump(&TraceRecord::ThreadDestroyed { thread: InternalId(2) }).unwrap();
        log.dump(&TraceRecord::ThreadAssignedToOsThread { thread: InternalId(2), os_thread_id: 99 }).unwrap();
        log.flush().unwrap();
        assert_eq!(log.contents(), "thr dst 0x00000002\nthr aos 0x00000002 99\n");
        assert_eq!(log.records().len(), 2);
    }

    #[test]
    fn test_file_sink() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.log");
        let config = TraceLogConfig { output: TraceLogOutput::File(path.clone()) };
        let log = open_trace_log(&config).unwrap();
        log.dump(&TraceRecord::ThreadDestroyed { thread: InternalId(5) }).unwrap();
        log.flush().unwrap();
        assert_eq!(std::fs::read_to_string(path).unwrap(), "thr dst 0x00000005\n");
    }

    #[test]
    fn test_unwritable_path_reports_open_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("trace.log");
        let config = TraceLogConfig { output: TraceLogOutput::File(path) };
        assert!(matches!(open_trace_log(&config), Err(TraceLogError::Open { .. })));
    }
}
