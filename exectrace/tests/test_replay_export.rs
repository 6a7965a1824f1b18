use exectrace::analysis::{analyze_hotspots, Replay};
use exectrace::export::ChromeTraceExporter;
use exectrace_common::InternalId;
use std::path::PathBuf;
use std::process::Command;

fn fixture() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/sample.log")
}

#[test]
fn test_replay_of_recorded_log() {
    let replay = Replay::from_path(&fixture()).expect("Failed to replay fixture");

    assert_eq!(replay.records, 15);
    assert_eq!(replay.threads, vec![InternalId(0), InternalId(1)]);
    assert_eq!(replay.samples.len(), 7);
    assert_eq!(replay.process_id, Some(0x457));
    assert_eq!(replay.duration_ms(), 31);

    let depths: Vec<usize> = replay.thread_samples(InternalId(0)).map(|sample| sample.stack.len()).collect();
    assert_eq!(depths, vec![1, 3, 3, 0]);
}

#[test]
fn test_hotspots_of_recorded_log() {
    let replay = Replay::from_path(&fixture()).unwrap();
    let hotspots = analyze_hotspots(&replay);

    let names: Vec<&str> = hotspots.iter().map(|hotspot| hotspot.name.as_str()).collect();
    assert_eq!(names, vec!["JsonParser::ReadToken", "Program::Main", "JsonParser::Parse"]);
    assert_eq!(hotspots[0].self_weight, 4);
    assert_eq!(hotspots[1].total_weight, 9);
    assert!((hotspots[2].total_percentage - 600.0 / 9.0).abs() < 0.01);
    // Same functions, different refined IP
    assert_eq!(hotspots[0].call_stacks.len(), 2);
}

#[test]
fn test_export_creates_valid_json() {
    let replay = Replay::from_path(&fixture()).unwrap();
    let exporter = ChromeTraceExporter::from_replay(&replay);
    assert_eq!(exporter.event_count(), 10);

    let mut buffer = Vec::new();
    exporter.export(&mut buffer).expect("Failed to export trace");

    let json_str = String::from_utf8(buffer).expect("Invalid UTF-8");
    let parsed: serde_json::Value = serde_json::from_str(&json_str).expect("Invalid JSON");

    assert_eq!(parsed["displayTimeUnit"], "ms");
    let events = parsed["traceEvents"].as_array().unwrap();
    assert_eq!(events.len(), 12);
    assert!(events.iter().all(|event| event["pid"] == 0x457));
    let begins = events.iter().filter(|event| event["ph"] == "B").count();
    let ends = events.iter().filter(|event| event["ph"] == "E").count();
    assert_eq!(begins, ends);
}

#[test]
fn test_replay_command_exports_trace() {
    let dir = tempfile::tempdir().unwrap();
    let export = dir.path().join("trace.json");

    let output = Command::new(env!("CARGO_BIN_EXE_exectrace"))
        .arg("replay")
        .arg(fixture())
        .args(["--top", "2", "--export"])
        .arg(&export)
        .output()
        .expect("Failed to run exectrace");

    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("JsonParser::ReadToken"));
    assert!(!stdout.contains("JsonParser::Parse\n"));

    let parsed: serde_json::Value = serde_json::from_slice(&std::fs::read(&export).unwrap()).unwrap();
    assert!(parsed.get("traceEvents").is_some());
}

#[test]
fn test_replay_command_rejects_missing_file() {
    let output = Command::new(env!("CARGO_BIN_EXE_exectrace"))
        .args(["replay", "/nonexistent/trace.log"])
        .output()
        .expect("Failed to run exectrace");

    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("Failed to replay"));
}
