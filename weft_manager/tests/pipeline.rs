//! Pipeline test over the command implementations: record a trace,
//! analyze it, rewrite the prediction, and aggregate statistics.

use std::fs;
use std::time::Duration;

use tempfile::tempdir;

use weft_core::trace::{write_trace_dir, ChannelOpKind, Event, EventKind, Position, Trace};
use weft_manager::commands;
use weft_manager::report::ResultDir;

fn send_on_closed_trace() -> Trace {
    let mut trace = Trace::new();
    trace
        .add(Event {
            routine: 1,
            t_pre: 2,
            t_post: 4,
            pos: Position::new("main.go", 10),
            kind: EventKind::Channel {
                id: 5,
                op: ChannelOpKind::Send,
                closed: false,
                op_id: 1,
                qsize: 1,
                qcount: 1,
            },
        })
        .unwrap();
    trace
        .add(Event {
            routine: 2,
            t_pre: 6,
            t_post: 6,
            pos: Position::new("main.go", 20),
            kind: EventKind::Channel {
                id: 5,
                op: ChannelOpKind::Close,
                closed: false,
                op_id: 0,
                qsize: 1,
                qcount: 1,
            },
        })
        .unwrap();
    trace
}

#[test]
fn record_analyze_rewrite_stats_pipeline() {
    let workspace = tempdir().unwrap();
    let trace_dir = workspace.path().join("trace");
    let results = workspace.path().join("results");
    write_trace_dir(&send_on_closed_trace(), &trace_dir).unwrap();

    // record: files a normalized copy
    commands::record::run(&trace_dir, &results).unwrap();
    assert!(results.join("traces").join("recorded").exists());

    // analyze: predicts the send on closed and writes reports
    let bugs = commands::analyze::run(
        &trace_dir,
        &results,
        &commands::analyze::AnalyzeOptions {
            scenarios: "",
            out_readable: true,
            out_machine: true,
        },
    )
    .unwrap();
    assert!(bugs >= 1);
    let result = ResultDir::new(&results);
    let bug_files: Vec<_> = fs::read_dir(result.bugs_dir())
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    assert!(bug_files.iter().any(|name| name.contains("P01")));
    assert!(bug_files.iter().any(|name| name == "bugs.json"));

    // rewrite: produces a rewritten trace directory with its sidecar
    commands::rewrite::run(&trace_dir, &results, "").unwrap();
    let rewritten: Vec<_> = fs::read_dir(result.traces_dir())
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|name| name.starts_with("rewritten_"))
        .collect();
    assert_eq!(rewritten.len(), 1);
    let rewrite_dir = result.traces_dir().join(&rewritten[0]);
    assert!(rewrite_dir.join("active.json").exists());

    // replaying the rewritten trace reports the confirmation code
    let exit = commands::replay::run(
        &rewrite_dir,
        &commands::replay::ReplayOptions {
            timeout: Duration::from_secs(1),
            ignore_atomics: false,
        },
    )
    .unwrap();
    assert_eq!(exit.code(), 30);

    // stats: aggregates the reports into a CSV
    commands::stats::run(&results).unwrap();
    let csv = fs::read_to_string(result.stats_dir().join("bugs.csv")).unwrap();
    assert!(csv.contains("P01"));
}

#[test]
fn analyze_rejects_missing_trace_dir() {
    let workspace = tempdir().unwrap();
    let missing = workspace.path().join("nope");
    fs::create_dir_all(&missing).unwrap();
    let result = commands::analyze::run(
        &missing,
        &workspace.path().join("results"),
        &commands::analyze::AnalyzeOptions {
            scenarios: "",
            out_readable: false,
            out_machine: false,
        },
    );
    assert!(result.is_err());
}
