//! Integration tests for forwarding a run's log events to a queue.

mod common;

use common::Chatty;
use rust_measure::log_capture::LogEntry;
use rust_measure::procedures::{ProcedureInstance, Status};
use rust_measure::results::Results;
use rust_measure::worker::{Worker, WorkerConfig};
use std::time::Duration;
use tempfile::tempdir;
use tokio::sync::mpsc;
use tracing::Level;

fn run_chatty(level: Level) -> Vec<LogEntry> {
    let dir = tempdir().unwrap();
    let procedure = ProcedureInstance::new(Chatty).unwrap();
    let results = Results::new(procedure, dir.path().join("chatty.csv")).unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let config = WorkerConfig {
        log_level: level,
        ..WorkerConfig::default()
    };
    let mut worker = Worker::new(results, config).unwrap().with_log_queue(tx);
    worker.start().unwrap();
    worker.join(Duration::from_secs(10)).unwrap();
    assert_eq!(worker.status(), Status::Finished);
    drop(worker);

    let mut entries = Vec::new();
    while let Ok(entry) = rx.try_recv() {
        entries.push(entry);
    }
    entries
}

#[test]
fn test_run_events_reach_the_queue_at_or_above_level() {
    let entries = run_chatty(Level::INFO);
    let messages: Vec<&str> = entries.iter().map(|e| e.message.as_str()).collect();

    assert!(messages.contains(&"aligned the stage step=1"), "{messages:?}");
    assert!(messages.contains(&"temperature drifting"));
    assert!(!messages.iter().any(|m| m.contains("raw reading")));
    assert!(entries.iter().all(|e| e.level <= Level::INFO));

    let warning = entries
        .iter()
        .find(|e| e.message == "temperature drifting")
        .unwrap();
    assert_eq!(warning.level, Level::WARN);
    assert!(warning.to_string().contains("temperature drifting"));
}

#[test]
fn test_debug_level_forwards_everything_in_order() {
    let entries = run_chatty(Level::DEBUG);
    let position = |needle: &str| {
        entries
            .iter()
            .position(|e| e.message.contains(needle))
            .unwrap_or_else(|| panic!("missing log entry '{needle}'"))
    };

    assert!(position("raw reading") < position("aligned the stage"));
    assert!(position("aligned the stage") < position("temperature drifting"));
}
