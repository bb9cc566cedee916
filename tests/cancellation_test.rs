//! Integration tests for cooperative stop requests and bounded joins.

mod common;

use common::{drain, statuses, Polling};
use rust_measure::procedures::{ProcedureInstance, Status};
use rust_measure::results::Results;
use rust_measure::worker::{Worker, WorkerConfig};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::tempdir;

fn polling_worker(path: &std::path::Path, shutdowns: &Arc<AtomicUsize>) -> Worker {
    let procedure = ProcedureInstance::new(Polling {
        shutdowns: Arc::clone(shutdowns),
    })
    .unwrap();
    let results = Results::new(procedure, path).unwrap();
    Worker::new(results, WorkerConfig::default()).unwrap()
}

#[test]
fn test_stop_aborts_and_runs_shutdown_once() {
    let dir = tempdir().unwrap();
    let shutdowns = Arc::new(AtomicUsize::new(0));
    let mut worker = polling_worker(&dir.path().join("polling.csv"), &shutdowns);
    let monitor = worker.monitor().unwrap();

    worker.start().unwrap();
    std::thread::sleep(Duration::from_millis(50));
    assert!(worker.is_running());
    assert!(!worker.should_stop());

    worker.stop();
    worker.stop();
    assert!(worker.should_stop());
    worker.join(Duration::from_secs(10)).unwrap();

    assert_eq!(worker.status(), Status::Aborted);
    assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
    assert_eq!(statuses(&drain(monitor)), vec![Status::Running, Status::Aborted]);

    let mut results = worker.into_results().unwrap();
    let rows = results.data().unwrap().column_f64("n").unwrap();
    assert!(!rows.is_empty());
    let expected: Vec<f64> = (0..rows.len()).map(|i| i as f64).collect();
    assert_eq!(rows, expected, "rows are written in emission order");
}

#[test]
fn test_try_join_is_bounded() {
    let dir = tempdir().unwrap();
    let shutdowns = Arc::new(AtomicUsize::new(0));
    let mut worker = polling_worker(&dir.path().join("polling.csv"), &shutdowns);
    worker.start().unwrap();

    let started = Instant::now();
    assert!(!worker.try_join(Duration::from_millis(30)).unwrap());
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(worker.status(), Status::Running);
    assert!(worker.results().is_none(), "results stay with the run thread");

    worker.stop();
    assert!(worker.try_join(Duration::from_secs(10)).unwrap());
    assert_eq!(worker.status(), Status::Aborted);
    assert!(worker.results().is_some());
}

#[test]
fn test_join_timeout_requests_stop() {
    let dir = tempdir().unwrap();
    let shutdowns = Arc::new(AtomicUsize::new(0));
    let mut worker = polling_worker(&dir.path().join("polling.csv"), &shutdowns);
    worker.start().unwrap();

    worker.join(Duration::from_millis(50)).unwrap();
    assert!(worker.should_stop());
    assert_eq!(worker.status(), Status::Aborted);
    assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
}

#[test]
fn test_dropping_a_running_worker_stops_it() {
    let dir = tempdir().unwrap();
    let shutdowns = Arc::new(AtomicUsize::new(0));
    let worker_status = {
        let mut worker = polling_worker(&dir.path().join("polling.csv"), &shutdowns);
        worker.start().unwrap();
        std::thread::sleep(Duration::from_millis(20));
        let status = worker.subscribe_status();
        status
    };

    assert_eq!(*worker_status.borrow(), Status::Aborted);
    assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
}
