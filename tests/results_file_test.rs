//! Integration tests for the on-disk layout of a completed run and for
//! reopening it.

mod common;

use common::Counting;
use rust_measure::procedures::{ProcedureInstance, ProcedureRegistry, Status};
use rust_measure::results::{peek_procedure_type, DataReader, Results, ResultsFormat};
use rust_measure::worker::{Worker, WorkerConfig};
use std::io::Write;
use std::time::Duration;
use tempfile::tempdir;

fn registry() -> ProcedureRegistry {
    let mut registry = ProcedureRegistry::default();
    registry.register_type::<Counting>();
    registry
}

fn run_counting(path: &std::path::Path) -> Results {
    let procedure = ProcedureInstance::new(Counting).unwrap();
    let results = Results::builder(procedure, path)
        .comment("cryostat B")
        .build()
        .unwrap();
    let mut worker = Worker::new(results, WorkerConfig::default()).unwrap();
    worker.start().unwrap();
    worker.join(Duration::from_secs(10)).unwrap();
    assert_eq!(worker.status(), Status::Finished);
    worker.into_results().unwrap()
}

#[test]
fn test_metadata_block_precedes_labels_and_data() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("counting.csv");
    let results = run_counting(&path);

    assert_eq!(
        std::fs::read_to_string(&path).unwrap(),
        "#cryostat B\n\
         #Procedure: <Counting>\n\
         #Parameters:\n\
         #\tLoop Iterations: 3\n\
         #Metadata:\n\
         #\tSerial Number: SN-7\n\
         x,y (V)\n\
         0,0.0\n\
         1,1.0\n\
         2,2.0\n"
    );
    assert_eq!(results.header_count(), 6);
}

#[test]
fn test_completed_run_reloads_with_its_procedure() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("counting.csv");
    run_counting(&path);

    assert_eq!(peek_procedure_type(&path).unwrap().as_deref(), Some("Counting"));
    let mut loaded = Results::load(&path, &registry()).unwrap();
    let procedure = loaded.procedure();
    assert!(procedure.is_runnable());
    assert_eq!(procedure.status(), Status::Queued);
    assert_eq!(procedure.parameters().get_i64("iterations").unwrap(), 3);
    assert_eq!(
        procedure.metadata().get("serial").unwrap().value_string(),
        "SN-7"
    );
    assert_eq!(loaded.header_count(), 6);
    assert_eq!(loaded.data().unwrap().len(), 3);
}

#[test]
fn test_reader_tails_a_growing_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("counting.csv");
    run_counting(&path);

    let mut reader = DataReader::new(&path, ResultsFormat::Csv, b',', b'#');
    assert_eq!(reader.read().unwrap().len(), 3);

    // a partially written line is left for the next read
    let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
    write!(file, "3,3.0\n4,4").unwrap();
    file.flush().unwrap();
    assert_eq!(reader.read().unwrap().len(), 4);
    assert_eq!(reader.cached_rows(), 4);

    writeln!(file, ".0").unwrap();
    file.flush().unwrap();
    let table = reader.read().unwrap();
    assert_eq!(table.len(), 5);
    assert_eq!(table.column_f64("y (V)").unwrap()[4], 4.0);

    reader.reset();
    assert_eq!(reader.cached_rows(), 0);
    assert_eq!(reader.reload().unwrap().len(), 5);
}

#[test]
fn test_rerun_from_loaded_parameters_leaves_old_file_alone() {
    let dir = tempdir().unwrap();
    let old = dir.path().join("counting.csv");
    run_counting(&old);
    let before = std::fs::read_to_string(&old).unwrap();

    let registry = registry();
    let loaded = Results::load(&old, &registry).unwrap();
    assert!(loaded.procedure().metadata().all_evaluated());
    let mut procedure = registry.recreate(loaded.procedure()).unwrap();
    assert_eq!(procedure.parameters().get_i64("iterations").unwrap(), 3);
    procedure.set_parameters([("iterations", 4)]).unwrap();

    let fresh = dir.path().join("counting_2.csv");
    let results = Results::new(procedure, &fresh).unwrap();
    let mut worker = Worker::new(results, WorkerConfig::default()).unwrap();
    worker.start().unwrap();
    worker.join(Duration::from_secs(10)).unwrap();

    assert_eq!(worker.status(), Status::Finished);
    assert_eq!(std::fs::read_to_string(&old).unwrap(), before);
    let mut results = worker.into_results().unwrap();
    assert_eq!(results.data().unwrap().len(), 4);
}
