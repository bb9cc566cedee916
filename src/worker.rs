//! Worker: runs one procedure on a dedicated thread.
//!
//! # Run Sequence
//!
//! ```text
//! start()
//!   └─ thread "procedure-worker"
//!        ├─ recorder thread started
//!        ├─ status QUEUED → RUNNING, progress 0
//!        ├─ startup() → evaluate metadata → store metadata → execute()
//!        │     error      → FAILED (logged, sent to the monitor)
//!        │     panic      → FAILED
//!        │     cancelled  → decided below
//!        ├─ shutdown()                      (always, once startup was entered)
//!        ├─ recorder drained, files closed
//!        └─ still RUNNING: recorder fault → FAILED
//!                          stop requested → ABORTED
//!                          otherwise      → FINISHED, progress 100
//! ```
//!
//! The recorder is drained before the final status is published, so an observer
//! that sees a terminal status can read every row of the run from the file.
//!
//! Cancellation is cooperative: [`Worker::stop`] only sets the flag that
//! `RunContext::should_stop()` reports.

use crate::error::{AppResult, DaqError};
use crate::log_capture::{forwarding_dispatch, LogEntry};
use crate::procedures::panic_safety::{panic_message, PanicGuard, StopFlag};
use crate::procedures::{Emission, EmitSink, Status, StatusCell};
use crate::recorder::{sink_for, Recorder};
use crate::results::Results;
use crate::value::{Record, Value};
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, info_span, warn, Level};

/// Message on the monitor channel. The channel closes when the run is over.
#[derive(Debug, Clone, PartialEq)]
pub enum MonitorEvent {
    Status(Status),
    /// Percent complete
    Progress(f64),
    /// A failure inside the run; `details` carries the full error chain or panic text
    Error { message: String, details: String },
}

/// Worker options.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Default wait used by [`Worker::join_default`]
    pub join_timeout: Duration,
    /// Minimum level forwarded to an attached log queue
    pub log_level: Level,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            join_timeout: Duration::from_secs(5),
            log_level: Level::INFO,
        }
    }
}

/// What the run thread hands back.
struct RunOutcome {
    results: Results,
    shutdown_error: Option<String>,
}

/// Executes a procedure on its own thread and mediates its emissions.
pub struct Worker {
    results: Option<Results>,
    config: WorkerConfig,
    stop: StopFlag,
    status: StatusCell,
    monitor_tx: Option<mpsc::UnboundedSender<MonitorEvent>>,
    monitor_rx: Option<mpsc::UnboundedReceiver<MonitorEvent>>,
    log_queue: Option<mpsc::UnboundedSender<LogEntry>>,
    handle: Option<JoinHandle<RunOutcome>>,
    done: Option<std_mpsc::Receiver<()>>,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("status", &self.status.get())
            .field("stop_requested", &self.stop.is_requested())
            .field("started", &self.done.is_some())
            .finish()
    }
}

impl Worker {
    /// Fails fast when the procedure cannot run: an unknown-procedure placeholder,
    /// a procedure that already ran, or a required parameter that is not set.
    pub fn new(results: Results, config: WorkerConfig) -> AppResult<Self> {
        let procedure = results.procedure();
        if !procedure.is_runnable() {
            return Err(DaqError::UnknownProcedure(procedure.type_id().to_string()));
        }
        if procedure.status() != Status::Queued {
            return Err(DaqError::WorkerState(format!(
                "procedure is {}, expected {}",
                procedure.status(),
                Status::Queued
            )));
        }
        if let Some(missing) = procedure.parameters().missing().into_iter().next() {
            return Err(DaqError::ParameterNotSet(missing));
        }

        let (monitor_tx, monitor_rx) = mpsc::unbounded_channel();
        Ok(Self {
            status: procedure.status_cell().clone(),
            results: Some(results),
            config,
            stop: StopFlag::new(),
            monitor_tx: Some(monitor_tx),
            monitor_rx: Some(monitor_rx),
            log_queue: None,
            handle: None,
            done: None,
        })
    }

    /// Forwards every event of the run at or above `config.log_level` to `queue`.
    pub fn with_log_queue(mut self, queue: mpsc::UnboundedSender<LogEntry>) -> Self {
        self.log_queue = Some(queue);
        self
    }

    /// Takes the monitor receiver. Only the first call returns it.
    pub fn monitor(&mut self) -> Option<mpsc::UnboundedReceiver<MonitorEvent>> {
        self.monitor_rx.take()
    }

    pub fn status(&self) -> Status {
        self.status.get()
    }

    /// Receiver observing every status change.
    pub fn subscribe_status(&self) -> watch::Receiver<Status> {
        self.status.subscribe()
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Launches the run thread.
    pub fn start(&mut self) -> AppResult<()> {
        let results = self
            .results
            .take()
            .ok_or_else(|| DaqError::WorkerState("worker was already started".to_string()))?;
        let monitor = self
            .monitor_tx
            .take()
            .ok_or_else(|| DaqError::WorkerState("monitor channel already closed".to_string()))?;
        let stop = self.stop.clone();
        let dispatch = match &self.log_queue {
            Some(queue) => forwarding_dispatch(queue.clone(), self.config.log_level),
            None => tracing::dispatcher::get_default(Clone::clone),
        };
        let (done_tx, done_rx) = std_mpsc::channel::<()>();

        info!(procedure = %results.procedure().type_id(), run_id = %results.run_id(), "Starting worker");
        let handle = std::thread::Builder::new()
            .name("procedure-worker".to_string())
            .spawn(move || {
                // dropped when the thread ends, however it ends
                let _done = done_tx;
                tracing::dispatcher::with_default(&dispatch, || {
                    let span = info_span!(
                        "worker",
                        procedure = %results.procedure().type_id(),
                        run_id = %results.run_id()
                    );
                    let _entered = span.enter();
                    run(results, stop, monitor)
                })
            })?;

        self.handle = Some(handle);
        self.done = Some(done_rx);
        Ok(())
    }

    /// Requests a cooperative stop.
    pub fn stop(&self) {
        if self.stop.request("stop requested by controller") {
            info!("Worker stop requested");
        }
    }

    pub fn should_stop(&self) -> bool {
        self.stop.is_requested()
    }

    /// True while the run thread is alive.
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Waits up to `timeout` for the run to end, then requests a stop and waits
    /// for the thread unconditionally.
    ///
    /// Returns [`DaqError::ShutdownFailed`] if the procedure's own shutdown hook
    /// failed.
    pub fn join(&mut self, timeout: Duration) -> AppResult<()> {
        if !self.wait(timeout)? {
            warn!(timeout_ms = timeout.as_millis() as u64, "Worker still running, requesting stop");
            self.stop();
        }
        self.finish()
    }

    /// [`join`](Self::join) with the configured timeout.
    pub fn join_default(&mut self) -> AppResult<()> {
        self.join(self.config.join_timeout)
    }

    /// Waits at most `timeout`. Returns `Ok(false)` if the run is still going.
    pub fn try_join(&mut self, timeout: Duration) -> AppResult<bool> {
        if self.wait(timeout)? {
            self.finish()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn wait(&self, timeout: Duration) -> AppResult<bool> {
        if self.handle.is_none() {
            return if self.results.is_some() && self.done.is_some() {
                Ok(true)
            } else {
                Err(DaqError::WorkerState("worker was not started".to_string()))
            };
        }
        match self.done.as_ref().map(|done| done.recv_timeout(timeout)) {
            Some(Err(std_mpsc::RecvTimeoutError::Timeout)) => Ok(false),
            _ => Ok(true),
        }
    }

    fn finish(&mut self) -> AppResult<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        let outcome = handle
            .join()
            .map_err(|payload| DaqError::WorkerPanicked(panic_message(payload.as_ref())))?;
        self.results = Some(outcome.results);
        debug!(status = %self.status.get(), "Worker joined");
        match outcome.shutdown_error {
            Some(message) => Err(DaqError::ShutdownFailed(message)),
            None => Ok(()),
        }
    }

    /// Results, available before start and after join.
    pub fn results(&self) -> Option<&Results> {
        self.results.as_ref()
    }

    pub fn results_mut(&mut self) -> Option<&mut Results> {
        self.results.as_mut()
    }

    /// Gives back the results of a joined worker.
    pub fn into_results(mut self) -> AppResult<Results> {
        self.results
            .take()
            .ok_or_else(|| DaqError::WorkerState("worker has not been joined".to_string()))
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.stop();
            if let Err(e) = self.finish() {
                error!(error = %e, "Worker dropped while running");
            }
        }
    }
}

// =============================================================================
// Run thread
// =============================================================================

/// Emission routing for one run.
struct RunSink<'a> {
    recorder: &'a Recorder,
    stop: &'a StopFlag,
    monitor: &'a mpsc::UnboundedSender<MonitorEvent>,
}

impl EmitSink for RunSink<'_> {
    fn emit(&self, emission: Emission) -> AppResult<()> {
        match emission {
            Emission::Results(record) => self.recorder.send(record),
            Emission::BatchResults(batch) => {
                let records = fan_out(batch).inspect_err(|e| {
                    self.stop.request(e.to_string());
                })?;
                records
                    .into_iter()
                    .try_for_each(|record| self.recorder.send(record))
            }
            Emission::Progress(percent) => {
                // a closed monitor only means nobody is watching
                let _ = self.monitor.send(MonitorEvent::Progress(percent));
                Ok(())
            }
        }
    }

    fn should_stop(&self) -> bool {
        self.stop.is_requested()
    }
}

/// Splits equal-length columns into one record per index.
pub fn fan_out(batch: BTreeMap<String, Vec<Value>>) -> AppResult<Vec<Record>> {
    let lengths: Vec<(&String, usize)> = batch.iter().map(|(k, v)| (k, v.len())).collect();
    let rows = lengths.first().map_or(0, |(_, n)| *n);
    if lengths.iter().any(|(_, n)| *n != rows) {
        let detail: Vec<String> = lengths.iter().map(|(k, n)| format!("{k}={n}")).collect();
        return Err(DaqError::BatchLengthMismatch(detail.join(", ")));
    }
    let mut records = vec![Record::new(); rows];
    for (column, values) in batch {
        for (record, value) in records.iter_mut().zip(values) {
            record.insert(column.clone(), value);
        }
    }
    Ok(records)
}

fn publish(status: &StatusCell, monitor: &mpsc::UnboundedSender<MonitorEvent>, next: Status) {
    if status.transition(next) {
        let _ = monitor.send(MonitorEvent::Status(next));
    }
}

fn report(monitor: &mpsc::UnboundedSender<MonitorEvent>, message: &str, details: String) {
    let _ = monitor.send(MonitorEvent::Error {
        message: message.to_string(),
        details,
    });
}

fn run_hooks(results: &mut Results, sink: &dyn EmitSink) -> anyhow::Result<()> {
    results
        .procedure_mut()
        .run_hook(sink, |procedure, ctx| procedure.startup(ctx))?;
    results.procedure_mut().evaluate_metadata()?;
    results.store_metadata()?;
    results
        .procedure_mut()
        .run_hook(sink, |procedure, ctx| procedure.execute(ctx))
}

fn run(
    mut results: Results,
    stop: StopFlag,
    monitor: mpsc::UnboundedSender<MonitorEvent>,
) -> RunOutcome {
    let status = results.procedure().status_cell().clone();
    let _status_guard = {
        let status = status.clone();
        let monitor = monitor.clone();
        // no-op unless the thread unwinds past the handlers below
        PanicGuard::named("worker-status", move || publish(&status, &monitor, Status::Failed))
    };

    let fault: Arc<Mutex<Option<String>>> = Arc::default();
    let on_error = {
        let fault = Arc::clone(&fault);
        let stop = stop.clone();
        let monitor = monitor.clone();
        move |e: &DaqError| {
            let mut slot = fault.lock().unwrap_or_else(|e| e.into_inner());
            slot.get_or_insert_with(|| e.to_string());
            stop.request(format!("recorder failed: {e}"));
            report(&monitor, "Failed to record results", e.to_string());
        }
    };
    let mut recorder = match Recorder::start(sink_for(&results), on_error) {
        Ok(recorder) => recorder,
        Err(e) => {
            error!(error = %e, "Could not start the recorder");
            publish(&status, &monitor, Status::Running);
            publish(&status, &monitor, Status::Failed);
            report(&monitor, "Could not start the recorder", e.to_string());
            return RunOutcome {
                results,
                shutdown_error: None,
            };
        }
    };

    publish(&status, &monitor, Status::Running);
    let _ = monitor.send(MonitorEvent::Progress(0.0));

    let sink = RunSink {
        recorder: &recorder,
        stop: &stop,
        monitor: &monitor,
    };
    let mut cancelled = false;
    match catch_unwind(AssertUnwindSafe(|| run_hooks(&mut results, &sink))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) if DaqError::is_cancellation(&e) => {
            info!("Procedure observed the stop request");
            cancelled = true;
        }
        Ok(Err(e)) => {
            error!(error = ?e, "Procedure failed");
            publish(&status, &monitor, Status::Failed);
            report(&monitor, &e.to_string(), format!("{e:?}"));
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!(panic = %message, "Procedure panicked");
            publish(&status, &monitor, Status::Failed);
            report(&monitor, "Procedure panicked", message);
        }
    }

    let shutdown_error = match catch_unwind(AssertUnwindSafe(|| {
        results
            .procedure_mut()
            .run_hook(&sink, |procedure, ctx| procedure.shutdown(ctx))
    })) {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(format!("{e:#}")),
        Err(payload) => Some(panic_message(payload.as_ref())),
    };
    if let Some(message) = &shutdown_error {
        error!(error = %message, "Procedure shutdown failed");
        publish(&status, &monitor, Status::Failed);
        report(&monitor, "Procedure shutdown failed", message.clone());
    }

    match recorder.stop() {
        Ok(stats) => debug!(written = stats.written, discarded = stats.discarded, "Recorder drained"),
        Err(e) => {
            error!(error = %e, "Recorder did not stop cleanly");
            let mut slot = fault.lock().unwrap_or_else(|e| e.into_inner());
            slot.get_or_insert_with(|| e.to_string());
        }
    }

    if status.get() == Status::Running {
        let fault = fault.lock().unwrap_or_else(|e| e.into_inner()).clone();
        if let Some(fault) = fault {
            warn!(error = %fault, "Run lost records");
            publish(&status, &monitor, Status::Failed);
        } else if cancelled || stop.is_requested() {
            info!(reason = ?stop.reason(), "Procedure aborted");
            publish(&status, &monitor, Status::Aborted);
        } else {
            let _ = monitor.send(MonitorEvent::Progress(100.0));
            publish(&status, &monitor, Status::Finished);
            info!("Procedure finished");
        }
    }

    RunOutcome {
        results,
        shutdown_error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parameter::Parameter;
    use crate::procedures::{Procedure, ProcedureInfo, ProcedureInstance, RunContext};
    use crate::record;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    #[derive(Default)]
    struct Faulty {
        shutdowns: Arc<AtomicUsize>,
    }

    impl Procedure for Faulty {
        fn type_info() -> ProcedureInfo {
            ProcedureInfo::new("Faulty").column("x")
        }

        fn execute(&mut self, ctx: &mut RunContext<'_>) -> anyhow::Result<()> {
            ctx.emit_results(record! { "x" => 1 })?;
            anyhow::bail!("instrument timeout")
        }

        fn shutdown(&mut self, _ctx: &mut RunContext<'_>) -> anyhow::Result<()> {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct NeedsInput;

    impl Procedure for NeedsInput {
        fn type_info() -> ProcedureInfo {
            ProcedureInfo::new("NeedsInput").parameter(Parameter::float("bias", "Bias"))
        }

        fn execute(&mut self, _ctx: &mut RunContext<'_>) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn fan_out_splits_columns() {
        let batch = BTreeMap::from([
            ("a".to_string(), vec![Value::Int(1), Value::Int(2), Value::Int(3)]),
            ("b".to_string(), vec![Value::Int(4), Value::Int(5), Value::Int(6)]),
        ]);
        let records = fan_out(batch).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[1], record! { "a" => 2, "b" => 5 });
    }

    #[test]
    fn fan_out_rejects_ragged_batches() {
        let batch = BTreeMap::from([
            ("a".to_string(), vec![Value::Int(1), Value::Int(2)]),
            ("b".to_string(), vec![Value::Int(4), Value::Int(5), Value::Int(6)]),
        ]);
        let err = fan_out(batch).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Batch results columns have mismatched lengths: a=2, b=3"
        );
        assert!(fan_out(BTreeMap::new()).unwrap().is_empty());
    }

    #[test]
    fn missing_parameter_fails_fast() {
        let dir = tempdir().unwrap();
        let procedure = ProcedureInstance::new(NeedsInput).unwrap();
        let results = Results::new(procedure, dir.path().join("run.csv")).unwrap();
        assert!(matches!(
            Worker::new(results, WorkerConfig::default()),
            Err(DaqError::ParameterNotSet(ref key)) if key == "bias"
        ));
    }

    #[test]
    fn failure_still_runs_shutdown_and_keeps_rows() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.csv");
        let shutdowns = Arc::new(AtomicUsize::new(0));
        let procedure = ProcedureInstance::new(Faulty {
            shutdowns: Arc::clone(&shutdowns),
        })
        .unwrap();
        let results = Results::new(procedure, &path).unwrap();

        let mut worker = Worker::new(results, WorkerConfig::default()).unwrap();
        let mut monitor = worker.monitor().unwrap();
        worker.start().unwrap();
        worker.join(Duration::from_secs(10)).unwrap();

        assert_eq!(worker.status(), Status::Failed);
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);

        let mut events = Vec::new();
        while let Some(event) = monitor.blocking_recv() {
            events.push(event);
        }
        assert_eq!(events[0], MonitorEvent::Status(Status::Running));
        assert!(events.contains(&MonitorEvent::Status(Status::Failed)));
        assert!(events
            .iter()
            .any(|e| matches!(e, MonitorEvent::Error { message, .. } if message == "instrument timeout")));

        let mut results = worker.into_results().unwrap();
        assert_eq!(results.data().unwrap().len(), 1);
    }

    #[test]
    fn start_twice_is_rejected() {
        let dir = tempdir().unwrap();
        let procedure = ProcedureInstance::new(Faulty::default()).unwrap();
        let results = Results::new(procedure, dir.path().join("run.csv")).unwrap();
        let mut worker = Worker::new(results, WorkerConfig::default()).unwrap();
        worker.start().unwrap();
        assert!(matches!(worker.start(), Err(DaqError::WorkerState(_))));
        worker.join(Duration::from_secs(10)).unwrap();
        assert!(!worker.is_running());
    }
}
