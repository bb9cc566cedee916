//! Recorder: drains emitted records into the results file(s).
//!
//! The worker thread pushes records onto an unbounded queue; a dedicated recorder
//! thread pops them in order and hands each one to a [`RecordSink`]. Stopping the
//! recorder closes the queue, drains everything still in it, shuts the sink down
//! (flushing and closing files) and joins the thread, so no record that was
//! accepted by [`Recorder::send`] is lost.

use crate::error::{AppResult, DaqError};
use crate::results::json_log;
use crate::results::{CsvFormatter, Results, ResultsFormat};
use crate::value::Record;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::thread::JoinHandle;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Destination of recorded rows.
pub trait RecordSink: Send {
    /// Persists one record. Must be visible to readers when this returns.
    fn write(&mut self, record: &Record) -> AppResult<()>;

    /// Flushes and closes everything the sink opened.
    fn shutdown(&mut self) -> AppResult<()> {
        Ok(())
    }
}

/// Appends one delimited line per record to every target file.
pub struct CsvSink {
    formatter: CsvFormatter,
    targets: Vec<(PathBuf, Option<BufWriter<File>>)>,
}

impl CsvSink {
    pub fn new(formatter: CsvFormatter, paths: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            formatter,
            targets: paths.into_iter().map(|p| (p, None)).collect(),
        }
    }
}

impl RecordSink for CsvSink {
    fn write(&mut self, record: &Record) -> AppResult<()> {
        let line = self.formatter.format(record);
        for (path, writer) in &mut self.targets {
            // opened on first use so the metadata splice happens on a closed file
            if writer.is_none() {
                let file = OpenOptions::new().create(true).append(true).open(&*path)?;
                *writer = Some(BufWriter::new(file));
            }
            if let Some(writer) = writer {
                writeln!(writer, "{line}")?;
                writer.flush()?;
            }
        }
        Ok(())
    }

    fn shutdown(&mut self) -> AppResult<()> {
        for (path, writer) in &mut self.targets {
            if let Some(mut writer) = writer.take() {
                writer.flush()?;
                debug!(path = %path.display(), "Closed results file");
            }
        }
        Ok(())
    }
}

/// Merges each record into the run's column lists of a JSON results file.
pub struct JsonSink {
    formatter: CsvFormatter,
    run_id: String,
    paths: Vec<PathBuf>,
}

impl JsonSink {
    pub fn new(formatter: CsvFormatter, run_id: impl Into<String>, paths: Vec<PathBuf>) -> Self {
        Self {
            formatter,
            run_id: run_id.into(),
            paths,
        }
    }
}

impl RecordSink for JsonSink {
    fn write(&mut self, record: &Record) -> AppResult<()> {
        let values: Vec<(String, serde_json::Value)> = self
            .formatter
            .columns()
            .iter()
            .cloned()
            .zip(self.formatter.coerce_record(record).iter().map(|v| v.to_json()))
            .collect();
        for path in &self.paths {
            let mut root = json_log::read_root(path)?;
            json_log::merge_record(&mut root, &self.run_id, values.clone())?;
            json_log::write_root(path, &root)?;
        }
        Ok(())
    }
}

/// Sink matching the format and targets of `results`.
pub fn sink_for(results: &Results) -> Box<dyn RecordSink> {
    let formatter = results.formatter().clone();
    let paths = results.paths().to_vec();
    match results.results_format() {
        ResultsFormat::Csv => Box::new(CsvSink::new(formatter, paths)),
        ResultsFormat::Json => Box::new(JsonSink::new(formatter, results.run_id(), paths)),
    }
}

/// Counters reported when the recorder stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecorderStats {
    pub written: u64,
    pub discarded: u64,
}

/// Background thread persisting records in arrival order.
pub struct Recorder {
    tx: Option<mpsc::UnboundedSender<Record>>,
    handle: Option<JoinHandle<RecorderStats>>,
}

impl Recorder {
    /// Spawns the recorder thread.
    ///
    /// `on_error` is called from the recorder thread for the first failed write and
    /// for a failed shutdown. Records arriving after a failed write are discarded.
    pub fn start<F>(mut sink: Box<dyn RecordSink>, on_error: F) -> AppResult<Self>
    where
        F: Fn(&DaqError) + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<Record>();
        let span = tracing::info_span!("recorder");
        let dispatch = tracing::dispatcher::get_default(Clone::clone);

        let handle = std::thread::Builder::new()
            .name("recorder".to_string())
            .spawn(move || {
                tracing::dispatcher::with_default(&dispatch, || {
                    let _entered = span.enter();
                    let mut stats = RecorderStats::default();
                    let mut failed = false;
                    while let Some(record) = rx.blocking_recv() {
                        if failed {
                            stats.discarded += 1;
                            continue;
                        }
                        match sink.write(&record) {
                            Ok(()) => stats.written += 1,
                            Err(e) => {
                                error!(error = %e, "Failed to record results, discarding the rest of the run");
                                on_error(&e);
                                failed = true;
                                stats.discarded += 1;
                            }
                        }
                    }
                    if let Err(e) = sink.shutdown() {
                        error!(error = %e, "Failed to close results files");
                        on_error(&e);
                    }
                    if stats.discarded > 0 {
                        warn!(discarded = stats.discarded, "Records were not persisted");
                    }
                    debug!(written = stats.written, "Recorder stopped");
                    stats
                })
            })?;

        Ok(Self {
            tx: Some(tx),
            handle: Some(handle),
        })
    }

    /// Queues a record.
    pub fn send(&self, record: Record) -> AppResult<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| DaqError::WorkerState("recorder is stopped".to_string()))?;
        tx.send(record)
            .map_err(|_| DaqError::WorkerState("recorder thread exited".to_string()))
    }

    pub fn is_running(&self) -> bool {
        self.tx.is_some()
    }

    /// Closes the queue, waits for every queued record to be written and joins.
    pub fn stop(&mut self) -> AppResult<RecorderStats> {
        drop(self.tx.take());
        match self.handle.take() {
            Some(handle) => handle.join().map_err(|payload| {
                DaqError::WorkerPanicked(crate::procedures::panic_safety::panic_message(
                    payload.as_ref(),
                ))
            }),
            None => Ok(RecorderStats::default()),
        }
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        if self.handle.is_some() {
            if let Err(e) = self.stop() {
                error!(error = %e, "Recorder did not stop cleanly");
            }
        }
    }
}
