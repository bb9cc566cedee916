//! Execution context handed to procedure hooks.
//!
//! A procedure never talks to the worker directly. Every hook receives a
//! [`RunContext`] through which it reads its parameters, publishes [`Emission`]s
//! and polls for cancellation. Outside a worker, [`RunContext::detached`] gives a
//! context whose `emit` fails with [`DaqError::NotBound`].

use super::{Procedure, ProcedureInfo};
use crate::error::{AppResult, DaqError};
use crate::parameter::ParameterSet;
use crate::value::{Record, Value};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Granularity of [`RunContext::sleep`] cancellation checks.
const SLEEP_SLICE: Duration = Duration::from_millis(20);

/// A topic-tagged message published by a running procedure.
#[derive(Debug, Clone, PartialEq)]
pub enum Emission {
    /// One record, appended to the results file(s)
    Results(Record),
    /// Equal-length columns, fanned out into one record per index
    BatchResults(BTreeMap<String, Vec<Value>>),
    /// Percent complete, forwarded to the monitor channel
    Progress(f64),
}

impl Emission {
    pub fn topic(&self) -> &'static str {
        match self {
            Emission::Results(_) => "results",
            Emission::BatchResults(_) => "batch results",
            Emission::Progress(_) => "progress",
        }
    }
}

/// Receiver of emissions, implemented by the worker.
pub trait EmitSink {
    fn emit(&self, emission: Emission) -> AppResult<()>;
    fn should_stop(&self) -> bool;
}

/// Capabilities available to a procedure hook.
pub struct RunContext<'a> {
    parameters: &'a ParameterSet,
    info: &'a ProcedureInfo,
    sink: Option<&'a dyn EmitSink>,
}

impl<'a> RunContext<'a> {
    pub(crate) fn bound(
        parameters: &'a ParameterSet,
        info: &'a ProcedureInfo,
        sink: &'a dyn EmitSink,
    ) -> Self {
        Self {
            parameters,
            info,
            sink: Some(sink),
        }
    }

    /// Context not attached to a worker: emitting fails, `should_stop()` is false.
    pub fn detached(parameters: &'a ParameterSet, info: &'a ProcedureInfo) -> Self {
        Self {
            parameters,
            info,
            sink: None,
        }
    }

    pub fn parameters(&self) -> &ParameterSet {
        self.parameters
    }

    pub fn info(&self) -> &ProcedureInfo {
        self.info
    }

    pub fn is_bound(&self) -> bool {
        self.sink.is_some()
    }

    pub fn emit(&self, emission: Emission) -> AppResult<()> {
        match self.sink {
            Some(sink) => sink.emit(emission),
            None => Err(DaqError::NotBound("emit")),
        }
    }

    pub fn emit_results(&self, record: Record) -> AppResult<()> {
        self.emit(Emission::Results(record))
    }

    pub fn emit_batch(&self, batch: BTreeMap<String, Vec<Value>>) -> AppResult<()> {
        self.emit(Emission::BatchResults(batch))
    }

    pub fn emit_progress(&self, percent: f64) -> AppResult<()> {
        self.emit(Emission::Progress(percent))
    }

    /// Whether the controller asked the run to stop.
    pub fn should_stop(&self) -> bool {
        self.sink.is_some_and(|sink| sink.should_stop())
    }

    /// `Err(Cancelled)` once a stop was requested, for early return with `?`.
    pub fn check_stop(&self) -> AppResult<()> {
        if self.should_stop() {
            Err(DaqError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sleeps for `duration`, returning `Err(Cancelled)` as soon as a stop is requested.
    pub fn sleep(&self, duration: Duration) -> AppResult<()> {
        let deadline = Instant::now() + duration;
        loop {
            self.check_stop()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            std::thread::sleep(SLEEP_SLICE.min(deadline - now));
        }
    }

    /// Reads every declared measurable, in declaration order.
    pub fn get_datapoint(&self, procedure: &mut dyn Procedure) -> anyhow::Result<Record> {
        let mut record = Record::new();
        for measurable in self.info.measurables() {
            let value = procedure.read_measurable(&measurable.name)?;
            record.insert(measurable.column(), value);
        }
        Ok(record)
    }

    /// Reads a data point and emits it as results.
    pub fn measure(&self, procedure: &mut dyn Procedure) -> anyhow::Result<Record> {
        let record = self.get_datapoint(procedure)?;
        self.emit_results(record.clone())?;
        Ok(record)
    }
}
