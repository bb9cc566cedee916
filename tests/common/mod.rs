//! Procedures and helpers shared by the integration tests.

#![allow(dead_code)]

use rust_measure::metadata::Metadata;
use rust_measure::parameter::Parameter;
use rust_measure::procedures::{Procedure, ProcedureInfo, RunContext};
use rust_measure::record;
use rust_measure::value::Value;
use rust_measure::worker::MonitorEvent;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Emits `x = i`, `y (V) = i` for `iterations` steps.
#[derive(Default)]
pub struct Counting;

impl Procedure for Counting {
    fn type_info() -> ProcedureInfo {
        ProcedureInfo::new("Counting")
            .description("Counts up")
            .parameter(
                Parameter::integer("iterations", "Loop Iterations")
                    .range(1.0, 100.0)
                    .default(3),
            )
            .metadata(Metadata::fixed("serial", "Serial Number", "SN-7"))
            .columns(["x", "y (V)"])
    }

    fn execute(&mut self, ctx: &mut RunContext<'_>) -> anyhow::Result<()> {
        let n = ctx.parameters().get_i64("iterations")?;
        for i in 0..n {
            ctx.check_stop()?;
            ctx.emit_results(record! { "x" => i, "y (V)" => i as f64 })?;
            ctx.emit_progress(100.0 * (i + 1) as f64 / n as f64)?;
        }
        Ok(())
    }
}

/// Emits one row, then fails.
#[derive(Default)]
pub struct Failing {
    pub shutdowns: Arc<AtomicUsize>,
}

impl Procedure for Failing {
    fn type_info() -> ProcedureInfo {
        ProcedureInfo::new("Failing").column("x")
    }

    fn execute(&mut self, ctx: &mut RunContext<'_>) -> anyhow::Result<()> {
        ctx.emit_results(record! { "x" => 1 })?;
        anyhow::bail!("lock-in amplifier did not respond")
    }

    fn shutdown(&mut self, _ctx: &mut RunContext<'_>) -> anyhow::Result<()> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Panics in the middle of `execute`.
#[derive(Default)]
pub struct Panicking {
    pub shutdowns: Arc<AtomicUsize>,
}

impl Procedure for Panicking {
    fn type_info() -> ProcedureInfo {
        ProcedureInfo::new("Panicking").column("x")
    }

    fn execute(&mut self, ctx: &mut RunContext<'_>) -> anyhow::Result<()> {
        ctx.emit_results(record! { "x" => 1 })?;
        panic!("stage limit switch tripped");
    }

    fn shutdown(&mut self, _ctx: &mut RunContext<'_>) -> anyhow::Result<()> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Emits rows until a stop is requested.
#[derive(Default)]
pub struct Polling {
    pub shutdowns: Arc<AtomicUsize>,
}

impl Procedure for Polling {
    fn type_info() -> ProcedureInfo {
        ProcedureInfo::new("Polling").column("n")
    }

    fn execute(&mut self, ctx: &mut RunContext<'_>) -> anyhow::Result<()> {
        let mut n = 0_i64;
        loop {
            ctx.emit_results(record! { "n" => n })?;
            n += 1;
            ctx.sleep(Duration::from_millis(5))?;
        }
    }

    fn shutdown(&mut self, _ctx: &mut RunContext<'_>) -> anyhow::Result<()> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Emits one batch of three rows, or a ragged batch when `ragged` is set.
#[derive(Default)]
pub struct Batch;

impl Procedure for Batch {
    fn type_info() -> ProcedureInfo {
        ProcedureInfo::new("Batch")
            .parameter(Parameter::boolean("ragged", "Ragged Batch").default(false))
            .columns(["a", "b"])
    }

    fn execute(&mut self, ctx: &mut RunContext<'_>) -> anyhow::Result<()> {
        let b_len = if ctx.parameters().get_bool("ragged")? { 2 } else { 3 };
        let batch = BTreeMap::from([
            ("a".to_string(), (1..=3).map(Value::Int).collect::<Vec<_>>()),
            ("b".to_string(), (4..4 + b_len).map(Value::Int).collect::<Vec<_>>()),
        ]);
        ctx.emit_batch(batch)?;
        Ok(())
    }
}

/// Finishes its measurement but fails to power down.
#[derive(Default)]
pub struct BadShutdown;

impl Procedure for BadShutdown {
    fn type_info() -> ProcedureInfo {
        ProcedureInfo::new("BadShutdown").column("x")
    }

    fn execute(&mut self, ctx: &mut RunContext<'_>) -> anyhow::Result<()> {
        ctx.emit_results(record! { "x" => 1 })?;
        Ok(())
    }

    fn shutdown(&mut self, _ctx: &mut RunContext<'_>) -> anyhow::Result<()> {
        anyhow::bail!("laser shutter stuck open")
    }
}

/// Emits a number, then text, into the same column.
#[derive(Default)]
pub struct TypeFlip;

impl Procedure for TypeFlip {
    fn type_info() -> ProcedureInfo {
        ProcedureInfo::new("TypeFlip").column("x")
    }

    fn execute(&mut self, ctx: &mut RunContext<'_>) -> anyhow::Result<()> {
        ctx.emit_results(record! { "x" => 1.5 })?;
        ctx.emit_results(record! { "x" => "overload" })?;
        Ok(())
    }
}

/// Logs at several levels.
#[derive(Default)]
pub struct Chatty;

impl Procedure for Chatty {
    fn type_info() -> ProcedureInfo {
        ProcedureInfo::new("Chatty").column("x")
    }

    fn execute(&mut self, _ctx: &mut RunContext<'_>) -> anyhow::Result<()> {
        tracing::debug!("raw reading 0x1f");
        tracing::info!(step = 1, "aligned the stage");
        tracing::warn!("temperature drifting");
        Ok(())
    }
}

/// Collects every monitor event until the channel closes.
pub fn drain(mut monitor: mpsc::UnboundedReceiver<MonitorEvent>) -> Vec<MonitorEvent> {
    let mut events = Vec::new();
    while let Some(event) = monitor.blocking_recv() {
        events.push(event);
    }
    events
}

/// Status changes in the order they were published.
pub fn statuses(events: &[MonitorEvent]) -> Vec<rust_measure::Status> {
    events
        .iter()
        .filter_map(|e| match e {
            MonitorEvent::Status(status) => Some(*status),
            _ => None,
        })
        .collect()
}

/// File content after the leading comment lines.
pub fn data_section(path: &Path) -> String {
    std::fs::read_to_string(path)
        .expect("results file should be readable")
        .lines()
        .skip_while(|line| line.starts_with('#'))
        .map(|line| format!("{line}\n"))
        .collect()
}
