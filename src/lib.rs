//! # Rust Measure Core Library
//!
//! Runs user-defined measurement procedures on a background thread, records their
//! emitted data to append-only results files, and tails those files for live
//! display while they grow.
//!
//! ## Crate Structure
//!
//! - **`procedures`**: the `Procedure` trait (user hooks), `ProcedureInfo` descriptors,
//!   `ProcedureInstance`, the `ProcedureRegistry`, status and cancellation primitives.
//! - **`parameter`** / **`metadata`**: typed, validated inputs and run-fixed
//!   descriptive values recorded in the results header.
//! - **`results`**: the results file (header, metadata block, formatting, loading)
//!   and incremental readers.
//! - **`recorder`**: the thread that persists emitted records in order.
//! - **`worker`**: the execution engine driving a procedure through its lifecycle.
//! - **`units`** / **`value`**: the value model and unit conversion for data columns.
//! - **`config`**, **`logging`**, **`log_capture`**, **`error`**: ambient services.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rust_measure::procedures::{ProcedureRegistry, Status};
//! use rust_measure::results::Results;
//! use rust_measure::worker::{Worker, WorkerConfig};
//! use std::time::Duration;
//!
//! # fn main() -> anyhow::Result<()> {
//! let registry = ProcedureRegistry::default();
//! let mut procedure = registry.create("RandomProcedure")?;
//! procedure.set_parameters([("iterations", 100)])?;
//!
//! let results = Results::new(procedure, "data/random.csv")?;
//! let mut worker = Worker::new(results, WorkerConfig::default())?;
//! worker.start()?;
//! worker.join(Duration::from_secs(30))?;
//! assert_eq!(worker.status(), Status::Finished);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod log_capture;
pub mod logging;
pub mod metadata;
pub mod parameter;
pub mod procedures;
pub mod recorder;
pub mod results;
pub mod units;
pub mod value;
pub mod worker;

pub use error::{AppResult, DaqError};
pub use procedures::{Procedure, ProcedureInfo, ProcedureInstance, ProcedureRegistry, RunContext, Status};
pub use results::Results;
pub use value::{Record, Value};
pub use worker::{MonitorEvent, Worker, WorkerConfig};
