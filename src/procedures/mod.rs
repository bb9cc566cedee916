//! Procedure Framework
//!
//! A procedure is a user-defined measurement program with `startup`, `execute` and
//! `shutdown` hooks, declared parameters, run metadata and an ordered list of output
//! columns.
//!
//! # Key Concepts
//!
//! - **Procedure**: trait holding only the user hooks and instrument state
//! - **ProcedureInfo**: static descriptor of a procedure type (parameters, metadata,
//!   columns, measurables)
//! - **ProcedureInstance**: one runnable instance, owning the parameter and metadata
//!   snapshots and the observable [`Status`]
//! - **ProcedureRegistry**: resolves the type identifier stored in a results header
//!   back into a procedure type
//! - **RunContext**: the capabilities a hook may use (`emit`, `should_stop`)
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                      ProcedureRegistry                        │
//! │   type_id ──> (ProcedureInfo, factory)                        │
//! ├───────────────────────────────────────────────────────────────┤
//! │                      ProcedureInstance                        │
//! │   ParameterSet │ MetadataSet │ StatusCell │ Box<dyn Procedure>│
//! ├───────────────────────────────────────────────────────────────┤
//! │                      Procedure trait                          │
//! │   startup(ctx) → execute(ctx) → shutdown(ctx)                 │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust
//! use rust_measure::parameter::Parameter;
//! use rust_measure::procedures::{Procedure, ProcedureInfo, ProcedureInstance, RunContext};
//! use rust_measure::record;
//!
//! #[derive(Default)]
//! struct Sweep;
//!
//! impl Procedure for Sweep {
//!     fn type_info() -> ProcedureInfo {
//!         ProcedureInfo::new("Sweep")
//!             .parameter(Parameter::integer("iterations", "Loop Iterations").default(3))
//!             .columns(["x", "y (V)"])
//!     }
//!
//!     fn execute(&mut self, ctx: &mut RunContext<'_>) -> anyhow::Result<()> {
//!         let n = ctx.parameters().get_i64("iterations")?;
//!         for i in 0..n {
//!             ctx.check_stop()?;
//!             ctx.emit_results(record! { "x" => i, "y (V)" => i as f64 })?;
//!         }
//!         Ok(())
//!     }
//! }
//!
//! let procedure = ProcedureInstance::new(Sweep).unwrap();
//! assert_eq!(procedure.data_columns(), vec!["x", "y (V)"]);
//! ```

pub mod context;
pub mod panic_safety;
pub mod random;
pub mod status;

pub use context::{EmitSink, Emission, RunContext};
pub use panic_safety::{PanicGuard, StopFlag};
pub use random::RandomProcedure;
pub use status::{Status, StatusCell};

use crate::error::{AppResult, DaqError};
use crate::metadata::{Metadata, MetadataSet};
use crate::parameter::{Parameter, ParameterSet};
use crate::value::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

// =============================================================================
// Procedure Trait
// =============================================================================

/// User hooks of a measurement program.
///
/// The framework guarantees that `shutdown()` runs once `startup()` has been
/// entered, whether the run finishes, fails, panics or is aborted.
pub trait Procedure: Send + 'static {
    /// Get static information about this procedure type
    fn type_info() -> ProcedureInfo
    where
        Self: Sized;

    /// Prepare instruments. Metadata is evaluated after this returns.
    fn startup(&mut self, _ctx: &mut RunContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    /// The measurement itself. Should poll `ctx.should_stop()` regularly.
    fn execute(&mut self, ctx: &mut RunContext<'_>) -> anyhow::Result<()>;

    /// Leave instruments in a safe state.
    fn shutdown(&mut self, _ctx: &mut RunContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    /// Read one declared measurable.
    fn read_measurable(&mut self, name: &str) -> anyhow::Result<Value> {
        anyhow::bail!("procedure has no measurable named '{name}'")
    }
}

// =============================================================================
// Procedure Info
// =============================================================================

/// A column whose value is read through [`Procedure::read_measurable`].
#[derive(Debug, Clone, PartialEq)]
pub struct Measurable {
    pub name: String,
    pub units: Option<String>,
}

impl Measurable {
    /// Column label, `"name (units)"` when units are declared.
    pub fn column(&self) -> String {
        match &self.units {
            Some(units) => format!("{} ({units})", self.name),
            None => self.name.clone(),
        }
    }
}

/// Static description of a procedure type.
#[derive(Debug, Clone)]
pub struct ProcedureInfo {
    type_id: String,
    description: String,
    parameters: Vec<Parameter>,
    metadata: Vec<Metadata>,
    columns: Vec<String>,
    measurables: Vec<Measurable>,
}

impl ProcedureInfo {
    /// `type_id` is written to the results header and resolved by the registry.
    pub fn new(type_id: impl Into<String>) -> Self {
        Self {
            type_id: type_id.into(),
            description: String::new(),
            parameters: Vec::new(),
            metadata: Vec::new(),
            columns: Vec::new(),
            measurables: Vec::new(),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn parameter(mut self, parameter: Parameter) -> Self {
        self.parameters.push(parameter);
        self
    }

    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.metadata.push(metadata);
        self
    }

    /// Declare a data column, `"name"` or `"name (unit)"`.
    pub fn column(mut self, label: impl Into<String>) -> Self {
        self.columns.push(label.into());
        self
    }

    pub fn columns<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns.extend(labels.into_iter().map(Into::into));
        self
    }

    /// Declare a measurable; it also becomes a data column.
    pub fn measurable(mut self, name: impl Into<String>, units: Option<&str>) -> Self {
        self.measurables.push(Measurable {
            name: name.into(),
            units: units.map(str::to_string),
        });
        self
    }

    pub fn type_id(&self) -> &str {
        &self.type_id
    }

    pub fn description_text(&self) -> &str {
        &self.description
    }

    pub fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }

    pub fn metadata_templates(&self) -> &[Metadata] {
        &self.metadata
    }

    pub fn measurables(&self) -> &[Measurable] {
        &self.measurables
    }

    /// Declared columns followed by measurable columns, in declaration order.
    pub fn data_columns(&self) -> Vec<String> {
        self.columns
            .iter()
            .cloned()
            .chain(self.measurables.iter().map(Measurable::column))
            .collect()
    }
}

// =============================================================================
// Procedure Instance
// =============================================================================

/// One runnable procedure: descriptor, parameter and metadata snapshots, status,
/// and the user hooks.
pub struct ProcedureInstance {
    info: Arc<ProcedureInfo>,
    parameters: ParameterSet,
    metadata: MetadataSet,
    status: StatusCell,
    behaviour: Option<Box<dyn Procedure>>,
}

impl fmt::Debug for ProcedureInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcedureInstance")
            .field("type_id", &self.info.type_id)
            .field("status", &self.status.get())
            .field("parameters", &self.parameters)
            .field("runnable", &self.behaviour.is_some())
            .finish()
    }
}

impl ProcedureInstance {
    /// Instance of `P`, with parameters set to their defaults.
    pub fn new<P: Procedure>(procedure: P) -> AppResult<Self> {
        Self::from_parts(Arc::new(P::type_info()), Box::new(procedure))
    }

    pub fn from_parts(info: Arc<ProcedureInfo>, behaviour: Box<dyn Procedure>) -> AppResult<Self> {
        Ok(Self {
            parameters: ParameterSet::from_templates(info.parameters())?,
            metadata: MetadataSet::from_templates(info.metadata_templates()),
            status: StatusCell::new(),
            behaviour: Some(behaviour),
            info,
        })
    }

    /// Placeholder for a results file whose procedure type is not registered.
    ///
    /// Every raw header parameter is kept as a text parameter. The placeholder
    /// cannot be run.
    pub fn unknown(type_id: &str, raw_parameters: &[(String, String)]) -> Self {
        let mut parameters = ParameterSet::default();
        for (name, raw) in raw_parameters {
            let mut parameter = Parameter::text(name.clone(), name.clone());
            // text parameters accept any string
            let _ = parameter.set(raw.as_str());
            parameters.push(parameter);
        }
        Self {
            info: Arc::new(ProcedureInfo::new(type_id)),
            parameters,
            metadata: MetadataSet::default(),
            status: StatusCell::new(),
            behaviour: None,
        }
    }

    pub fn type_id(&self) -> &str {
        self.info.type_id()
    }

    pub fn info(&self) -> &ProcedureInfo {
        &self.info
    }

    pub fn shared_info(&self) -> Arc<ProcedureInfo> {
        Arc::clone(&self.info)
    }

    /// False for an unknown-procedure placeholder.
    pub fn is_runnable(&self) -> bool {
        self.behaviour.is_some()
    }

    pub fn parameters(&self) -> &ParameterSet {
        &self.parameters
    }

    pub fn parameters_mut(&mut self) -> &mut ParameterSet {
        &mut self.parameters
    }

    /// Assign several parameters at once.
    pub fn set_parameters<K, V>(&mut self, values: impl IntoIterator<Item = (K, V)>) -> AppResult<()>
    where
        K: AsRef<str>,
        V: Into<Value>,
    {
        self.parameters.set_parameters(values)
    }

    pub fn metadata(&self) -> &MetadataSet {
        &self.metadata
    }

    pub(crate) fn metadata_mut(&mut self) -> &mut MetadataSet {
        &mut self.metadata
    }

    pub fn status(&self) -> Status {
        self.status.get()
    }

    pub fn status_cell(&self) -> &StatusCell {
        &self.status
    }

    pub fn data_columns(&self) -> Vec<String> {
        self.info.data_columns()
    }

    /// Evaluates every metadata entry once.
    pub fn evaluate_metadata(&mut self) -> AppResult<()> {
        let mut values = Vec::with_capacity(self.metadata.len());
        for entry in self.metadata.iter() {
            values.push((entry.key().to_string(), entry.resolve(self)?));
        }
        for (key, value) in values {
            if let Some(entry) = self.metadata.get_mut(&key) {
                entry.evaluate_with(value)?;
            }
        }
        Ok(())
    }

    /// Context with no worker behind it, for exercising hooks directly.
    pub fn detached_context(&self) -> RunContext<'_> {
        RunContext::detached(&self.parameters, &self.info)
    }

    /// Runs one hook with a context bound to `sink`.
    pub(crate) fn run_hook<F>(&mut self, sink: &dyn EmitSink, hook: F) -> anyhow::Result<()>
    where
        F: FnOnce(&mut dyn Procedure, &mut RunContext<'_>) -> anyhow::Result<()>,
    {
        let behaviour = self
            .behaviour
            .as_deref_mut()
            .ok_or_else(|| DaqError::UnknownProcedure(self.info.type_id.clone()))?;
        let mut ctx = RunContext::bound(&self.parameters, &self.info, sink);
        hook(behaviour, &mut ctx)
    }
}

// =============================================================================
// Procedure Registry
// =============================================================================

/// Factory function for creating procedures
pub type ProcedureFactory = fn() -> Box<dyn Procedure>;

/// Registry for procedure types, keyed by type identifier.
pub struct ProcedureRegistry {
    procedure_types: HashMap<String, ProcedureFactory>,
    type_info_cache: HashMap<String, Arc<ProcedureInfo>>,
}

impl Default for ProcedureRegistry {
    /// Registry with the built-in procedures.
    fn default() -> Self {
        let mut registry = Self::new();
        registry.register_builtin_procedures();
        registry
    }
}

impl ProcedureRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            procedure_types: HashMap::new(),
            type_info_cache: HashMap::new(),
        }
    }

    fn register_builtin_procedures(&mut self) {
        self.register_type::<RandomProcedure>();
    }

    /// Register a procedure type
    pub fn register_type<P: Procedure + Default>(&mut self) {
        let info = P::type_info();
        let type_id = info.type_id().to_string();
        self.type_info_cache.insert(type_id.clone(), Arc::new(info));
        self.procedure_types
            .insert(type_id, || -> Box<dyn Procedure> { Box::new(P::default()) });
    }

    /// List all registered procedure types, sorted by identifier
    pub fn list_types(&self) -> Vec<&ProcedureInfo> {
        let mut types: Vec<&ProcedureInfo> = self.type_info_cache.values().map(AsRef::as_ref).collect();
        types.sort_by(|a, b| a.type_id().cmp(b.type_id()));
        types
    }

    /// Get info for a specific procedure type
    pub fn get_type_info(&self, type_id: &str) -> Option<&ProcedureInfo> {
        self.type_info_cache.get(type_id).map(AsRef::as_ref)
    }

    pub fn contains(&self, type_id: &str) -> bool {
        self.procedure_types.contains_key(type_id)
    }

    /// New instance of a registered type with default parameters
    pub fn create(&self, type_id: &str) -> AppResult<ProcedureInstance> {
        let factory = self
            .procedure_types
            .get(type_id)
            .ok_or_else(|| DaqError::UnknownProcedure(type_id.to_string()))?;
        let info = self
            .type_info_cache
            .get(type_id)
            .cloned()
            .ok_or_else(|| DaqError::UnknownProcedure(type_id.to_string()))?;
        ProcedureInstance::from_parts(info, factory())
    }

    /// Fresh, queued instance of the same type carrying `source`'s parameter values.
    ///
    /// Used to run a procedure again, e.g. one reloaded from a results file whose
    /// metadata is already frozen.
    pub fn recreate(&self, source: &ProcedureInstance) -> AppResult<ProcedureInstance> {
        let mut instance = self.create(source.type_id())?;
        for parameter in source.parameters().iter() {
            if let Some(value) = parameter.value() {
                instance.parameters_mut().set(parameter.key(), value.clone())?;
            }
        }
        Ok(instance)
    }
}

// =============================================================================
// Tests
// =============================================================================
