//! Run-fixed descriptive values recorded in the results header.
//!
//! Unlike a [`Parameter`](crate::parameter::Parameter), a [`Metadata`] entry is not a
//! tunable input: it is evaluated exactly once per run, after the procedure's
//! `startup()` hook (so it can capture e.g. an instrument serial number), and is then
//! frozen. The value comes from one of three sources:
//!
//! - a fixed value,
//! - a getter closure receiving the procedure instance,
//! - a parameter path such as `"parameters.iterations"`.

use crate::error::{AppResult, DaqError};
use crate::procedures::ProcedureInstance;
use crate::value::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use strfmt::strfmt;
use tracing::warn;

/// Getter closure evaluated against the running procedure.
pub type MetadataGetter = Arc<dyn Fn(&ProcedureInstance) -> anyhow::Result<Value> + Send + Sync>;

/// Where a metadata value comes from.
#[derive(Clone)]
pub enum MetadataSource {
    Fixed(Value),
    Getter(MetadataGetter),
    Parameter(String),
}

impl fmt::Debug for MetadataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetadataSource::Fixed(value) => f.debug_tuple("Fixed").field(value).finish(),
            MetadataSource::Getter(_) => f.write_str("Getter(..)"),
            MetadataSource::Parameter(path) => f.debug_tuple("Parameter").field(path).finish(),
        }
    }
}

/// A named value computed once per run.
#[derive(Debug, Clone)]
pub struct Metadata {
    key: String,
    name: String,
    source: MetadataSource,
    units: Option<String>,
    default: Option<Value>,
    fmt: Option<String>,
    value: Option<Value>,
}

impl Metadata {
    fn with_source(key: impl Into<String>, name: impl Into<String>, source: MetadataSource) -> Self {
        Self {
            key: key.into(),
            name: name.into(),
            source,
            units: None,
            default: None,
            fmt: None,
            value: None,
        }
    }

    /// Metadata with a constant value.
    pub fn fixed(key: impl Into<String>, name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::with_source(key, name, MetadataSource::Fixed(value.into()))
    }

    /// Metadata computed by `getter` when the run starts.
    pub fn getter<F>(key: impl Into<String>, name: impl Into<String>, getter: F) -> Self
    where
        F: Fn(&ProcedureInstance) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        Self::with_source(key, name, MetadataSource::Getter(Arc::new(getter)))
    }

    /// Metadata copied from a parameter, e.g. `"parameters.iterations"` or `"iterations"`.
    pub fn parameter(key: impl Into<String>, name: impl Into<String>, path: impl Into<String>) -> Self {
        Self::with_source(key, name, MetadataSource::Parameter(path.into()))
    }

    pub fn units(mut self, units: impl Into<String>) -> Self {
        self.units = Some(units.into());
        self
    }

    /// Value used when the getter fails.
    pub fn default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    /// `strfmt` format string applied to `{value}` when rendering.
    pub fn format(mut self, fmt: impl Into<String>) -> Self {
        self.fmt = Some(fmt.into());
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn unit_text(&self) -> Option<&str> {
        self.units.as_deref()
    }

    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    pub fn is_evaluated(&self) -> bool {
        self.value.is_some()
    }

    /// Computes the value without storing it.
    pub fn resolve(&self, procedure: &ProcedureInstance) -> AppResult<Value> {
        if self.is_evaluated() {
            return Err(DaqError::MetadataAlreadyEvaluated(self.name.clone()));
        }
        match &self.source {
            MetadataSource::Fixed(value) => Ok(value.clone()),
            MetadataSource::Parameter(path) => {
                let key = path.strip_prefix("parameters.").unwrap_or(path);
                procedure.parameters().get(key).cloned()
            }
            MetadataSource::Getter(getter) => match getter(procedure) {
                Ok(value) => Ok(value),
                Err(e) => match &self.default {
                    Some(default) => {
                        warn!(metadata = %self.name, error = %e, "Metadata getter failed, using default");
                        Ok(default.clone())
                    }
                    None => Err(DaqError::Configuration(format!(
                        "metadata '{}' could not be evaluated: {e:#}",
                        self.name
                    ))),
                },
            },
        }
    }

    /// Evaluates and freezes the value.
    pub fn evaluate(&mut self, procedure: &ProcedureInstance) -> AppResult<&Value> {
        let value = self.resolve(procedure)?;
        self.evaluate_with(value)
    }

    /// Freezes a manually supplied value, bypassing the source.
    pub fn evaluate_with(&mut self, value: impl Into<Value>) -> AppResult<&Value> {
        if self.is_evaluated() {
            return Err(DaqError::MetadataAlreadyEvaluated(self.name.clone()));
        }
        Ok(self.value.insert(value.into()))
    }

    /// Header form: formatted value followed by units, empty when not evaluated.
    pub fn value_string(&self) -> String {
        let Some(value) = &self.value else {
            return String::new();
        };
        let rendered = match &self.fmt {
            Some(fmt) => {
                let vars = HashMap::from([("value".to_string(), value.to_string())]);
                strfmt(fmt, &vars).unwrap_or_else(|e| {
                    warn!(metadata = %self.name, error = %e, "Invalid metadata format string");
                    value.to_string()
                })
            }
            None => value.to_string(),
        };
        match &self.units {
            Some(units) => format!("{rendered} {units}"),
            None => rendered,
        }
    }
}

/// Ordered metadata entries of one procedure instance.
#[derive(Debug, Clone, Default)]
pub struct MetadataSet {
    entries: Vec<Metadata>,
}

impl MetadataSet {
    pub fn from_templates(templates: &[Metadata]) -> Self {
        Self {
            entries: templates.to_vec(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Metadata> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Metadata> {
        self.entries.iter().find(|m| m.key == key)
    }

    pub fn by_name(&self, name: &str) -> Option<&Metadata> {
        self.entries.iter().find(|m| m.name == name)
    }

    pub(crate) fn get_mut(&mut self, key: &str) -> Option<&mut Metadata> {
        self.entries.iter_mut().find(|m| m.key == key)
    }

    pub(crate) fn push(&mut self, metadata: Metadata) {
        self.entries.push(metadata);
    }

    /// True once every entry holds a value.
    pub fn all_evaluated(&self) -> bool {
        self.entries.iter().all(Metadata::is_evaluated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parameter::Parameter;
    use crate::procedures::{Procedure, ProcedureInfo, RunContext};

    #[derive(Default)]
    struct Probe;

    impl Procedure for Probe {
        fn type_info() -> ProcedureInfo {
            ProcedureInfo::new("Probe")
                .parameter(Parameter::integer("iterations", "Loop Iterations").default(4))
                .metadata(Metadata::parameter("count", "Count", "parameters.iterations"))
                .metadata(Metadata::fixed("serial", "Serial", "SN-001"))
                .metadata(
                    Metadata::getter("temp", "Temperature", |_| Err(anyhow::anyhow!("sensor offline")))
                        .units("K")
                        .default(f64::NAN),
                )
                .metadata(Metadata::fixed("gain", "Gain", 0.123456).format("{value} (nominal)"))
        }

        fn execute(&mut self, _ctx: &mut RunContext<'_>) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn evaluates_every_source_once() {
        let mut procedure = ProcedureInstance::new(Probe).unwrap();
        procedure.evaluate_metadata().unwrap();

        let metadata = procedure.metadata();
        assert!(metadata.all_evaluated());
        assert_eq!(metadata.get("count").unwrap().value(), Some(&Value::Int(4)));
        assert_eq!(metadata.get("serial").unwrap().value_string(), "SN-001");
        assert_eq!(metadata.get("temp").unwrap().value_string(), "nan K");
        assert_eq!(metadata.get("gain").unwrap().value_string(), "0.123456 (nominal)");

        assert!(matches!(
            procedure.evaluate_metadata(),
            Err(DaqError::MetadataAlreadyEvaluated(_))
        ));
    }

    #[test]
    fn manual_override_wins() {
        let mut entry = Metadata::getter("id", "Instrument", |_| Ok(Value::from("auto")));
        entry.evaluate_with("manual").unwrap();
        assert_eq!(entry.value_string(), "manual");
        assert!(entry.evaluate_with("again").is_err());
    }
}
