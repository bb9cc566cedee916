//! Typed, validated procedure parameters.
//!
//! A [`Parameter`] is declared once on a procedure type (as a template inside
//! `ProcedureInfo`) and snapshotted into every `ProcedureInstance`, where its value can
//! be changed independently. Values are validated and converted on assignment, never
//! on read, and every parameter has a canonical string form (`"<value>[ <units>]"`)
//! that the results header stores and [`Parameter::set_from_str`] reads back.
//!
//! # Example
//!
//! ```rust
//! use rust_measure::parameter::Parameter;
//!
//! let mut delay = Parameter::float("delay", "Delay Time")
//!     .units("s")
//!     .range(0.0, 10.0)
//!     .default(0.2);
//!
//! delay.set_from_str("250 ms").unwrap();
//! assert_eq!(delay.value_string(), "0.25 s");
//! assert!(delay.set(42.0).is_err()); // out of range
//! ```

use crate::error::{AppResult, DaqError};
use crate::units::{Quantity, Unit};
use crate::value::Value;
use std::fmt;

// =============================================================================
// ParameterKind
// =============================================================================

/// Validation rules for each kind of parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum ParameterKind {
    /// Free text
    Text,
    /// Whole number within an inclusive range
    Integer {
        minimum: i64,
        maximum: i64,
        step: Option<i64>,
    },
    /// Real number within an inclusive range
    Float {
        minimum: f64,
        maximum: f64,
        decimals: usize,
    },
    /// True/false flag
    Boolean,
    /// One of a fixed set of values
    Choice { choices: Vec<Value> },
    /// List of real numbers, optionally of fixed length
    Vector { length: Option<usize> },
}

impl fmt::Display for ParameterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterKind::Text => write!(f, "text"),
            ParameterKind::Integer { minimum, maximum, .. } => {
                write!(f, "integer [{minimum}, {maximum}]")
            }
            ParameterKind::Float { minimum, maximum, .. } => write!(
                f,
                "float [{}, {}]",
                crate::value::format_float(*minimum),
                crate::value::format_float(*maximum)
            ),
            ParameterKind::Boolean => write!(f, "boolean"),
            ParameterKind::Choice { choices } => {
                let names: Vec<String> = choices.iter().map(Value::to_string).collect();
                write!(f, "choice {{{}}}", names.join(", "))
            }
            ParameterKind::Vector { length: Some(n) } => write!(f, "vector[{n}]"),
            ParameterKind::Vector { length: None } => write!(f, "vector"),
        }
    }
}

// =============================================================================
// Parameter
// =============================================================================

/// A named, typed value with validation and an optional physical unit.
#[derive(Debug, Clone)]
pub struct Parameter {
    key: String,
    name: String,
    kind: ParameterKind,
    units: Option<String>,
    default: Option<Value>,
    description: Option<String>,
    value: Option<Value>,
}

impl Parameter {
    fn with_kind(key: impl Into<String>, name: impl Into<String>, kind: ParameterKind) -> Self {
        Self {
            key: key.into(),
            name: name.into(),
            kind,
            units: None,
            default: None,
            description: None,
            value: None,
        }
    }

    /// Free-text parameter.
    pub fn text(key: impl Into<String>, name: impl Into<String>) -> Self {
        Self::with_kind(key, name, ParameterKind::Text)
    }

    /// Integer parameter, range defaults to ±1e9.
    pub fn integer(key: impl Into<String>, name: impl Into<String>) -> Self {
        Self::with_kind(
            key,
            name,
            ParameterKind::Integer {
                minimum: -1_000_000_000,
                maximum: 1_000_000_000,
                step: None,
            },
        )
    }

    /// Float parameter, range defaults to ±1e9.
    pub fn float(key: impl Into<String>, name: impl Into<String>) -> Self {
        Self::with_kind(
            key,
            name,
            ParameterKind::Float {
                minimum: -1e9,
                maximum: 1e9,
                decimals: 15,
            },
        )
    }

    /// Boolean parameter.
    pub fn boolean(key: impl Into<String>, name: impl Into<String>) -> Self {
        Self::with_kind(key, name, ParameterKind::Boolean)
    }

    /// Parameter restricted to `choices`.
    pub fn choice<T: Into<Value>>(
        key: impl Into<String>,
        name: impl Into<String>,
        choices: impl IntoIterator<Item = T>,
    ) -> Self {
        Self::with_kind(
            key,
            name,
            ParameterKind::Choice {
                choices: choices.into_iter().map(Into::into).collect(),
            },
        )
    }

    /// Vector-of-floats parameter.
    pub fn vector(key: impl Into<String>, name: impl Into<String>) -> Self {
        Self::with_kind(key, name, ParameterKind::Vector { length: None })
    }

    /// Set the default value. It is validated when a procedure instance is created.
    pub fn default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    /// Set the physical unit.
    pub fn units(mut self, units: impl Into<String>) -> Self {
        self.units = Some(units.into());
        self
    }

    /// Set the description (tooltips, CLI listing).
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Set an inclusive numeric range. Ignored for non-numeric kinds.
    pub fn range(mut self, min: f64, max: f64) -> Self {
        match &mut self.kind {
            ParameterKind::Integer { minimum, maximum, .. } => {
                *minimum = min.ceil() as i64;
                *maximum = max.floor() as i64;
            }
            ParameterKind::Float { minimum, maximum, .. } => {
                *minimum = min;
                *maximum = max;
            }
            _ => {}
        }
        self
    }

    /// Set the display step of an integer parameter.
    pub fn step(mut self, value: i64) -> Self {
        if let ParameterKind::Integer { step, .. } = &mut self.kind {
            *step = Some(value);
        }
        self
    }

    /// Set the display precision of a float parameter.
    pub fn decimals(mut self, value: usize) -> Self {
        if let ParameterKind::Float { decimals, .. } = &mut self.kind {
            *decimals = value;
        }
        self
    }

    /// Require a vector parameter to have exactly `n` elements.
    pub fn length(mut self, n: usize) -> Self {
        if let ParameterKind::Vector { length } = &mut self.kind {
            *length = Some(n);
        }
        self
    }

    /// Attribute-style identifier (e.g. `iterations`).
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Human-readable name written to the results header (e.g. `Loop Iterations`).
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &ParameterKind {
        &self.kind
    }

    pub fn unit_text(&self) -> Option<&str> {
        self.units.as_deref()
    }

    pub fn description_text(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn default_value(&self) -> Option<&Value> {
        self.default.as_ref()
    }

    /// Current value, `None` when unset.
    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    pub fn is_set(&self) -> bool {
        self.value.is_some()
    }

    /// Current value or [`DaqError::ParameterNotSet`].
    pub fn get(&self) -> AppResult<&Value> {
        self.value
            .as_ref()
            .ok_or_else(|| DaqError::ParameterNotSet(self.key.clone()))
    }

    /// Validate, convert and store `value`. On error the previous value is kept.
    pub fn set(&mut self, value: impl Into<Value>) -> AppResult<()> {
        let converted = self.convert(value.into())?;
        self.value = Some(converted);
        Ok(())
    }

    /// Parse the canonical string form (as written in a results header).
    pub fn set_from_str(&mut self, text: &str) -> AppResult<()> {
        self.set(Value::Text(text.to_string()))
    }

    /// Reset to the default value, or to unset if there is none.
    pub fn reset(&mut self) -> AppResult<()> {
        match self.default.clone() {
            Some(default) => self.set(default),
            None => {
                self.value = None;
                Ok(())
            }
        }
    }

    /// Canonical string form: value followed by units, empty when unset.
    pub fn value_string(&self) -> String {
        match (&self.value, &self.units) {
            (None, _) => String::new(),
            (Some(value), Some(units)) => format!("{value} {units}"),
            (Some(value), None) => value.to_string(),
        }
    }

    /// Validate and convert `value` into this parameter's canonical representation.
    pub fn convert(&self, value: Value) -> AppResult<Value> {
        match &self.kind {
            ParameterKind::Text => Ok(match value {
                Value::Text(text) => Value::Text(text),
                other => Value::Text(other.to_string()),
            }),
            ParameterKind::Integer {
                minimum, maximum, ..
            } => {
                let number = self.integer_input(&value)?;
                if number < *minimum || number > *maximum {
                    return Err(self.invalid(format!(
                        "value {number} is out of range [{minimum}, {maximum}]"
                    )));
                }
                Ok(Value::Int(number))
            }
            ParameterKind::Float {
                minimum, maximum, ..
            } => {
                let number = self.float_input(&value)?;
                if number.is_nan() || number < *minimum || number > *maximum {
                    return Err(self.invalid(format!(
                        "value {} is out of range [{}, {}]",
                        crate::value::format_float(number),
                        crate::value::format_float(*minimum),
                        crate::value::format_float(*maximum)
                    )));
                }
                Ok(Value::Float(number))
            }
            ParameterKind::Boolean => self.boolean_input(&value).map(Value::Bool),
            ParameterKind::Choice { choices } => self.choice_input(value, choices),
            ParameterKind::Vector { length } => {
                let items = self.vector_input(&value)?;
                if let Some(expected) = length {
                    if items.len() != *expected {
                        return Err(self.invalid(format!(
                            "expected {expected} elements, got {}",
                            items.len()
                        )));
                    }
                }
                Ok(Value::List(items.into_iter().map(Value::Float).collect()))
            }
        }
    }

    fn invalid(&self, reason: impl Into<String>) -> DaqError {
        DaqError::validation(self.name.clone(), reason)
    }

    /// Strips this parameter's unit suffix from text input, if present.
    fn strip_units<'a>(&self, text: &'a str) -> &'a str {
        let text = text.trim();
        match &self.units {
            Some(units) => text
                .strip_suffix(units.as_str())
                .map(str::trim_end)
                .filter(|rest| !rest.is_empty())
                .unwrap_or(text),
            None => text,
        }
    }

    fn quantity_in_units(&self, quantity: &Quantity) -> AppResult<f64> {
        let target = match &self.units {
            Some(units) => Unit::parse(units)?,
            None => Unit::dimensionless(),
        };
        quantity
            .magnitude_in(&target)
            .map_err(|e| self.invalid(e.to_string()))
    }

    fn float_input(&self, value: &Value) -> AppResult<f64> {
        match value {
            Value::Int(v) => Ok(*v as f64),
            Value::Float(v) => Ok(*v),
            Value::Quantity(q) => self.quantity_in_units(q),
            Value::Text(text) => {
                let stripped = self.strip_units(text);
                if let Ok(number) = stripped.parse::<f64>() {
                    return Ok(number);
                }
                let quantity = Quantity::parse(text)
                    .map_err(|_| self.invalid(format!("'{text}' is not a number")))?;
                self.quantity_in_units(&quantity)
            }
            other => Err(self.invalid(format!("expected a number, got {}", other.type_name()))),
        }
    }

    fn integer_input(&self, value: &Value) -> AppResult<i64> {
        if let Value::Text(text) = value {
            if let Ok(number) = self.strip_units(text).parse::<i64>() {
                return Ok(number);
            }
        }
        if let Value::Int(v) = value {
            return Ok(*v);
        }
        let number = self.float_input(value)?;
        if number.fract() != 0.0 || !number.is_finite() {
            return Err(self.invalid(format!(
                "{} is not an integer",
                crate::value::format_float(number)
            )));
        }
        Ok(number as i64)
    }

    fn boolean_input(&self, value: &Value) -> AppResult<bool> {
        match value {
            Value::Bool(v) => Ok(*v),
            Value::Int(0) => Ok(false),
            Value::Int(1) => Ok(true),
            Value::Text(text) => match text.trim().to_ascii_lowercase().as_str() {
                "true" | "1" => Ok(true),
                "false" | "0" => Ok(false),
                _ => Err(self.invalid(format!("'{text}' is not a boolean"))),
            },
            other => Err(self.invalid(format!("{other} is not a boolean"))),
        }
    }

    fn choice_input(&self, value: Value, choices: &[Value]) -> AppResult<Value> {
        let matched = match &value {
            Value::Text(text) => {
                let stripped = self.strip_units(text);
                choices
                    .iter()
                    .find(|choice| choice.to_string() == stripped || choice.to_string() == text.trim())
            }
            other => choices.iter().find(|choice| {
                *choice == other
                    || matches!((choice.as_f64(), other.as_f64()), (Some(a), Some(b)) if a == b)
            }),
        };
        matched.cloned().ok_or_else(|| {
            let names: Vec<String> = choices.iter().map(Value::to_string).collect();
            self.invalid(format!("{value} is not one of [{}]", names.join(", ")))
        })
    }

    fn vector_input(&self, value: &Value) -> AppResult<Vec<f64>> {
        match value {
            Value::List(items) => items.iter().map(|item| self.float_input(item)).collect(),
            Value::Text(text) => {
                let inner = self.strip_units(text);
                let inner = inner
                    .strip_prefix('[')
                    .and_then(|rest| rest.strip_suffix(']'))
                    .ok_or_else(|| self.invalid(format!("'{text}' is not a vector like [1, 2]")))?;
                if inner.trim().is_empty() {
                    return Ok(Vec::new());
                }
                inner
                    .split(',')
                    .map(|item| {
                        item.trim()
                            .parse::<f64>()
                            .map_err(|_| self.invalid(format!("'{}' is not a number", item.trim())))
                    })
                    .collect()
            }
            other => Err(self.invalid(format!("expected a vector, got {}", other.type_name()))),
        }
    }
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value_string())
    }
}

// =============================================================================
// ParameterSet
// =============================================================================

/// Ordered collection of parameters belonging to one procedure instance.
#[derive(Debug, Clone, Default)]
pub struct ParameterSet {
    parameters: Vec<Parameter>,
}

impl ParameterSet {
    /// Snapshot templates, applying their defaults.
    pub fn from_templates(templates: &[Parameter]) -> AppResult<Self> {
        let mut parameters = Vec::with_capacity(templates.len());
        for template in templates {
            let mut parameter = template.clone();
            parameter.reset().map_err(|e| {
                DaqError::Configuration(format!("default of parameter '{}' is invalid: {e}", template.key))
            })?;
            parameters.push(parameter);
        }
        Ok(Self { parameters })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Parameter> {
        self.parameters.iter()
    }

    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    /// Add a parameter after construction (used for placeholder procedures).
    pub fn push(&mut self, parameter: Parameter) {
        self.parameters.push(parameter);
    }

    pub fn parameter(&self, key: &str) -> Option<&Parameter> {
        self.parameters.iter().find(|p| p.key == key)
    }

    fn parameter_mut(&mut self, key: &str) -> AppResult<&mut Parameter> {
        self.parameters
            .iter_mut()
            .find(|p| p.key == key)
            .ok_or_else(|| DaqError::UnknownParameter(key.to_string()))
    }

    /// Look a parameter up by its header name.
    pub fn by_name(&self, name: &str) -> Option<&Parameter> {
        self.parameters.iter().find(|p| p.name == name)
    }

    pub fn get(&self, key: &str) -> AppResult<&Value> {
        self.parameter(key)
            .ok_or_else(|| DaqError::UnknownParameter(key.to_string()))?
            .get()
    }

    pub fn get_i64(&self, key: &str) -> AppResult<i64> {
        let value = self.get(key)?;
        value
            .as_i64()
            .ok_or_else(|| DaqError::validation(key, format!("{value} is not an integer")))
    }

    pub fn get_f64(&self, key: &str) -> AppResult<f64> {
        let value = self.get(key)?;
        value
            .as_f64()
            .ok_or_else(|| DaqError::validation(key, format!("{value} is not a number")))
    }

    pub fn get_bool(&self, key: &str) -> AppResult<bool> {
        let value = self.get(key)?;
        value
            .as_bool()
            .ok_or_else(|| DaqError::validation(key, format!("{value} is not a boolean")))
    }

    pub fn get_str(&self, key: &str) -> AppResult<String> {
        Ok(self.get(key)?.to_string())
    }

    pub fn get_vector(&self, key: &str) -> AppResult<Vec<f64>> {
        let value = self.get(key)?;
        value
            .as_list()
            .and_then(|items| items.iter().map(Value::as_f64).collect())
            .ok_or_else(|| DaqError::validation(key, format!("{value} is not a vector")))
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) -> AppResult<()> {
        self.parameter_mut(key)?.set(value)
    }

    pub fn set_from_str(&mut self, key: &str, text: &str) -> AppResult<()> {
        self.parameter_mut(key)?.set_from_str(text)
    }

    /// Assign several parameters; stops at the first invalid one.
    pub fn set_parameters<K, V>(&mut self, values: impl IntoIterator<Item = (K, V)>) -> AppResult<()>
    where
        K: AsRef<str>,
        V: Into<Value>,
    {
        for (key, value) in values {
            self.set(key.as_ref(), value)?;
        }
        Ok(())
    }

    /// Keys of parameters that have no value.
    pub fn missing(&self) -> Vec<String> {
        self.parameters
            .iter()
            .filter(|p| !p.is_set())
            .map(|p| p.key.clone())
            .collect()
    }

    /// Re-run every set value through its own conversion so stored values are
    /// canonical (e.g. `"5"` text becomes the integer 5).
    pub fn refresh(&mut self) -> AppResult<()> {
        for parameter in &mut self.parameters {
            if let Some(value) = parameter.value.clone() {
                let converted = parameter.convert(value)?;
                parameter.value = Some(converted);
            }
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parameter_basic() {
        let mut param = Parameter::float("test", "Test").default(42.0);
        param.reset().unwrap();
        assert_eq!(param.get().unwrap(), &Value::Float(42.0));

        param.set(100.0).unwrap();
        assert_eq!(param.get().unwrap(), &Value::Float(100.0));
    }

    #[test]
    fn test_unset_parameter_errors_on_read() {
        let param = Parameter::integer("iterations", "Loop Iterations");
        assert!(!param.is_set());
        assert!(matches!(param.get(), Err(DaqError::ParameterNotSet(key)) if key == "iterations"));
        assert_eq!(param.value_string(), "");
    }

    #[test]
    fn test_parameter_range_validation() {
        let mut param = Parameter::integer("n", "Count").range(0.0, 100.0);

        assert!(param.set(50).is_ok());
        assert!(param.set(150).is_err());
        assert!(param.set(-10).is_err());
        // failed assignment keeps the previous value
        assert_eq!(param.get().unwrap(), &Value::Int(50));
        assert!(param.set(2.5).is_err());
        assert_eq!(param.get().unwrap(), &Value::Int(50));
    }

    #[test]
    fn test_integer_accepts_text_with_units() {
        let mut param = Parameter::integer("steps", "Steps").units("V");
        param.set_from_str("5 V").unwrap();
        assert_eq!(param.get().unwrap(), &Value::Int(5));
        assert_eq!(param.value_string(), "5 V");
    }

    #[test]
    fn test_float_converts_quantities() {
        let mut param = Parameter::float("bias", "Bias").units("V");
        param.set_from_str("2 kV").unwrap();
        assert_eq!(param.get().unwrap(), &Value::Float(2000.0));

        assert!(param.set_from_str("3 A").is_err());
        param
            .set(Value::Quantity(Quantity::parse("500 mV").unwrap()))
            .unwrap();
        assert_eq!(param.value_string(), "0.5 V");
    }

    #[test]
    fn test_unit_exponent_overflow_is_a_validation_error() {
        let mut param = Parameter::float("bias", "Bias").units("V").default(1.0);
        param.reset().unwrap();
        assert!(matches!(
            param.set_from_str("1 V^50"),
            Err(DaqError::ParameterValidation { .. })
        ));
        assert_eq!(param.get().unwrap(), &Value::Float(1.0));
    }

    #[test]
    fn test_parameter_choices() {
        let mut param = Parameter::choice("mode", "Mode", ["auto", "manual"]);

        assert!(param.set("manual").is_ok());
        assert!(param.set("invalid").is_err());

        let mut range = Parameter::choice("range", "Range", [1, 10, 100]).units("V");
        range.set_from_str("10 V").unwrap();
        assert_eq!(range.get().unwrap(), &Value::Int(10));
        range.set(100.0).unwrap();
        assert_eq!(range.get().unwrap(), &Value::Int(100));
    }

    #[test]
    fn test_boolean_parsing() {
        let mut param = Parameter::boolean("flag", "Flag");
        param.set_from_str("TRUE").unwrap();
        assert_eq!(param.value_string(), "True");
        param.set_from_str("False").unwrap();
        assert_eq!(param.get().unwrap(), &Value::Bool(false));
        param.set(1).unwrap();
        assert_eq!(param.get().unwrap(), &Value::Bool(true));
        assert!(param.set_from_str("yes").is_err());
        assert!(param.set(2.0).is_err());
    }

    #[test]
    fn test_vector_round_trip() {
        let mut param = Parameter::vector("points", "Points").length(3);
        param.set(vec![1.0, 2.0, 3.5]).unwrap();
        let text = param.value_string();
        assert_eq!(text, "[1.0, 2.0, 3.5]");

        let mut other = Parameter::vector("points", "Points").length(3);
        other.set_from_str(&text).unwrap();
        assert_eq!(other.get().unwrap(), param.get().unwrap());
        assert!(other.set(vec![1.0]).is_err());
        assert!(other.set_from_str("1, 2, 3").is_err());
    }

    #[test]
    fn test_text_keeps_control_characters() {
        let mut param = Parameter::text("note", "Note");
        param.set("line one\nline two").unwrap();
        assert_eq!(param.value_string(), "line one\nline two");
        param.set(5).unwrap();
        assert_eq!(param.get().unwrap(), &Value::Text("5".into()));
    }

    #[test]
    fn test_parameter_set_defaults_and_missing() {
        let templates = vec![
            Parameter::integer("iterations", "Loop Iterations").default(3),
            Parameter::float("delay", "Delay Time").units("s"),
        ];
        let mut set = ParameterSet::from_templates(&templates).unwrap();
        assert_eq!(set.get_i64("iterations").unwrap(), 3);
        assert_eq!(set.missing(), vec!["delay".to_string()]);

        set.set_parameters([("delay", 0.5)]).unwrap();
        assert!(set.missing().is_empty());
        assert_eq!(set.by_name("Delay Time").unwrap().value_string(), "0.5 s");
        assert!(matches!(set.set("nope", 1), Err(DaqError::UnknownParameter(_))));
    }

    #[test]
    fn test_invalid_default_is_a_configuration_error() {
        let templates = vec![Parameter::integer("n", "N").range(1.0, 5.0).default(10)];
        assert!(matches!(
            ParameterSet::from_templates(&templates),
            Err(DaqError::Configuration(_))
        ));
    }

    #[test]
    fn test_refresh_canonicalizes() {
        let templates = vec![Parameter::float("delay", "Delay Time").units("s").default(1)];
        let mut set = ParameterSet::from_templates(&templates).unwrap();
        set.refresh().unwrap();
        assert_eq!(set.get("delay").unwrap(), &Value::Float(1.0));
        assert_eq!(set.by_name("Delay Time").unwrap().value_string(), "1.0 s");
    }
}
