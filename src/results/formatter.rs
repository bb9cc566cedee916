//! Row encoding for delimited results files.
//!
//! Column labels are `"name"` or `"name (unit)"`. A value written into a column with a
//! declared unit is converted to that unit and only the magnitude is written. A value
//! that cannot be converted becomes `nan` and a warning is logged: formatting never
//! interrupts a running measurement.

use crate::error::{AppResult, DaqError};
use crate::units::{Quantity, Unit};
use crate::value::{Record, Value};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::warn;

static LABEL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(.*?)\s*\((.*)\)$").expect("valid regex"));

/// Splits `"Voltage (V)"` into `("Voltage", Some("V"))`.
pub fn split_label(label: &str) -> (&str, Option<&str>) {
    match LABEL_RE.captures(label) {
        Some(caps) => (
            caps.get(1).map_or(label, |m| m.as_str()),
            caps.get(2).map(|m| m.as_str()),
        ),
        None => (label, None),
    }
}

/// Encodes records as delimited lines in a fixed column order.
#[derive(Debug, Clone)]
pub struct CsvFormatter {
    columns: Vec<String>,
    units: Vec<Option<Unit>>,
    delimiter: u8,
    comment: u8,
}

impl CsvFormatter {
    /// Fails with a configuration error when a label's unit does not parse.
    pub fn new(columns: &[String], delimiter: u8) -> AppResult<Self> {
        let units = columns
            .iter()
            .map(|label| match split_label(label) {
                (_, Some(unit)) => Unit::parse(unit).map(Some).map_err(|_| {
                    DaqError::Configuration(format!(
                        "data column '{label}' declares an unknown unit '{unit}'"
                    ))
                }),
                (_, None) => Ok(None),
            })
            .collect::<AppResult<Vec<_>>>()?;
        Ok(Self {
            columns: columns.to_vec(),
            units,
            delimiter,
            comment: b'#',
        })
    }

    /// Formatter that treats every column as unitless, for files written by
    /// procedures this process does not know.
    pub fn without_units(columns: &[String], delimiter: u8) -> Self {
        Self {
            columns: columns.to_vec(),
            units: vec![None; columns.len()],
            delimiter,
            comment: b'#',
        }
    }

    /// Comment character readers of the file skip. Cells containing it are quoted
    /// so no data row can start with it.
    pub fn with_comment(mut self, comment: u8) -> Self {
        self.comment = comment;
        self
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn delimiter(&self) -> u8 {
        self.delimiter
    }

    pub fn comment(&self) -> u8 {
        self.comment
    }

    /// Declared unit of a column.
    pub fn unit_of(&self, label: &str) -> Option<&Unit> {
        let index = self.columns.iter().position(|c| c == label)?;
        self.units[index].as_ref()
    }

    /// Column label line, without line terminator.
    pub fn header_line(&self) -> String {
        self.encode(self.columns.iter().map(String::as_str))
    }

    /// One record as a delimited line, without line terminator.
    pub fn format(&self, record: &Record) -> String {
        let cells: Vec<String> = self
            .coerce_record(record)
            .iter()
            .map(Value::to_string)
            .collect();
        self.encode(cells.iter().map(String::as_str))
    }

    /// Values in column order after unit coercion; missing values are NaN.
    pub fn coerce_record(&self, record: &Record) -> Vec<Value> {
        self.columns
            .iter()
            .zip(&self.units)
            .map(|(label, unit)| match record.get(label) {
                None => Value::nan(),
                Some(value) => coerce(label, unit.as_ref(), value),
            })
            .collect()
    }

    fn encode<'a>(&self, cells: impl Iterator<Item = &'a str>) -> String {
        let mut writer = csv::WriterBuilder::new()
            .delimiter(self.delimiter)
            .comment(Some(self.comment))
            .terminator(csv::Terminator::Any(b'\n'))
            .from_writer(Vec::new());
        let cells: Vec<&str> = cells.collect();
        // writing into a Vec cannot fail
        let encoded = writer
            .write_record(&cells)
            .ok()
            .and_then(|()| writer.into_inner().ok())
            .unwrap_or_default();
        let mut line = String::from_utf8_lossy(&encoded).into_owned();
        if line.ends_with('\n') {
            line.pop();
        }
        line
    }
}

fn incompatible(label: &str, value: &Value, reason: &str) -> Value {
    warn!(column = %label, value = %value, reason, "Value is not compatible with the column units, writing nan");
    Value::nan()
}

fn coerce(label: &str, unit: Option<&Unit>, value: &Value) -> Value {
    let Some(unit) = unit else {
        return match value {
            Value::Quantity(q) if q.unit.is_dimensionless() => Value::Float(q.magnitude),
            other => other.clone(),
        };
    };
    match value {
        Value::Int(_) | Value::Float(_) => value.clone(),
        Value::Quantity(q) => match q.magnitude_in(unit) {
            Ok(magnitude) => Value::Float(magnitude),
            Err(e) => incompatible(label, value, &e.to_string()),
        },
        Value::Text(text) => match Quantity::parse(text).and_then(|q| q.magnitude_in(unit)) {
            Ok(magnitude) => Value::Float(magnitude),
            Err(e) => incompatible(label, value, &e.to_string()),
        },
        Value::Bool(_) | Value::List(_) => {
            incompatible(label, value, &format!("{} has no unit", value.type_name()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record;
    use tracing_test::traced_test;

    fn formatter(columns: &[&str]) -> CsvFormatter {
        let columns: Vec<String> = columns.iter().map(|c| c.to_string()).collect();
        CsvFormatter::new(&columns, b',').unwrap()
    }

    #[test]
    fn splits_labels() {
        assert_eq!(split_label("Voltage (V)"), ("Voltage", Some("V")));
        assert_eq!(split_label("x"), ("x", None));
        assert_eq!(split_label("Field (m/s^2)"), ("Field", Some("m/s^2")));
    }

    #[test]
    fn rejects_unknown_units() {
        let columns = vec!["Flux (furlongs)".to_string()];
        assert!(matches!(
            CsvFormatter::new(&columns, b','),
            Err(DaqError::Configuration(_))
        ));
    }

    #[test]
    fn formats_rows_in_column_order() {
        let f = formatter(&["x", "y (V)"]);
        assert_eq!(f.header_line(), "x,y (V)");
        assert_eq!(f.format(&record! { "y (V)" => 2.0, "x" => 2 }), "2,2.0");
        assert_eq!(f.format(&record! { "x" => 1 }), "1,nan");
    }

    #[test]
    fn converts_quantities_to_declared_units() {
        let f = formatter(&["voltage (V)"]);
        assert_eq!(f.format(&record! { "voltage (V)" => "5 kV" }), "5000.0");
        let q = Quantity::parse("250 mV").unwrap();
        assert_eq!(f.format(&record! { "voltage (V)" => q }), "0.25");
    }

    #[test]
    #[traced_test]
    fn incompatible_values_become_nan() {
        let f = formatter(&["voltage (V)"]);
        assert_eq!(f.format(&record! { "voltage (V)" => true }), "nan");
        assert_eq!(f.format(&record! { "voltage (V)" => "3 A" }), "nan");
        assert!(logs_contain("writing nan"));
    }

    #[test]
    fn quotes_cells_containing_the_delimiter() {
        let f = formatter(&["label", "n"]);
        assert_eq!(f.format(&record! { "label" => "a,b", "n" => 1 }), "\"a,b\",1");
    }

    #[test]
    fn cells_starting_with_the_comment_character_are_quoted() {
        let f = formatter(&["label", "n"]);
        assert_eq!(
            f.format(&record! { "label" => "#3 sample", "n" => 1 }),
            "\"#3 sample\",1"
        );

        let f = f.with_comment(b'%');
        assert_eq!(f.format(&record! { "label" => "%rh", "n" => 2 }), "\"%rh\",2");
    }

    #[test]
    #[traced_test]
    fn exponent_overflow_in_a_value_becomes_nan() {
        let f = formatter(&["voltage (V)"]);
        assert_eq!(f.format(&record! { "voltage (V)" => "1 V^50" }), "nan");
        assert!(logs_contain("writing nan"));
    }

    #[test]
    fn honours_custom_delimiter() {
        let columns = vec!["a".to_string(), "b".to_string()];
        let f = CsvFormatter::new(&columns, b'\t').unwrap();
        assert_eq!(f.format(&record! { "a" => 1, "b" => 0.5 }), "1\t0.5");
    }
}
