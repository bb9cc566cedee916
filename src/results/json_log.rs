//! JSON accumulation format.
//!
//! The file holds one object keyed by run identifier, mapping each column to the
//! list of values recorded so far:
//!
//! ```json
//! { "2b1c…": { "x": [0, 1, 2], "trace": [0.1, 0.2, 0.3, 0.4] } }
//! ```
//!
//! Scalar values are appended and list values are concatenated. A value whose JSON
//! type differs from what the column already holds is rejected, so a file is never
//! silently corrupted.

use super::table::DataTable;
use crate::error::{AppResult, DaqError};
use crate::value::Value;
use serde_json::{Map, Value as JsonValue};
use std::fs;
use std::io::Write;
use std::path::Path;

/// JSON type name used for compatibility checks. `null` (NaN) counts as a number.
pub fn kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null | JsonValue::Number(_) => "number",
        JsonValue::Bool(_) => "bool",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

/// Merges one record into the run object.
///
/// Every column is checked before anything is modified.
pub fn merge_record(
    root: &mut Map<String, JsonValue>,
    run_id: &str,
    record: Vec<(String, JsonValue)>,
) -> AppResult<()> {
    let run = match root
        .entry(run_id.to_string())
        .or_insert_with(|| JsonValue::Object(Map::new()))
    {
        JsonValue::Object(run) => run,
        other => {
            return Err(DaqError::JsonTypeMismatch {
                column: run_id.to_string(),
                stored: kind(other).to_string(),
                received: "object".to_string(),
            })
        }
    };

    let mut staged = Vec::with_capacity(record.len());
    for (column, value) in record {
        let items = match value {
            JsonValue::Array(items) => items,
            scalar => vec![scalar],
        };
        match run.get(&column) {
            None => {}
            Some(JsonValue::Array(stored)) => {
                if let Some(first) = stored.first() {
                    if let Some(bad) = items.iter().find(|item| kind(item) != kind(first)) {
                        return Err(DaqError::JsonTypeMismatch {
                            column,
                            stored: kind(first).to_string(),
                            received: kind(bad).to_string(),
                        });
                    }
                }
            }
            Some(other) => {
                return Err(DaqError::JsonTypeMismatch {
                    column,
                    stored: kind(other).to_string(),
                    received: "array".to_string(),
                })
            }
        }
        staged.push((column, items));
    }

    for (column, items) in staged {
        if let JsonValue::Array(stored) = run
            .entry(column)
            .or_insert_with(|| JsonValue::Array(Vec::new()))
        {
            stored.extend(items);
        }
    }
    Ok(())
}

/// Reads the root object; a missing or empty file is an empty object.
pub fn read_root(path: &Path) -> AppResult<Map<String, JsonValue>> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Map::new()),
        Err(e) => return Err(e.into()),
    };
    if text.trim().is_empty() {
        return Ok(Map::new());
    }
    match serde_json::from_str(&text)? {
        JsonValue::Object(map) => Ok(map),
        other => Err(DaqError::JsonTypeMismatch {
            column: String::new(),
            stored: kind(&other).to_string(),
            received: "object".to_string(),
        }),
    }
}

/// Replaces the file contents through a temporary file and a rename, so readers
/// never observe a half-written object.
pub fn write_root(path: &Path, root: &Map<String, JsonValue>) -> AppResult<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = Path::new(&tmp);
    {
        let mut file = fs::File::create(tmp)?;
        serde_json::to_writer(&mut file, root)?;
        file.write_all(b"\n")?;
        file.sync_data()?;
    }
    fs::rename(tmp, path)?;
    Ok(())
}

/// Creates the run entry with an empty list per column.
pub fn init_run(path: &Path, run_id: &str, columns: &[String]) -> AppResult<()> {
    let mut root = read_root(path)?;
    let run: Map<String, JsonValue> = columns
        .iter()
        .map(|c| (c.clone(), JsonValue::Array(Vec::new())))
        .collect();
    root.entry(run_id.to_string())
        .or_insert(JsonValue::Object(run));
    write_root(path, &root)
}

/// Run identifiers stored in the file.
pub fn run_ids(path: &Path) -> AppResult<Vec<String>> {
    Ok(read_root(path)?.keys().cloned().collect())
}

/// Table of one run; the first run when `run_id` is `None`.
///
/// `columns` fixes the column order, otherwise columns are sorted by name.
pub fn load_table(path: &Path, run_id: Option<&str>, columns: Option<&[String]>) -> AppResult<DataTable> {
    let root = read_root(path)?;
    let run = match run_id {
        Some(id) => root.get(id),
        None => root.values().next(),
    };
    let Some(JsonValue::Object(run)) = run else {
        return Ok(DataTable::new(columns.map(<[String]>::to_vec).unwrap_or_default()));
    };

    let labels: Vec<String> = match columns {
        Some(columns) => columns.to_vec(),
        None => run.keys().cloned().collect(),
    };
    let series: Vec<Vec<Value>> = labels
        .iter()
        .map(|label| match run.get(label) {
            Some(JsonValue::Array(items)) => items.iter().map(Value::from_json).collect(),
            _ => Vec::new(),
        })
        .collect();
    let rows = series.iter().map(Vec::len).max().unwrap_or(0);

    let mut table = DataTable::new(labels);
    for index in 0..rows {
        table.push_row(
            series
                .iter()
                .map(|values| values.get(index).cloned().unwrap_or_else(Value::nan))
                .collect(),
        );
    }
    Ok(table)
}
