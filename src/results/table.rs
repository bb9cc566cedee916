//! In-memory data tables and incremental tailing of growing results files.
//!
//! A [`DataReader`] keeps its own cached table. Every read re-opens the file, skips
//! the comment block, the column label line and the rows it has already cached, and
//! appends only what is new. Only complete (newline-terminated) lines are consumed,
//! so a row that is half-written when the read happens is picked up by the next read.

use super::json_log;
use super::ResultsFormat;
use crate::error::AppResult;
use crate::value::{parse_cell, Record, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

/// Rows of values under named columns.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DataTable {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

impl DataTable {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Appends a row; short rows are padded with NaN.
    pub fn push_row(&mut self, mut row: Vec<Value>) {
        row.resize(self.columns.len(), Value::nan());
        self.rows.push(row);
    }

    /// All values of one column.
    pub fn column(&self, label: &str) -> Option<Vec<&Value>> {
        let index = self.columns.iter().position(|c| c == label)?;
        Some(self.rows.iter().map(|row| &row[index]).collect())
    }

    /// Numeric view of one column; non-numeric cells become NaN.
    pub fn column_f64(&self, label: &str) -> Option<Vec<f64>> {
        self.column(label)
            .map(|values| values.into_iter().map(|v| v.as_f64().unwrap_or(f64::NAN)).collect())
    }

    /// One row as a record.
    pub fn record(&self, index: usize) -> Option<Record> {
        let row = self.rows.get(index)?;
        Some(self.columns.iter().cloned().zip(row.iter().cloned()).collect())
    }

    pub fn records(&self) -> impl Iterator<Item = Record> + '_ {
        (0..self.rows.len()).filter_map(|i| self.record(i))
    }
}

/// Independent tail reader over one results file.
#[derive(Debug, Clone)]
pub struct DataReader {
    path: PathBuf,
    format: ResultsFormat,
    delimiter: u8,
    comment: u8,
    run_id: Option<String>,
    columns: Option<Vec<String>>,
    table: Option<DataTable>,
}

impl DataReader {
    pub fn new(path: impl Into<PathBuf>, format: ResultsFormat, delimiter: u8, comment: u8) -> Self {
        Self {
            path: path.into(),
            format,
            delimiter,
            comment,
            run_id: None,
            columns: None,
            table: None,
        }
    }

    /// Restrict a JSON reader to one run.
    pub fn for_run(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    /// Column order for JSON files, which do not store one.
    pub fn with_columns(mut self, columns: Vec<String>) -> Self {
        self.columns = Some(columns);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rows cached so far.
    pub fn cached_rows(&self) -> usize {
        self.table.as_ref().map_or(0, DataTable::len)
    }

    /// Drops the cache so the next read parses the whole file.
    pub fn reset(&mut self) {
        self.table = None;
    }

    /// Full parse, discarding the cache.
    pub fn reload(&mut self) -> AppResult<&DataTable> {
        self.reset();
        self.read()
    }

    /// Cumulative table including any rows appended since the last read.
    pub fn read(&mut self) -> AppResult<&DataTable> {
        match self.format {
            ResultsFormat::Csv => self.read_csv()?,
            ResultsFormat::Json => {
                let table = json_log::load_table(&self.path, self.run_id.as_deref(), self.columns.as_deref())?;
                self.table = Some(table);
            }
        }
        Ok(self.table.get_or_insert_with(DataTable::default))
    }

    fn read_csv(&mut self) -> AppResult<()> {
        let bytes = fs::read(&self.path)?;
        let complete = match bytes.iter().rposition(|b| *b == b'\n') {
            Some(last) => &bytes[..=last],
            None => {
                trace!(path = %self.path.display(), "No complete line yet");
                return Ok(());
            }
        };

        let mut reader = csv::ReaderBuilder::new()
            .delimiter(self.delimiter)
            .comment(Some(self.comment))
            .has_headers(true)
            .from_reader(complete);
        let columns: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
        if columns.is_empty() {
            return Ok(());
        }

        let stale = self
            .table
            .as_ref()
            .is_some_and(|table| table.columns() != columns.as_slice());
        if stale {
            debug!(path = %self.path.display(), "Column labels changed, reloading");
            self.table = None;
        }
        let table = self.table.get_or_insert_with(|| DataTable::new(columns));

        let skip = table.len();
        let mut added = 0usize;
        for row in reader.records().skip(skip) {
            let row = row?;
            table.push_row(row.iter().map(parse_cell).collect());
            added += 1;
        }
        if added > 0 {
            trace!(path = %self.path.display(), added, total = table.len(), "Read new rows");
        }
        Ok(())
    }
}
