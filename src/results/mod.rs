//! File-backed record of one procedure run.
//!
//! [`Results`] owns the on-disk representation: the header (procedure type and
//! parameters), the optional metadata block, the column label line and the data
//! rows appended by the recorder. Creating a `Results` for a new file writes the
//! header immediately; opening an existing file reloads it instead, so a resumed run
//! appends to the same file.
//!
//! # Example
//!
//! ```rust,no_run
//! use rust_measure::procedures::{ProcedureRegistry, RandomProcedure, ProcedureInstance};
//! use rust_measure::results::Results;
//!
//! # fn main() -> rust_measure::error::AppResult<()> {
//! let procedure = ProcedureInstance::new(RandomProcedure::default())?;
//! let results = Results::new(procedure, "data/random.csv")?;
//! println!("{}", results.header().join("\n"));
//!
//! // later, possibly in another process
//! let registry = ProcedureRegistry::default();
//! let mut loaded = Results::load("data/random.csv", &registry)?;
//! println!("{} rows", loaded.data()?.len());
//! # Ok(())
//! # }
//! ```

pub mod formatter;
pub mod header;
pub mod json_log;
pub mod table;

pub use formatter::CsvFormatter;
pub use header::ParsedHeader;
pub use table::{DataReader, DataTable};

use crate::error::{AppResult, DaqError};
use crate::metadata::Metadata;
use crate::procedures::{Procedure, ProcedureInstance, ProcedureRegistry};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default column delimiter.
pub const DELIMITER: u8 = b',';
/// Default comment character.
pub const COMMENT: char = '#';

/// Persisted representation of the data rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultsFormat {
    /// Comment header plus delimited rows
    #[default]
    Csv,
    /// `{run_id: {column: [values]}}`
    Json,
}

impl ResultsFormat {
    /// Format implied by a file extension (`.json` or anything else).
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => ResultsFormat::Json,
            _ => ResultsFormat::Csv,
        }
    }
}

/// Options for creating a [`Results`].
pub struct ResultsBuilder {
    procedure: ProcedureInstance,
    paths: Vec<PathBuf>,
    comments: Vec<String>,
    delimiter: u8,
    comment: char,
    format: ResultsFormat,
}

impl ResultsBuilder {
    /// Additional target file; every record is written to every file.
    pub fn file(mut self, path: impl Into<PathBuf>) -> Self {
        self.paths.push(path.into());
        self
    }

    /// Free-text comment written at the top of the header.
    pub fn comment(mut self, text: impl Into<String>) -> Self {
        self.comments.push(text.into());
        self
    }

    pub fn delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }

    pub fn comment_char(mut self, comment: char) -> Self {
        self.comment = comment;
        self
    }

    pub fn format(mut self, format: ResultsFormat) -> Self {
        self.format = format;
        self
    }

    /// Writes headers to new files and reloads existing ones.
    pub fn build(self) -> AppResult<Results> {
        if self.paths.is_empty() {
            return Err(DaqError::Configuration(
                "results need at least one target file".to_string(),
            ));
        }
        if !self.comment.is_ascii() || !self.delimiter.is_ascii() {
            return Err(DaqError::Configuration(
                "delimiter and comment character must be ASCII".to_string(),
            ));
        }
        let formatter = CsvFormatter::new(&self.procedure.data_columns(), self.delimiter)?
            .with_comment(self.comment as u8);
        let run_id = Uuid::new_v4().to_string();

        let mut results = Results {
            procedure: self.procedure,
            paths: self.paths,
            formatter,
            format: self.format,
            comment: self.comment,
            comments: self.comments,
            run_id,
            header_count: 0,
            reader: None,
        };

        let mut existing = false;
        for path in &results.paths {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
            let resumed = has_content(path)?;
            existing |= resumed;
            match results.format {
                // every run gets its own key, so JSON files are always extended
                ResultsFormat::Json => {
                    json_log::init_run(path, &results.run_id, results.formatter.columns())?;
                }
                ResultsFormat::Csv if resumed => {
                    debug!(path = %path.display(), "Results file exists, reloading");
                    continue;
                }
                ResultsFormat::Csv => {
                    let mut file = fs::File::create(path)?;
                    for line in results.header() {
                        writeln!(file, "{line}")?;
                    }
                    writeln!(file, "{}", results.labels())?;
                    file.flush()?;
                }
            }
            info!(path = %path.display(), run_id = %results.run_id, resumed, "Opened results file");
        }

        results.header_count = match results.format {
            ResultsFormat::Csv => count_comment_lines(&results.paths[0], results.comment)?,
            ResultsFormat::Json => 0,
        };
        if existing {
            results.reload()?;
        }
        Ok(results)
    }
}

/// Persistent record of one procedure run.
pub struct Results {
    procedure: ProcedureInstance,
    paths: Vec<PathBuf>,
    formatter: CsvFormatter,
    format: ResultsFormat,
    comment: char,
    comments: Vec<String>,
    run_id: String,
    header_count: usize,
    reader: Option<DataReader>,
}

impl std::fmt::Debug for Results {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Results")
            .field("procedure", &self.procedure.type_id())
            .field("paths", &self.paths)
            .field("format", &self.format)
            .field("run_id", &self.run_id)
            .finish()
    }
}

impl Results {
    /// Builder with a single target file.
    pub fn builder(procedure: ProcedureInstance, path: impl Into<PathBuf>) -> ResultsBuilder {
        let path = path.into();
        ResultsBuilder {
            procedure,
            format: ResultsFormat::from_path(&path),
            paths: vec![path],
            comments: Vec::new(),
            delimiter: DELIMITER,
            comment: COMMENT,
        }
    }

    /// Results writing to one file with default options.
    pub fn new(procedure: ProcedureInstance, path: impl Into<PathBuf>) -> AppResult<Self> {
        Self::builder(procedure, path).build()
    }

    /// Results fanning out to several files.
    pub fn with_files<I, P>(procedure: ProcedureInstance, paths: I) -> AppResult<Self>
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        let mut paths = paths.into_iter().map(Into::into);
        let first = paths.next().ok_or_else(|| {
            DaqError::Configuration("results need at least one target file".to_string())
        })?;
        paths
            .fold(Self::builder(procedure, first), |builder, path| builder.file(path))
            .build()
    }

    /// Opens an existing results file, resolving its procedure type through `registry`.
    ///
    /// An unregistered type, or a header that does not match the registered type,
    /// yields an unknown-procedure placeholder holding the raw parameter strings.
    pub fn load(path: impl AsRef<Path>, registry: &ProcedureRegistry) -> AppResult<Self> {
        let path = path.as_ref();
        if ResultsFormat::from_path(path) == ResultsFormat::Json {
            return Self::load_json(path);
        }
        let parsed = read_header(path, COMMENT)?;
        let labels = read_labels(path, COMMENT, DELIMITER)?;

        let procedure = match parsed.procedure_type.as_deref() {
            Some(type_id) if registry.contains(type_id) => {
                let mut procedure = registry.create(type_id)?;
                match apply_header(&mut procedure, &parsed) {
                    Ok(()) => procedure,
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Header does not match procedure, loading as unknown");
                        placeholder(type_id, &parsed)
                    }
                }
            }
            Some(type_id) => {
                warn!(path = %path.display(), procedure = type_id, "Procedure type is not registered, loading as unknown");
                placeholder(type_id, &parsed)
            }
            None => {
                warn!(path = %path.display(), "Header names no procedure, loading as unknown");
                placeholder("", &parsed)
            }
        };
        Self::attach(procedure, path, parsed, labels)
    }

    /// Opens an existing results file as procedure type `P`, ignoring the registry.
    pub fn load_as<P: Procedure + Default>(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        let parsed = read_header(path, COMMENT)?;
        let labels = read_labels(path, COMMENT, DELIMITER)?;
        let mut procedure = ProcedureInstance::new(P::default())?;
        apply_header(&mut procedure, &parsed)?;
        Self::attach(procedure, path, parsed, labels)
    }

    fn load_json(path: &Path) -> AppResult<Self> {
        let run_id = json_log::run_ids(path)?
            .into_iter()
            .next()
            .ok_or_else(|| DaqError::HeaderParse(format!("{} holds no runs", path.display())))?;
        let table = json_log::load_table(path, Some(&run_id), None)?;
        let procedure = ProcedureInstance::unknown("", &[]);
        let mut results = Results {
            formatter: CsvFormatter::without_units(table.columns(), DELIMITER),
            procedure,
            paths: vec![path.to_path_buf()],
            format: ResultsFormat::Json,
            comment: COMMENT,
            comments: Vec::new(),
            run_id,
            header_count: 0,
            reader: None,
        };
        results.reload()?;
        Ok(results)
    }

    fn attach(
        procedure: ProcedureInstance,
        path: &Path,
        parsed: ParsedHeader,
        labels: Vec<String>,
    ) -> AppResult<Self> {
        let declared = procedure.data_columns();
        let formatter = if procedure.is_runnable() && declared == labels {
            CsvFormatter::new(&declared, DELIMITER)?
        } else {
            if procedure.is_runnable() {
                warn!(path = %path.display(), ?declared, file = ?labels, "Column labels differ from the procedure declaration");
            }
            CsvFormatter::new(&labels, DELIMITER)
                .unwrap_or_else(|_| CsvFormatter::without_units(&labels, DELIMITER))
        };
        let mut results = Results {
            procedure,
            paths: vec![path.to_path_buf()],
            formatter,
            format: ResultsFormat::Csv,
            comment: COMMENT,
            comments: parsed.comments,
            run_id: Uuid::new_v4().to_string(),
            header_count: count_comment_lines(path, COMMENT)?,
            reader: None,
        };
        results.reload()?;
        Ok(results)
    }

    /// Header comment block, one line per entry, comment characters included.
    pub fn header(&self) -> Vec<String> {
        header::render_header(&self.procedure, &self.comments, self.comment)
    }

    /// Column label line.
    pub fn labels(&self) -> String {
        self.formatter.header_line()
    }

    /// Encodes one record as a data line.
    pub fn format(&self, record: &crate::value::Record) -> String {
        self.formatter.format(record)
    }

    /// Number of comment lines before the column labels.
    pub fn header_count(&self) -> usize {
        self.header_count
    }

    /// Splices the evaluated metadata block into every target file, right before
    /// the column labels.
    ///
    /// Returns `Ok(false)` when there is nothing to store, the format has no header,
    /// or the block is already present. Fails with [`DaqError::MetadataAfterData`]
    /// once any data row exists, leaving every file untouched.
    pub fn store_metadata(&mut self) -> AppResult<bool> {
        if self.procedure.metadata().is_empty() || self.format == ResultsFormat::Json {
            return Ok(false);
        }
        if !self.procedure.metadata().all_evaluated() {
            return Err(DaqError::Configuration(
                "metadata must be evaluated before it is stored".to_string(),
            ));
        }
        let marker = format!("{}{}", self.comment, header::METADATA_LINE);
        let block = header::render_metadata(&self.procedure, self.comment);

        let mut rewrites = Vec::with_capacity(self.paths.len());
        for path in &self.paths {
            let text = fs::read_to_string(path)?;
            let lines: Vec<&str> = text.lines().collect();
            if lines.iter().any(|line| *line == marker) {
                debug!(path = %path.display(), "Metadata block already present");
                return Ok(false);
            }
            let label_index = lines
                .iter()
                .position(|line| !line.starts_with(self.comment))
                .unwrap_or(lines.len());
            if lines[label_index..].iter().skip(1).any(|line| !line.is_empty()) {
                return Err(DaqError::MetadataAfterData(path.display().to_string()));
            }
            let mut spliced: Vec<String> = lines[..label_index].iter().map(|l| l.to_string()).collect();
            spliced.extend(block.iter().cloned());
            spliced.extend(lines[label_index..].iter().map(|l| l.to_string()));
            rewrites.push((path.clone(), spliced));
        }

        // the recorder opens its appenders on the first row, so no handle
        // points at the file being replaced
        for (path, lines) in rewrites {
            let tmp = splice_path(&path);
            {
                let mut file = fs::File::create(&tmp)?;
                for line in &lines {
                    writeln!(file, "{line}")?;
                }
                file.sync_data()?;
            }
            fs::rename(&tmp, &path)?;
        }
        self.header_count += block.len();
        info!(run_id = %self.run_id, entries = self.procedure.metadata().len(), "Stored metadata");
        Ok(true)
    }

    /// Cumulative data table, reading only rows appended since the last call.
    pub fn data(&mut self) -> AppResult<&DataTable> {
        if self.reader.is_none() {
            self.reader = Some(self.reader());
        }
        match self.reader.as_mut() {
            Some(reader) => reader.read(),
            None => Err(DaqError::WorkerState("results reader unavailable".to_string())),
        }
    }

    /// Discards cached rows and parses the whole file again.
    pub fn reload(&mut self) -> AppResult<&DataTable> {
        self.reader = Some(self.reader());
        self.data()
    }

    /// A new, independent tail reader over the first target file.
    pub fn reader(&self) -> DataReader {
        let reader = DataReader::new(
            self.paths[0].clone(),
            self.format,
            self.formatter.delimiter(),
            self.comment as u8,
        );
        match self.format {
            ResultsFormat::Csv => reader,
            ResultsFormat::Json => reader
                .for_run(self.run_id.clone())
                .with_columns(self.formatter.columns().to_vec()),
        }
    }

    pub fn procedure(&self) -> &ProcedureInstance {
        &self.procedure
    }

    pub fn procedure_mut(&mut self) -> &mut ProcedureInstance {
        &mut self.procedure
    }

    pub fn into_procedure(self) -> ProcedureInstance {
        self.procedure
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    pub fn formatter(&self) -> &CsvFormatter {
        &self.formatter
    }

    pub fn results_format(&self) -> ResultsFormat {
        self.format
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }
}

fn has_content(path: &Path) -> AppResult<bool> {
    match fs::metadata(path) {
        Ok(meta) => Ok(meta.len() > 0),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Sibling file the metadata splice is written to before it replaces `path`.
fn splice_path(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

/// Leading comment lines with the comment character stripped.
fn read_header(path: &Path, comment: char) -> AppResult<ParsedHeader> {
    let file = fs::File::open(path)?;
    let mut lines = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        match line.strip_prefix(comment) {
            Some(rest) => lines.push(rest.to_string()),
            None => break,
        }
    }
    Ok(header::parse_header(&lines))
}

fn count_comment_lines(path: &Path, comment: char) -> AppResult<usize> {
    let file = fs::File::open(path)?;
    let mut count = 0;
    for line in BufReader::new(file).lines() {
        if !line?.starts_with(comment) {
            break;
        }
        count += 1;
    }
    Ok(count)
}

/// Column labels: the first non-comment line.
fn read_labels(path: &Path, comment: char, delimiter: u8) -> AppResult<Vec<String>> {
    let file = fs::File::open(path)?;
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .comment(Some(comment as u8))
        .has_headers(true)
        .from_reader(file);
    Ok(reader.headers()?.iter().map(str::to_string).collect())
}

fn placeholder(type_id: &str, parsed: &ParsedHeader) -> ProcedureInstance {
    let mut procedure = ProcedureInstance::unknown(type_id, &parsed.parameters);
    restore_metadata(&mut procedure, parsed);
    procedure
}

/// Sets parameters from their header strings, then canonicalizes them.
fn apply_header(procedure: &mut ProcedureInstance, parsed: &ParsedHeader) -> AppResult<()> {
    let names: Vec<(String, String)> = procedure
        .parameters()
        .iter()
        .map(|p| (p.key().to_string(), p.name().to_string()))
        .collect();
    for (key, name) in names {
        match parsed.parameter(&name) {
            Some(raw) if raw.is_empty() => {}
            Some(raw) => procedure
                .parameters_mut()
                .set_from_str(&key, raw)
                .map_err(|e| DaqError::HeaderParse(format!("parameter '{name}': {e}")))?,
            None => warn!(parameter = %name, "Parameter missing from header, using default"),
        }
    }
    procedure.parameters_mut().refresh()?;
    restore_metadata(procedure, parsed);
    Ok(())
}

fn restore_metadata(procedure: &mut ProcedureInstance, parsed: &ParsedHeader) {
    for (name, raw) in &parsed.metadata {
        let metadata = procedure.metadata_mut();
        let key = metadata.by_name(name).map(|m| m.key().to_string());
        let restored = match key.as_deref().and_then(|k| metadata.get_mut(k)) {
            Some(entry) => {
                let text = entry
                    .unit_text()
                    .and_then(|units| raw.strip_suffix(units))
                    .map_or(raw.as_str(), str::trim_end);
                entry.evaluate_with(Value::Text(text.to_string())).is_ok()
            }
            None => {
                let mut entry = Metadata::fixed(name.clone(), name.clone(), raw.clone());
                let evaluated = entry.evaluate_with(raw.clone()).is_ok();
                metadata.push(entry);
                evaluated
            }
        };
        if !restored {
            warn!(metadata = %name, "Metadata appears twice in header");
        }
    }
}

/// Procedure type named in a results file header, without loading data.
pub fn peek_procedure_type(path: impl AsRef<Path>) -> AppResult<Option<String>> {
    Ok(read_header(path.as_ref(), COMMENT)?.procedure_type)
}
