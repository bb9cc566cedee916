//! Configuration System using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (`config/default.toml` unless another path is given)
//! 2. environment variables prefixed with `RUST_MEASURE_`, nested with `__`
//!
//! Every field has a default, so a missing file yields a usable configuration.
//!
//! # Example
//! ```no_run
//! use rust_measure::config::Settings;
//!
//! let settings = Settings::load()?;
//! settings.validate()?;
//! println!("Writing results to {}", settings.results.output_dir.display());
//! # Ok::<(), rust_measure::error::DaqError>(())
//! ```
//!
//! Environment example: `RUST_MEASURE_WORKER__JOIN_TIMEOUT_MS=10000`.

use crate::error::{AppResult, DaqError};
use crate::logging::{parse_log_level, LoggingConfig, OutputFormat};
use crate::results::ResultsFormat;
use crate::worker::WorkerConfig;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub results: ResultsSettings,
    pub worker: WorkerSettings,
}

/// Logging output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// trace, debug, info, warn or error
    pub level: String,
    /// pretty, compact or json
    pub format: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

/// Results file defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResultsSettings {
    /// Directory for files given without a path
    pub output_dir: PathBuf,
    pub format: ResultsFormat,
    /// Single ASCII character
    pub delimiter: String,
    /// Single ASCII character
    pub comment: String,
}

impl Default for ResultsSettings {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("data"),
            format: ResultsFormat::Csv,
            delimiter: ",".to_string(),
            comment: "#".to_string(),
        }
    }
}

impl ResultsSettings {
    pub fn delimiter_byte(&self) -> AppResult<u8> {
        single_ascii("results.delimiter", &self.delimiter)
    }

    pub fn comment_char(&self) -> AppResult<char> {
        single_ascii("results.comment", &self.comment).map(char::from)
    }
}

/// Worker defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    pub join_timeout_ms: u64,
    /// Minimum level forwarded to a worker log queue
    pub log_level: String,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            join_timeout_ms: 5000,
            log_level: "info".to_string(),
        }
    }
}

fn single_ascii(field: &str, value: &str) -> AppResult<u8> {
    match value.as_bytes() {
        [byte] if byte.is_ascii() && !byte.is_ascii_alphanumeric() && *byte != b'\n' => Ok(*byte),
        _ => Err(DaqError::Configuration(format!(
            "{field} must be a single ASCII punctuation or whitespace character, got '{value}'"
        ))),
    }
}

impl Settings {
    /// Load configuration from the default file and environment variables.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let settings = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("RUST_MEASURE_").split("__"))
            .extract()?;
        Ok(settings)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        parse_log_level(&self.logging.level).map_err(DaqError::Configuration)?;
        parse_log_level(&self.worker.log_level).map_err(DaqError::Configuration)?;
        self.output_format()?;
        let delimiter = self.results.delimiter_byte()?;
        let comment = self.results.comment_char()?;
        if delimiter == comment as u8 {
            return Err(DaqError::Configuration(
                "results.delimiter and results.comment must differ".to_string(),
            ));
        }
        if self.worker.join_timeout_ms == 0 {
            return Err(DaqError::Configuration(
                "worker.join_timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    fn output_format(&self) -> AppResult<OutputFormat> {
        self.logging.format.parse().map_err(DaqError::Configuration)
    }

    /// Logging setup described by this configuration.
    pub fn logging_config(&self) -> AppResult<LoggingConfig> {
        let level = parse_log_level(&self.logging.level).map_err(DaqError::Configuration)?;
        Ok(LoggingConfig::new(level).with_format(self.output_format()?))
    }

    /// Worker options described by this configuration.
    pub fn worker_config(&self) -> AppResult<WorkerConfig> {
        Ok(WorkerConfig {
            join_timeout: Duration::from_millis(self.worker.join_timeout_ms),
            log_level: parse_log_level(&self.worker.log_level).map_err(DaqError::Configuration)?,
        })
    }

    /// Effective configuration rendered as TOML, suitable for `config/default.toml`.
    pub fn to_toml(&self) -> AppResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| DaqError::Configuration(format!("cannot render configuration: {e}")))
    }

    /// Resolves a results file name against `results.output_dir`.
    pub fn output_path(&self, file: impl AsRef<Path>) -> PathBuf {
        let file = file.as_ref();
        if file.is_absolute() || file.parent().is_some_and(|p| !p.as_os_str().is_empty()) {
            file.to_path_buf()
        } else {
            self.results.output_dir.join(file)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    #[serial]
    fn test_missing_file_gives_defaults() {
        let settings = Settings::load_from("does/not/exist.toml").unwrap();
        assert_eq!(settings, Settings::default());
        assert!(settings.validate().is_ok());
    }

    #[test]
    #[serial]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[results]\nformat = \"json\"\ndelimiter = \"\\t\"\n\n[worker]\njoin_timeout_ms = 250"
        )
        .unwrap();

        let settings = Settings::load_from(file.path()).unwrap();
        assert_eq!(settings.results.format, ResultsFormat::Json);
        assert_eq!(settings.results.delimiter_byte().unwrap(), b'\t');
        assert_eq!(settings.results.comment_char().unwrap(), '#');
        assert_eq!(
            settings.worker_config().unwrap().join_timeout,
            Duration::from_millis(250)
        );
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        std::env::set_var("RUST_MEASURE_WORKER__JOIN_TIMEOUT_MS", "1234");
        std::env::set_var("RUST_MEASURE_LOGGING__LEVEL", "debug");
        let settings = Settings::load_from("does/not/exist.toml");
        std::env::remove_var("RUST_MEASURE_WORKER__JOIN_TIMEOUT_MS");
        std::env::remove_var("RUST_MEASURE_LOGGING__LEVEL");

        let settings = settings.unwrap();
        assert_eq!(settings.worker.join_timeout_ms, 1234);
        assert_eq!(settings.logging.level, "debug");
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut settings = Settings::default();
        settings.logging.level = "loud".to_string();
        assert!(matches!(settings.validate(), Err(DaqError::Configuration(_))));

        let mut settings = Settings::default();
        settings.results.delimiter = ";;".to_string();
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.results.comment = ",".to_string();
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.logging.format = "xml".to_string();
        assert!(settings.validate().is_err());
    }

    #[test]
    #[serial]
    fn test_rendered_toml_loads_back() {
        let mut settings = Settings::default();
        settings.results.delimiter = ";".to_string();
        settings.worker.join_timeout_ms = 750;

        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", settings.to_toml().unwrap()).unwrap();
        assert_eq!(Settings::load_from(file.path()).unwrap(), settings);
    }

    #[test]
    fn test_output_path() {
        let settings = Settings::default();
        assert_eq!(settings.output_path("run.csv"), PathBuf::from("data/run.csv"));
        assert_eq!(settings.output_path("other/run.csv"), PathBuf::from("other/run.csv"));
    }
}
