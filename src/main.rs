//! CLI Entry Point for rust-measure
//!
//! Provides command-line interface for:
//! - Listing the registered procedure types and their parameters
//! - Running a procedure to a results file while streaming its status
//! - Inspecting an existing results file
//! - Printing the effective configuration
//!
//! # Usage
//!
//! ```bash
//! rust-measure list
//! rust-measure run RandomProcedure -p iterations=20 -p "delay=50 ms" -o random.csv
//! rust-measure inspect data/random.csv
//! rust-measure config > config/default.toml
//! ```

use anyhow::{bail, Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use rust_measure::config::Settings;
use rust_measure::logging;
use rust_measure::procedures::ProcedureRegistry;
use rust_measure::results::{Results, ResultsFormat};
use rust_measure::worker::{MonitorEvent, Worker};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "rust-measure")]
#[command(about = "Run measurement procedures and record their results", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = rust_measure::config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List registered procedure types
    List,

    /// Run a procedure and record its results
    Run {
        /// Procedure type identifier
        procedure: String,

        /// Results file; relative names are placed in the configured output directory
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Parameter assignment, `key=value`
        #[arg(short = 'p', long = "param", value_parser = parse_assignment)]
        params: Vec<(String, String)>,

        /// Join timeout after which a stop is requested
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Print the header and a data summary of a results file
    Inspect {
        file: PathBuf,
    },

    /// Print the effective configuration as TOML
    Config,
}

fn parse_assignment(text: &str) -> Result<(String, String), String> {
    text.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected key=value, got '{text}'"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = Settings::load_from(&cli.config).context("loading configuration")?;
    settings.validate()?;
    logging::init(settings.logging_config()?).map_err(anyhow::Error::msg)?;

    let registry = ProcedureRegistry::default();
    match cli.command {
        Commands::List => list(&registry),
        Commands::Run {
            procedure,
            output,
            params,
            timeout_ms,
        } => run(&settings, &registry, &procedure, output, &params, timeout_ms).await,
        Commands::Inspect { file } => inspect(&registry, file),
        Commands::Config => {
            print!("{}", settings.to_toml()?);
            Ok(())
        }
    }
}

fn list(registry: &ProcedureRegistry) -> Result<()> {
    for info in registry.list_types() {
        println!("{}", info.type_id());
        if !info.description_text().is_empty() {
            println!("    {}", info.description_text());
        }
        for parameter in info.parameters() {
            let default = parameter
                .default_value()
                .map(|v| v.to_string())
                .unwrap_or_else(|| "<required>".to_string());
            let units = parameter.unit_text().map(|u| format!(" [{u}]")).unwrap_or_default();
            println!(
                "    {:<12} {:<20} {}{units} = {default}",
                parameter.key(),
                parameter.name(),
                parameter.kind()
            );
        }
        println!("    columns: {}", info.data_columns().join(", "));
    }
    Ok(())
}

async fn run(
    settings: &Settings,
    registry: &ProcedureRegistry,
    type_id: &str,
    output: Option<PathBuf>,
    params: &[(String, String)],
    timeout_ms: Option<u64>,
) -> Result<()> {
    let mut procedure = registry.create(type_id)?;
    for (key, value) in params {
        procedure
            .parameters_mut()
            .set_from_str(key, value)
            .with_context(|| format!("setting parameter '{key}'"))?;
    }

    // an explicit file name decides the format through its extension
    let format = output
        .as_deref()
        .map(ResultsFormat::from_path)
        .unwrap_or(settings.results.format);
    let extension = match format {
        ResultsFormat::Csv => "csv",
        ResultsFormat::Json => "json",
    };
    let file = output.unwrap_or_else(|| {
        PathBuf::from(format!("{type_id}_{}.{extension}", Local::now().format("%Y%m%d_%H%M%S")))
    });
    let path = settings.output_path(file);

    let results = Results::builder(procedure, &path)
        .delimiter(settings.results.delimiter_byte()?)
        .comment_char(settings.results.comment_char()?)
        .format(format)
        .build()?;

    let mut worker_config = settings.worker_config()?;
    if let Some(ms) = timeout_ms {
        worker_config.join_timeout = Duration::from_millis(ms);
    }
    let mut worker = Worker::new(results, worker_config)?;
    let mut monitor = worker
        .monitor()
        .context("monitor channel already taken")?;
    worker.start()?;
    info!(path = %path.display(), "Recording results");

    loop {
        tokio::select! {
            event = monitor.recv() => match event {
                Some(MonitorEvent::Status(status)) => println!("status: {status}"),
                Some(MonitorEvent::Progress(percent)) => println!("progress: {percent:.1}%"),
                Some(MonitorEvent::Error { message, details }) => {
                    eprintln!("error: {message}");
                    if details != message {
                        eprintln!("{details}");
                    }
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, asking the procedure to stop");
                worker.stop();
            }
        }
    }

    let timeout = worker.config().join_timeout;
    worker.join(timeout)?;
    let status = worker.status();
    let mut results = worker.into_results()?;
    let rows = results.data()?.len();
    println!("{status}: {rows} rows written to {}", path.display());
    if status != rust_measure::Status::Finished {
        bail!("procedure ended as {status}");
    }
    Ok(())
}

fn inspect(registry: &ProcedureRegistry, file: PathBuf) -> Result<()> {
    let mut results = Results::load(&file, registry)
        .with_context(|| format!("loading {}", file.display()))?;
    if !results.procedure().is_runnable() {
        println!("(procedure type '{}' is not registered)", results.procedure().type_id());
    }
    for line in results.header() {
        println!("{line}");
    }
    for entry in results.procedure().metadata().iter() {
        println!("#\t{}: {}", entry.name(), entry.value_string());
    }

    let table = results.data()?;
    println!("{} rows", table.len());
    for column in table.columns() {
        let values = table.column_f64(column).unwrap_or_default();
        let finite: Vec<f64> = values.into_iter().filter(|v| v.is_finite()).collect();
        if finite.is_empty() {
            println!("  {column}: no numeric values");
            continue;
        }
        let min = finite.iter().copied().fold(f64::INFINITY, f64::min);
        let max = finite.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let mean = finite.iter().sum::<f64>() / finite.len() as f64;
        println!("  {column}: min {min}, max {max}, mean {mean}");
    }
    Ok(())
}
