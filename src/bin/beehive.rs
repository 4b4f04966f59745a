//! Beehive CLI - Command-line interface for the beehive sensor pipeline
//!
//! Commands:
//! - route: Calibrate raw payloads from stdin and print outbound messages
//! - fit: Fit calibration parameters from measured/reference pairs
//! - decode: Decode raw payloads into physical readings
//! - validate: Check a calibration record and configuration

use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{debug, info, warn};

use beehive_pipeline::calibration::fit;
use beehive_pipeline::transport::LineTransport;
use beehive_pipeline::types::CalibratedReadings;
use beehive_pipeline::{
    publish_all, CalibrationError, CalibrationService, CalibrationTable, Config, FormatError,
    PayloadCodec, PipelineError, TransportError, PIPELINE_VERSION,
};

/// Beehive - Sensor acquisition and calibration pipeline
#[derive(Parser)]
#[command(name = "beehive")]
#[command(version = PIPELINE_VERSION)]
#[command(about = "Calibrate and route beehive sensor payloads", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Calibrate payloads read from stdin and print TOPIC<TAB>BODY lines
    Route {
        /// Calibration record (JSON)
        #[arg(short, long)]
        calibration: PathBuf,

        /// Pipeline configuration (JSON); defaults apply when omitted
        #[arg(long)]
        config: Option<PathBuf>,

        /// Treat every input line as a bare payload from this device
        #[arg(long)]
        device: Option<String>,
    },

    /// Fit calibration parameters from `measured,reference` CSV pairs
    Fit {
        /// Input file path (use - for stdin)
        #[arg(short, long)]
        input: PathBuf,
    },

    /// Decode payloads read from stdin into physical readings (NDJSON)
    Decode,

    /// Validate a calibration record against a configuration
    Validate {
        /// Calibration record (JSON)
        #[arg(short, long)]
        calibration: PathBuf,

        /// Pipeline configuration (JSON)
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!(
                "{}",
                serde_json::to_string(&CliError::from(e))
                    .unwrap_or_else(|_| "Unknown error".to_string())
            );
            ExitCode::FAILURE
        }
    }
}

fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(io::stderr)
        .with_target(false)
        .compact()
        .init();
}

fn run(cli: Cli) -> Result<(), BeehiveCliError> {
    match cli.command {
        Commands::Route {
            calibration,
            config,
            device,
        } => cmd_route(&calibration, config.as_deref(), device.as_deref()),
        Commands::Fit { input } => cmd_fit(&input),
        Commands::Decode => cmd_decode(),
        Commands::Validate {
            calibration,
            config,
        } => cmd_validate(&calibration, config.as_deref()),
    }
}

fn load_config(path: Option<&Path>) -> Result<Config, BeehiveCliError> {
    match path {
        Some(path) => Ok(Config::from_path(path)?),
        None => Ok(Config::default()),
    }
}

fn hint_if_interactive() {
    if atty::is(atty::Stream::Stdin) {
        info!("reading payloads from stdin, one per line (Ctrl-D to finish)");
    }
}

fn cmd_route(
    calibration: &Path,
    config: Option<&Path>,
    device: Option<&str>,
) -> Result<(), BeehiveCliError> {
    let config = load_config(config)?;
    let calibrations = CalibrationTable::from_path(calibration)?;
    let service = CalibrationService::new(config.router, calibrations);
    let mut transport = LineTransport::new(io::stdout().lock());

    hint_if_interactive();
    let mut failed = 0;
    for (index, line) in io::stdin().lock().lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let routed = match device {
            Some(device) => service.handle_device(device, line.as_bytes()),
            None => match line.split_once(char::is_whitespace) {
                Some((topic, payload)) => service.handle(topic, payload.trim().as_bytes()),
                None => Err(FormatError::UnexpectedTopic(line.to_string()).into()),
            },
        };

        match routed {
            Ok(messages) => {
                publish_all(&messages, &mut transport)?;
            }
            Err(e) => {
                warn!(line = index + 1, error = %e, "payload rejected");
                failed += 1;
            }
        }
    }

    if failed > 0 {
        return Err(BeehiveCliError::RejectedPayloads(failed));
    }
    Ok(())
}

fn cmd_fit(input: &Path) -> Result<(), BeehiveCliError> {
    let text = if input.as_os_str() == "-" {
        io::read_to_string(io::stdin())?
    } else {
        fs::read_to_string(input)?
    };

    let mut pairs = Vec::new();
    for (index, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match parse_pair(line) {
            Some(pair) => pairs.push(pair),
            // header row
            None if pairs.is_empty() && index == 0 => continue,
            None => {
                return Err(BeehiveCliError::Parse(format!(
                    "line {}: expected 'measured,reference', got '{}'",
                    index + 1,
                    line
                )))
            }
        }
    }

    debug!(samples = pairs.len(), "fitting calibration");
    let params = fit(&pairs)?;
    println!("{}", serde_json::to_string_pretty(&params)?);
    Ok(())
}

fn parse_pair(line: &str) -> Option<(f64, f64)> {
    let (measured, reference) = line.split_once(',')?;
    Some((
        measured.trim().parse().ok()?,
        reference.trim().parse().ok()?,
    ))
}

fn cmd_decode() -> Result<(), BeehiveCliError> {
    hint_if_interactive();
    for line in io::stdin().lock().lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let payload = PayloadCodec::decode(line.as_bytes()).map_err(PipelineError::from)?;
        let readings: CalibratedReadings = payload
            .readings
            .iter()
            .map(|(address, raw)| (*address, raw.to_physical()))
            .collect();
        let decoded = DecodedPayload {
            sequence: payload.sequence,
            timestamp: payload.timestamp,
            readings,
        };
        println!("{}", serde_json::to_string(&decoded)?);
    }
    Ok(())
}

fn cmd_validate(calibration: &Path, config: Option<&Path>) -> Result<(), BeehiveCliError> {
    let config = load_config(config)?;
    let table = CalibrationTable::from_path(calibration)?;

    let mut unmapped = Vec::new();
    for (column, entries) in config.router.columns.columns() {
        for entry in entries {
            if table.chain(entry.sensor()).is_err() {
                unmapped.push(format!("{}:{}", column, entry.sensor()));
            }
        }
    }

    let report = ValidationReport {
        reference: table.reference().to_string(),
        sensors: table.sensors().map(|s| s.to_string()).collect(),
        columns: config
            .router
            .columns
            .columns()
            .map(|(name, entries)| (name.to_string(), entries.len()))
            .collect(),
        uncalibrated_column_sensors: unmapped,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);

    if !report.uncalibrated_column_sensors.is_empty() {
        return Err(BeehiveCliError::ValidationFailed(
            report.uncalibrated_column_sensors.len(),
        ));
    }
    Ok(())
}

// Error handling

#[derive(Debug)]
enum BeehiveCliError {
    Io(io::Error),
    Pipeline(PipelineError),
    Json(serde_json::Error),
    Parse(String),
    RejectedPayloads(usize),
    ValidationFailed(usize),
}

impl From<io::Error> for BeehiveCliError {
    fn from(e: io::Error) -> Self {
        BeehiveCliError::Io(e)
    }
}

impl From<PipelineError> for BeehiveCliError {
    fn from(e: PipelineError) -> Self {
        BeehiveCliError::Pipeline(e)
    }
}

impl From<CalibrationError> for BeehiveCliError {
    fn from(e: CalibrationError) -> Self {
        BeehiveCliError::Pipeline(e.into())
    }
}

impl From<TransportError> for BeehiveCliError {
    fn from(e: TransportError) -> Self {
        BeehiveCliError::Pipeline(e.into())
    }
}

impl From<serde_json::Error> for BeehiveCliError {
    fn from(e: serde_json::Error) -> Self {
        BeehiveCliError::Json(e)
    }
}

#[derive(serde::Serialize)]
struct CliError {
    code: String,
    message: String,
    hint: Option<String>,
}

impl From<BeehiveCliError> for CliError {
    fn from(e: BeehiveCliError) -> Self {
        match e {
            BeehiveCliError::Io(e) => CliError {
                code: "IO_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check file paths and permissions".to_string()),
            },
            BeehiveCliError::Pipeline(PipelineError::Format(e)) => CliError {
                code: "FORMAT_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Expected SEQ,TIMESTAMP;CCDD,Txxxx,Hxxxx;...".to_string()),
            },
            BeehiveCliError::Pipeline(PipelineError::Calibration(e)) => CliError {
                code: "CALIBRATION_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Run 'beehive validate' on the calibration record".to_string()),
            },
            BeehiveCliError::Pipeline(PipelineError::Io(e)) => CliError {
                code: "IO_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check file paths and permissions".to_string()),
            },
            BeehiveCliError::Pipeline(e) => CliError {
                code: "PIPELINE_ERROR".to_string(),
                message: e.to_string(),
                hint: None,
            },
            BeehiveCliError::Json(e) => CliError {
                code: "JSON_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check JSON syntax".to_string()),
            },
            BeehiveCliError::Parse(msg) => CliError {
                code: "PARSE_ERROR".to_string(),
                message: msg,
                hint: Some("Check input format".to_string()),
            },
            BeehiveCliError::RejectedPayloads(count) => CliError {
                code: "REJECTED_PAYLOADS".to_string(),
                message: format!("{} payloads could not be routed", count),
                hint: Some("Each rejected line is logged to stderr".to_string()),
            },
            BeehiveCliError::ValidationFailed(count) => CliError {
                code: "VALIDATION_FAILED".to_string(),
                message: format!("{} column sensors have no calibration", count),
                hint: Some("Add them to the calibration record or the columns".to_string()),
            },
        }
    }
}

// Report types

#[derive(serde::Serialize)]
struct DecodedPayload {
    sequence: u32,
    timestamp: chrono::NaiveDateTime,
    readings: CalibratedReadings,
}

#[derive(serde::Serialize)]
struct ValidationReport {
    reference: String,
    sensors: Vec<String>,
    columns: BTreeMap<String, usize>,
    uncalibrated_column_sensors: Vec<String>,
}
