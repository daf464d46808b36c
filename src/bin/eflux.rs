//! eflux CLI - Command-line interface for errp-flux
//!
//! Commands:
//! - simulate: Run a synthetic stream through the closed loop and archive it
//! - inspect: Validate an EBS archive and print its header
//! - replay: Run an archive through the loop and print the selected interventions
//! - config: Print a session configuration as JSON

use clap::{Parser, Subcommand};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use errp_flux::archive::ArchiveReader;
use errp_flux::bandit::LinUcbBandit;
use errp_flux::config::{SegmenterConfig, SessionConfig};
use errp_flux::detector::TemplateScorer;
use errp_flux::pipeline::{replay_config, FeedbackEvent, FeedbackOrchestrator, SessionSummary};
use errp_flux::session::{run_session, SessionStreams};
use errp_flux::synth::SyntheticSource;
use errp_flux::transport::{Payload, StreamHub, StreamInfo, StreamKind};
use errp_flux::types::{Decision, FeatureVector};
use errp_flux::{ComputeError, ERRP_FLUX_VERSION, PRODUCER_NAME};

/// eflux - Closed-loop error-signal adaptation engine
#[derive(Parser)]
#[command(name = "eflux")]
#[command(author = "Synheart AI Inc")]
#[command(version = ERRP_FLUX_VERSION)]
#[command(about = "Window, archive and adapt biosignal streams", long_about = None)]
struct Cli {
    /// Log at debug level (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a synthetic signal through the closed loop and archive every window
    Simulate {
        /// Archive output path
        #[arg(short, long)]
        output: PathBuf,

        /// Session configuration file (defaults apply when omitted)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Channel names, comma separated (overrides the configuration)
        #[arg(long, value_delimiter = ',')]
        channels: Vec<String>,

        /// Sampling rate in Hz (overrides the configuration)
        #[arg(long)]
        rate: Option<f64>,

        /// Window length in samples (overrides the configuration)
        #[arg(long)]
        window: Option<usize>,

        /// Window overlap in samples (overrides the configuration)
        #[arg(long)]
        overlap: Option<usize>,

        /// Seconds of signal to generate
        #[arg(long, default_value = "60")]
        duration: f64,

        /// Samples per channel in each pushed chunk
        #[arg(long, default_value = "32")]
        chunk: usize,

        /// Seed of the synthetic generator
        #[arg(long, default_value = "0")]
        seed: u64,

        /// Emit a decision every N windows
        #[arg(long, default_value = "1")]
        decide_every: u64,

        /// Save the bandit state to file after the session
        #[arg(long)]
        save_bandit: Option<PathBuf>,
    },

    /// Validate an EBS archive and print its header and window count
    Inspect {
        /// Archive path
        path: PathBuf,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run an archive through the loop and print interventions as NDJSON
    Replay {
        /// Archive path
        path: PathBuf,

        /// Session configuration file (segmentation always comes from the archive)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Emit a decision every N windows
        #[arg(long, default_value = "1")]
        decide_every: u64,

        /// Print every loop event, not just interventions
        #[arg(long)]
        all_events: bool,

        /// Load the bandit state from file
        #[arg(long)]
        load_bandit: Option<PathBuf>,

        /// Save the bandit state to file after the replay
        #[arg(long)]
        save_bandit: Option<PathBuf>,
    },

    /// Print a session configuration as JSON
    Config {
        /// Configuration file to validate and print (defaults when omitted)
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

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

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| level.into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(io::stderr),
        )
        .init();
}

fn run(cli: Cli) -> Result<(), EfluxCliError> {
    match cli.command {
        Commands::Simulate {
            output,
            config,
            channels,
            rate,
            window,
            overlap,
            duration,
            chunk,
            seed,
            decide_every,
            save_bandit,
        } => {
            let mut config = load_config(config.as_deref())?;
            override_segmenter(&mut config.segmenter, channels, rate, window, overlap);
            cmd_simulate(
                config.with_archive(output),
                duration,
                chunk,
                seed,
                decide_every,
                save_bandit.as_deref(),
            )
        }

        Commands::Inspect { path, json } => cmd_inspect(&path, json),

        Commands::Replay {
            path,
            config,
            decide_every,
            all_events,
            load_bandit,
            save_bandit,
        } => cmd_replay(
            &path,
            load_config(config.as_deref())?,
            decide_every,
            all_events,
            load_bandit.as_deref(),
            save_bandit.as_deref(),
        ),

        Commands::Config { config } => {
            let config = load_config(config.as_deref())?;
            println!("{}", config.to_json()?);
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<SessionConfig, EfluxCliError> {
    match path {
        Some(path) => Ok(SessionConfig::load(path)?),
        None => Ok(SessionConfig::default()),
    }
}

fn override_segmenter(
    segmenter: &mut SegmenterConfig,
    channels: Vec<String>,
    rate: Option<f64>,
    window: Option<usize>,
    overlap: Option<usize>,
) {
    if !channels.is_empty() {
        segmenter.channels = channels;
    }
    if let Some(rate) = rate {
        segmenter.sample_rate = rate;
    }
    if let Some(window) = window {
        segmenter.window_samples = window;
    }
    if let Some(overlap) = overlap {
        segmenter.overlap_samples = overlap;
    }
}

/// Decides every `every`-th valid window, labelling it with its strongest band
fn dominant_band_classifier(
    bands: usize,
    every: u64,
) -> impl FnMut(&FeatureVector) -> Option<Decision> + Send {
    let every = every.max(1);
    let mut seen = 0u64;
    move |features: &FeatureVector| {
        if !features.is_valid() || bands == 0 {
            return None;
        }
        seen += 1;
        if seen % every != 0 {
            return None;
        }
        let mut totals = vec![0.0; bands];
        for (i, value) in features.values.iter().enumerate() {
            totals[i % bands] += value;
        }
        let sum: f64 = totals.iter().sum();
        let (label, peak) = totals
            .iter()
            .copied()
            .enumerate()
            .fold((0, f64::MIN), |best, (i, v)| if v > best.1 { (i, v) } else { best });
        let confidence = if sum > 0.0 { peak / sum } else { 0.0 };
        Some(Decision {
            label: label as u32,
            confidence,
        })
    }
}

fn orchestrator(
    config: SessionConfig,
    decide_every: u64,
    load_bandit: Option<&Path>,
) -> Result<FeedbackOrchestrator, EfluxCliError> {
    let bands = config.features.bands.len();
    let mut orchestrator = FeedbackOrchestrator::new(config, Box::new(TemplateScorer::default()))?
        .with_classifier(Box::new(dominant_band_classifier(bands, decide_every)));
    if let Some(path) = load_bandit {
        let bandit = LinUcbBandit::from_json(&fs::read_to_string(path)?)?;
        orchestrator = orchestrator.with_bandit(Arc::new(bandit))?;
    }
    Ok(orchestrator)
}

fn save_bandit(bandit: &LinUcbBandit, path: Option<&Path>) -> Result<(), EfluxCliError> {
    if let Some(path) = path {
        fs::write(path, bandit.to_json()?)?;
    }
    Ok(())
}

fn cmd_simulate(
    config: SessionConfig,
    duration: f64,
    chunk: usize,
    seed: u64,
    decide_every: u64,
    save_bandit_to: Option<&Path>,
) -> Result<(), EfluxCliError> {
    let segmenter = config.segmenter.clone();
    let capacity = config.queue_capacity;
    let orchestrator = orchestrator(config, decide_every, None)?;
    let bandit = Arc::clone(orchestrator.bandit());
    let mut source =
        SyntheticSource::new(segmenter.channel_count(), segmenter.sample_rate, chunk, seed)?;
    let total = (duration.max(0.0) * segmenter.sample_rate).round() as usize;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_time()
        .build()?;

    let summary = runtime.block_on(async {
        let hub = StreamHub::new(capacity);
        let input = hub.advertise(
            StreamInfo::new("samples", StreamKind::Samples, PRODUCER_NAME)
                .with_signal(segmenter.channel_count(), segmenter.sample_rate),
        )?;
        let cancel = CancellationToken::new();

        let session_hub = hub.clone();
        let session_cancel = cancel.clone();
        let session = tokio::spawn(async move {
            run_session(
                orchestrator,
                &session_hub,
                SessionStreams::new("samples"),
                session_cancel,
            )
            .await
        });

        // the session advertises its output once its input subscription is live
        while hub.resolve_by_name("interventions").is_none() {
            if session.is_finished() {
                break;
            }
            tokio::task::yield_now().await;
        }

        let mut sent = 0;
        while sent < total && !session.is_finished() {
            let n = chunk.min(total - sent);
            input.publish(Payload::Samples(source.next_chunk(n))).await?;
            sent += n;
        }
        hub.close("samples");

        let summary = session
            .await
            .map_err(|e| EfluxCliError::Runtime(e.to_string()))??;
        Ok::<SessionSummary, EfluxCliError>(summary)
    })?;

    save_bandit(&bandit, save_bandit_to)?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn cmd_replay(
    path: &Path,
    config: SessionConfig,
    decide_every: u64,
    all_events: bool,
    load_bandit: Option<&Path>,
    save_bandit_to: Option<&Path>,
) -> Result<(), EfluxCliError> {
    let mut reader = ArchiveReader::open(path)?;
    let config = replay_config(reader.header(), config);
    let mut orchestrator = orchestrator(config, decide_every, load_bandit)?;
    let bandit = Arc::clone(orchestrator.bandit());

    let events = orchestrator.replay(&mut reader)?;
    let summary = orchestrator.shutdown()?;

    let stdout = io::stdout();
    let mut out = stdout.lock();
    for event in &events {
        if all_events || matches!(event, FeedbackEvent::Intervention(_)) {
            writeln!(out, "{}", serde_json::to_string(event)?)?;
        }
    }
    out.flush()?;

    save_bandit(&bandit, save_bandit_to)?;
    tracing::info!(
        windows = summary.windows,
        markers = summary.markers,
        signals_scored = summary.signals_scored,
        signals_fallback = summary.signals_fallback,
        interventions = summary.interventions,
        "Replay finished"
    );
    Ok(())
}

fn cmd_inspect(path: &Path, json: bool) -> Result<(), EfluxCliError> {
    let mut reader = ArchiveReader::open(path)?;
    // decode every window so a corrupt payload fails the inspection
    for window in reader.windows() {
        window?;
    }

    let header = reader.header();
    let report = InspectReport {
        producer: PRODUCER_NAME.to_string(),
        path: path.to_path_buf(),
        bytes: fs::metadata(path)?.len(),
        windows: reader.len(),
        duration_seconds: reader.len() as f64 * header.step() as f64 / header.sample_rate,
        header: serde_json::to_value(header)?,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("EBS Archive");
        println!("===========");
        println!("Path:        {}", report.path.display());
        println!("Session:     {}", header.session_id);
        println!("Format:      {} v{}", header.format, header.version);
        println!("Channels:    {}", header.channels.join(", "));
        println!("Sample rate: {} Hz", header.sample_rate);
        println!("Window:      {} samples (step {})", header.window_samples, header.step());
        println!("Windows:     {}", report.windows);
        println!("Duration:    {:.3} s", report.duration_seconds);
        println!("Size:        {} bytes", report.bytes);
    }
    Ok(())
}

// Error types

#[derive(Debug)]
enum EfluxCliError {
    Io(io::Error),
    Compute(ComputeError),
    Json(serde_json::Error),
    Runtime(String),
}

impl From<io::Error> for EfluxCliError {
    fn from(e: io::Error) -> Self {
        EfluxCliError::Io(e)
    }
}

impl From<ComputeError> for EfluxCliError {
    fn from(e: ComputeError) -> Self {
        EfluxCliError::Compute(e)
    }
}

impl From<serde_json::Error> for EfluxCliError {
    fn from(e: serde_json::Error) -> Self {
        EfluxCliError::Json(e)
    }
}

#[derive(serde::Serialize)]
struct CliError {
    code: String,
    message: String,
    hint: Option<String>,
}

impl From<EfluxCliError> for CliError {
    fn from(e: EfluxCliError) -> Self {
        match e {
            EfluxCliError::Io(e) => CliError {
                code: "IO_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check file paths and permissions".to_string()),
            },
            EfluxCliError::Json(e) => CliError {
                code: "JSON_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check JSON syntax".to_string()),
            },
            EfluxCliError::Runtime(msg) => CliError {
                code: "RUNTIME_ERROR".to_string(),
                message: msg,
                hint: None,
            },
            EfluxCliError::Compute(e) => {
                let (code, hint) = match &e {
                    ComputeError::FormatError(_) | ComputeError::HeaderOverflowError { .. } => {
                        ("FORMAT_ERROR", Some("Run 'eflux inspect' on the archive"))
                    }
                    ComputeError::SchemaMismatchError(_) => (
                        "SCHEMA_MISMATCH",
                        Some("Channels and rate must match the archive header"),
                    ),
                    ComputeError::InvalidConfig(_) => (
                        "CONFIG_ERROR",
                        Some("Run 'eflux config' to see a valid configuration"),
                    ),
                    ComputeError::InvalidContext(_) | ComputeError::UnknownArm(_) => (
                        "BANDIT_ERROR",
                        Some("Saved bandit state must match the session's context size"),
                    ),
                    ComputeError::NumericalError(_) => ("NUMERICAL_ERROR", None),
                    ComputeError::UnderrunError { .. } => ("UNDERRUN_ERROR", None),
                    ComputeError::TransportError(_) | ComputeError::SessionClosed => {
                        ("TRANSPORT_ERROR", None)
                    }
                    ComputeError::IoError(_) => {
                        ("IO_ERROR", Some("Check file paths and permissions"))
                    }
                    ComputeError::JsonError(_) => ("JSON_ERROR", Some("Check JSON syntax")),
                };
                CliError {
                    code: code.to_string(),
                    message: e.to_string(),
                    hint: hint.map(str::to_string),
                }
            }
        }
    }
}

// Report types

#[derive(serde::Serialize)]
struct InspectReport {
    producer: String,
    path: PathBuf,
    bytes: u64,
    windows: u64,
    duration_seconds: f64,
    header: serde_json::Value,
}
