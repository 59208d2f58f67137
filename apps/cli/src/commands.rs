//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

use tenderwatch_classify::{Classifier, RiskScorer};
use tenderwatch_core::{
    CancelFlag, CheckpointManager, Pipeline, ProgressReporter, RunReport, run_analysis,
    write_run_report,
};
use tenderwatch_shared::{
    AppConfig, Classification, Confidence, ErrorCategory, Origin, RunConfig, init_config,
    load_config, load_config_from,
};
use tenderwatch_storage::Storage;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// tenderwatch — origin screening for public procurement archives.
#[derive(Parser)]
#[command(
    name = "tenderwatch",
    version,
    about = "Screen nested procurement archives for PRC, Taiwan, Hong Kong and Macao counterparties.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file (defaults to ~/.tenderwatch/tenderwatch.toml).
    #[arg(long, global = true, env = "TENDERWATCH_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Process every unprocessed archive, then write the report tree.
    Run {
        /// Input root (overrides `defaults.input_dir`).
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Report directory (overrides `defaults.output_dir`).
        #[arg(short, long)]
        out: Option<PathBuf>,

        /// Stop after persisting detections.
        #[arg(long)]
        skip_analysis: bool,
    },

    /// Rebuild graph, patterns and reports from the detection store.
    Analyze {
        /// Report directory (overrides `defaults.output_dir`).
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Classify a single counterparty and print the result.
    Classify {
        /// Party name as it appears in the source.
        name: String,

        /// Declared ISO country code.
        #[arg(long)]
        country: Option<String>,

        /// Declared parent company.
        #[arg(long)]
        parent: Option<String>,

        /// Contract value.
        #[arg(long)]
        value: Option<f64>,
    },

    /// Manually correct the classification of a stored detection.
    Correct {
        /// Detection id (`record_id#party_index`).
        detection_id: String,

        /// Corrected origin (PRC, Taiwan, HongKong, Macao, Other, Unknown).
        #[arg(long)]
        origin: Origin,

        /// Confidence tier of the correction.
        #[arg(long, default_value = "Verified")]
        confidence: Confidence,

        /// Keep the detection flagged for source verification.
        #[arg(long)]
        verify: bool,

        /// Free-text justification stored in the audit trail.
        #[arg(long)]
        note: Option<String>,
    },

    /// Checkpoint inspection and recovery.
    Checkpoint {
        #[command(subcommand)]
        action: CheckpointAction,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Checkpoint subcommands.
#[derive(Subcommand)]
pub(crate) enum CheckpointAction {
    /// Print the current checkpoint.
    Show,
    /// Replace the checkpoint (the old file is kept as `.corrupt`).
    Rebuild {
        /// Required: rebuilding can cause archives to be reprocessed.
        #[arg(long)]
        confirm: bool,

        /// Reconstruct processed archives from the detection store ledger
        /// instead of starting empty.
        #[arg(long)]
        from_store: bool,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags. Logs go to stderr so command
/// output on stdout stays machine-readable.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "tenderwatch=info",
        1 => "tenderwatch=debug",
        _ => "tenderwatch=trace",
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .with_target(false)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Exit status of a `run` that left archives failed or unprocessed.
const INCOMPLETE_RUN: u8 = 3;

/// Run the CLI command. Only `run` reports anything but success through the
/// exit code; hard errors surface as `Err`.
pub(crate) async fn run(cli: Cli) -> Result<ExitCode> {
    let config_path = cli.config.clone();
    let done = match cli.command {
        Command::Run {
            input,
            out,
            skip_analysis,
        } => {
            let config = resolve_config(config_path.as_deref())?;
            return cmd_run(&config, input, out, skip_analysis).await;
        }
        Command::Analyze { out } => {
            let config = resolve_config(config_path.as_deref())?;
            cmd_analyze(&config, out).await
        }
        Command::Classify {
            name,
            country,
            parent,
            value,
        } => {
            let config = resolve_config(config_path.as_deref())?;
            cmd_classify(&config, &name, country.as_deref(), parent.as_deref(), value)
        }
        Command::Correct {
            detection_id,
            origin,
            confidence,
            verify,
            note,
        } => {
            let config = resolve_config(config_path.as_deref())?;
            cmd_correct(&config, &detection_id, origin, confidence, verify, note.as_deref()).await
        }
        Command::Checkpoint { action } => {
            let config = resolve_config(config_path.as_deref())?;
            match action {
                CheckpointAction::Show => cmd_checkpoint_show(&config).await,
                CheckpointAction::Rebuild {
                    confirm,
                    from_store,
                } => cmd_checkpoint_rebuild(&config, confirm, from_store).await,
            }
        }
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(),
            ConfigAction::Show => cmd_config_show(config_path.as_deref()),
        },
    };
    done.map(|()| ExitCode::SUCCESS)
}

fn resolve_config(path: Option<&Path>) -> Result<AppConfig> {
    Ok(match path {
        Some(p) => load_config_from(p)?,
        None => load_config()?,
    })
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_run(
    config: &AppConfig,
    input: Option<PathBuf>,
    out: Option<PathBuf>,
    skip_analysis: bool,
) -> Result<ExitCode> {
    let mut config = config.clone();
    if let Some(input) = input {
        config.defaults.input_dir = input.display().to_string();
    }
    if let Some(out) = out {
        config.defaults.output_dir = out.display().to_string();
    }

    let pipeline = Pipeline::new(&config)?;
    let run_config: &RunConfig = pipeline.run_config();

    // A corrupt checkpoint stops the run before any archive is touched.
    let checkpoint = Arc::new(CheckpointManager::open(&run_config.checkpoint_path())?);
    let storage = Arc::new(Storage::open(&run_config.store_path()).await?);

    let cancel = CancelFlag::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing in-flight archives");
            on_signal.cancel();
        }
    });

    info!(
        input = %run_config.input_dir.display(),
        workers = run_config.workers,
        "starting run"
    );

    let reporter = CliProgress::new();
    let report = pipeline
        .run(Arc::clone(&storage), checkpoint, &cancel, &reporter)
        .await?;

    let report_path = run_config.output_dir.join("run_report.json");
    write_run_report(&report_path, &report)?;
    print_run_summary(&report, &report_path);

    let status = if report.archives_failed > 0 || report.cancelled {
        ExitCode::from(INCOMPLETE_RUN)
    } else {
        ExitCode::SUCCESS
    };
    if skip_analysis || report.cancelled {
        return Ok(status);
    }

    let summary = run_analysis(
        &config,
        &storage,
        pipeline.classifier(),
        &run_config.output_dir,
    )
    .await?;
    println!(
        "  Reports: {} files ({} patterns) in {}",
        summary.files_written,
        summary.patterns,
        run_config.output_dir.display()
    );
    println!();
    Ok(status)
}

fn print_run_summary(report: &RunReport, report_path: &Path) {
    println!();
    println!("  Archives:    {} seen, {} processed, {} skipped, {} failed",
        report.archives_seen,
        report.archives_processed,
        report.archives_skipped,
        report.archives_failed
    );
    println!("  Members:     {} read, {} malformed", report.members_read, report.malformed_members);
    println!("  Records:     {}", report.records_parsed);
    println!("  Detections:  {}", report.detections_produced);
    println!(
        "  Checkpoint:  {} commits, {} failures",
        report.checkpoint_commits, report.checkpoint_commit_failures
    );
    for category in [
        ErrorCategory::ArchiveUnreadable,
        ErrorCategory::MemberCorrupt,
        ErrorCategory::ClassificationAmbiguous,
        ErrorCategory::DetectionStoreWriteFailure,
    ] {
        let count = report.count(category);
        if count > 0 {
            println!("  {category}: {count}");
        }
    }
    if report.cancelled {
        println!("  Run was cancelled; remaining archives will be picked up next run.");
    }
    println!("  Report:      {}", report_path.display());
    println!();
}

async fn cmd_analyze(config: &AppConfig, out: Option<PathBuf>) -> Result<()> {
    let run_config = RunConfig::from(config);
    let out_dir = out.unwrap_or_else(|| run_config.output_dir.clone());
    let storage = Storage::open_readonly(&run_config.store_path()).await?;
    let classifier = Classifier::new(&config.classify)?;

    let summary = run_analysis(config, &storage, &classifier, &out_dir).await?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn cmd_classify(
    config: &AppConfig,
    name: &str,
    country: Option<&str>,
    parent: Option<&str>,
    value: Option<f64>,
) -> Result<()> {
    let classifier = Classifier::new(&config.classify)?;
    let classification = classifier.classify(name, country, parent, value);
    println!("{}", serde_json::to_string_pretty(&classification)?);
    Ok(())
}

async fn cmd_correct(
    config: &AppConfig,
    detection_id: &str,
    origin: Origin,
    confidence: Confidence,
    verify: bool,
    note: Option<&str>,
) -> Result<()> {
    let run_config = RunConfig::from(config);
    let storage = Storage::open(&run_config.store_path()).await?;

    let rationale = match note {
        Some(n) => format!("manual correction: {n}"),
        None => "manual correction".to_string(),
    };
    let classification = Classification {
        origin,
        confidence,
        rationale,
        warnings: Vec::new(),
        verification_required: verify,
        rule_id: Some("manual".to_string()),
        ambiguous: false,
    };

    let scorer = RiskScorer::new(&config.risk);
    let corrected = storage
        .correct_classification(detection_id, &classification, note, &scorer)
        .await?;
    println!(
        "Corrected {detection_id} -> {origin} ({confidence}), risk now {}",
        corrected.risk.level
    );
    println!("Run `tenderwatch analyze` to refresh the reports.");
    Ok(())
}

async fn cmd_checkpoint_show(config: &AppConfig) -> Result<()> {
    let run_config = RunConfig::from(config);
    let checkpoint = CheckpointManager::open(&run_config.checkpoint_path())?;
    let snapshot = checkpoint.snapshot().await;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

async fn cmd_checkpoint_rebuild(config: &AppConfig, confirm: bool, from_store: bool) -> Result<()> {
    if !confirm {
        return Err(eyre!(
            "refusing to rebuild the checkpoint without --confirm; \
             archives missing from the rebuilt checkpoint will be reprocessed"
        ));
    }

    let run_config = RunConfig::from(config);
    let path = run_config.checkpoint_path();
    let checkpoint = if from_store {
        let storage = Storage::open(&run_config.store_path()).await?;
        CheckpointManager::rebuild_from_store(&path, &storage).await?
    } else {
        CheckpointManager::rebuild(&path, Vec::new())?
    };

    let snapshot = checkpoint.snapshot().await;
    println!(
        "Checkpoint rebuilt at {} with {} processed archive(s)",
        path.display(),
        snapshot.processed_archive_ids.len()
    );
    Ok(())
}

fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show(path: Option<&Path>) -> Result<()> {
    let config = resolve_config(path)?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner that turns into a bar
/// once the archive count is known.
struct CliProgress {
    bar: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let bar = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} {msg}") {
            bar.set_style(style.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]));
        }
        bar.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { bar }
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, name: &str) {
        self.bar.set_message(name.to_string());
    }

    fn archives_found(&self, total: usize) {
        self.bar.set_length(total as u64);
        if let Ok(style) =
            ProgressStyle::with_template("{spinner:.cyan} [{bar:30.cyan/blue}] {pos}/{len} {msg}")
        {
            self.bar.set_style(style.progress_chars("=> "));
        }
    }

    fn archive_done(&self, archive_id: &str, current: usize, _total: usize) {
        self.bar.set_position(current as u64);
        self.bar.set_message(archive_id.to_string());
    }

    fn done(&self, _report: &RunReport) {
        self.bar.finish_and_clear();
    }
}
