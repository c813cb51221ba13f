//! Sumi-Pipeline main entry point
//!
//! This is the command-line interface for the scrape pipeline: it runs jobs
//! in the foreground, inspects and controls the persisted job status, and
//! doubles as the crawl child process launched by the controller.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use sumi_pipeline::config::{load_crawl_config, load_settings_with_hash, DEFAULT_LISTING_URL};
use sumi_pipeline::crawler::run_crawl;
use sumi_pipeline::output::print_summary;
use sumi_pipeline::pipeline::MAX_LOG_LINES;
use sumi_pipeline::storage::HISTORY_LIMIT;
use sumi_pipeline::{JobState, PipelineController, Stage};
use tracing_subscriber::EnvFilter;

/// Sumi-Pipeline: a restart-safe scrape pipeline
///
/// Runs the crawl, transform and load stages as one job, keeps the job
/// status in a SQLite database and supervises the crawl as a child process.
#[derive(Parser, Debug)]
#[command(name = "sumi-pipeline")]
#[command(version = "1.0.0")]
#[command(about = "A restart-safe scrape pipeline", long_about = None)]
struct Cli {
    /// Path to the pipeline settings (TOML)
    #[arg(short, long, global = true, default_value = "pipeline.toml")]
    settings: PathBuf,

    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Crawl every configured group (the crawl stage's child process)
    Crawl {
        /// Crawl config (JSON); falls back to $CRAWL_CONFIG_FILE
        #[arg(long)]
        config: Option<PathBuf>,

        /// Directory for the group output files; falls back to $CRAWL_OUTPUT_DIR
        #[arg(long)]
        output_dir: Option<PathBuf>,

        /// Listing URL template with {group} and {page}
        #[arg(long)]
        listing_url: Option<String>,
    },

    /// Start a job and wait for it in the foreground
    Run {
        /// First stage to execute
        #[arg(long, default_value = "scraping")]
        start_stage: Stage,

        /// Explicit stage list, comma separated
        #[arg(long, value_delimiter = ',')]
        stages: Option<Vec<Stage>>,
    },

    /// Show the current job status
    Status,

    /// Show past jobs, most recent first
    History {
        #[arg(long, default_value_t = 10)]
        limit: usize,

        #[arg(long, default_value_t = 0)]
        offset: usize,

        /// Remove the record of this job instead of listing
        #[arg(long, value_name = "JOB_ID")]
        delete: Option<String>,
    },

    /// Request cancellation of the running job
    Cancel,

    /// Return the status to idle
    Reset {
        /// Reset even if the recorded job still appears to be alive
        #[arg(long)]
        force: bool,
    },

    /// Print the last lines of the crawl log
    Logs {
        #[arg(long, default_value_t = 100)]
        lines: usize,
    },

    /// Inspect or replace the crawl config
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the current crawl config
    Show,

    /// Print the default crawl config
    Default,

    /// Validate a JSON file and make it the crawl config
    Set { file: PathBuf },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // The crawl child writes into the log sink, which must stay plain text
    let ansi = !matches!(cli.command, Command::Crawl { .. });
    setup_logging(cli.verbose, cli.quiet, ansi);

    match cli.command {
        Command::Crawl {
            config,
            output_dir,
            listing_url,
        } => handle_crawl(config, output_dir, listing_url).await,
        command => {
            let controller = open_controller(&cli.settings)?;
            handle_control(controller, command).await
        }
    }
}

/// Sets up the logging/tracing subscriber based on verbosity level
fn setup_logging(verbose: u8, quiet: bool, ansi: bool) {
    let filter = if quiet {
        // Only show errors
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("sumi_pipeline=info,crawl=info,warn"),
            1 => EnvFilter::new("sumi_pipeline=debug,crawl=info,info"),
            2 => EnvFilter::new("sumi_pipeline=trace,debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(ansi)
        .with_thread_ids(false)
        .with_file(false)
        .init();
}

fn open_controller(settings_path: &Path) -> anyhow::Result<Arc<PipelineController>> {
    tracing::debug!("Loading settings from: {}", settings_path.display());
    let (settings, hash) = load_settings_with_hash(settings_path)
        .with_context(|| format!("failed to load settings from {}", settings_path.display()))?;
    tracing::debug!("Settings loaded (hash: {})", hash);

    Ok(PipelineController::from_settings(settings)?)
}

/// Handles the crawl child process
async fn handle_crawl(
    config: Option<PathBuf>,
    output_dir: Option<PathBuf>,
    listing_url: Option<String>,
) -> anyhow::Result<()> {
    let config_path = config
        .or_else(|| std::env::var_os("CRAWL_CONFIG_FILE").map(PathBuf::from))
        .context("no crawl config given (--config or CRAWL_CONFIG_FILE)")?;
    let output_dir = output_dir
        .or_else(|| std::env::var_os("CRAWL_OUTPUT_DIR").map(PathBuf::from))
        .context("no output directory given (--output-dir or CRAWL_OUTPUT_DIR)")?;
    let listing_url = listing_url
        .or_else(|| std::env::var("CRAWL_LISTING_URL").ok())
        .unwrap_or_else(|| DEFAULT_LISTING_URL.to_string());

    let config = load_crawl_config(&config_path)
        .with_context(|| format!("failed to load crawl config {}", config_path.display()))?;

    tracing::info!(
        "Crawling {} groups with {} workers into {}",
        config.groups.len(),
        config.worker_count,
        output_dir.display()
    );

    match run_crawl(config, &listing_url, &output_dir).await {
        Ok((summary, results)) => {
            print_summary(&summary, &results);
            Ok(())
        }
        Err(e) => {
            tracing::error!("Crawl failed: {}", e);
            Err(e.into())
        }
    }
}

async fn handle_control(controller: Arc<PipelineController>, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Run {
            start_stage,
            stages,
        } => handle_run(controller, start_stage, stages).await,
        Command::Status => {
            let status = controller.status()?;
            print_json(&status)?;
            if let Some(seconds) = status.duration_seconds(chrono::Utc::now()) {
                println!("Duration: {}s", seconds);
            }
            Ok(())
        }
        Command::History {
            limit,
            offset,
            delete,
        } => {
            if let Some(job_id) = delete {
                controller.delete_history(&job_id)?;
                println!("Deleted history record {}", job_id);
                return Ok(());
            }
            if limit > HISTORY_LIMIT {
                tracing::warn!("History keeps at most {} records", HISTORY_LIMIT);
            }
            print_json(&controller.history(limit, offset)?)
        }
        Command::Cancel => {
            let status = controller.cancel().await?;
            println!(
                "Cancellation requested for job {} (now {})",
                status.job_id.as_deref().unwrap_or("-"),
                status.status
            );
            Ok(())
        }
        Command::Reset { force } => {
            controller.force_reset(force)?;
            println!("Status reset to idle");
            Ok(())
        }
        Command::Logs { lines } => {
            if lines > MAX_LOG_LINES {
                bail!("--lines must be at most {}", MAX_LOG_LINES);
            }
            for line in controller.logs(lines)? {
                println!("{}", line);
            }
            Ok(())
        }
        Command::Config { action } => match action {
            ConfigAction::Show => print_json(&controller.crawl_config()?),
            ConfigAction::Default => print_json(&controller.default_crawl_config()),
            ConfigAction::Set { file } => {
                let config = load_crawl_config(&file)
                    .with_context(|| format!("invalid crawl config {}", file.display()))?;
                controller.update_crawl_config(&config)?;
                println!("Crawl config updated from {}", file.display());
                Ok(())
            }
        },
        Command::Crawl { .. } => bail!("crawl does not use the controller"),
    }
}

/// Starts a job and waits for it; Ctrl-C requests cancellation
async fn handle_run(
    controller: Arc<PipelineController>,
    start_stage: Stage,
    stages: Option<Vec<Stage>>,
) -> anyhow::Result<()> {
    let ticket = controller.start(start_stage, stages)?;
    println!("Started job {}", ticket.job_id);

    let mut handle = ticket.handle;
    let status = tokio::select! {
        result = &mut handle => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted, cancelling job {}", ticket.job_id);
            if let Err(e) = controller.cancel().await {
                tracing::warn!("Cancel failed: {}", e);
            }
            handle.await?
        }
    };

    print_json(&status)?;

    match status.status {
        JobState::Completed | JobState::Cancelled => Ok(()),
        _ => bail!(
            "job {} ended as {}: {}",
            ticket.job_id,
            status.status,
            status.error_message.as_deref().unwrap_or("no error message")
        ),
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
