//! Pipeline controller - the job state machine
//!
//! The controller owns the only path that starts, cancels and resets jobs:
//! - `start` admits one job at a time through an atomic store transition
//! - Stages run in order on a spawned task; every boundary is persisted
//! - A second task awaits the job task, so even a panic ends in `failed`
//! - `cancel` flags the job in the store and signals the crawl child, or
//!   stops a crawl left behind by a controller that is gone
//! - `force_reset` recovers a status left `running` by a dead process

use crate::config::{
    crawl_config_hash, CommandStageConfig, ConfigProvider, CrawlConfig, JsonConfigProvider,
    PipelineSettings,
};
use crate::output::count_items_since;
use crate::pipeline::stage::{Stage, StageError, StageOutcome};
use crate::state::{HistoryPage, ImportStats, JobState, JobStatus};
use crate::storage::{open_store, StatusStore, StorageError, HISTORY_LIMIT};
use crate::supervisor::{
    pid_alive, stop_process_group, BoundedOutcome, ExitOutcome, LaunchCommand, LogSink,
    ProcessSupervisor, SupervisorError,
};
use crate::ConfigError;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Group files older than job start minus this are not counted
const MTIME_TOLERANCE: Duration = Duration::from_secs(1);

/// Upper bound for `logs`
pub const MAX_LOG_LINES: usize = 1000;

/// Error message of a cancelled job
const CANCELLED_MESSAGE: &str = "Cancelled by user";

/// File name of the crawl config snapshot handed to the crawl child
const CONFIG_SNAPSHOT_FILE: &str = "crawl-config.snapshot.json";

/// Rejections and failures of controller operations
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("job {} is already running", .job_id.as_deref().unwrap_or("<unknown>"))]
    AlreadyRunning {
        job_id: Option<String>,
        status: Box<JobStatus>,
    },

    #[error("no job is running")]
    NotRunning,

    #[error("job {} is still running (pid {})", .job_id.as_deref().unwrap_or("<unknown>"), pid_label(.pid))]
    StillAlive {
        job_id: Option<String>,
        pid: Option<u32>,
    },

    #[error("crawl config is locked: {0}")]
    ConfigLocked(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn pid_label(pid: &Option<u32>) -> String {
    pid.map_or_else(|| "in-process".to_string(), |pid| pid.to_string())
}

/// An accepted job
///
/// Awaiting `handle` yields the terminal status. Dropping the ticket does
/// not stop the job.
#[derive(Debug)]
pub struct JobTicket {
    pub job_id: String,
    pub handle: JoinHandle<JobStatus>,
}

struct ActiveJob {
    job_id: String,
    token: CancellationToken,
}

/// Top-level state machine of the scrape pipeline
pub struct PipelineController {
    settings: PipelineSettings,
    store: Arc<dyn StatusStore>,
    config_provider: Arc<dyn ConfigProvider>,
    supervisor: ProcessSupervisor,
    active: Mutex<Option<ActiveJob>>,
}

impl PipelineController {
    /// Creates a controller over an existing store and config provider
    pub fn new(
        settings: PipelineSettings,
        store: Arc<dyn StatusStore>,
        config_provider: Arc<dyn ConfigProvider>,
    ) -> Arc<Self> {
        let supervisor = ProcessSupervisor::new(LogSink::new(&settings.paths.log_file));
        Arc::new(Self {
            settings,
            store,
            config_provider,
            supervisor,
            active: Mutex::new(None),
        })
    }

    /// Creates a controller from pipeline settings
    ///
    /// Opens the SQLite status store and the JSON crawl config named in
    /// `[paths]`. A status left `running` by a dead process is reported
    /// but kept; `force_reset` clears it.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use sumi_pipeline::config::load_settings;
    /// use sumi_pipeline::{PipelineController, Stage};
    /// use std::path::Path;
    ///
    /// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
    /// let settings = load_settings(Path::new("pipeline.toml"))?;
    /// let controller = PipelineController::from_settings(settings)?;
    /// let ticket = controller.start(Stage::Scraping, None)?;
    /// let status = ticket.handle.await?;
    /// println!("Job {} ended as {}", ticket.job_id, status.status);
    /// # Ok(())
    /// # }
    /// ```
    pub fn from_settings(settings: PipelineSettings) -> Result<Arc<Self>, ControlError> {
        let store = open_store(&settings.paths.state_database)?;
        let provider = JsonConfigProvider::new(&settings.paths.crawl_config);

        let current = store.load()?;
        if current.is_running() && !current.process_pid.map_or(false, pid_alive) {
            tracing::warn!(
                job_id = ?current.job_id,
                "Status says running but no live process was recorded; reset it if the job is gone"
            );
        }

        Ok(Self::new(settings, Arc::new(store), Arc::new(provider)))
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Starts a new job on a background task
    ///
    /// Must be called inside a tokio runtime.
    ///
    /// # Arguments
    ///
    /// * `start_stage` - First stage to execute; earlier stages count as completed
    /// * `stages` - Explicit stage list; defaults to every stage from `start_stage` on
    ///
    /// # Returns
    ///
    /// * `Ok(JobTicket)` - The job was admitted and is running
    /// * `Err(ControlError::AlreadyRunning)` - Another job holds the slot
    pub fn start(
        self: &Arc<Self>,
        start_stage: Stage,
        stages: Option<Vec<Stage>>,
    ) -> Result<JobTicket, ControlError> {
        let mut stages_to_run = stages.unwrap_or_else(|| Stage::from_onward(start_stage));
        stages_to_run.retain(|stage| *stage >= start_stage);
        stages_to_run.sort();
        stages_to_run.dedup();
        if stages_to_run.is_empty() {
            return Err(ControlError::InvalidArgument(format!(
                "no stages to run from {}",
                start_stage
            )));
        }

        let job_id = Uuid::new_v4().to_string();
        let status = JobStatus::new_job(&job_id, start_stage, stages_to_run, Utc::now());

        if let Err(current) = self.store.try_transition(&startable_states(), &status)? {
            tracing::info!(job_id = ?current.job_id, "Start rejected, a job is already running");
            return Err(ControlError::AlreadyRunning {
                job_id: current.job_id.clone(),
                status: Box::new(current),
            });
        }

        let token = CancellationToken::new();
        self.set_active(&job_id, token.clone());

        tracing::info!(
            job_id = %job_id,
            stages = ?status.stages_to_run,
            "Job started"
        );

        let handle = tokio::spawn(Arc::clone(self).supervise_job(status, token));
        Ok(JobTicket { job_id, handle })
    }

    /// Latest persisted status
    pub fn status(&self) -> Result<JobStatus, ControlError> {
        Ok(self.store.load()?)
    }

    /// Requests cancellation of the running job
    ///
    /// The flag is persisted, so a job run by another controller process
    /// notices it at its next poll. A crawl child owned by this process is
    /// signalled immediately. A recorded crawl process that no job task here
    /// owns is stopped directly and the job is written as cancelled.
    pub async fn cancel(&self) -> Result<JobStatus, ControlError> {
        let current = self.store.load()?;
        let job_id = match (&current.job_id, current.is_running()) {
            (Some(job_id), true) => job_id.clone(),
            _ => return Err(ControlError::NotRunning),
        };

        if !self.store.request_cancel(&job_id)? {
            return Err(ControlError::NotRunning);
        }
        tracing::info!(job_id = %job_id, "Cancellation requested");

        if let Some(token) = self.active_token(&job_id) {
            token.cancel();
            if self.supervisor.terminate_current() {
                tracing::info!(job_id = %job_id, "Signalled crawl process");
            }
            return Ok(self.store.load()?);
        }

        match current.process_pid {
            Some(pid) => self.cancel_unowned(&job_id, pid).await,
            None => Ok(self.store.load()?),
        }
    }

    /// Stops the recorded crawl process of a job owned elsewhere
    ///
    /// The status becomes `cancelled` once the process is gone. If it
    /// survives the kill the request stays pending.
    async fn cancel_unowned(&self, job_id: &str, pid: u32) -> Result<JobStatus, ControlError> {
        if pid_alive(pid) {
            tracing::info!(job_id, pid, "Stopping crawl process not owned by this controller");
            let crawl = &self.settings.crawl;
            match stop_process_group(pid, crawl.grace_period(), crawl.poll_interval()).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::warn!(job_id, pid, "Crawl process survived the kill");
                    return Ok(self.store.load()?);
                }
                Err(e) => {
                    tracing::warn!(job_id, pid, "Cannot stop crawl process: {}", e);
                    return Ok(self.store.load()?);
                }
            }
        }

        let mut status = self.store.load()?;
        if status.is_running() && status.job_id.as_deref() == Some(job_id) {
            status.cancelled = true;
            status.cancel(CANCELLED_MESSAGE, Utc::now());
            self.store.save(&status)?;
            tracing::info!(job_id, "Job cancelled");
        }
        Ok(status)
    }

    /// Returns the status to idle
    ///
    /// Rejected while the recorded job is confirmed alive, unless `force`
    /// is set. Forcing only rewrites the status; a live job is not stopped.
    pub fn force_reset(&self, force: bool) -> Result<JobStatus, ControlError> {
        let current = self.store.load()?;

        if current.is_running() {
            if let Some(pid) = self.liveness(&current) {
                if !force {
                    return Err(ControlError::StillAlive {
                        job_id: current.job_id.clone(),
                        pid,
                    });
                }
                tracing::warn!(job_id = ?current.job_id, "Forcing reset of a live job");
            }
        }

        self.store.reset()?;
        tracing::info!(previous = %current.status, "Status reset to idle");
        Ok(self.store.load()?)
    }

    /// Page of history records, most recent first
    ///
    /// `limit` is clamped to 1..=50.
    pub fn history(&self, limit: usize, offset: usize) -> Result<HistoryPage, ControlError> {
        let limit = limit.clamp(1, HISTORY_LIMIT);
        Ok(self.store.history(limit, offset)?)
    }

    pub fn delete_history(&self, job_id: &str) -> Result<(), ControlError> {
        Ok(self.store.delete_history(job_id)?)
    }

    /// Last `lines` lines of the crawl log sink
    pub fn logs(&self, lines: usize) -> Result<Vec<String>, ControlError> {
        if !(1..=MAX_LOG_LINES).contains(&lines) {
            return Err(ControlError::InvalidArgument(format!(
                "lines must be between 1 and {}",
                MAX_LOG_LINES
            )));
        }
        Ok(self.supervisor.sink().tail(lines)?)
    }

    pub fn crawl_config(&self) -> Result<CrawlConfig, ControlError> {
        Ok(self.config_provider.load()?)
    }

    /// Replaces the crawl config; rejected while a job is running
    pub fn update_crawl_config(&self, config: &CrawlConfig) -> Result<(), ControlError> {
        if self.store.load()?.is_running() {
            return Err(ControlError::ConfigLocked(
                "cannot change the crawl config while a job is running".to_string(),
            ));
        }
        self.config_provider.save(config)?;
        Ok(())
    }

    pub fn default_crawl_config(&self) -> CrawlConfig {
        CrawlConfig::default()
    }

    /// Awaits the job task and writes `failed` if it died
    async fn supervise_job(self: Arc<Self>, status: JobStatus, token: CancellationToken) -> JobStatus {
        let job_id = status.job_id.clone().unwrap_or_default();
        let fallback = status.clone();

        let worker = tokio::spawn(Arc::clone(&self).run_job(status, token));

        let final_status = match worker.await {
            Ok(status) => status,
            Err(e) => {
                tracing::error!(job_id = %job_id, "Job task died: {}", e);
                let mut status = match self.store.load() {
                    Ok(stored) if stored.job_id == fallback.job_id => stored,
                    _ => fallback,
                };
                let stage = status.current_stage;
                status.fail(stage, &format!("Unexpected error: {}", e));
                if let Err(e) = self.store.save(&status) {
                    tracing::error!(job_id = %job_id, "Could not persist failed status: {}", e);
                }
                status
            }
        };

        self.clear_active(&job_id);
        tracing::info!(job_id = %job_id, status = %final_status.status, "Job finished");
        final_status
    }

    async fn run_job(self: Arc<Self>, mut status: JobStatus, token: CancellationToken) -> JobStatus {
        if let Err(e) = self.run_stages(&mut status, &token).await {
            tracing::error!(job_id = ?status.job_id, "Job aborted: {}", e);
            status.fail(None, &format!("Unexpected error: {}", e));
            if let Err(e) = self.store.save(&status) {
                tracing::error!(job_id = ?status.job_id, "Could not persist failed status: {}", e);
            }
        }
        status
    }

    /// Runs every remaining stage; returns early on failure or cancellation
    ///
    /// Only storage failures escape as errors. Stage failures are
    /// recorded on `status`.
    async fn run_stages(
        &self,
        status: &mut JobStatus,
        token: &CancellationToken,
    ) -> Result<(), StorageError> {
        let job_id = status.job_id.clone().unwrap_or_default();
        let stages = status.stages_to_run.clone();

        for stage in stages {
            if self.cancel_requested(&job_id, token) {
                tracing::info!(job_id = %job_id, stage = %stage, "Cancelled before stage launch");
                status.cancelled = true;
                status.cancel(CANCELLED_MESSAGE, Utc::now());
                return self.store.save(status);
            }

            status.begin_stage(stage);
            self.store.save(status)?;
            tracing::info!(job_id = %job_id, stage = %stage, "Stage started");

            let result = match stage {
                Stage::Scraping => self.run_crawl_stage(status, token).await,
                Stage::Processing => {
                    self.run_command_stage(stage, &self.settings.transform, status, token)
                        .await
                }
                Stage::DatabaseUpdate => {
                    self.run_command_stage(stage, &self.settings.load, status, token)
                        .await
                }
            };
            status.process_pid = None;

            match result {
                Ok(StageOutcome::Completed) => {
                    status.complete_stage(stage);
                    self.store.save(status)?;
                    tracing::info!(job_id = %job_id, stage = %stage, "Stage completed");
                }
                Ok(StageOutcome::Cancelled) => {
                    status.cancelled = true;
                    status.cancel(CANCELLED_MESSAGE, Utc::now());
                    self.store.save(status)?;
                    tracing::info!(job_id = %job_id, stage = %stage, "Stage cancelled");
                    return Ok(());
                }
                Err(e) => {
                    tracing::error!(job_id = %job_id, stage = %stage, "Stage failed: {}", e);
                    status.fail(Some(stage), &e.to_string());
                    return self.store.save(status);
                }
            }
        }

        status.complete(Utc::now());
        self.store.save(status)
    }

    /// Crawl stage: launch the crawl child and wait for it
    async fn run_crawl_stage(
        &self,
        status: &mut JobStatus,
        token: &CancellationToken,
    ) -> Result<StageOutcome, StageError> {
        let stage = Stage::Scraping;
        let job_id = status.job_id.clone().unwrap_or_default();

        // Pre-flight: nothing is launched without a valid config
        let config = self.config_provider.load()?;
        status.config_hash = Some(crawl_config_hash(&config)?);
        status.crawled_groups = config.groups.clone();

        let snapshot = JsonConfigProvider::new(self.snapshot_path());
        snapshot.save(&config)?;

        let command = self
            .crawl_command(snapshot.path(), &job_id)
            .map_err(|e| StageError::Launch {
                stage,
                source: SupervisorError::Io(e),
            })?;

        let started = status
            .started_at
            .map(SystemTime::from)
            .unwrap_or_else(SystemTime::now);

        let handle = self
            .supervisor
            .launch(&command)
            .map_err(|source| StageError::Launch { stage, source })?;

        status.process_pid = handle.pid();
        if let Err(e) = self.persist(status) {
            tracing::error!(job_id = %job_id, "Could not record crawl pid, stopping crawl: {}", e);
            if let Err(stop) = self
                .supervisor
                .abandon(handle, self.settings.crawl.grace_period())
                .await
            {
                tracing::warn!(job_id = %job_id, "Stopping crawl failed: {}", stop);
            }
            return Err(e);
        }

        let crawl = &self.settings.crawl;
        let outcome = self
            .supervisor
            .await_with_cancellation(handle, crawl.poll_interval(), crawl.grace_period(), || {
                self.cancel_requested(&job_id, token)
            })
            .await
            .map_err(|e| StageError::Internal(format!("Unexpected error: {}", e)))?;

        match outcome {
            ExitOutcome::Cancelled => Ok(StageOutcome::Cancelled),
            ExitOutcome::Exited(Some(0)) => {
                match count_items_since(
                    &self.settings.paths.output_dir,
                    &config.groups,
                    started,
                    MTIME_TOLERANCE,
                ) {
                    Ok(count) => {
                        tracing::info!(
                            job_id = %job_id,
                            "Crawl produced {} items in {} groups",
                            count.total,
                            count.groups.len()
                        );
                        status.n_items_fetched = Some(count.total);
                        status.crawled_groups = count.groups;
                    }
                    Err(e) => tracing::warn!(job_id = %job_id, "Could not count crawled items: {}", e),
                }
                Ok(StageOutcome::Completed)
            }
            ExitOutcome::Exited(code) => Err(StageError::Exit {
                stage,
                code,
                context: self.crawl_error_context(),
            }),
        }
    }

    /// Transform or load stage: a bounded command with captured output
    async fn run_command_stage(
        &self,
        stage: Stage,
        stage_config: &CommandStageConfig,
        status: &mut JobStatus,
        token: &CancellationToken,
    ) -> Result<StageOutcome, StageError> {
        let job_id = status.job_id.clone().unwrap_or_default();
        let command = LaunchCommand::new(&stage_config.program)
            .args(stage_config.args.iter().cloned())
            .work_dir(stage_config.work_dir.clone())
            .env(
                "PIPELINE_OUTPUT_DIR",
                absolute(&self.settings.paths.output_dir)
                    .display()
                    .to_string(),
            )
            .env("PIPELINE_JOB_ID", job_id.as_str());

        let limit = stage_config
            .timeout_secs
            .map(Duration::from_secs)
            .or_else(|| stage.default_timeout());

        if let Err(e) = self
            .supervisor
            .sink()
            .append_line(&format!("=== {}: {} ===", stage.title(), command.display()))
        {
            tracing::warn!("Cannot write to log sink: {}", e);
        }

        let outcome = self
            .supervisor
            .run_bounded(&command, limit, self.settings.crawl.poll_interval(), || {
                self.cancel_requested(&job_id, token)
            })
            .await;

        match outcome {
            Ok(BoundedOutcome::Cancelled) => Ok(StageOutcome::Cancelled),
            Ok(BoundedOutcome::Finished(output)) if output.success() => {
                if stage == Stage::DatabaseUpdate {
                    status.import_stats = ImportStats::from_output(&output.stdout);
                    if let Some(stats) = &status.import_stats {
                        tracing::info!(
                            job_id = %job_id,
                            "Import: {} inserted, {} updated, {} skipped, {} errors",
                            stats.inserted,
                            stats.updated,
                            stats.skipped,
                            stats.errors
                        );
                    }
                }
                Ok(StageOutcome::Completed)
            }
            Ok(BoundedOutcome::Finished(output)) => {
                let source = if output.stderr.trim().is_empty() {
                    &output.stdout
                } else {
                    &output.stderr
                };
                Err(StageError::Exit {
                    stage,
                    code: output.code,
                    context: last_lines(source, self.settings.crawl.error_context_lines),
                })
            }
            Err(SupervisorError::Timeout { limit }) => Err(StageError::Timeout { stage, limit }),
            Err(source) => Err(StageError::Launch { stage, source }),
        }
    }

    /// Crawl child command: the configured program, or this executable's `crawl`
    fn crawl_command(&self, config_path: &Path, job_id: &str) -> std::io::Result<LaunchCommand> {
        let crawl = &self.settings.crawl;
        let output_dir = absolute(&self.settings.paths.output_dir);
        let config_path = absolute(config_path);

        let command = match &crawl.program {
            Some(program) => LaunchCommand::new(program).args(crawl.args.iter().cloned()),
            None => LaunchCommand::new(std::env::current_exe()?)
                .arg("crawl")
                .arg("--config")
                .arg(config_path.display().to_string())
                .arg("--output-dir")
                .arg(output_dir.display().to_string())
                .arg("--listing-url")
                .arg(crawl.listing_url.as_str()),
        };

        Ok(command
            .work_dir(crawl.work_dir.clone())
            .env("CRAWL_CONFIG_FILE", config_path.display().to_string())
            .env("CRAWL_OUTPUT_DIR", output_dir.display().to_string())
            .env("CRAWL_LISTING_URL", crawl.listing_url.as_str())
            .env("PIPELINE_JOB_ID", job_id))
    }

    fn snapshot_path(&self) -> PathBuf {
        self.settings
            .paths
            .state_database
            .with_file_name(CONFIG_SNAPSHOT_FILE)
    }

    fn crawl_error_context(&self) -> String {
        match self
            .supervisor
            .sink()
            .tail(self.settings.crawl.error_context_lines)
        {
            Ok(lines) => lines.join("\n"),
            Err(e) => format!("log unavailable: {}", e),
        }
    }

    fn persist(&self, status: &JobStatus) -> Result<(), StageError> {
        self.store
            .save(status)
            .map_err(|e| StageError::Internal(format!("Unexpected error: {}", e)))
    }

    /// True once cancellation was requested in-process or through the store
    fn cancel_requested(&self, job_id: &str, token: &CancellationToken) -> bool {
        if token.is_cancelled() {
            return true;
        }
        match self.store.cancel_requested(job_id) {
            Ok(requested) => requested,
            Err(e) => {
                tracing::warn!(job_id, "Cannot read cancel flag: {}", e);
                false
            }
        }
    }

    /// Evidence that the recorded job still runs
    ///
    /// `Some(pid)` when a process is alive, `Some(None)` when only the
    /// in-process job task is, `None` when nothing is.
    fn liveness(&self, status: &JobStatus) -> Option<Option<u32>> {
        if let Some(pid) = self.supervisor.current_pid().filter(|_| self.supervisor.is_alive()) {
            return Some(Some(pid));
        }
        if let Some(pid) = status.process_pid.filter(|pid| pid_alive(*pid)) {
            return Some(Some(pid));
        }
        match (&status.job_id, self.active_job_id()) {
            (Some(recorded), Some(active)) if *recorded == active => Some(None),
            _ => None,
        }
    }

    fn set_active(&self, job_id: &str, token: CancellationToken) {
        if let Ok(mut active) = self.active.lock() {
            *active = Some(ActiveJob {
                job_id: job_id.to_string(),
                token,
            });
        }
    }

    fn clear_active(&self, job_id: &str) {
        if let Ok(mut active) = self.active.lock() {
            if active.as_ref().map_or(false, |job| job.job_id == job_id) {
                *active = None;
            }
        }
    }

    fn active_token(&self, job_id: &str) -> Option<CancellationToken> {
        let active = self.active.lock().ok()?;
        active
            .as_ref()
            .filter(|job| job.job_id == job_id)
            .map(|job| job.token.clone())
    }

    fn active_job_id(&self) -> Option<String> {
        let active = self.active.lock().ok()?;
        active.as_ref().map(|job| job.job_id.clone())
    }
}

/// States a new job may start from
fn startable_states() -> Vec<JobState> {
    JobState::ALL
        .into_iter()
        .filter(|state| state.can_transition_to(JobState::Running))
        .collect()
}

/// Relative paths are resolved against the working directory
fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    match std::env::current_dir() {
        Ok(cwd) => cwd.join(path),
        Err(_) => path.to_path_buf(),
    }
}

fn last_lines(text: &str, count: usize) -> String {
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(count);
    lines[start..].join("\n")
}
