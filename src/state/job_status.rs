use crate::state::{JobState, Stage};
use crate::truncate_message;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Persisted status record of the current (or last) pipeline job
///
/// The record is always written whole; readers never see a partial update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobStatus {
    /// Opaque unique token, absent for a reset (idle) record
    #[serde(rename = "id")]
    pub job_id: Option<String>,

    pub status: JobState,

    /// Stage currently executing, or the stage a failure happened in
    pub current_stage: Option<Stage>,

    /// 0-100, never decreases within one job
    pub progress_percent: u8,

    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    /// Truncated to [`crate::MAX_ERROR_MESSAGE_LEN`] characters
    pub error_message: Option<String>,

    pub stages_completed: Vec<Stage>,
    pub stages_failed: Vec<Stage>,
    pub stages_to_run: Vec<Stage>,
    pub start_stage: Option<Stage>,

    /// Cancellation was requested; distinct from the terminal `cancelled` state
    pub cancelled: bool,

    /// Pid of the crawl child, for liveness checks after a restart
    pub process_pid: Option<u32>,

    /// Items written by the crawl stage of this job
    pub n_items_fetched: Option<u64>,

    /// Groups the crawl stage was configured with
    pub crawled_groups: Vec<String>,

    /// Hash of the crawl config the crawl stage ran with
    pub config_hash: Option<String>,

    /// Counts reported by the load stage, when it printed them
    pub import_stats: Option<ImportStats>,

    /// Set on every write
    pub last_updated: Option<DateTime<Utc>>,
}

impl Default for JobStatus {
    fn default() -> Self {
        Self {
            job_id: None,
            status: JobState::Idle,
            current_stage: None,
            progress_percent: 0,
            started_at: None,
            completed_at: None,
            error_message: None,
            stages_completed: Vec::new(),
            stages_failed: Vec::new(),
            stages_to_run: Vec::new(),
            start_stage: None,
            cancelled: false,
            process_pid: None,
            n_items_fetched: None,
            crawled_groups: Vec::new(),
            config_hash: None,
            import_stats: None,
            last_updated: None,
        }
    }
}

impl JobStatus {
    /// The status reported when no job has ever run
    pub fn idle() -> Self {
        Self::default()
    }

    /// Creates the running status of a freshly started job
    ///
    /// Stages preceding `start_stage` are recorded as already completed.
    pub fn new_job(
        job_id: impl Into<String>,
        start_stage: Stage,
        stages_to_run: Vec<Stage>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id: Some(job_id.into()),
            status: JobState::Running,
            started_at: Some(now),
            stages_completed: Stage::before(start_stage),
            stages_to_run,
            start_stage: Some(start_stage),
            ..Self::default()
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == JobState::Running
    }

    pub fn can_start_new(&self) -> bool {
        self.status.can_start_new()
    }

    /// Raises progress; lower values are ignored so progress stays monotonic
    pub fn set_progress(&mut self, percent: u8) {
        self.progress_percent = self.progress_percent.max(percent.min(100));
    }

    /// Marks `stage` as executing and moves progress to the start of its window
    pub fn begin_stage(&mut self, stage: Stage) {
        self.current_stage = Some(stage);
        self.set_progress(stage.progress_window().0);
    }

    /// Records a successful stage and moves progress to the end of its window
    pub fn complete_stage(&mut self, stage: Stage) {
        if !self.stages_completed.contains(&stage) {
            self.stages_completed.push(stage);
        }
        self.set_progress(stage.progress_window().1);
    }

    /// Terminal failure; `completed_at` is deliberately left unset
    pub fn fail(&mut self, stage: Option<Stage>, message: &str) {
        if let Some(stage) = stage {
            self.current_stage = Some(stage);
            self.stages_failed.push(stage);
        }
        self.status = JobState::Failed;
        self.error_message = Some(truncate_message(message));
        self.process_pid = None;
    }

    pub fn cancel(&mut self, message: &str, now: DateTime<Utc>) {
        self.status = JobState::Cancelled;
        self.error_message = Some(truncate_message(message));
        self.completed_at = Some(now);
        self.process_pid = None;
    }

    pub fn complete(&mut self, now: DateTime<Utc>) {
        self.status = JobState::Completed;
        self.current_stage = None;
        self.set_progress(100);
        self.completed_at = Some(now);
        self.process_pid = None;
    }

    /// Elapsed seconds: completion minus start, or now minus start while running
    pub fn duration_seconds(&self, now: DateTime<Utc>) -> Option<i64> {
        let started = self.started_at?;
        match (self.completed_at, self.status) {
            (Some(completed), _) => Some((completed - started).num_seconds()),
            (None, JobState::Running) => Some((now - started).num_seconds()),
            _ => None,
        }
    }
}

/// Counts reported by the external database importer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ImportStats {
    pub inserted: u64,
    pub updated: u64,
    pub skipped: u64,
    pub errors: u64,
}

impl ImportStats {
    /// Parses the last non-empty line of a load stage's stdout
    ///
    /// Returns None unless that line is a JSON object with all four counts.
    pub fn from_output(stdout: &str) -> Option<Self> {
        let last = stdout.lines().rev().find(|l| !l.trim().is_empty())?;
        serde_json::from_str(last.trim()).ok()
    }
}

/// One history entry: a job status snapshot plus its duration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    #[serde(flatten)]
    pub status: JobStatus,

    pub duration_seconds: Option<i64>,
}

impl HistoryRecord {
    pub fn from_status(status: JobStatus, now: DateTime<Utc>) -> Self {
        let duration_seconds = status.duration_seconds(now);
        Self {
            status,
            duration_seconds,
        }
    }
}

/// A page of history records, most recent first
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryPage {
    pub records: Vec<HistoryRecord>,
    pub total: usize,
    pub limit: usize,
    pub offset: usize,
}
