//! Integration tests for the pipeline controller
//!
//! Stages are played by `sh` scripts so the tests exercise real child
//! processes, signals and the SQLite status store.
#![cfg(unix)]

use chrono::Utc;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use sumi_pipeline::config::{
    CommandStageConfig, ConfigProvider, CrawlConfig, CrawlStageConfig, JsonConfigProvider,
    PathsConfig, PipelineSettings,
};
use sumi_pipeline::pipeline::ControlError;
use sumi_pipeline::state::HistoryPage;
use sumi_pipeline::storage::{SqliteStatusStore, StatusStore, StorageError, HISTORY_LIMIT};
use sumi_pipeline::supervisor::pid_alive;
use sumi_pipeline::{JobState, JobStatus, PipelineController, Stage};
use tempfile::TempDir;

fn sh_stage(script: &str) -> CommandStageConfig {
    CommandStageConfig {
        program: PathBuf::from("sh"),
        args: vec!["-c".to_string(), script.to_string()],
        work_dir: None,
        timeout_secs: Some(30),
    }
}

/// Creates settings whose crawl, transform and load stages run the given scripts
fn create_test_settings(dir: &TempDir, crawl: &str, transform: &str, load: &str) -> PipelineSettings {
    PipelineSettings {
        paths: PathsConfig {
            state_database: dir.path().join("state").join("pipeline.db"),
            crawl_config: dir.path().join("crawl.json"),
            output_dir: dir.path().join("out"),
            log_file: dir.path().join("logs").join("crawl.log"),
        },
        crawl: CrawlStageConfig {
            program: Some(PathBuf::from("sh")),
            args: vec!["-c".to_string(), crawl.to_string()],
            poll_interval_ms: 50,
            grace_period_secs: 2,
            ..CrawlStageConfig::default()
        },
        transform: sh_stage(transform),
        load: sh_stage(load),
    }
}

/// Writes a crawl config for the audi and bmw groups
fn create_test_provider(settings: &PipelineSettings) -> JsonConfigProvider {
    let provider = JsonConfigProvider::new(&settings.paths.crawl_config);
    let config = CrawlConfig {
        groups: vec!["audi".to_string(), "bmw".to_string()],
        ..CrawlConfig::default()
    };
    provider.save(&config).unwrap();
    provider
}

fn create_test_controller(settings: PipelineSettings) -> Arc<PipelineController> {
    let provider = create_test_provider(&settings);
    let store = SqliteStatusStore::new(&settings.paths.state_database).unwrap();
    PipelineController::new(settings, Arc::new(store), Arc::new(provider))
}

/// Status store that keeps a copy of every record written to it
struct RecordingStore {
    inner: SqliteStatusStore,
    saved: Mutex<Vec<JobStatus>>,
}

impl RecordingStore {
    fn new(settings: &PipelineSettings) -> Self {
        Self {
            inner: SqliteStatusStore::new(&settings.paths.state_database).unwrap(),
            saved: Mutex::new(Vec::new()),
        }
    }

    fn saved(&self) -> Vec<JobStatus> {
        self.saved.lock().unwrap().clone()
    }
}

impl StatusStore for RecordingStore {
    fn load(&self) -> Result<JobStatus, StorageError> {
        self.inner.load()
    }

    fn save(&self, status: &JobStatus) -> Result<(), StorageError> {
        self.saved.lock().unwrap().push(status.clone());
        self.inner.save(status)
    }

    fn try_transition(
        &self,
        allowed_from: &[JobState],
        next: &JobStatus,
    ) -> Result<Result<(), JobStatus>, StorageError> {
        self.inner.try_transition(allowed_from, next)
    }

    fn request_cancel(&self, job_id: &str) -> Result<bool, StorageError> {
        self.inner.request_cancel(job_id)
    }

    fn cancel_requested(&self, job_id: &str) -> Result<bool, StorageError> {
        self.inner.cancel_requested(job_id)
    }

    fn reset(&self) -> Result<(), StorageError> {
        self.inner.reset()
    }

    fn history(&self, limit: usize, offset: usize) -> Result<HistoryPage, StorageError> {
        self.inner.history(limit, offset)
    }

    fn delete_history(&self, job_id: &str) -> Result<(), StorageError> {
        self.inner.delete_history(job_id)
    }
}

/// Saves a running crawl status as a controller that has since exited would
fn save_running_crawl(settings: &PipelineSettings, job_id: &str, pid: u32) {
    let store = SqliteStatusStore::new(&settings.paths.state_database).unwrap();
    let mut status = JobStatus::new_job(job_id, Stage::Scraping, Stage::ALL.to_vec(), Utc::now());
    status.begin_stage(Stage::Scraping);
    status.process_pid = Some(pid);
    store.save(&status).unwrap();
}

/// Waits until the running job has recorded its crawl process
async fn wait_for_pid(controller: &PipelineController) -> JobStatus {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let status = controller.status().unwrap();
        if status.process_pid.is_some() {
            return status;
        }
        assert!(Instant::now() < deadline, "crawl process never started");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_crawl_failure_fails_job() {
    let dir = TempDir::new().unwrap();
    let controller = create_test_controller(create_test_settings(
        &dir,
        "echo starting; echo 'fatal: listing unreachable' >&2; exit 1",
        "true",
        "true",
    ));

    let ticket = controller.start(Stage::Scraping, None).unwrap();
    let status = ticket.handle.await.unwrap();

    assert_eq!(status.status, JobState::Failed);
    assert_eq!(status.stages_failed, vec![Stage::Scraping]);
    assert!(status.stages_completed.is_empty());
    assert!(status.completed_at.is_none());
    assert!(status.process_pid.is_none());

    let message = status.error_message.clone().unwrap();
    assert!(message.starts_with("Scraping failed (return code 1)"));
    assert!(message.contains("fatal: listing unreachable"));

    let stored = controller.status().unwrap();
    assert_eq!(stored.status, JobState::Failed);
    assert_eq!(stored.job_id.as_deref(), Some(ticket.job_id.as_str()));

    let logs = controller.logs(20).unwrap();
    assert!(logs.iter().any(|l| l.ends_with("| starting")));
}

#[tokio::test]
async fn test_full_run_records_items_and_import_stats() {
    let dir = TempDir::new().unwrap();
    let controller = create_test_controller(create_test_settings(
        &dir,
        r#"mkdir -p "$CRAWL_OUTPUT_DIR" && printf '{"id":"1"}\n{"id":"2"}\n{"id":"3"}\n' > "$CRAWL_OUTPUT_DIR/audi.jsonl""#,
        r#"test -f "$PIPELINE_OUTPUT_DIR/audi.jsonl""#,
        r#"echo importing; echo '{"inserted": 2, "updated": 1, "skipped": 0, "errors": 0}'"#,
    ));

    let ticket = controller.start(Stage::Scraping, None).unwrap();
    let status = ticket.handle.await.unwrap();

    assert_eq!(status.status, JobState::Completed, "{:?}", status.error_message);
    assert_eq!(status.progress_percent, 100);
    assert_eq!(status.stages_completed, Stage::ALL.to_vec());
    assert_eq!(status.n_items_fetched, Some(3));
    assert_eq!(status.crawled_groups, vec!["audi".to_string()]);
    assert!(status.config_hash.is_some());
    assert!(status.completed_at.is_some());

    let stats = status.import_stats.unwrap();
    assert_eq!((stats.inserted, stats.updated), (2, 1));

    let history = controller.history(10, 0).unwrap();
    assert_eq!(history.total, 1);
    assert!(history.records[0].duration_seconds.is_some());
}

#[tokio::test]
async fn test_failure_after_crawl_keeps_crawl_progress() {
    let dir = TempDir::new().unwrap();
    let controller = create_test_controller(create_test_settings(
        &dir,
        "exit 0",
        "echo 'bad input' >&2; exit 2",
        "true",
    ));

    let ticket = controller.start(Stage::Scraping, None).unwrap();
    let status = ticket.handle.await.unwrap();

    assert_eq!(status.status, JobState::Failed);
    assert_eq!(status.stages_completed, vec![Stage::Scraping]);
    assert_eq!(status.stages_failed, vec![Stage::Processing]);
    assert_eq!(status.progress_percent, 75);
    assert_eq!(
        status.error_message.as_deref(),
        Some("Processing failed (return code 2): bad input")
    );
}

#[tokio::test]
async fn test_crawl_boundary_is_persisted_at_seventy_percent() {
    let dir = TempDir::new().unwrap();
    let release = dir.path().join("release");
    let transform = format!(
        r#"while [ ! -f "{}" ]; do sleep 0.05; done"#,
        release.display()
    );
    let settings = create_test_settings(&dir, "exit 0", &transform, "true");
    let provider = create_test_provider(&settings);
    let store = Arc::new(RecordingStore::new(&settings));
    let controller = PipelineController::new(settings, store.clone(), Arc::new(provider));

    let ticket = controller.start(Stage::Scraping, None).unwrap();

    // The transform holds the job in Processing until the release file exists
    let deadline = Instant::now() + Duration::from_secs(10);
    let processing = loop {
        let status = controller.status().unwrap();
        if status.current_stage == Some(Stage::Processing) {
            break status;
        }
        assert!(Instant::now() < deadline, "processing never started");
        tokio::time::sleep(Duration::from_millis(20)).await;
    };
    assert_eq!(processing.status, JobState::Running);
    assert_eq!(processing.stages_completed, vec![Stage::Scraping]);
    assert_eq!(processing.progress_percent, 75);

    let boundary = store
        .saved()
        .into_iter()
        .find(|s| s.stages_completed == vec![Stage::Scraping])
        .expect("crawl completion was never persisted");
    assert_eq!(boundary.current_stage, Some(Stage::Scraping));
    assert_eq!(boundary.progress_percent, 70);
    assert_eq!(boundary.status, JobState::Running);
    assert!(boundary.process_pid.is_none());

    fs::write(&release, "").unwrap();
    let status = ticket.handle.await.unwrap();
    assert_eq!(status.status, JobState::Completed, "{:?}", status.error_message);
}

#[tokio::test]
async fn test_start_from_later_stage() {
    let dir = TempDir::new().unwrap();
    let controller = create_test_controller(create_test_settings(&dir, "exit 1", "true", "true"));

    let ticket = controller.start(Stage::DatabaseUpdate, None).unwrap();
    let status = ticket.handle.await.unwrap();

    assert_eq!(status.status, JobState::Completed);
    assert_eq!(status.start_stage, Some(Stage::DatabaseUpdate));
    assert_eq!(status.stages_to_run, vec![Stage::DatabaseUpdate]);
    assert_eq!(status.stages_completed, Stage::ALL.to_vec());
}

#[tokio::test]
async fn test_command_stage_timeout() {
    let dir = TempDir::new().unwrap();
    let mut settings = create_test_settings(&dir, "exit 0", "sleep 30", "true");
    settings.transform.timeout_secs = Some(1);
    let controller = create_test_controller(settings);

    let started = Instant::now();
    let ticket = controller.start(Stage::Processing, None).unwrap();
    let status = ticket.handle.await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(15));
    assert_eq!(status.status, JobState::Failed);
    assert_eq!(
        status.error_message.as_deref(),
        Some("Processing timed out after 1s")
    );
}

#[tokio::test]
async fn test_second_start_is_rejected() {
    let dir = TempDir::new().unwrap();
    let controller = create_test_controller(create_test_settings(&dir, "sleep 30", "true", "true"));

    let ticket = controller.start(Stage::Scraping, None).unwrap();

    match controller.start(Stage::Scraping, None) {
        Err(ControlError::AlreadyRunning { job_id, status }) => {
            assert_eq!(job_id.as_deref(), Some(ticket.job_id.as_str()));
            assert_eq!(status.status, JobState::Running);
        }
        other => panic!("expected rejection, got {:?}", other.map(|t| t.job_id)),
    }

    wait_for_pid(&controller).await;
    controller.cancel().await.unwrap();
    let status = ticket.handle.await.unwrap();
    assert_eq!(status.status, JobState::Cancelled);
}

#[tokio::test]
async fn test_reset_rejected_while_crawl_alive() {
    let dir = TempDir::new().unwrap();
    let controller = create_test_controller(create_test_settings(&dir, "sleep 30", "true", "true"));

    let ticket = controller.start(Stage::Scraping, None).unwrap();
    let running = wait_for_pid(&controller).await;

    match controller.force_reset(false) {
        Err(ControlError::StillAlive { job_id, pid }) => {
            assert_eq!(job_id, running.job_id);
            assert_eq!(pid, running.process_pid);
        }
        other => panic!("expected rejection, got {:?}", other.map(|s| s.status)),
    }

    controller.cancel().await.unwrap();
    ticket.handle.await.unwrap();

    let status = controller.force_reset(false).unwrap();
    assert_eq!(status.status, JobState::Idle);
}

#[tokio::test]
async fn test_cancel_stops_crawl() {
    let dir = TempDir::new().unwrap();
    let controller = create_test_controller(create_test_settings(&dir, "sleep 30", "true", "true"));

    let ticket = controller.start(Stage::Scraping, None).unwrap();
    wait_for_pid(&controller).await;

    let started = Instant::now();
    let requested = controller.cancel().await.unwrap();
    assert!(requested.cancelled);

    let status = ticket.handle.await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(10));

    assert_eq!(status.status, JobState::Cancelled);
    assert!(status.cancelled);
    assert!(status.completed_at.is_some());
    assert!(status.stages_failed.is_empty());
    assert_eq!(controller.status().unwrap().status, JobState::Cancelled);
    assert!(matches!(controller.cancel().await, Err(ControlError::NotRunning)));
}

#[tokio::test]
async fn test_cancel_from_another_controller() {
    let dir = TempDir::new().unwrap();
    let settings = create_test_settings(&dir, "sleep 30", "true", "true");
    let owner = create_test_controller(settings.clone());

    let ticket = owner.start(Stage::Scraping, None).unwrap();
    wait_for_pid(&owner).await;

    // A second controller on the same database, as a separate CLI process would be
    let store = SqliteStatusStore::new(&settings.paths.state_database).unwrap();
    let provider = JsonConfigProvider::new(&settings.paths.crawl_config);
    let other = PipelineController::new(settings, Arc::new(store), Arc::new(provider));

    other.cancel().await.unwrap();

    let status = tokio::time::timeout(Duration::from_secs(10), ticket.handle)
        .await
        .expect("job did not notice the cancellation")
        .unwrap();
    assert_eq!(status.status, JobState::Cancelled);
}

#[tokio::test]
async fn test_cancel_stops_crawl_left_by_dead_controller() {
    let dir = TempDir::new().unwrap();
    let settings = create_test_settings(&dir, "sleep 30", "true", "true");

    let mut crawl = tokio::process::Command::new("sleep")
        .arg("30")
        .process_group(0)
        .spawn()
        .unwrap();
    let pid = crawl.id().unwrap();
    let reaper = tokio::spawn(async move { crawl.wait().await });
    save_running_crawl(&settings, "left-behind", pid);

    // A fresh controller owns no job task for the recorded job
    let controller = create_test_controller(settings);

    let started = Instant::now();
    let status = controller.cancel().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(10));

    assert_eq!(status.status, JobState::Cancelled);
    assert!(status.cancelled);
    assert!(status.completed_at.is_some());
    assert!(status.process_pid.is_none());
    assert_eq!(status.error_message.as_deref(), Some("Cancelled by user"));

    let exit = reaper.await.unwrap().unwrap();
    assert!(exit.code().is_none());
    assert!(!pid_alive(pid));

    let stored = controller.status().unwrap();
    assert_eq!(stored.status, JobState::Cancelled);
    assert_eq!(stored.job_id.as_deref(), Some("left-behind"));
    assert!(matches!(controller.cancel().await, Err(ControlError::NotRunning)));
}

#[tokio::test]
async fn test_cancel_of_dead_crawl_left_by_dead_controller() {
    let dir = TempDir::new().unwrap();
    let settings = create_test_settings(&dir, "sleep 30", "true", "true");

    let mut crawl = std::process::Command::new("true").spawn().unwrap();
    let pid = crawl.id();
    crawl.wait().unwrap();
    save_running_crawl(&settings, "already-gone", pid);

    let controller = create_test_controller(settings);
    let status = controller.cancel().await.unwrap();

    assert_eq!(status.status, JobState::Cancelled);
    assert_eq!(controller.history(10, 0).unwrap().records[0].status.status, JobState::Cancelled);
}

#[tokio::test]
async fn test_config_locked_while_running() {
    let dir = TempDir::new().unwrap();
    let controller = create_test_controller(create_test_settings(&dir, "sleep 30", "true", "true"));

    let ticket = controller.start(Stage::Scraping, None).unwrap();
    wait_for_pid(&controller).await;

    let config = controller.default_crawl_config();
    assert!(matches!(
        controller.update_crawl_config(&config),
        Err(ControlError::ConfigLocked(_))
    ));

    controller.cancel().await.unwrap();
    ticket.handle.await.unwrap();
    controller.update_crawl_config(&config).unwrap();
}

#[tokio::test]
async fn test_history_is_capped() {
    let dir = TempDir::new().unwrap();
    let controller = create_test_controller(create_test_settings(&dir, "exit 0", "true", "true"));

    let mut last_job = String::new();
    for _ in 0..HISTORY_LIMIT + 3 {
        let ticket = controller.start(Stage::DatabaseUpdate, None).unwrap();
        last_job = ticket.job_id.clone();
        ticket.handle.await.unwrap();
    }

    let page = controller.history(HISTORY_LIMIT, 0).unwrap();
    assert_eq!(page.total, HISTORY_LIMIT);
    assert_eq!(page.records.len(), HISTORY_LIMIT);
    assert_eq!(page.records[0].status.job_id.as_deref(), Some(last_job.as_str()));

    controller.delete_history(&last_job).unwrap();
    assert_eq!(controller.history(HISTORY_LIMIT, 0).unwrap().total, HISTORY_LIMIT - 1);
}
