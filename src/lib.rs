//! Sumi-Pipeline: a restart-safe scrape pipeline
//!
//! This crate runs a multi-stage batch job (crawl, transform, load) that may
//! take days to finish. It persists the job status so it survives controller
//! restarts, supervises the crawl as a child process with live log capture,
//! and crawls listing pages per group under jitter delays, bounded
//! concurrency and retry.

pub mod config;
pub mod crawler;
pub mod output;
pub mod pipeline;
pub mod state;
pub mod storage;
pub mod supervisor;

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for Sumi-Pipeline operations
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] storage::StorageError),

    #[error("Supervisor error: {0}")]
    Supervisor(#[from] supervisor::SupervisorError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] crawler::FetchError),

    #[error("HTTP client error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] ::url::ParseError),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config file not found: {}", .0.display())]
    Missing(PathBuf),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to parse JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid URL in config: {0}")]
    InvalidUrl(String),
}

/// Result type alias for Sumi-Pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Result type alias for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Maximum length of an error message persisted into a job status
pub const MAX_ERROR_MESSAGE_LEN: usize = 500;

/// Truncates a message to [`MAX_ERROR_MESSAGE_LEN`] characters
pub fn truncate_message(message: &str) -> String {
    match message.char_indices().nth(MAX_ERROR_MESSAGE_LEN) {
        Some((idx, _)) => message[..idx].to_string(),
        None => message.to_string(),
    }
}

// Re-export commonly used types
pub use config::{CrawlConfig, PipelineSettings};
pub use pipeline::{PipelineController, Stage};
pub use state::{HistoryRecord, JobState, JobStatus};
