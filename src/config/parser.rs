use crate::config::types::{CrawlConfig, PipelineSettings};
use crate::config::validation::{validate_crawl_config, validate_settings};
use crate::ConfigError;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// Loads and parses a pipeline settings file from the given path
///
/// # Arguments
///
/// * `path` - Path to the TOML settings file
///
/// # Returns
///
/// * `Ok(PipelineSettings)` - Successfully loaded and validated settings
/// * `Err(ConfigError)` - Failed to load, parse, or validate the settings
///
/// # Example
///
/// ```no_run
/// use std::path::Path;
/// use sumi_pipeline::config::load_settings;
///
/// let settings = load_settings(Path::new("pipeline.toml")).unwrap();
/// println!("Status database: {}", settings.paths.state_database.display());
/// ```
pub fn load_settings(path: &Path) -> Result<PipelineSettings, ConfigError> {
    let content = std::fs::read_to_string(path)?;

    let settings: PipelineSettings = toml::from_str(&content)?;

    validate_settings(&settings)?;

    Ok(settings)
}

/// Computes a SHA-256 hash of the configuration file content
///
/// # Arguments
///
/// * `path` - Path to the configuration file
///
/// # Returns
///
/// * `Ok(String)` - Hex-encoded SHA-256 hash of the file content
/// * `Err(ConfigError)` - Failed to read the file
pub fn compute_config_hash(path: &Path) -> Result<String, ConfigError> {
    let content = std::fs::read(path)?;
    Ok(hash_bytes(&content))
}

/// Loads pipeline settings and returns both the settings and the file hash
pub fn load_settings_with_hash(path: &Path) -> Result<(PipelineSettings, String), ConfigError> {
    let settings = load_settings(path)?;
    let hash = compute_config_hash(path)?;
    Ok((settings, hash))
}

/// Hex-encoded SHA-256 of the canonical JSON form of a crawl config
///
/// Recorded on the job status so a history entry can be tied to the exact
/// crawl parameters it ran with.
pub fn crawl_config_hash(config: &CrawlConfig) -> Result<String, ConfigError> {
    let canonical = serde_json::to_vec(config)?;
    Ok(hash_bytes(&canonical))
}

fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Source of crawl parameters
///
/// The provider is owned by an external admin surface; the pipeline only
/// reads from it before a crawl and writes to it on explicit request.
pub trait ConfigProvider: Send + Sync {
    /// Loads and validates the current crawl config
    fn load(&self) -> Result<CrawlConfig, ConfigError>;

    /// Validates and persists a crawl config
    fn save(&self, config: &CrawlConfig) -> Result<(), ConfigError>;
}

/// Crawl config stored as a JSON file
#[derive(Debug, Clone)]
pub struct JsonConfigProvider {
    path: PathBuf,
}

impl JsonConfigProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigProvider for JsonConfigProvider {
    fn load(&self) -> Result<CrawlConfig, ConfigError> {
        load_crawl_config(&self.path)
    }

    fn save(&self, config: &CrawlConfig) -> Result<(), ConfigError> {
        validate_crawl_config(config)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let content = serde_json::to_string_pretty(config)?;
        std::fs::write(&self.path, content)?;
        tracing::info!("Crawl config saved to {}", self.path.display());
        Ok(())
    }
}

/// Loads and validates a crawl config file
///
/// A missing file is reported as [`ConfigError::Missing`] rather than
/// falling back to defaults: a crawl must never start with parameters the
/// operator did not write down.
pub fn load_crawl_config(path: &Path) -> Result<CrawlConfig, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::Missing(path.to_path_buf()));
    }

    let content = std::fs::read_to_string(path)?;
    let config: CrawlConfig = serde_json::from_str(&content)?;

    validate_crawl_config(&config)?;

    Ok(config)
}
