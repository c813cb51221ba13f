//! Configuration module for Sumi-Pipeline
//!
//! Two configuration sources live here:
//! - `PipelineSettings`: the controller's TOML file (paths, stage commands, timeouts)
//! - `CrawlConfig`: crawl parameters owned by an external config provider (JSON)
//!
//! # Example
//!
//! ```no_run
//! use sumi_pipeline::config::{load_settings, ConfigProvider, JsonConfigProvider};
//! use std::path::Path;
//!
//! let settings = load_settings(Path::new("pipeline.toml")).unwrap();
//! let provider = JsonConfigProvider::new(&settings.paths.crawl_config);
//! let crawl = provider.load().unwrap();
//! println!("Crawling {} groups with {} workers", crawl.groups.len(), crawl.worker_count);
//! ```

mod parser;
mod types;
mod validation;

// Re-export types
pub use types::{
    CommandStageConfig, CrawlConfig, CrawlStageConfig, PathsConfig, PipelineSettings,
    DEFAULT_GROUPS, DEFAULT_LISTING_URL, PUBLICATION_DATE_FORMAT,
};

// Re-export parser functions
pub use parser::{
    compute_config_hash, crawl_config_hash, load_crawl_config, load_settings,
    load_settings_with_hash, ConfigProvider, JsonConfigProvider,
};

pub use validation::{validate_crawl_config, validate_listing_url};
