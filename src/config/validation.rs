use crate::config::types::{CommandStageConfig, CrawlConfig, CrawlStageConfig, PipelineSettings};
use crate::ConfigError;
use std::path::Path;
use url::Url;

/// Validates a crawl config
pub fn validate_crawl_config(config: &CrawlConfig) -> Result<(), ConfigError> {
    if config.worker_count < 1 || config.worker_count > 10 {
        return Err(ConfigError::Validation(format!(
            "max_workers must be between 1 and 10, got {}",
            config.worker_count
        )));
    }

    if config.request_timeout_secs < 5 || config.request_timeout_secs > 60 {
        return Err(ConfigError::Validation(format!(
            "request_timeout must be between 5 and 60 seconds, got {}",
            config.request_timeout_secs
        )));
    }

    validate_delay_range("delay_between_offers", config.offer_delay_range(), 0.1, 5.0)?;
    validate_delay_range("delay_between_pages", config.page_delay_range(), 0.5, 10.0)?;

    if config.max_items_per_group == Some(0) {
        return Err(ConfigError::Validation(
            "max_offers_per_brand must be >= 1 when set".to_string(),
        ));
    }

    validate_groups(&config.groups)?;

    if let (Some(from), Some(to)) = (config.publication_date_from, config.publication_date_to) {
        if to < from {
            return Err(ConfigError::Validation(format!(
                "date_to ({}) cannot be earlier than date_from ({})",
                to, from
            )));
        }
    }

    Ok(())
}

/// Validates a `(min, max)` jitter range against inclusive bounds
fn validate_delay_range(
    name: &str,
    (min, max): (f64, f64),
    lower: f64,
    upper: f64,
) -> Result<(), ConfigError> {
    for (suffix, value) in [("min", min), ("max", max)] {
        if !value.is_finite() || value < lower || value > upper {
            return Err(ConfigError::Validation(format!(
                "{}_{} must be between {} and {} seconds, got {}",
                name, suffix, lower, upper, value
            )));
        }
    }

    if max < min {
        return Err(ConfigError::Validation(format!(
            "{}_max ({}) must be >= {}_min ({})",
            name, max, name, min
        )));
    }

    Ok(())
}

/// Validates group identifiers: non-empty, lowercase slug characters only
fn validate_groups(groups: &[String]) -> Result<(), ConfigError> {
    if groups.is_empty() {
        return Err(ConfigError::Validation(
            "brands_to_scrape must list at least one group".to_string(),
        ));
    }

    for group in groups {
        if group.is_empty() {
            return Err(ConfigError::Validation(
                "Group identifier cannot be empty".to_string(),
            ));
        }

        // Group ids end up in URLs and output file names
        if !group
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(ConfigError::Validation(format!(
                "Group '{}' must contain only lowercase letters, digits and hyphens",
                group
            )));
        }
    }

    Ok(())
}

/// Validates the pipeline settings file
pub fn validate_settings(settings: &PipelineSettings) -> Result<(), ConfigError> {
    validate_path("paths.state-database", &settings.paths.state_database)?;
    validate_path("paths.crawl-config", &settings.paths.crawl_config)?;
    validate_path("paths.output-dir", &settings.paths.output_dir)?;
    validate_path("paths.log-file", &settings.paths.log_file)?;
    validate_crawl_stage(&settings.crawl)?;
    validate_command_stage("transform", &settings.transform)?;
    validate_command_stage("load", &settings.load)?;
    Ok(())
}

fn validate_path(name: &str, path: &Path) -> Result<(), ConfigError> {
    if path.as_os_str().is_empty() {
        return Err(ConfigError::Validation(format!("{} cannot be empty", name)));
    }
    Ok(())
}

fn validate_crawl_stage(config: &CrawlStageConfig) -> Result<(), ConfigError> {
    validate_listing_url(&config.listing_url)?;

    if config.poll_interval_ms == 0 {
        return Err(ConfigError::Validation(
            "crawl.poll-interval-ms must be > 0".to_string(),
        ));
    }

    if let Some(program) = &config.program {
        validate_path("crawl.program", program)?;
    }

    Ok(())
}

fn validate_command_stage(name: &str, config: &CommandStageConfig) -> Result<(), ConfigError> {
    validate_path(&format!("{}.program", name), &config.program)?;

    if config.timeout_secs == Some(0) {
        return Err(ConfigError::Validation(format!(
            "{}.timeout-secs must be > 0",
            name
        )));
    }

    Ok(())
}

/// Validates a listing URL template
pub fn validate_listing_url(template: &str) -> Result<(), ConfigError> {
    for placeholder in ["{group}", "{page}"] {
        if !template.contains(placeholder) {
            return Err(ConfigError::Validation(format!(
                "listing-url must contain the {} placeholder",
                placeholder
            )));
        }
    }

    let sample = template.replace("{group}", "group").replace("{page}", "1");
    let url = Url::parse(&sample)
        .map_err(|e| ConfigError::InvalidUrl(format!("Invalid listing-url: {}", e)))?;

    if url.scheme() != "https" && url.scheme() != "http" {
        return Err(ConfigError::InvalidUrl(format!(
            "listing-url must use http or https, got '{}'",
            url.scheme()
        )));
    }

    Ok(())
}
