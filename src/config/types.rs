use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Date format used for publication date bounds and scraped item dates
pub const PUBLICATION_DATE_FORMAT: &str = "%d.%m.%Y";

/// Listing URL template used when the settings file does not override it
pub const DEFAULT_LISTING_URL: &str =
    "https://www.otomoto.pl/osobowe/{group}/?page={page}&search%5Border%5D=created_at_first%3Adesc";

/// Groups crawled when the crawl config does not list any
pub const DEFAULT_GROUPS: &[&str] = &[
    "abarth",
    "alfa-romeo",
    "audi",
    "bmw",
    "chevrolet",
    "citroen",
    "dacia",
    "fiat",
    "ford",
    "honda",
    "hyundai",
    "kia",
    "mazda",
    "mercedes-benz",
    "nissan",
    "opel",
    "peugeot",
    "renault",
    "seat",
    "skoda",
    "toyota",
    "volkswagen",
    "volvo",
];

/// Crawl parameters owned by the config provider
///
/// The JSON keys match the file written by the admin surface. Keys missing
/// from the file are filled from [`CrawlConfig::default`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlConfig {
    /// Number of groups crawled in parallel
    #[serde(rename = "max_workers")]
    pub worker_count: usize,

    /// Per-request timeout (seconds)
    #[serde(rename = "request_timeout")]
    pub request_timeout_secs: u64,

    /// Minimum jitter after each detail fetch (seconds)
    #[serde(rename = "delay_between_offers_min")]
    pub offer_delay_min: f64,

    /// Maximum jitter after each detail fetch (seconds)
    #[serde(rename = "delay_between_offers_max")]
    pub offer_delay_max: f64,

    /// Minimum jitter after each listing page (seconds)
    #[serde(rename = "delay_between_pages_min")]
    pub page_delay_min: f64,

    /// Maximum jitter after each listing page (seconds)
    #[serde(rename = "delay_between_pages_max")]
    pub page_delay_max: f64,

    /// Item cap per group (`None` crawls until listings run out)
    #[serde(rename = "max_offers_per_brand")]
    pub max_items_per_group: Option<usize>,

    /// Groups to crawl, in order
    #[serde(rename = "brands_to_scrape")]
    pub groups: Vec<String>,

    /// Inclusive lower bound on publication date
    #[serde(rename = "date_from", with = "date_format")]
    pub publication_date_from: Option<NaiveDate>,

    /// Inclusive upper bound on publication date
    #[serde(rename = "date_to", with = "date_format")]
    pub publication_date_to: Option<NaiveDate>,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            worker_count: 2,
            request_timeout_secs: 15,
            offer_delay_min: 0.8,
            offer_delay_max: 1.5,
            page_delay_min: 1.5,
            page_delay_max: 3.0,
            max_items_per_group: None,
            groups: DEFAULT_GROUPS.iter().map(|g| g.to_string()).collect(),
            publication_date_from: None,
            publication_date_to: None,
        }
    }
}

impl CrawlConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn offer_delay_range(&self) -> (f64, f64) {
        (self.offer_delay_min, self.offer_delay_max)
    }

    pub fn page_delay_range(&self) -> (f64, f64) {
        (self.page_delay_min, self.page_delay_max)
    }

    /// Returns true if either publication date bound is set
    pub fn has_date_window(&self) -> bool {
        self.publication_date_from.is_some() || self.publication_date_to.is_some()
    }
}

/// Serde adapter for optional `DD.MM.YYYY` dates
mod date_format {
    use super::PUBLICATION_DATE_FORMAT;
    use chrono::NaiveDate;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(date: &Option<NaiveDate>, s: S) -> Result<S::Ok, S::Error> {
        match date {
            Some(d) => s.serialize_str(&d.format(PUBLICATION_DATE_FORMAT).to_string()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<NaiveDate>, D::Error> {
        let raw: Option<String> = Option::deserialize(d)?;
        match raw.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(s) => NaiveDate::parse_from_str(s, PUBLICATION_DATE_FORMAT)
                .map(Some)
                .map_err(|e| serde::de::Error::custom(format!("invalid date '{}': {}", s, e))),
        }
    }
}

/// Pipeline settings loaded from the controller's TOML file
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineSettings {
    pub paths: PathsConfig,
    #[serde(default)]
    pub crawl: CrawlStageConfig,
    pub transform: CommandStageConfig,
    pub load: CommandStageConfig,
}

/// Filesystem locations used by the controller
#[derive(Debug, Clone, Deserialize)]
pub struct PathsConfig {
    /// SQLite database holding the job status and history
    #[serde(rename = "state-database")]
    pub state_database: PathBuf,

    /// JSON crawl config read by the crawl stage
    #[serde(rename = "crawl-config")]
    pub crawl_config: PathBuf,

    /// Directory receiving one output file per group
    #[serde(rename = "output-dir")]
    pub output_dir: PathBuf,

    /// Append-only log sink for the crawl child process
    #[serde(rename = "log-file")]
    pub log_file: PathBuf,
}

/// Crawl stage launch settings
#[derive(Debug, Clone, Deserialize)]
pub struct CrawlStageConfig {
    /// Program to launch; the current executable when unset
    #[serde(default)]
    pub program: Option<PathBuf>,

    /// Arguments for `program`; ignored when `program` is unset
    #[serde(default)]
    pub args: Vec<String>,

    #[serde(rename = "work-dir", default)]
    pub work_dir: Option<PathBuf>,

    /// Listing page URL with `{group}` and `{page}` placeholders
    #[serde(rename = "listing-url", default = "default_listing_url")]
    pub listing_url: String,

    /// How often the wait loop checks for exit and cancellation (milliseconds)
    #[serde(rename = "poll-interval-ms", default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Time between terminate and kill on cancellation (seconds)
    #[serde(rename = "grace-period-secs", default = "default_grace_period_secs")]
    pub grace_period_secs: u64,

    /// Log lines embedded into the error message of a failed crawl
    #[serde(rename = "error-context-lines", default = "default_error_context_lines")]
    pub error_context_lines: usize,
}

impl Default for CrawlStageConfig {
    fn default() -> Self {
        Self {
            program: None,
            args: Vec::new(),
            work_dir: None,
            listing_url: default_listing_url(),
            poll_interval_ms: default_poll_interval_ms(),
            grace_period_secs: default_grace_period_secs(),
            error_context_lines: default_error_context_lines(),
        }
    }
}

impl CrawlStageConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}

/// Transform or load stage settings
#[derive(Debug, Clone, Deserialize)]
pub struct CommandStageConfig {
    pub program: PathBuf,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(rename = "work-dir", default)]
    pub work_dir: Option<PathBuf>,

    /// Hard wall-clock limit; the stage default applies when unset
    #[serde(rename = "timeout-secs", default)]
    pub timeout_secs: Option<u64>,
}

fn default_listing_url() -> String {
    DEFAULT_LISTING_URL.to_string()
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_grace_period_secs() -> u64 {
    5
}

fn default_error_context_lines() -> usize {
    10
}
