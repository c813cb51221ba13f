//! Crawler coordinator - group worker pool and per-group crawl loop
//!
//! One worker handles one group end to end, so pages and items of a group
//! are processed in discovery order. Groups run in parallel, bounded by the
//! configured worker count. A failing group never cancels the others.

use crate::config::CrawlConfig;
use crate::crawler::fetcher::{build_http_client, fetch_with_retry, RetryPolicy};
use crate::crawler::filter::within_publication_window;
use crate::crawler::parser::{parse_detail, parse_listing, DetailOutcome, RawItem};
use crate::output::write_group_file;
use crate::PipelineError;
use rand::Rng;
use reqwest::Client;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use url::Url;

/// Caps at or below this value halve the offer delays
const FAST_MODE_CAP: usize = 50;

/// Outcome of crawling one group
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroupResult {
    pub group: String,

    /// Accepted items, in discovery order
    pub items: Vec<RawItem>,

    /// Detail pages fetched successfully
    pub fetched: usize,

    /// Items rejected by the publication date window
    pub filtered_out: usize,

    /// Detail links attempted
    pub processed: usize,

    /// Set when the group ended on an unexpected error; `items` stays partial
    pub error: Option<String>,
}

impl GroupResult {
    pub fn new(group: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            ..Self::default()
        }
    }
}

/// Rate-limited crawler over the configured groups
#[derive(Clone)]
pub struct Crawler {
    config: Arc<CrawlConfig>,
    listing_url: String,
    output_dir: PathBuf,
    client: Client,
    retry: RetryPolicy,
}

impl Crawler {
    /// Creates a crawler
    ///
    /// # Arguments
    ///
    /// * `config` - Crawl parameters from the config provider
    /// * `listing_url` - Listing URL template with `{group}` and `{page}`
    /// * `output_dir` - Directory for the group output files
    ///
    /// # Returns
    ///
    /// * `Ok(Crawler)` - Ready to run
    /// * `Err(PipelineError)` - The HTTP client could not be built
    pub fn new(
        config: CrawlConfig,
        listing_url: impl Into<String>,
        output_dir: impl Into<PathBuf>,
    ) -> Result<Self, PipelineError> {
        let client = build_http_client(config.request_timeout())?;
        Ok(Self {
            config: Arc::new(config),
            listing_url: listing_url.into(),
            output_dir: output_dir.into(),
            client,
            retry: RetryPolicy::default(),
        })
    }

    /// Replaces the retry policy used for listing and detail fetches
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Crawls every configured group
    ///
    /// # Returns
    ///
    /// One result per group. A group whose collection panicked keeps the
    /// items found before the panic and carries an error. A worker that dies
    /// outside collection is logged and its group is absent from the map.
    pub async fn run(&self) -> HashMap<String, GroupResult> {
        let semaphore = Arc::new(Semaphore::new(self.config.worker_count.max(1)));
        let mut workers = JoinSet::new();

        tracing::info!(
            "Crawling {} groups with {} workers",
            self.config.groups.len(),
            self.config.worker_count.max(1)
        );

        for group in self.config.groups.iter().cloned() {
            let crawler = self.clone();
            let semaphore = Arc::clone(&semaphore);
            workers.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                crawler.crawl_group(group).await
            });
        }

        let mut results = HashMap::new();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(result) => {
                    results.insert(result.group.clone(), result);
                }
                Err(e) => tracing::error!("Group worker aborted: {}", e),
            }
        }

        results
    }

    /// Crawls one group: page loop, detail fetches, date filter, output file
    ///
    /// Collection runs on its own task. If it panics, the items gathered so
    /// far are still written and the group carries an error.
    pub async fn crawl_group(&self, group: String) -> GroupResult {
        let progress = GroupProgress::new(&group);

        let crawler = self.clone();
        let shared = progress.clone();
        let joined = tokio::spawn(async move { crawler.collect_group(&group, &shared).await }).await;

        self.finish_group(&progress, joined)
    }

    async fn collect_group(&self, group: &str, progress: &GroupProgress) {
        let cap = self.config.max_items_per_group;
        let (offer_min, offer_max) = scaled_offer_delays(&self.config);
        let (page_min, page_max) = self.config.page_delay_range();

        tracing::info!(
            group = %group,
            "Starting group (cap: {}, offer delay {:.2}-{:.2}s)",
            cap.map_or_else(|| "none".to_string(), |c| c.to_string()),
            offer_min,
            offer_max
        );

        let mut page: u32 = 1;
        'pages: loop {
            if progress.update(|r| cap_reached(r, cap)) {
                break;
            }

            let listing_url = match self.listing_url_for(group, page) {
                Ok(url) => url,
                Err(e) => {
                    progress.update(|r| r.error = Some(format!("invalid listing URL: {}", e)));
                    break;
                }
            };

            let html = match fetch_with_retry(&self.client, listing_url.as_str(), &self.retry).await
            {
                Ok(html) => html,
                Err(e) => {
                    tracing::warn!(group = %group, "No response for page {}, ending group: {}", page, e);
                    break;
                }
            };

            let entries = parse_listing(&html, &listing_url);
            if entries.is_empty() {
                tracing::info!(group = %group, "No items on page {}, ending group", page);
                break;
            }
            tracing::debug!(group = %group, "Found {} items on page {}", entries.len(), page);

            for entry in entries {
                if progress.update(|r| cap_reached(r, cap)) {
                    break 'pages;
                }

                progress.update(|r| r.processed += 1);
                match fetch_with_retry(&self.client, entry.url.as_str(), &self.retry).await {
                    Ok(html) => {
                        progress.update(|r| r.fetched += 1);
                        match parse_detail(&html, &entry.url, &entry.external_id) {
                            DetailOutcome::Damaged => {
                                tracing::debug!(group = %group, "Skipping damaged item {}", entry.url);
                            }
                            DetailOutcome::Item(item) => {
                                if within_publication_window(item.publication_date(), &self.config) {
                                    let full = progress.update(|r| {
                                        r.items.push(item);
                                        cap_reached(r, cap)
                                    });
                                    if full {
                                        break 'pages;
                                    }
                                } else {
                                    progress.update(|r| r.filtered_out += 1);
                                }
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!(group = %group, "Skipping item {}: {}", entry.url, e);
                    }
                }

                tokio::time::sleep(jitter(offer_min, offer_max)).await;
            }

            page += 1;
            tokio::time::sleep(jitter(page_min, page_max)).await;
        }
    }

    /// Writes the group file from whatever was collected
    fn finish_group(&self, progress: &GroupProgress, joined: Result<(), JoinError>) -> GroupResult {
        let mut result = progress.snapshot();

        if let Err(e) = joined {
            tracing::error!(
                group = %result.group,
                "Group crawl aborted, keeping {} items: {}",
                result.items.len(),
                e
            );
            result.error = Some(format!("group crawl aborted: {}", e));
        }

        if let Err(e) = write_group_file(&self.output_dir, &result.group, &result.items) {
            tracing::error!(group = %result.group, "Failed to write output: {}", e);
            result.error = Some(format!("failed to write output: {}", e));
        }

        tracing::info!(
            group = %result.group,
            "Group finished: {} kept, {} fetched, {} filtered, {} processed",
            result.items.len(),
            result.fetched,
            result.filtered_out,
            result.processed
        );

        result
    }

    fn listing_url_for(&self, group: &str, page: u32) -> Result<Url, url::ParseError> {
        let url = self
            .listing_url
            .replace("{group}", group)
            .replace("{page}", &page.to_string());
        Url::parse(&url)
    }
}

/// A group's result shared with its collection task
#[derive(Clone)]
struct GroupProgress(Arc<Mutex<GroupResult>>);

impl GroupProgress {
    fn new(group: &str) -> Self {
        Self(Arc::new(Mutex::new(GroupResult::new(group))))
    }

    /// Runs `f` under the lock; a panicked writer leaves the data usable
    fn update<T>(&self, f: impl FnOnce(&mut GroupResult) -> T) -> T {
        let mut result = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut result)
    }

    fn snapshot(&self) -> GroupResult {
        self.update(|result| result.clone())
    }
}

fn cap_reached(result: &GroupResult, cap: Option<usize>) -> bool {
    cap.map_or(false, |cap| result.items.len() >= cap)
}

/// Offer delays, halved for small caps so short runs stay fast
fn scaled_offer_delays(config: &CrawlConfig) -> (f64, f64) {
    let (min, max) = config.offer_delay_range();
    match config.max_items_per_group {
        Some(cap) if cap <= FAST_MODE_CAP => ((min * 0.5).max(0.1), (max * 0.5).max(0.2)),
        _ => (min, max),
    }
}

/// A random delay in `[min, max]` seconds
fn jitter(min: f64, max: f64) -> Duration {
    if max <= 0.0 {
        return Duration::ZERO;
    }
    let min = min.max(0.0);
    let secs = if max > min {
        rand::thread_rng().gen_range(min..=max)
    } else {
        max
    };
    Duration::from_secs_f64(secs)
}
