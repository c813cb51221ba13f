//! Crawler module for listing and detail page fetching
//!
//! This module contains the crawl logic, including:
//! - HTTP fetching with a shared retry policy
//! - Listing and detail page parsing
//! - Publication date filtering
//! - The bounded group worker pool

mod coordinator;
mod fetcher;
mod filter;
mod parser;

pub use coordinator::{Crawler, GroupResult};
pub use fetcher::{build_http_client, fetch_with_retry, FetchError, RetryPolicy, USER_AGENT};
pub use filter::within_publication_window;
pub use parser::{
    extract_id_from_url, parse_detail, parse_listing, parse_polish_date, DetailOutcome,
    ListingEntry, RawItem,
};

use crate::config::CrawlConfig;
use crate::output::CrawlSummary;
use crate::PipelineError;
use std::collections::HashMap;
use std::path::Path;

/// Runs a complete crawl operation
///
/// This is the entry point of the crawl child process. It will:
/// 1. Build the HTTP client
/// 2. Crawl every group on the bounded worker pool
/// 3. Write one output file per group
/// 4. Summarize the run
///
/// # Arguments
///
/// * `config` - Crawl parameters from the config provider
/// * `listing_url` - Listing URL template with `{group}` and `{page}`
/// * `output_dir` - Directory for the group output files
///
/// # Returns
///
/// * `Ok((summary, results))` - The run finished; some groups may be partial
/// * `Err(PipelineError)` - The crawl could not start
pub async fn run_crawl(
    config: CrawlConfig,
    listing_url: &str,
    output_dir: &Path,
) -> Result<(CrawlSummary, HashMap<String, GroupResult>), PipelineError> {
    let crawler = Crawler::new(config, listing_url, output_dir)?;
    let results = crawler.run().await;
    let summary = CrawlSummary::from_results(&results);

    tracing::info!(
        "Crawl finished: {} items from {} groups ({} failed)",
        summary.items,
        summary.groups,
        summary.failed_groups.len()
    );

    Ok((summary, results))
}
