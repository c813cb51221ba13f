//! Crawl run summaries
//!
//! Totals across the groups of one crawl run, printed by the crawl
//! entry point and logged before it exits.

use crate::crawler::GroupResult;
use std::collections::HashMap;

/// Totals of one crawl run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CrawlSummary {
    /// Groups that returned a result
    pub groups: usize,

    /// Items kept across all groups
    pub items: usize,

    /// Detail pages fetched successfully
    pub fetched: usize,

    /// Items rejected by the publication date window
    pub filtered_out: usize,

    /// Detail links attempted
    pub processed: usize,

    /// Groups that ended with an error, sorted
    pub failed_groups: Vec<String>,
}

impl CrawlSummary {
    pub fn from_results(results: &HashMap<String, GroupResult>) -> Self {
        let mut summary = Self {
            groups: results.len(),
            ..Self::default()
        };

        for result in results.values() {
            summary.items += result.items.len();
            summary.fetched += result.fetched;
            summary.filtered_out += result.filtered_out;
            summary.processed += result.processed;
            if result.error.is_some() {
                summary.failed_groups.push(result.group.clone());
            }
        }
        summary.failed_groups.sort();

        summary
    }
}

/// Prints a crawl summary to stdout
pub fn print_summary(summary: &CrawlSummary, results: &HashMap<String, GroupResult>) {
    println!("\n=== Crawl Summary ===\n");
    println!("Groups crawled:      {}", summary.groups);
    println!("Items kept:          {}", summary.items);
    println!("Detail pages:        {}", summary.fetched);
    println!("Filtered by date:    {}", summary.filtered_out);
    println!("Links processed:     {}", summary.processed);

    let mut groups: Vec<_> = results.values().collect();
    groups.sort_by(|a, b| a.group.cmp(&b.group));

    if !groups.is_empty() {
        println!("\nPer group:");
        for result in groups {
            match &result.error {
                Some(error) => println!(
                    "  {:<20} {:>6} items  (error: {})",
                    result.group,
                    result.items.len(),
                    error
                ),
                None => println!("  {:<20} {:>6} items", result.group, result.items.len()),
            }
        }
    }
}
