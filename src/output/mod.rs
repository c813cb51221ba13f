//! Output module for crawl artifacts and summaries
//!
//! This module handles:
//! - Writing one JSON-lines file per group
//! - Counting the items a crawl produced from those files
//! - Summarizing crawl runs

mod group_file;
mod summary;

pub use group_file::{
    count_items_since, group_file_path, write_group_file, ItemCount, GROUP_FILE_EXTENSION,
};
pub use summary::{print_summary, CrawlSummary};
