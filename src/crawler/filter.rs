//! Publication date filtering

use crate::config::{CrawlConfig, PUBLICATION_DATE_FORMAT};
use chrono::NaiveDate;

/// Checks an item's publication date against the config's inclusive bounds
///
/// Without bounds every item passes. With either bound set, an item whose
/// date is missing or unparseable is rejected.
///
/// # Arguments
///
/// * `date` - Publication date as `DD.MM.YYYY`, possibly empty
/// * `config` - Supplies `publication_date_from` and `publication_date_to`
pub fn within_publication_window(date: &str, config: &CrawlConfig) -> bool {
    if !config.has_date_window() {
        return true;
    }

    let Ok(date) = NaiveDate::parse_from_str(date.trim(), PUBLICATION_DATE_FORMAT) else {
        return false;
    };

    config.publication_date_from.map_or(true, |from| date >= from)
        && config.publication_date_to.map_or(true, |to| date <= to)
}
