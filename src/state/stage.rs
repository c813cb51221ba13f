use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// One phase of the pipeline
///
/// Stages always run in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Crawl listing and detail pages into per-group files
    Scraping,

    /// Transform scraped files into the import format
    Processing,

    /// Load the transformed data into the database
    DatabaseUpdate,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::Scraping, Stage::Processing, Stage::DatabaseUpdate];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Scraping => "scraping",
            Self::Processing => "processing",
            Self::DatabaseUpdate => "database_update",
        }
    }

    /// Human-readable name used in error messages
    pub fn title(&self) -> &'static str {
        match self {
            Self::Scraping => "Scraping",
            Self::Processing => "Processing",
            Self::DatabaseUpdate => "Database update",
        }
    }

    /// Progress percent written before and after the stage runs
    pub fn progress_window(&self) -> (u8, u8) {
        match self {
            Self::Scraping => (5, 70),
            Self::Processing => (75, 85),
            Self::DatabaseUpdate => (90, 100),
        }
    }

    /// Wall-clock limit for bounded stages without an explicit timeout
    pub fn default_timeout(&self) -> Option<Duration> {
        match self {
            Self::Scraping => None,
            Self::Processing => Some(Duration::from_secs(2 * 3600)),
            Self::DatabaseUpdate => Some(Duration::from_secs(4 * 3600)),
        }
    }

    /// Stages from `start` to the end of the pipeline
    pub fn from_onward(start: Stage) -> Vec<Stage> {
        Self::ALL.iter().copied().filter(|s| *s >= start).collect()
    }

    /// Stages that precede `start`
    pub fn before(start: Stage) -> Vec<Stage> {
        Self::ALL.iter().copied().filter(|s| *s < start).collect()
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|stage| stage.name() == s)
            .ok_or_else(|| {
                format!(
                    "unknown stage '{}', expected one of: scraping, processing, database_update",
                    s
                )
            })
    }
}
