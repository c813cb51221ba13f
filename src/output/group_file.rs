//! Group-scoped JSON-lines artifacts
//!
//! Each group's items land in `<output_dir>/<group>.jsonl`, one JSON object
//! per line. The transform stage consumes these files.

use crate::crawler::RawItem;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

/// Extension of group output files
pub const GROUP_FILE_EXTENSION: &str = "jsonl";

/// Path of the output file for `group`
pub fn group_file_path(output_dir: &Path, group: &str) -> PathBuf {
    output_dir.join(format!("{}.{}", group.to_lowercase(), GROUP_FILE_EXTENSION))
}

/// Writes a group's items, replacing any previous file for that group
///
/// Nothing is written when `items` is empty.
///
/// # Returns
///
/// * `Ok(Some(path))` - The file that was written
/// * `Ok(None)` - No items, no file
/// * `Err(io::Error)` - The directory or file could not be written
pub fn write_group_file(
    output_dir: &Path,
    group: &str,
    items: &[RawItem],
) -> std::io::Result<Option<PathBuf>> {
    if items.is_empty() {
        return Ok(None);
    }

    fs::create_dir_all(output_dir)?;
    let path = group_file_path(output_dir, group);

    let mut writer = BufWriter::new(File::create(&path)?);
    for item in items {
        serde_json::to_writer(&mut writer, item)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;

    tracing::info!("Saved {} items for {} to {}", items.len(), group, path.display());
    Ok(Some(path))
}

/// Items produced by one crawl, counted from the group files
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemCount {
    pub total: u64,

    /// Groups whose file was written during the crawl
    pub groups: Vec<String>,
}

/// Counts items in group files modified since `since - tolerance`
///
/// Files older than that belong to earlier crawls and are skipped, as are
/// groups without a file.
pub fn count_items_since(
    output_dir: &Path,
    groups: &[String],
    since: SystemTime,
    tolerance: Duration,
) -> std::io::Result<ItemCount> {
    let threshold = since.checked_sub(tolerance).unwrap_or(since);
    let mut count = ItemCount::default();

    for group in groups {
        let path = group_file_path(output_dir, group);
        let modified = match fs::metadata(&path) {
            Ok(meta) if meta.is_file() => meta.modified()?,
            _ => continue,
        };

        if modified < threshold {
            tracing::debug!("Skipping {}, not written by this crawl", path.display());
            continue;
        }

        let reader = BufReader::new(File::open(&path)?);
        let mut lines = 0u64;
        for line in reader.lines() {
            if !line?.trim().is_empty() {
                lines += 1;
            }
        }

        count.total += lines;
        count.groups.push(group.clone());
    }

    Ok(count)
}
