//! Listings over the run hierarchy: run enumeration, paginated batch-file
//! scans with crash-duplicate resolution, and the descend-greatest probe
//! for the most recent batch file.

use crate::layout::{self, KeyError};
use crate::BatchStorage;
use chrono::{DateTime, Utc};
use evochora_error::{ErrorCodes, EvochoraError};
use evochora_metrics::{OperationTimer, UsageType};
use evochora_types::parse_run_timestamp;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

#[derive(Clone, Debug, Default)]
pub struct ListOptions {
    /// Resume strictly after this path (in the chosen order).
    pub continuation: Option<String>,
    /// Zero means no limit.
    pub max_results: usize,
    /// Inclusive lower bound on a file's `first_tick`.
    pub start_tick: Option<i64>,
    /// Inclusive upper bound on a file's `first_tick`.
    pub end_tick: Option<i64>,
    pub order: SortOrder,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct BatchFileListing {
    /// Root-relative paths with `/` separators.
    pub paths: Vec<String>,
    pub next_continuation: Option<String>,
    pub truncated: bool,
}

#[derive(Error, Debug)]
pub enum ListError {
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error("both compressed and uncompressed variants exist for '{0}'")]
    CompressedTwin(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl EvochoraError for ListError {
    fn code(&self) -> ErrorCodes {
        match self {
            ListError::Key(err) => err.code(),
            ListError::CompressedTwin(_) => ErrorCodes::DataLoss,
            ListError::Io(err) => err.code(),
        }
    }
}

struct BatchEntry {
    rel_path: String,
    logical_path: String,
    first_tick: i64,
    last_tick: i64,
}

impl BatchStorage {
    /// Enumerate run directories whose encoded start instant is strictly
    /// after `after`, ascending by name (equals ascending by time).
    pub async fn list_run_ids(&self, after: DateTime<Utc>) -> Result<Vec<String>, ListError> {
        let mut run_ids = Vec::new();
        let entries = match std::fs::read_dir(self.root()) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(run_ids),
            Err(err) => return Err(err.into()),
        };
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let name = match entry.file_name().into_string() {
                Ok(name) => name,
                Err(_) => continue,
            };
            match parse_run_timestamp(&name) {
                Some(instant) if instant > after => run_ids.push(name),
                _ => {}
            }
        }
        run_ids.sort();
        Ok(run_ids)
    }

    /// Recursive batch-file scan under `prefix` (root-relative, may be a
    /// run directory or any folder below it). Crash duplicates resolve to
    /// the file with the smaller `last_tick`; the loser is warned about and
    /// never listed.
    pub async fn list_batch_files(
        &self,
        prefix: &str,
        options: &ListOptions,
    ) -> Result<BatchFileListing, ListError> {
        let timer = OperationTimer::start(self.window(UsageType::StorageRead));
        let result = self.list_batch_files_inner(prefix, options);
        match &result {
            Ok(_) => timer.finish(),
            Err(_) => timer.finish_with_error(),
        }
        result
    }

    fn list_batch_files_inner(
        &self,
        prefix: &str,
        options: &ListOptions,
    ) -> Result<BatchFileListing, ListError> {
        let prefix = prefix.trim_end_matches('/');
        if !prefix.is_empty() {
            layout::validate_key(prefix)?;
        }
        let entries = self.scan_batch_entries(prefix)?;

        // Crash-duplicate resolution: the pre-crash file is known complete,
        // the rewrite may be truncated, so the smaller last_tick wins.
        let mut by_first: BTreeMap<i64, BatchEntry> = BTreeMap::new();
        for entry in entries {
            match by_first.get(&entry.first_tick) {
                None => {
                    by_first.insert(entry.first_tick, entry);
                }
                Some(kept) => {
                    if entry.last_tick == kept.last_tick
                        && entry.logical_path == kept.logical_path
                    {
                        return Err(ListError::CompressedTwin(entry.logical_path));
                    }
                    if entry.last_tick < kept.last_tick {
                        tracing::warn!(
                            kept = %entry.rel_path,
                            superseded = %kept.rel_path,
                            first_tick = entry.first_tick,
                            "duplicate batch files for one tick range"
                        );
                        by_first.insert(entry.first_tick, entry);
                    } else {
                        tracing::warn!(
                            kept = %kept.rel_path,
                            superseded = %entry.rel_path,
                            first_tick = entry.first_tick,
                            "duplicate batch files for one tick range"
                        );
                    }
                }
            }
        }

        let mut paths: Vec<String> = by_first
            .into_values()
            .filter(|entry| {
                options.start_tick.map_or(true, |start| entry.first_tick >= start)
                    && options.end_tick.map_or(true, |end| entry.first_tick <= end)
            })
            .map(|entry| entry.rel_path)
            .collect();
        paths.sort();
        if options.order == SortOrder::Descending {
            paths.reverse();
        }

        if let Some(token) = &options.continuation {
            paths.retain(|path| match options.order {
                SortOrder::Ascending => path.as_str() > token.as_str(),
                SortOrder::Descending => path.as_str() < token.as_str(),
            });
        }

        let truncated = options.max_results > 0 && paths.len() > options.max_results;
        if truncated {
            paths.truncate(options.max_results);
        }
        let next_continuation = if truncated { paths.last().cloned() } else { None };
        Ok(BatchFileListing {
            paths,
            next_continuation,
            truncated,
        })
    }

    /// The run's metadata blob, if present. Fails loudly when both the
    /// compressed and uncompressed variants exist.
    pub async fn find_metadata_path(&self, run_id: &str) -> Result<Option<String>, ListError> {
        layout::validate_key(run_id)?;
        let raw_dir = self.run_root(run_id).join(layout::RAW_DIR);
        let entries = match std::fs::read_dir(&raw_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let mut found: Option<String> = None;
        for entry in entries.flatten() {
            let name = match entry.file_name().into_string() {
                Ok(name) => name,
                Err(_) => continue,
            };
            if name.ends_with(layout::TEMP_FILE_SUFFIX) || !layout::is_metadata_file(&name) {
                continue;
            }
            if found.is_some() {
                return Err(ListError::CompressedTwin(format!(
                    "{}/{}/{}",
                    run_id,
                    layout::RAW_DIR,
                    layout::METADATA_FILE_STEM
                )));
            }
            found = Some(format!("{}/{}/{}", run_id, layout::RAW_DIR, name));
        }
        Ok(found)
    }

    /// Follow the greatest directory at every level of the bucket
    /// hierarchy, then return the greatest batch file in the leaf.
    pub async fn find_last_batch_file(&self, run_id: &str) -> Result<Option<String>, ListError> {
        layout::validate_key(run_id)?;
        let mut dir = self.run_root(run_id).join(layout::RAW_DIR);
        let mut rel = format!("{}/{}", run_id, layout::RAW_DIR);
        loop {
            let entries = match std::fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                Err(err) => return Err(err.into()),
            };
            let mut greatest_dir: Option<String> = None;
            let mut greatest_file: Option<String> = None;
            for entry in entries.flatten() {
                let name = match entry.file_name().into_string() {
                    Ok(name) => name,
                    Err(_) => continue,
                };
                let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
                if is_dir {
                    if name != layout::SUPERSEDED_DIR
                        && greatest_dir.as_deref().map_or(true, |max| name.as_str() > max)
                    {
                        greatest_dir = Some(name);
                    }
                } else if layout::parse_batch_file_name(&name).is_some()
                    && greatest_file.as_deref().map_or(true, |max| name.as_str() > max)
                {
                    greatest_file = Some(name);
                }
            }
            match greatest_dir {
                Some(name) => {
                    dir = dir.join(&name);
                    rel = format!("{}/{}", rel, name);
                }
                None => {
                    return Ok(greatest_file.map(|name| format!("{}/{}", rel, name)));
                }
            }
        }
    }

    fn scan_batch_entries(&self, prefix: &str) -> Result<Vec<BatchEntry>, ListError> {
        let start = if prefix.is_empty() {
            self.root().to_path_buf()
        } else {
            self.root().join(prefix)
        };
        let mut stack: Vec<(PathBuf, String)> = vec![(start, prefix.to_string())];
        let mut collected = Vec::new();
        while let Some((dir, rel)) = stack.pop() {
            let entries = match std::fs::read_dir(&dir) {
                Ok(entries) => entries,
                // The directory can vanish between discovery and the scan.
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            for entry in entries {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                    Err(err) => return Err(err.into()),
                };
                let name = match entry.file_name().into_string() {
                    Ok(name) => name,
                    Err(_) => continue,
                };
                let child_rel = if rel.is_empty() {
                    name.clone()
                } else {
                    format!("{}/{}", rel, name)
                };
                let file_type = match entry.file_type() {
                    Ok(file_type) => file_type,
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                    Err(err) => return Err(err.into()),
                };
                if file_type.is_dir() {
                    if name != layout::SUPERSEDED_DIR {
                        stack.push((entry.path(), child_rel));
                    }
                    continue;
                }
                if name.ends_with(layout::TEMP_FILE_SUFFIX) {
                    continue;
                }
                if let Some((first_tick, last_tick)) = layout::parse_batch_file_name(&name) {
                    let parent_rel = child_rel
                        .rsplit_once('/')
                        .map(|(parent, _)| parent)
                        .unwrap_or("");
                    let logical_path = if parent_rel.is_empty() {
                        layout::logical_file_name(&name).to_string()
                    } else {
                        format!("{}/{}", parent_rel, layout::logical_file_name(&name))
                    };
                    collected.push(BatchEntry {
                        rel_path: child_rel,
                        logical_path,
                        first_tick,
                        last_tick,
                    });
                }
            }
        }
        Ok(collected)
    }
}
