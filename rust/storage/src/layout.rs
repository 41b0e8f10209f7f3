//! The physical layout of a run directory: hierarchical tick buckets, the
//! batch filename grammar, and storage-key validation.

use evochora_error::{ErrorCodes, EvochoraError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const RAW_DIR: &str = "raw";
pub const ANALYTICS_DIR: &str = "analytics";
pub const SUPERSEDED_DIR: &str = "superseded";
pub const METADATA_FILE_STEM: &str = "metadata.pb";
pub const BATCH_FILE_PREFIX: &str = "batch_";
pub const BATCH_FILE_STEM_SUFFIX: &str = ".pb";
pub const TEMP_FILE_SUFFIX: &str = ".tmp";

/// Buckets wrap at 1000 so every level formats as exactly three digits.
const BUCKET_OVERFLOW: i64 = 1000;

///////////////////////////////////////////// errors ///////////////////////////////////////////////

#[derive(Error, Debug, Clone, PartialEq)]
pub enum KeyError {
    #[error("invalid storage key '{key}': {reason}")]
    InvalidKey { key: String, reason: &'static str },
    #[error("path '{0}' escapes the storage root")]
    PathTraversal(String),
}

impl EvochoraError for KeyError {
    fn code(&self) -> ErrorCodes {
        match self {
            KeyError::InvalidKey { .. } => ErrorCodes::InvalidArgument,
            KeyError::PathTraversal(_) => ErrorCodes::PermissionDenied,
        }
    }
}

/// Pure string validation of a storage key, independent of host path
/// semantics. Containment is checked separately via canonicalization for
/// writes under the analytics root.
pub fn validate_key(key: &str) -> Result<(), KeyError> {
    let fail = |reason: &'static str| {
        Err(KeyError::InvalidKey {
            key: key.to_string(),
            reason,
        })
    };
    if key.is_empty() {
        return fail("empty");
    }
    if key.starts_with('/') || key.starts_with('\\') {
        return fail("absolute path");
    }
    let bytes = key.as_bytes();
    if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
        return fail("windows drive letter");
    }
    if key.chars().any(|c| c.is_control()) {
        return fail("control character");
    }
    if key.chars().any(|c| matches!(c, '<' | '>' | '"' | '?' | '*' | '|')) {
        return fail("reserved character");
    }
    if key
        .split(['/', '\\'])
        .any(|segment| segment == "..")
    {
        return fail("parent directory traversal");
    }
    Ok(())
}

/// Canonicalized containment check: `relative` (whose parent directories
/// must already exist) must resolve under `root`. Used for analytics writes
/// where the sub-path comes from plugin configuration.
pub fn resolve_under_root(root: &Path, relative: &str) -> Result<PathBuf, KeyError> {
    validate_key(relative)?;
    let joined = root.join(relative);
    let parent = joined
        .parent()
        .ok_or_else(|| KeyError::PathTraversal(relative.to_string()))?;
    let canonical_root = root
        .canonicalize()
        .map_err(|_| KeyError::PathTraversal(relative.to_string()))?;
    let canonical_parent = parent
        .canonicalize()
        .map_err(|_| KeyError::PathTraversal(relative.to_string()))?;
    if !canonical_parent.starts_with(&canonical_root) {
        return Err(KeyError::PathTraversal(relative.to_string()));
    }
    let file_name = joined
        .file_name()
        .ok_or_else(|| KeyError::PathTraversal(relative.to_string()))?;
    Ok(canonical_parent.join(file_name))
}

///////////////////////////////////////// folder structure /////////////////////////////////////////

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct FolderStructureConfig {
    #[serde(default = "FolderStructureConfig::default_levels")]
    pub levels: Vec<i64>,
}

impl FolderStructureConfig {
    fn default_levels() -> Vec<i64> {
        vec![100_000_000, 100_000]
    }

    pub fn validate(&self) -> Result<(), KeyError> {
        if self.levels.is_empty() || self.levels.iter().any(|&level| level <= 0) {
            return Err(KeyError::InvalidKey {
                key: format!("{:?}", self.levels),
                reason: "folder structure levels must be positive",
            });
        }
        Ok(())
    }
}

impl Default for FolderStructureConfig {
    fn default() -> Self {
        FolderStructureConfig {
            levels: FolderStructureConfig::default_levels(),
        }
    }
}

/// Derive the bucket path for a tick: one 3-digit directory per configured
/// level, e.g. tick 1_234_567 with the default levels is `000/012`.
pub fn bucket_path(tick: i64, levels: &[i64]) -> String {
    levels
        .iter()
        .map(|&level| format!("{:03}", (tick / level).rem_euclid(BUCKET_OVERFLOW)))
        .collect::<Vec<_>>()
        .join("/")
}

////////////////////////////////////////// filename grammar ////////////////////////////////////////

/// `batch_<first:20d>_<last:20d>.pb[<ext>]`. The fixed width makes
/// lexicographic filename order equal ascending tick order.
pub fn batch_file_name(first_tick: i64, last_tick: i64, extension: &str) -> String {
    format!(
        "{}{:020}_{:020}{}{}",
        BATCH_FILE_PREFIX, first_tick, last_tick, BATCH_FILE_STEM_SUFFIX, extension
    )
}

/// Parse a batch filename into `(first_tick, last_tick)`. Returns `None`
/// for anything that is not a well-formed batch file, including temp files.
pub fn parse_batch_file_name(name: &str) -> Option<(i64, i64)> {
    if name.ends_with(TEMP_FILE_SUFFIX) {
        return None;
    }
    let rest = name.strip_prefix(BATCH_FILE_PREFIX)?;
    let (first, rest) = rest.split_at_checked(20)?;
    let rest = rest.strip_prefix('_')?;
    let (last, rest) = rest.split_at_checked(20)?;
    if !rest.starts_with(BATCH_FILE_STEM_SUFFIX) {
        return None;
    }
    if !first.bytes().all(|b| b.is_ascii_digit()) || !last.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((first.parse().ok()?, last.parse().ok()?))
}

/// Strip a known codec extension, leaving the logical `.pb` name. Used to
/// detect compressed/uncompressed twins of the same logical file.
pub fn logical_file_name(name: &str) -> &str {
    name.strip_suffix(".zst").unwrap_or(name)
}

/// Is this filename one of the metadata blob variants?
pub fn is_metadata_file(name: &str) -> bool {
    logical_file_name(name) == METADATA_FILE_STEM
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_path_uses_default_levels() {
        let levels = FolderStructureConfig::default().levels;
        assert_eq!(bucket_path(0, &levels), "000/000");
        assert_eq!(bucket_path(1_234_567, &levels), "000/012");
        assert_eq!(bucket_path(250_000_000, &levels), "002/500");
    }

    #[test]
    fn batch_file_names_round_trip() {
        let name = batch_file_name(0, 9, "");
        assert_eq!(
            name,
            "batch_00000000000000000000_00000000000000000009.pb"
        );
        assert_eq!(parse_batch_file_name(&name), Some((0, 9)));

        let compressed = batch_file_name(25, 49, ".zst");
        assert_eq!(parse_batch_file_name(&compressed), Some((25, 49)));
    }

    #[test]
    fn filename_order_matches_tick_order() {
        let a = batch_file_name(99, 100, "");
        let b = batch_file_name(100, 199, "");
        let c = batch_file_name(1_000_000, 1_000_099, "");
        assert!(a < b && b < c);
    }

    #[test]
    fn malformed_names_are_rejected() {
        for name in [
            "batch_0_9.pb",
            "batch_00000000000000000000_00000000000000000009.txt",
            "metadata.pb",
            "batch_00000000000000000000_00000000000000000009.pb.abc123.tmp",
            "snapshot_00000000000000000000_00000000000000000009.pb",
        ] {
            assert_eq!(parse_batch_file_name(name), None, "accepted {:?}", name);
        }
    }

    #[test]
    fn key_validation_blacklist() {
        assert!(validate_key("runs/a/batch.pb").is_ok());
        for bad in [
            "",
            "/abs",
            "\\abs",
            "c:evil",
            "a/../b",
            "..",
            "a\x07b",
            "a<b",
            "a|b",
            "wild*card",
        ] {
            assert!(validate_key(bad).is_err(), "accepted {:?}", bad);
        }
    }

    #[test]
    fn containment_check_rejects_escapes() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("metric/lod0")).unwrap();
        assert!(resolve_under_root(root.path(), "metric/lod0/file.parquet").is_ok());
        // Symlinked escape: point a directory outside the root.
        let outside = tempfile::tempdir().unwrap();
        #[cfg(unix)]
        {
            std::os::unix::fs::symlink(outside.path(), root.path().join("sneaky")).unwrap();
            let err = resolve_under_root(root.path(), "sneaky/file.parquet").unwrap_err();
            assert!(matches!(err, KeyError::PathTraversal(_)));
        }
    }

    #[test]
    fn metadata_twins_share_a_logical_name() {
        assert!(is_metadata_file("metadata.pb"));
        assert!(is_metadata_file("metadata.pb.zst"));
        assert!(!is_metadata_file("metadata.json"));
    }
}
