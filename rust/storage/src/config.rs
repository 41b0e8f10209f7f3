use crate::compression::CompressionConfig;
use crate::layout::FolderStructureConfig;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
/// The configuration for a batch storage resource.
/// # Fields
/// - root: directory that holds one subdirectory per simulation run.
/// # Notes
/// Compression applies to newly written files only; readers detect the
/// codec per file, so mixed archives stay readable after a config change.
pub struct BatchStorageConfig {
    pub root: String,
    #[serde(default)]
    pub folder_structure: FolderStructureConfig,
    #[serde(default)]
    pub compression: CompressionConfig,
    #[serde(default = "BatchStorageConfig::default_metrics_window_seconds")]
    pub metrics_window_seconds: u64,
}

impl BatchStorageConfig {
    fn default_metrics_window_seconds() -> u64 {
        5
    }

    pub fn with_root(root: impl Into<String>) -> BatchStorageConfig {
        BatchStorageConfig {
            root: root.into(),
            folder_structure: FolderStructureConfig::default(),
            compression: CompressionConfig::default(),
            metrics_window_seconds: BatchStorageConfig::default_metrics_window_seconds(),
        }
    }
}
