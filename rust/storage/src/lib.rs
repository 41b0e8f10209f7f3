//! Batch storage for tick capture.
//!
//! A batch file is an ordered sequence of length-delimited `TickDataChunk`
//! messages, optionally wrapped by a stream codec, renamed into place only
//! once complete. This crate owns the folder layout, the atomic write
//! protocol, listings with crash-duplicate resolution, and the streaming
//! read paths the indexers and frame renderers share.

pub mod codec;
pub mod compression;
pub mod config;
pub mod layout;
mod listing;
mod reader;
mod writer;

pub use codec::{ChunkHeader, CodecError, FieldFilter, RawChunk, MAX_FRAME_LEN};
pub use compression::{CompressionCodec, CompressionConfig, UnknownCodecError, ZSTD_MAGIC};
pub use config::BatchStorageConfig;
pub use layout::{FolderStructureConfig, KeyError};
pub use listing::{BatchFileListing, ListError, ListOptions, SortOrder};
pub use reader::ReadError;
pub use writer::{WriteBatchError, WrittenBatch};

use async_trait::async_trait;
use evochora_config::{
    registry::{Injectable, Registry},
    Configurable,
};
use evochora_error::EvochoraError;
use evochora_metrics::{Capabilities, UsageMeter, UsageType, WindowedMetrics};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// A local-filesystem batch store rooted at one directory. Clones share the
/// metric windows, so one resource can be handed to many pipelines.
#[derive(Clone)]
pub struct BatchStorage {
    root: PathBuf,
    codec: CompressionCodec,
    compression_level: i32,
    levels: Vec<i64>,
    meter: UsageMeter,
}

const SUPPORTED_USAGES: &[UsageType] = &[
    UsageType::StorageRead,
    UsageType::StorageWrite,
    UsageType::AnalyticsWrite,
];

impl BatchStorage {
    pub fn new(config: &BatchStorageConfig) -> Result<BatchStorage, Box<dyn EvochoraError>> {
        config
            .folder_structure
            .validate()
            .map_err(|err| err.boxed())?;
        let codec = config.compression.resolve().map_err(|err| err.boxed())?;
        let window = Duration::from_secs(config.metrics_window_seconds.max(1));
        Ok(BatchStorage {
            root: PathBuf::from(&config.root),
            codec,
            compression_level: config.compression.level,
            levels: config.folder_structure.levels.clone(),
            meter: UsageMeter::new(SUPPORTED_USAGES, window),
        })
    }

    /// A store over a temporary directory, for tests.
    pub fn new_test_storage_at<P: AsRef<Path>>(path: P) -> BatchStorage {
        BatchStorage::new(&BatchStorageConfig::with_root(
            path.as_ref()
                .to_str()
                .expect("Should be able to convert path to string"),
        ))
        .expect("default batch storage config must be valid")
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn compression_codec(&self) -> CompressionCodec {
        self.codec
    }

    pub(crate) fn compression_level(&self) -> i32 {
        self.compression_level
    }

    pub(crate) fn levels(&self) -> &[i64] {
        &self.levels
    }

    pub(crate) fn window(&self, usage: UsageType) -> &WindowedMetrics {
        // The meter seeds every supported usage at construction.
        self.meter.declared(usage)
    }

    /// The metric window for a usage type; unsupported types fail with the
    /// supported list, per the resource-wrapping contract.
    pub fn metrics(
        &self,
        usage: UsageType,
    ) -> Result<Arc<WindowedMetrics>, evochora_metrics::UnsupportedUsageError> {
        self.meter.for_usage(usage)
    }

    /// Absolute directory of one run.
    pub fn run_root(&self, run_id: &str) -> PathBuf {
        self.root.join(run_id)
    }

    /// Absolute analytics root of one run.
    pub fn analytics_root(&self, run_id: &str) -> PathBuf {
        self.run_root(run_id).join(layout::ANALYTICS_DIR)
    }
}

impl Injectable for BatchStorage {}

impl Capabilities for BatchStorage {
    fn resource_name(&self) -> &str {
        "batch-storage"
    }

    fn supported_usages(&self) -> &'static [UsageType] {
        SUPPORTED_USAGES
    }
}

#[async_trait]
impl Configurable<BatchStorageConfig> for BatchStorage {
    async fn try_from_config(
        config: &BatchStorageConfig,
        _registry: &Registry,
    ) -> Result<Self, Box<dyn EvochoraError>> {
        BatchStorage::new(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evochora_metrics::UsageType;

    #[test]
    fn unsupported_usage_is_rejected_with_supported_list() {
        let dir = tempfile::tempdir().unwrap();
        let storage = BatchStorage::new_test_storage_at(dir.path());
        let err = storage.metrics(UsageType::TopicRead).unwrap_err();
        assert_eq!(err.supported, SUPPORTED_USAGES.to_vec());
        assert!(storage.metrics(UsageType::StorageRead).is_ok());
    }

    #[test]
    fn invalid_folder_levels_are_rejected() {
        let mut config = BatchStorageConfig::with_root("/tmp/x");
        config.folder_structure.levels = vec![0];
        assert!(BatchStorage::new(&config).is_err());
    }
}
