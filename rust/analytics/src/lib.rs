//! Analytics for captured runs: the plugin contract, LOD-aware parquet
//! output, and the competing-consumer indexer service.

pub mod config;
pub mod indexer;
pub mod manifest;
pub mod output;
pub mod plugin;
pub mod plugins;

pub use config::{
    IndexerConfig, PluginBuildError, PluginInstanceConfig, PluginOptions, PluginRegistry,
};
pub use indexer::{AnalyticsIndexer, IndexerError, IndexerMetricsSnapshot, IndexerState};
pub use manifest::{ManifestEntry, QuerySpec, VisualizationSpec};
pub use output::{rows_to_parquet, OutputError, RowBuffer};
pub use plugin::{
    effective_sampling, AnalyticsPlugin, ColumnSpec, ColumnType, Row, RowError, TickView, Value,
};

use async_trait::async_trait;
use evochora_config::{
    registry::{Injectable, Registry},
    Configurable,
};
use evochora_error::EvochoraError;
use evochora_storage::BatchStorage;
use evochora_sysdb::SysDb;
use evochora_topic::Topic;
use std::sync::Arc;

/// Registry-shareable handle to a plugin registry. Constructors are
/// registered once at program start and the handle is cloned from there.
#[derive(Clone)]
pub struct SharedPluginRegistry(pub Arc<PluginRegistry>);

impl Injectable for SharedPluginRegistry {}

#[async_trait]
impl Configurable<IndexerConfig> for AnalyticsIndexer {
    async fn try_from_config(
        config: &IndexerConfig,
        registry: &Registry,
    ) -> Result<Self, Box<dyn EvochoraError>> {
        let storage = registry.get::<BatchStorage>().map_err(|err| err.boxed())?;
        let topic = registry.get::<Topic>().map_err(|err| err.boxed())?;
        let sysdb = registry.get::<SysDb>().map_err(|err| err.boxed())?;
        let plugins = registry
            .get::<SharedPluginRegistry>()
            .map(|shared| shared.0)
            .unwrap_or_else(|_| Arc::new(PluginRegistry::with_builtins()));
        AnalyticsIndexer::new(storage, topic, sysdb, config, &plugins)
    }
}
