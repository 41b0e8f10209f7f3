//! Indexer configuration and the plugin registry. Plugins are constructed
//! from configuration through registered constructor closures; the config
//! carries the registry key (`class_name`), never a type to reflect on.

use crate::plugin::AnalyticsPlugin;
use evochora_error::{ErrorCodes, EvochoraError};
use evochora_storage::FolderStructureConfig;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

const DEFAULT_CONFIG_PATH: &str = "./indexer_config.yaml";

#[derive(Deserialize, Clone, Serialize, Debug)]
pub struct PluginOptions {
    /// Overrides the plugin's default metric id.
    pub metric_id: Option<String>,
    #[serde(default = "PluginOptions::default_sampling_interval")]
    pub sampling_interval: i64,
    #[serde(default = "PluginOptions::default_lod_factor")]
    pub lod_factor: i64,
    #[serde(default = "PluginOptions::default_lod_levels")]
    pub lod_levels: u32,
    pub max_data_points: Option<i64>,
    /// Plugin-specific options, passed through untouched.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl PluginOptions {
    fn default_sampling_interval() -> i64 {
        1
    }

    fn default_lod_factor() -> i64 {
        10
    }

    fn default_lod_levels() -> u32 {
        1
    }
}

impl Default for PluginOptions {
    fn default() -> Self {
        PluginOptions {
            metric_id: None,
            sampling_interval: PluginOptions::default_sampling_interval(),
            lod_factor: PluginOptions::default_lod_factor(),
            lod_levels: PluginOptions::default_lod_levels(),
            max_data_points: None,
            extra: BTreeMap::new(),
        }
    }
}

#[derive(Deserialize, Clone, Serialize, Debug)]
pub struct PluginInstanceConfig {
    pub class_name: String,
    #[serde(default)]
    pub options: PluginOptions,
}

#[derive(Deserialize, Clone, Serialize, Debug)]
pub struct IndexerConfig {
    pub run_id: String,
    #[serde(default = "IndexerConfig::default_consumer_group")]
    pub consumer_group: String,
    #[serde(default = "IndexerConfig::default_metadata_poll_interval_ms")]
    pub metadata_poll_interval_ms: u64,
    #[serde(default = "IndexerConfig::default_metadata_max_poll_duration_ms")]
    pub metadata_max_poll_duration_ms: u64,
    #[serde(default)]
    pub folder_structure: FolderStructureConfig,
    pub plugins: Vec<PluginInstanceConfig>,
}

impl IndexerConfig {
    fn default_consumer_group() -> String {
        "analytics-indexer".to_string()
    }

    fn default_metadata_poll_interval_ms() -> u64 {
        500
    }

    fn default_metadata_max_poll_duration_ms() -> u64 {
        30_000
    }

    pub fn load() -> Self {
        Self::load_from_path(DEFAULT_CONFIG_PATH)
    }

    pub fn load_from_path(path: &str) -> Self {
        match evochora_config::load_config(path, "indexer", "EVOCHORA_INDEXER_") {
            Ok(config) => config,
            Err(e) => panic!("Error loading config from {path}: {}", e),
        }
    }
}

////////////////////////////////////////// plugin registry /////////////////////////////////////////

#[derive(Error, Debug)]
pub enum PluginBuildError {
    #[error("no plugin registered under class name '{0}'")]
    UnknownClassName(String),
    #[error("plugin '{class_name}' rejected its options: {reason}")]
    InvalidOptions { class_name: String, reason: String },
}

impl EvochoraError for PluginBuildError {
    fn code(&self) -> ErrorCodes {
        ErrorCodes::InvalidArgument
    }
}

type PluginConstructor =
    Box<dyn Fn(&PluginOptions) -> Result<Box<dyn AnalyticsPlugin>, PluginBuildError> + Send + Sync>;

/// Maps `class_name` registry keys to constructor closures, populated at
/// program start.
#[derive(Default)]
pub struct PluginRegistry {
    constructors: HashMap<String, PluginConstructor>,
}

impl PluginRegistry {
    pub fn new() -> PluginRegistry {
        PluginRegistry::default()
    }

    /// A registry with the built-in metric plugins registered.
    pub fn with_builtins() -> PluginRegistry {
        let mut registry = PluginRegistry::new();
        registry.register("OrganismCountPlugin", |options| {
            Ok(Box::new(crate::plugins::OrganismCountPlugin::new(options)))
        });
        registry.register("EnergyStatsPlugin", |options| {
            Ok(Box::new(crate::plugins::EnergyStatsPlugin::new(options)))
        });
        registry
    }

    pub fn register<F>(&mut self, class_name: &str, constructor: F)
    where
        F: Fn(&PluginOptions) -> Result<Box<dyn AnalyticsPlugin>, PluginBuildError>
            + Send
            + Sync
            + 'static,
    {
        self.constructors
            .insert(class_name.to_string(), Box::new(constructor));
    }

    pub fn build(
        &self,
        config: &PluginInstanceConfig,
    ) -> Result<Box<dyn AnalyticsPlugin>, PluginBuildError> {
        let constructor = self
            .constructors
            .get(&config.class_name)
            .ok_or_else(|| PluginBuildError::UnknownClassName(config.class_name.clone()))?;
        constructor(&config.options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_resolve_by_class_name() {
        let registry = PluginRegistry::with_builtins();
        let config = PluginInstanceConfig {
            class_name: "OrganismCountPlugin".to_string(),
            options: PluginOptions::default(),
        };
        let plugin = registry.build(&config).unwrap();
        assert_eq!(plugin.metric_id(), "organism_count");
    }

    #[test]
    fn unknown_class_name_is_an_error() {
        let registry = PluginRegistry::with_builtins();
        let config = PluginInstanceConfig {
            class_name: "NoSuchPlugin".to_string(),
            options: PluginOptions::default(),
        };
        assert!(matches!(
            registry.build(&config),
            Err(PluginBuildError::UnknownClassName(_))
        ));
    }

    #[test]
    fn plugin_options_deserialize_with_defaults() {
        let options: PluginOptions = serde_json::from_str(r#"{"metric_id": "custom"}"#).unwrap();
        assert_eq!(options.metric_id.as_deref(), Some("custom"));
        assert_eq!(options.sampling_interval, 1);
        assert_eq!(options.lod_factor, 10);
        assert_eq!(options.lod_levels, 1);
    }
}
