use evochora_config::helpers::{
    deserialize_duration_from_millis, deserialize_duration_from_seconds,
    serialize_duration_to_millis, serialize_duration_to_seconds,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Deserialize, Clone, Serialize, Debug)]
pub struct SqliteTopicConfig {
    pub db: evochora_sqlite::SqliteDBConfig,
    #[serde(
        rename = "claim_timeout_seconds",
        deserialize_with = "deserialize_duration_from_seconds",
        serialize_with = "serialize_duration_to_seconds",
        default = "default_claim_timeout"
    )]
    pub claim_timeout: Duration,
    #[serde(
        rename = "poll_interval_ms",
        deserialize_with = "deserialize_duration_from_millis",
        serialize_with = "serialize_duration_to_millis",
        default = "default_poll_interval"
    )]
    pub poll_interval: Duration,
}

#[derive(Deserialize, Clone, Serialize, Debug)]
pub struct InMemoryTopicConfig {
    #[serde(
        rename = "claim_timeout_seconds",
        deserialize_with = "deserialize_duration_from_seconds",
        serialize_with = "serialize_duration_to_seconds",
        default = "default_claim_timeout"
    )]
    pub claim_timeout: Duration,
    #[serde(
        rename = "poll_interval_ms",
        deserialize_with = "deserialize_duration_from_millis",
        serialize_with = "serialize_duration_to_millis",
        default = "default_poll_interval"
    )]
    pub poll_interval: Duration,
}

pub(crate) fn default_claim_timeout() -> Duration {
    Duration::from_secs(300)
}

pub(crate) fn default_poll_interval() -> Duration {
    Duration::from_millis(100)
}

impl Default for InMemoryTopicConfig {
    fn default() -> Self {
        InMemoryTopicConfig {
            claim_timeout: default_claim_timeout(),
            poll_interval: default_poll_interval(),
        }
    }
}

#[derive(Deserialize, Clone, Serialize, Debug)]
pub enum TopicConfig {
    #[serde(alias = "sqlite")]
    Sqlite(SqliteTopicConfig),
    #[serde(alias = "in_memory")]
    InMemory(InMemoryTopicConfig),
}
