//! Per-run batch-info topics: a persistent FIFO queue with competing
//! consumer groups and claim leases.
//!
//! Delivery is at-least-once. A claimed message that is not acknowledged
//! within the claim timeout is redelivered to the group; within a single
//! consumer, delivery order equals publish order.

pub mod config;
mod in_memory_topic;
mod sqlite_topic;

pub use config::TopicConfig;
pub use in_memory_topic::InMemoryTopic;
pub use sqlite_topic::SqliteTopic;

use async_trait::async_trait;
use evochora_config::{
    registry::{Injectable, Registry},
    Configurable,
};
use evochora_error::{ErrorCodes, EvochoraError};
use evochora_metrics::{Capabilities, UsageType};
use evochora_types::run_id_from_suffixed_name;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// The logical topic base name; each run gets `<base>_<runId>`.
pub const BATCH_TOPIC_BASE: &str = "batch-topic";

pub fn topic_name(run_id: &str) -> String {
    format!("{}_{}", BATCH_TOPIC_BASE, run_id)
}

#[derive(Error, Debug)]
pub enum TopicError {
    #[error("Query error: {0}")]
    QueryError(#[from] evochora_error::WrappedSqlxError),
    #[error("message {0} is not claimed by this consumer group")]
    NotClaimed(i64),
}

impl EvochoraError for TopicError {
    fn code(&self) -> ErrorCodes {
        match self {
            TopicError::QueryError(err) => err.code(),
            TopicError::NotClaimed(_) => ErrorCodes::FailedPrecondition,
        }
    }
}

/// A message leased to one consumer group. The lease holds until `ack` or
/// until the claim timeout expires, whichever comes first.
#[derive(Clone, Debug, PartialEq)]
pub struct ClaimedMessage {
    pub id: i64,
    pub payload: Vec<u8>,
    /// 1 on first delivery, incremented on every redelivery.
    pub delivery_count: i64,
}

////////////////////////////////////////////// Topic ///////////////////////////////////////////////

#[derive(Clone, Debug)]
pub enum Topic {
    Sqlite(SqliteTopic),
    InMemory(InMemoryTopic),
}

impl Topic {
    /// Durably enqueue a message for the run's topic. The message is
    /// persisted before this returns; a crash after publish can only lead
    /// to duplicate delivery, never loss.
    pub async fn publish(
        &self,
        run_id: &str,
        payload: Vec<u8>,
    ) -> Result<(), Box<dyn EvochoraError>> {
        let topic = topic_name(run_id);
        match self {
            Topic::Sqlite(inner) => inner
                .publish(&topic, payload)
                .await
                .map_err(|e| Box::new(e) as Box<dyn EvochoraError>),
            Topic::InMemory(inner) => {
                inner.publish(&topic, payload);
                Ok(())
            }
        }
    }

    /// Join a competing-consumer group on the run's topic.
    pub fn subscribe(&self, run_id: &str, consumer_group: &str) -> Subscription {
        Subscription {
            topic: self.clone(),
            topic_name: topic_name(run_id),
            consumer_group: consumer_group.to_string(),
            claim_timeout: self.claim_timeout(),
            poll_interval: self.poll_interval(),
        }
    }

    /// Every topic name with at least one message, for cleanup tooling.
    pub async fn list_topic_names(&self) -> Result<Vec<String>, Box<dyn EvochoraError>> {
        match self {
            Topic::Sqlite(inner) => inner
                .list_topic_names()
                .await
                .map_err(|e| Box::new(e) as Box<dyn EvochoraError>),
            Topic::InMemory(inner) => Ok(inner.list_topic_names()),
        }
    }

    /// Delete every topic whose name carries the given run id suffix.
    pub async fn delete_run(&self, run_id: &str) -> Result<u64, Box<dyn EvochoraError>> {
        let names = self.list_topic_names().await?;
        let doomed: Vec<String> = names
            .into_iter()
            .filter(|name| {
                run_id_from_suffixed_name(name)
                    .map(|id| id.as_str() == run_id)
                    .unwrap_or(false)
            })
            .collect();
        let mut deleted = 0u64;
        for name in doomed {
            match self {
                Topic::Sqlite(inner) => {
                    deleted += inner
                        .delete_topic(&name)
                        .await
                        .map_err(|e| Box::new(e) as Box<dyn EvochoraError>)?;
                }
                Topic::InMemory(inner) => deleted += inner.delete_topic(&name),
            }
        }
        Ok(deleted)
    }

    fn claim_timeout(&self) -> Duration {
        match self {
            Topic::Sqlite(inner) => inner.claim_timeout(),
            Topic::InMemory(inner) => inner.claim_timeout(),
        }
    }

    fn poll_interval(&self) -> Duration {
        match self {
            Topic::Sqlite(inner) => inner.poll_interval(),
            Topic::InMemory(inner) => inner.poll_interval(),
        }
    }
}

impl Injectable for Topic {}

impl Capabilities for Topic {
    fn resource_name(&self) -> &str {
        "batch-topic"
    }

    fn supported_usages(&self) -> &'static [UsageType] {
        &[UsageType::TopicRead, UsageType::TopicWrite]
    }
}

#[async_trait]
impl Configurable<TopicConfig> for Topic {
    async fn try_from_config(
        config: &TopicConfig,
        registry: &Registry,
    ) -> Result<Self, Box<dyn EvochoraError>> {
        match config {
            TopicConfig::Sqlite(sqlite_config) => Ok(Topic::Sqlite(
                SqliteTopic::try_from_config(sqlite_config, registry).await?,
            )),
            TopicConfig::InMemory(in_memory_config) => {
                Ok(Topic::InMemory(InMemoryTopic::new(in_memory_config)))
            }
        }
    }
}

/////////////////////////////////////////// Subscription ///////////////////////////////////////////

/// One consumer's membership in a competing-consumer group.
pub struct Subscription {
    topic: Topic,
    topic_name: String,
    consumer_group: String,
    claim_timeout: Duration,
    poll_interval: Duration,
}

impl Subscription {
    pub fn consumer_group(&self) -> &str {
        &self.consumer_group
    }

    /// Claim the next available message, if any. A message is available
    /// when it has no live, unacknowledged claim by this group.
    pub async fn poll(&self) -> Result<Option<ClaimedMessage>, Box<dyn EvochoraError>> {
        match &self.topic {
            Topic::Sqlite(inner) => inner
                .claim_next(&self.topic_name, &self.consumer_group, self.claim_timeout)
                .await
                .map_err(|e| Box::new(e) as Box<dyn EvochoraError>),
            Topic::InMemory(inner) => Ok(inner.claim_next(
                &self.topic_name,
                &self.consumer_group,
                self.claim_timeout,
            )),
        }
    }

    /// Poll until a message arrives or the token cancels. Idle loops sleep
    /// for the bounded poll interval.
    pub async fn next(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<ClaimedMessage>, Box<dyn EvochoraError>> {
        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }
            if let Some(message) = self.poll().await? {
                return Ok(Some(message));
            }
            tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    /// Settle a message after successful processing. Without this, the
    /// lease expires and the message is redelivered.
    pub async fn ack(&self, message: &ClaimedMessage) -> Result<(), Box<dyn EvochoraError>> {
        match &self.topic {
            Topic::Sqlite(inner) => inner
                .ack(message.id, &self.consumer_group)
                .await
                .map_err(|e| Box::new(e) as Box<dyn EvochoraError>),
            Topic::InMemory(inner) => inner
                .ack(&self.topic_name, message.id, &self.consumer_group)
                .map_err(|e| Box::new(e) as Box<dyn EvochoraError>),
        }
    }
}
