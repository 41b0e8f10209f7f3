use crate::config::InMemoryTopicConfig;
use crate::{ClaimedMessage, TopicError};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

// This is used for testing only: the same claim semantics as the durable
// backend, over in-process state.
#[derive(Clone, Debug, Default)]
struct ClaimState {
    claimed_at_ms: i64,
    delivery_count: i64,
    acked: bool,
}

#[derive(Clone, Debug)]
struct StoredMessage {
    id: i64,
    payload: Vec<u8>,
    claims: HashMap<String, ClaimState>,
}

#[derive(Debug, Default)]
struct InMemoryState {
    next_id: i64,
    topics: HashMap<String, Vec<StoredMessage>>,
}

#[derive(Clone, Debug)]
pub struct InMemoryTopic {
    state: Arc<Mutex<InMemoryState>>,
    claim_timeout: Duration,
    poll_interval: Duration,
}

impl InMemoryTopic {
    pub fn new(config: &InMemoryTopicConfig) -> InMemoryTopic {
        InMemoryTopic {
            state: Arc::new(Mutex::new(InMemoryState::default())),
            claim_timeout: config.claim_timeout,
            poll_interval: config.poll_interval,
        }
    }

    pub fn claim_timeout(&self) -> Duration {
        self.claim_timeout
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub(crate) fn publish(&self, topic: &str, payload: Vec<u8>) {
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = state.next_id;
        state
            .topics
            .entry(topic.to_string())
            .or_default()
            .push(StoredMessage {
                id,
                payload,
                claims: HashMap::new(),
            });
    }

    pub(crate) fn claim_next(
        &self,
        topic: &str,
        consumer_group: &str,
        claim_timeout: Duration,
    ) -> Option<ClaimedMessage> {
        let now_ms = Utc::now().timestamp_millis();
        let expired_before = now_ms - claim_timeout.as_millis() as i64;
        let mut state = self.state.lock();
        let messages = state.topics.get_mut(topic)?;
        for message in messages.iter_mut() {
            let claim = message.claims.get(consumer_group);
            let available = match claim {
                None => true,
                Some(claim) => !claim.acked && claim.claimed_at_ms <= expired_before,
            };
            if !available {
                continue;
            }
            let entry = message.claims.entry(consumer_group.to_string()).or_default();
            entry.claimed_at_ms = now_ms;
            entry.delivery_count += 1;
            entry.acked = false;
            return Some(ClaimedMessage {
                id: message.id,
                payload: message.payload.clone(),
                delivery_count: entry.delivery_count,
            });
        }
        None
    }

    pub(crate) fn ack(
        &self,
        topic: &str,
        message_id: i64,
        consumer_group: &str,
    ) -> Result<(), TopicError> {
        let mut state = self.state.lock();
        let claim = state
            .topics
            .get_mut(topic)
            .and_then(|messages| messages.iter_mut().find(|m| m.id == message_id))
            .and_then(|message| message.claims.get_mut(consumer_group));
        match claim {
            Some(claim) => {
                claim.acked = true;
                Ok(())
            }
            None => Err(TopicError::NotClaimed(message_id)),
        }
    }

    pub(crate) fn list_topic_names(&self) -> Vec<String> {
        let state = self.state.lock();
        let mut names: Vec<String> = state.topics.keys().cloned().collect();
        names.sort();
        names
    }

    pub(crate) fn delete_topic(&self, topic: &str) -> u64 {
        let mut state = self.state.lock();
        state
            .topics
            .remove(topic)
            .map(|messages| messages.len() as u64)
            .unwrap_or(0)
    }
}
