//! Serde helpers for duration-valued configuration keys. Durations are
//! written as plain integers in YAML, suffixed `_seconds` or `_ms` by
//! convention, and rehydrated into `std::time::Duration` on the way in.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::time::Duration;

pub fn deserialize_duration_from_seconds<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_secs)
}

pub fn serialize_duration_to_seconds<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    duration.as_secs().serialize(serializer)
}

pub fn deserialize_duration_from_millis<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_millis)
}

pub fn serialize_duration_to_millis<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    (duration.as_millis() as u64).serialize(serializer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(serde::Serialize, serde::Deserialize)]
    struct LeaseConfig {
        #[serde(
            rename = "claim_timeout_seconds",
            deserialize_with = "deserialize_duration_from_seconds",
            serialize_with = "serialize_duration_to_seconds"
        )]
        claim_timeout: Duration,
        #[serde(
            rename = "poll_interval_ms",
            deserialize_with = "deserialize_duration_from_millis",
            serialize_with = "serialize_duration_to_millis"
        )]
        poll_interval: Duration,
    }

    #[test]
    fn integer_fields_round_trip_as_durations() {
        let parsed: LeaseConfig =
            serde_json::from_str(r#"{"claim_timeout_seconds": 300, "poll_interval_ms": 100}"#)
                .unwrap();
        assert_eq!(parsed.claim_timeout, Duration::from_secs(300));
        assert_eq!(parsed.poll_interval, Duration::from_millis(100));

        let rendered = serde_json::to_string(&parsed).unwrap();
        assert!(rendered.contains("\"claim_timeout_seconds\":300"));
        assert!(rendered.contains("\"poll_interval_ms\":100"));
    }
}
