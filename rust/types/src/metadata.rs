use serde::{Deserialize, Serialize};

/// Per-run metadata published by the simulation before the first batch. The
/// resolved config JSON carries environment shape, topology, and the
/// sampling/snapshot/chunk intervals the indexer plans against.
///
/// Stored twice: as a length-delimited wire message at `raw/metadata.pb`
/// and as canonical JSON under the metadata store's `full_metadata` key.
#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct SimulationMetadata {
    #[prost(string, tag = "1")]
    pub simulation_run_id: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub resolved_config_json: ::prost::alloc::string::String,
    #[prost(int64, tag = "3")]
    pub start_time_ms: i64,
    #[prost(int64, tag = "4")]
    pub initial_seed: i64,
    #[prost(int64, tag = "5")]
    #[serde(default = "SimulationMetadata::default_sampling_interval")]
    pub sampling_interval: i64,
}

impl SimulationMetadata {
    fn default_sampling_interval() -> i64 {
        1
    }

    /// The canonical JSON encoding stored under the `full_metadata` key.
    pub fn to_canonical_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<SimulationMetadata, serde_json::Error> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_round_trip() {
        let metadata = SimulationMetadata {
            simulation_run_id: "20240301-09300000-00000000-0000-0000-0000-000000000000"
                .to_string(),
            resolved_config_json: r#"{"environment":{"shape":[100,100]}}"#.to_string(),
            start_time_ms: 1_709_285_400_000,
            initial_seed: 42,
            sampling_interval: 10,
        };
        let json = metadata.to_canonical_json().unwrap();
        assert_eq!(SimulationMetadata::from_json(&json).unwrap(), metadata);
    }

    #[test]
    fn sampling_interval_defaults_to_one() {
        let json = r#"{
            "simulation_run_id": "r",
            "resolved_config_json": "{}",
            "start_time_ms": 0,
            "initial_seed": 7
        }"#;
        let metadata = SimulationMetadata::from_json(json).unwrap();
        assert_eq!(metadata.sampling_interval, 1);
    }
}
