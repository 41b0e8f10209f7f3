use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use evochora_error::{ErrorCodes, EvochoraError};
use serde::Deserialize;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;
use uuid::Uuid;

/// Run ids are `YYYYMMDD-HHMMSSSS-<uuid>`: a wall-clock prefix (date, time,
/// centiseconds) followed by a v4 UUID. Lexicographic order on the string is
/// ascending start-time order, which the on-disk layout depends on.
static RUN_ID_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^[0-9]{8}-[0-9]{8}-[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}$",
    )
    .expect("run id regex must compile")
});

/// Matches a per-run resource name (e.g. a topic) and captures its run id.
static RUN_SUFFIX_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r".*_([0-9]{8}-[0-9]{8}-[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12})$",
    )
    .expect("run suffix regex must compile")
});

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RunIdError {
    #[error("'{0}' does not match the run id grammar")]
    Malformed(String),
    #[error("'{0}' carries an unparseable timestamp")]
    BadTimestamp(String),
}

impl EvochoraError for RunIdError {
    fn code(&self) -> ErrorCodes {
        ErrorCodes::InvalidArgument
    }
}

/// A validated simulation run id.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, serde::Serialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    pub fn new(raw: impl Into<String>) -> Result<RunId, RunIdError> {
        let raw = raw.into();
        if !RUN_ID_RE.is_match(&raw) {
            return Err(RunIdError::Malformed(raw));
        }
        // The grammar guarantees shape, not calendar validity.
        if parse_run_timestamp(&raw).is_none() {
            return Err(RunIdError::BadTimestamp(raw));
        }
        Ok(RunId(raw))
    }

    /// Generate a fresh run id for the given instant.
    pub fn generate(now: DateTime<Utc>) -> RunId {
        let centis = now.timestamp_subsec_millis() / 10;
        let prefix = format!("{}{:02}", now.format("%Y%m%d-%H%M%S"), centis);
        RunId(format!("{}-{}", prefix, Uuid::new_v4()))
    }

    /// The wall-clock instant encoded in the leading 17 characters.
    pub fn timestamp(&self) -> DateTime<Utc> {
        parse_run_timestamp(&self.0).expect("validated on construction")
    }

    /// Uppercase alphanumeric/underscore form used for SQL schema naming.
    pub fn sanitized(&self) -> String {
        self.0
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for RunId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::str::FromStr for RunId {
    type Err = RunIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RunId::new(s)
    }
}

impl<'de> serde::Deserialize<'de> for RunId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        RunId::new(raw).map_err(serde::de::Error::custom)
    }
}

/// Parse the `YYYYMMDD-HHMMSSSS` prefix of a run-id-shaped string. Returns
/// None when the leading 17 characters are not a valid instant.
pub fn parse_run_timestamp(name: &str) -> Option<DateTime<Utc>> {
    if name.len() < 17 || !name.is_char_boundary(17) {
        return None;
    }
    let (stamp, _) = name.split_at(17);
    let (datetime, centis) = stamp.split_at(15);
    let centis: u32 = centis.parse().ok()?;
    if centis > 99 {
        return None;
    }
    let naive = NaiveDateTime::parse_from_str(datetime, "%Y%m%d-%H%M%S").ok()?;
    let base = Utc.from_utc_datetime(&naive);
    Some(base + chrono::Duration::milliseconds(centis as i64 * 10))
}

/// Extract the run id captured by a `<base>_<runId>` resource name.
pub fn run_id_from_suffixed_name(name: &str) -> Option<RunId> {
    let captures = RUN_SUFFIX_RE.captures(name)?;
    RunId::new(captures.get(1)?.as_str()).ok()
}
