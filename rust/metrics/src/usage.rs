use crate::WindowedMetrics;
use evochora_error::{ErrorCodes, EvochoraError};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/////////////////////////////////////////////// usage //////////////////////////////////////////////

/// The capability a caller requests from a wrapped resource. A resource
/// declares the subset it supports; everything else is rejected.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, serde::Serialize, serde::Deserialize)]
pub enum UsageType {
    #[serde(rename = "storage-read")]
    StorageRead,
    #[serde(rename = "storage-write")]
    StorageWrite,
    #[serde(rename = "analytics-write")]
    AnalyticsWrite,
    #[serde(rename = "topic-read")]
    TopicRead,
    #[serde(rename = "topic-write")]
    TopicWrite,
    #[serde(rename = "db-meta-read")]
    DbMetaRead,
    #[serde(rename = "db-meta-write")]
    DbMetaWrite,
}

impl UsageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            UsageType::StorageRead => "storage-read",
            UsageType::StorageWrite => "storage-write",
            UsageType::AnalyticsWrite => "analytics-write",
            UsageType::TopicRead => "topic-read",
            UsageType::TopicWrite => "topic-write",
            UsageType::DbMetaRead => "db-meta-read",
            UsageType::DbMetaWrite => "db-meta-write",
        }
    }
}

impl std::fmt::Display for UsageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum UsageState {
    #[default]
    Active,
    Inactive,
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("usage type '{requested}' is not supported; supported: [{}]",
        .supported.iter().map(|u| u.as_str()).collect::<Vec<_>>().join(", "))]
pub struct UnsupportedUsageError {
    pub requested: UsageType,
    pub supported: Vec<UsageType>,
}

impl EvochoraError for UnsupportedUsageError {
    fn code(&self) -> ErrorCodes {
        ErrorCodes::PermissionDenied
    }
}

/// Implemented by resources that can be placed behind a [`Monitored`]
/// wrapper.
pub trait Capabilities {
    fn resource_name(&self) -> &str;
    fn supported_usages(&self) -> &'static [UsageType];
    fn usage_state(&self) -> UsageState {
        UsageState::Active
    }
}

///////////////////////////////////////////// UsageMeter ///////////////////////////////////////////

/// Per-usage metric windows for one resource. Resources that record their
/// own operations (batch storage times every read and write internally)
/// embed a meter directly; everything else gets one through [`Monitored`].
#[derive(Clone)]
pub struct UsageMeter {
    supported: &'static [UsageType],
    windows: HashMap<UsageType, Arc<WindowedMetrics>>,
}

impl UsageMeter {
    /// One window per supported usage, so reads and writes are reported
    /// separately the way the underlying dashboards expect.
    pub fn new(supported: &'static [UsageType], window: Duration) -> UsageMeter {
        let windows = supported
            .iter()
            .map(|usage| (*usage, Arc::new(WindowedMetrics::new(window))))
            .collect();
        UsageMeter { supported, windows }
    }

    pub fn supported(&self) -> &'static [UsageType] {
        self.supported
    }

    /// Resolve the window for a requested usage, failing with the full list
    /// of supported types when the capability is absent.
    pub fn for_usage(&self, usage: UsageType) -> Result<Arc<WindowedMetrics>, UnsupportedUsageError> {
        self.windows
            .get(&usage)
            .cloned()
            .ok_or_else(|| UnsupportedUsageError {
                requested: usage,
                supported: self.supported.to_vec(),
            })
    }

    /// Window for a usage the owning resource itself declared. Construction
    /// seeds every supported usage, so this cannot miss for the resource's
    /// own recording paths.
    pub fn declared(&self, usage: UsageType) -> &WindowedMetrics {
        &self.windows[&usage]
    }
}

///////////////////////////////////////////// Monitored ////////////////////////////////////////////

/// Capability-checked, metered access to a resource that does not meter
/// itself. Callers resolve a usage window, time their calls against it, and
/// reach the resource through `inner`.
pub struct Monitored<R: Capabilities> {
    inner: R,
    meter: UsageMeter,
}

impl<R: Capabilities> Monitored<R> {
    pub fn new(inner: R, window: Duration) -> Monitored<R> {
        let meter = UsageMeter::new(inner.supported_usages(), window);
        Monitored { inner, meter }
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }

    pub fn usage_state(&self) -> UsageState {
        self.inner.usage_state()
    }

    pub fn for_usage(&self, usage: UsageType) -> Result<Arc<WindowedMetrics>, UnsupportedUsageError> {
        self.meter.for_usage(usage)
    }

    pub fn snapshot(&self, usage: UsageType) -> Result<crate::MetricsSnapshot, UnsupportedUsageError> {
        Ok(self.meter.for_usage(usage)?.snapshot())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeSysDb;

    impl Capabilities for FakeSysDb {
        fn resource_name(&self) -> &str {
            "sysdb"
        }

        fn supported_usages(&self) -> &'static [UsageType] {
            &[UsageType::DbMetaRead, UsageType::DbMetaWrite]
        }
    }

    #[test]
    fn supported_usage_is_metered() {
        let monitored = Monitored::new(FakeSysDb, Duration::from_secs(5));
        let window = monitored.for_usage(UsageType::DbMetaRead).unwrap();
        window.record(128, Duration::from_micros(30));
        let snapshot = monitored.snapshot(UsageType::DbMetaRead).unwrap();
        assert_eq!(snapshot.total_operations, 1);
        assert_eq!(snapshot.total_bytes, 128);
        // Writes are tracked in their own window.
        let writes = monitored.snapshot(UsageType::DbMetaWrite).unwrap();
        assert_eq!(writes.total_operations, 0);
    }

    #[test]
    fn unsupported_usage_lists_supported_types() {
        let monitored = Monitored::new(FakeSysDb, Duration::from_secs(5));
        let err = monitored.for_usage(UsageType::TopicWrite).unwrap_err();
        assert_eq!(err.requested, UsageType::TopicWrite);
        assert_eq!(
            err.supported,
            vec![UsageType::DbMetaRead, UsageType::DbMetaWrite]
        );
        assert_eq!(err.code(), ErrorCodes::PermissionDenied);
        let rendered = err.to_string();
        assert!(rendered.contains("topic-write"));
        assert!(rendered.contains("db-meta-read"));
    }

    #[test]
    fn meter_declared_window_is_always_present() {
        let meter = UsageMeter::new(
            &[UsageType::StorageRead, UsageType::StorageWrite],
            Duration::from_secs(5),
        );
        meter
            .declared(UsageType::StorageWrite)
            .record(64, Duration::from_micros(10));
        let snapshot = meter.for_usage(UsageType::StorageWrite).unwrap().snapshot();
        assert_eq!(snapshot.total_bytes, 64);
        assert!(meter.for_usage(UsageType::TopicRead).is_err());
    }

    #[test]
    fn wrapped_resources_default_to_active() {
        let monitored = Monitored::new(FakeSysDb, Duration::from_secs(5));
        assert_eq!(monitored.usage_state(), UsageState::Active);
    }
}
