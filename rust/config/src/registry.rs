use evochora_error::EvochoraError;
use parking_lot::Mutex;
use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Marker for resources that may be shared through the registry: database
/// pools, storage facades, topics. Implementors are cheap-to-clone handles
/// whose clones observe the same underlying state (Arc-backed internals).
pub trait Injectable: Any + Send + Sync + Clone {}

/// Process-wide wiring for shared pipeline resources. Components built via
/// `Configurable` resolve their dependencies here instead of re-creating
/// them: the topic and the metadata store, for example, share one SQLite
/// pool by registering it on first construction. Keys are types, so a
/// component asks for "the pool" rather than a stringly-typed name.
///
/// The registry handle itself is cheap to clone; clones share the same
/// resource map.
#[derive(Clone, Default)]
pub struct Registry {
    resources: Arc<Mutex<HashMap<TypeId, RegistryEntry>>>,
}

struct RegistryEntry {
    value: Box<dyn Any + Send + Sync>,
    type_name: &'static str,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("no {missing} registered; registered resources: [{available}]")]
    TypeNotFound {
        missing: &'static str,
        available: String,
    },
}

impl EvochoraError for RegistryError {
    fn code(&self) -> evochora_error::ErrorCodes {
        evochora_error::ErrorCodes::FailedPrecondition
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a resource handle. Registering the same type again replaces
    /// the previous handle, so test harnesses can swap in fakes after the
    /// production wiring ran.
    pub fn register<T: Injectable>(&self, value: T) {
        let mut resources = self.resources.lock();
        resources.insert(
            TypeId::of::<T>(),
            RegistryEntry {
                value: Box::new(value),
                type_name: type_name::<T>(),
            },
        );
    }

    /// Resolve a clone of a previously registered resource. The error names
    /// everything that IS registered, which is usually enough to spot a
    /// component constructed before its dependency.
    pub fn get<T: Injectable>(&self) -> Result<T, RegistryError> {
        let resources = self.resources.lock();
        match resources
            .get(&TypeId::of::<T>())
            .and_then(|entry| entry.value.downcast_ref::<T>())
        {
            Some(value) => Ok(value.clone()),
            None => {
                let mut available: Vec<&'static str> =
                    resources.values().map(|entry| entry.type_name).collect();
                available.sort_unstable();
                Err(RegistryError::TypeNotFound {
                    missing: type_name::<T>(),
                    available: available.join(", "),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Stand-in for a shared pool handle: clones must observe each other's
    /// state, exactly like the SqlitePool the topic and sysdb share.
    #[derive(Clone, Default)]
    struct FakePool {
        opened: Arc<Mutex<Vec<String>>>,
    }

    impl Injectable for FakePool {}

    #[derive(Clone, Debug)]
    struct FakeStorageHandle {
        root: String,
    }

    impl Injectable for FakeStorageHandle {}

    #[test]
    fn resolved_clones_share_state() {
        let registry = Registry::new();
        registry.register(FakePool::default());

        let first = registry.get::<FakePool>().expect("pool was registered");
        first.opened.lock().push("runs.sqlite3".to_string());

        let second = registry.get::<FakePool>().expect("pool was registered");
        assert_eq!(second.opened.lock().as_slice(), ["runs.sqlite3"]);
    }

    #[test]
    fn re_registration_replaces_the_handle() {
        let registry = Registry::new();
        registry.register(FakeStorageHandle {
            root: "/data/runs".to_string(),
        });
        registry.register(FakeStorageHandle {
            root: "/tmp/test-runs".to_string(),
        });
        assert_eq!(registry.get::<FakeStorageHandle>().unwrap().root, "/tmp/test-runs");
    }

    #[test]
    fn missing_type_error_lists_what_is_registered() {
        let registry = Registry::new();
        registry.register(FakePool::default());

        let err = registry.get::<FakeStorageHandle>().unwrap_err();
        let rendered = err.to_string();
        assert!(rendered.contains("FakeStorageHandle"), "{}", rendered);
        assert!(rendered.contains("FakePool"), "{}", rendered);
    }

    #[test]
    fn registry_clones_share_the_resource_map() {
        let registry = Registry::new();
        let wiring_view = registry.clone();
        registry.register(FakePool::default());
        assert!(wiring_view.get::<FakePool>().is_ok());
    }
}
