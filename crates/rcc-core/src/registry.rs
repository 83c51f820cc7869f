//! Device registry (C1).
//!
//! A process-wide name→handle mapping populated at init. Lookup is
//! non-blocking; handles remain stable until teardown. The original
//! implementation keeps each device as a module-level singleton; this
//! registry replaces that with an explicit `DashMap`-backed lookup, the
//! same preference the grounding library shows for `DashMap`-keyed service
//! maps over ad-hoc statics.

use std::any::Any;
use std::sync::Arc;

use dashmap::DashMap;

/// A registered device handle, type-erased so the registry can hold
/// heterogeneous handles (broker client, audio engine, camera, GPS port)
/// behind one map.
pub type DeviceHandle = Arc<dyn Any + Send + Sync>;

/// Process-wide registry of device handles, keyed by name.
///
/// Populated once during [`crate::bootstrap::bootstrap_services`] in
/// dependency order; components look up collaborators by name rather than
/// threading every dependency through every constructor.
#[derive(Default)]
pub struct DeviceRegistry {
    handles: DashMap<&'static str, DeviceHandle>,
}

impl DeviceRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handle under `name`, replacing any existing entry.
    pub fn register<T: Any + Send + Sync>(&self, name: &'static str, handle: Arc<T>) {
        self.handles.insert(name, handle as DeviceHandle);
    }

    /// Looks up a handle by name and downcasts it to `T`.
    ///
    /// Returns `None` if no handle is registered under `name`, or if the
    /// registered handle is not of type `T`.
    #[must_use]
    pub fn get<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        self.handles
            .get(name)
            .and_then(|entry| entry.value().clone().downcast::<T>().ok())
    }

    /// Returns whether a handle is registered under `name`.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.handles.contains_key(name)
    }

    /// Removes a handle, returning whether one was present.
    ///
    /// Used during teardown, which proceeds in reverse dependency order.
    pub fn remove(&self, name: &str) -> bool {
        self.handles.remove(name).is_some()
    }

    /// Returns the number of registered handles.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Returns whether the registry holds no handles.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Thing(u32);

    #[test]
    fn register_then_get_round_trips() {
        let registry = DeviceRegistry::new();
        registry.register("thing", Arc::new(Thing(42)));
        let got = registry.get::<Thing>("thing").unwrap();
        assert_eq!(got.0, 42);
    }

    #[test]
    fn get_missing_returns_none() {
        let registry = DeviceRegistry::new();
        assert!(registry.get::<Thing>("missing").is_none());
    }

    #[test]
    fn get_wrong_type_returns_none() {
        let registry = DeviceRegistry::new();
        registry.register("thing", Arc::new(Thing(1)));
        assert!(registry.get::<String>("thing").is_none());
    }

    #[test]
    fn remove_clears_entry() {
        let registry = DeviceRegistry::new();
        registry.register("thing", Arc::new(Thing(1)));
        assert!(registry.remove("thing"));
        assert!(registry.get::<Thing>("thing").is_none());
        assert!(!registry.remove("thing"));
    }
}
