//! Registries for connected targets and watched sources.
//!
//! The engine resolves targets and sources by id at delivery time; the
//! host application registers concrete implementations at startup (and may
//! add or remove them while the engine runs, hence the lock).

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use courier_core::{Source, Target};

/// Registry of connected targets, keyed by target id.
#[derive(Default)]
pub struct TargetDirectory {
    targets: RwLock<HashMap<String, Arc<dyn Target>>>,
}

impl TargetDirectory {
    /// Creates an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a target, replacing any previous registration for its id.
    pub fn register(&self, target: Arc<dyn Target>) {
        let mut targets = self.targets.write().unwrap_or_else(|e| e.into_inner());
        targets.insert(target.id().to_string(), target);
    }

    /// Removes a target registration.
    pub fn unregister(&self, target_id: &str) -> Option<Arc<dyn Target>> {
        let mut targets = self.targets.write().unwrap_or_else(|e| e.into_inner());
        targets.remove(target_id)
    }

    /// Looks up a target by id.
    pub fn get(&self, target_id: &str) -> Option<Arc<dyn Target>> {
        let targets = self.targets.read().unwrap_or_else(|e| e.into_inner());
        targets.get(target_id).cloned()
    }

    /// All registered target ids.
    pub fn ids(&self) -> Vec<String> {
        let targets = self.targets.read().unwrap_or_else(|e| e.into_inner());
        targets.keys().cloned().collect()
    }
}

/// Registry of watched sources, keyed by source id.
#[derive(Default)]
pub struct SourceDirectory {
    sources: RwLock<HashMap<String, Arc<dyn Source>>>,
}

impl SourceDirectory {
    /// Creates an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a source, replacing any previous registration for its id.
    pub fn register(&self, source: Arc<dyn Source>) {
        let mut sources = self.sources.write().unwrap_or_else(|e| e.into_inner());
        sources.insert(source.id().to_string(), source);
    }

    /// Removes a source registration.
    pub fn unregister(&self, source_id: &str) -> Option<Arc<dyn Source>> {
        let mut sources = self.sources.write().unwrap_or_else(|e| e.into_inner());
        sources.remove(source_id)
    }

    /// Looks up a source by id.
    pub fn get(&self, source_id: &str) -> Option<Arc<dyn Source>> {
        let sources = self.sources.read().unwrap_or_else(|e| e.into_inner());
        sources.get(source_id).cloned()
    }

    /// All registered source ids.
    pub fn ids(&self) -> Vec<String> {
        let sources = self.sources.read().unwrap_or_else(|e| e.into_inner());
        sources.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use courier_core::{SourceError, TargetEndpoint, TargetError};

    use super::*;

    struct FakeTarget {
        id: String,
    }

    #[async_trait]
    impl Target for FakeTarget {
        fn id(&self) -> &str {
            &self.id
        }

        fn name(&self) -> &str {
            "fake"
        }

        fn target_type(&self) -> &str {
            "webhook"
        }

        fn base_url(&self) -> &str {
            "http://localhost"
        }

        async fn test_connection(&self) -> Result<(), TargetError> {
            Ok(())
        }

        async fn list_endpoints(&self) -> Result<Vec<TargetEndpoint>, TargetError> {
            Ok(Vec::new())
        }
    }

    struct FakeSource;

    impl Source for FakeSource {
        fn id(&self) -> &str {
            "stats"
        }

        fn name(&self) -> &str {
            "Stats"
        }

        fn event_type(&self) -> &str {
            "stats.updated"
        }

        fn snapshot(&self) -> Result<serde_json::Value, SourceError> {
            Ok(serde_json::json!({"ok": true}))
        }
    }

    #[test]
    fn registration_round_trips() {
        let directory = TargetDirectory::new();
        directory.register(Arc::new(FakeTarget { id: "t1".into() }));

        assert!(directory.get("t1").is_some());
        assert!(directory.get("t2").is_none());
        assert_eq!(directory.ids(), vec!["t1".to_string()]);

        assert!(directory.unregister("t1").is_some());
        assert!(directory.get("t1").is_none());
    }

    #[test]
    fn later_registration_replaces_earlier() {
        let directory = TargetDirectory::new();
        directory.register(Arc::new(FakeTarget { id: "t1".into() }));
        directory.register(Arc::new(FakeTarget { id: "t1".into() }));
        assert_eq!(directory.ids().len(), 1);
    }

    #[test]
    fn source_directory_round_trips() {
        let directory = SourceDirectory::new();
        directory.register(Arc::new(FakeSource));

        let source = directory.get("stats").unwrap();
        assert_eq!(source.event_type(), "stats.updated");
        assert!(directory.unregister("stats").is_some());
        assert!(directory.get("stats").is_none());
    }
}
