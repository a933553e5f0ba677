//! Capability registry: manifests for planner discovery

use std::collections::BTreeMap;
use std::sync::RwLock;

use serde_json::{Map, Value};
use tracing::info;

use super::{Manifest, Provider};

struct CapabilityEntry {
    manifest: Manifest,
    metadata: Map<String, Value>,
}

/// Runtime capabilities (sandbox, hostbridge, plugins) registered with
/// metadata so the planner can discover available tools and generate valid
/// plans against their manifests.
#[derive(Default)]
pub struct CapabilityRegistry {
    caps: RwLock<BTreeMap<String, CapabilityEntry>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str, manifest: Manifest, metadata: Map<String, Value>) {
        let mut caps = self.caps.write().unwrap();
        caps.insert(
            name.to_string(),
            CapabilityEntry { manifest, metadata },
        );
        info!(capability = name, "CapabilityRegistry: registered");
    }

    /// Register a provider under its own name using its manifest
    pub fn register_provider(&self, provider: &dyn Provider) {
        self.register(provider.name(), provider.manifest(), Map::new());
    }

    pub fn unregister(&self, name: &str) {
        let mut caps = self.caps.write().unwrap();
        if caps.remove(name).is_some() {
            info!(capability = name, "CapabilityRegistry: unregistered");
        }
    }

    pub fn get_manifest(&self, name: &str) -> Option<Manifest> {
        let caps = self.caps.read().unwrap();
        caps.get(name).map(|e| e.manifest.clone())
    }

    pub fn get_metadata(&self, name: &str) -> Option<Map<String, Value>> {
        let caps = self.caps.read().unwrap();
        caps.get(name).map(|e| e.metadata.clone())
    }

    pub fn list(&self) -> Vec<String> {
        let caps = self.caps.read().unwrap();
        caps.keys().cloned().collect()
    }

    /// Manifests plus metadata for every capability; the planner hands this
    /// to the DSL generator
    pub fn export_manifests(&self) -> BTreeMap<String, Value> {
        let caps = self.caps.read().unwrap();
        caps.iter()
            .map(|(name, entry)| {
                let mut value = entry.metadata.clone();
                value.insert(
                    "manifest".to_string(),
                    serde_json::to_value(&entry.manifest).unwrap_or(Value::Null),
                );
                (name.clone(), Value::Object(value))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::SimulatedProvider;

    #[test]
    fn test_register_and_export() {
        let registry = CapabilityRegistry::new();
        registry.register_provider(&SimulatedProvider);

        let mut metadata = Map::new();
        metadata.insert("kind".to_string(), "plugin".into());
        registry.register(
            "browser",
            Manifest {
                name: "browser".to_string(),
                version: "0.1.0".to_string(),
                description: "Browser automation".to_string(),
                actions: Default::default(),
            },
            metadata,
        );

        assert_eq!(registry.list(), vec!["browser".to_string(), "simulated".to_string()]);
        assert!(registry.get_manifest("simulated").is_some());

        let exported = registry.export_manifests();
        assert_eq!(exported["browser"]["kind"], "plugin");
        assert_eq!(exported["browser"]["manifest"]["name"], "browser");
    }

    #[test]
    fn test_unregister() {
        let registry = CapabilityRegistry::new();
        registry.register_provider(&SimulatedProvider);
        registry.unregister("simulated");
        assert!(registry.get_manifest("simulated").is_none());
    }
}
