//! Thread-safe plugin registry

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use eyre::{bail, Result};
use tracing::info;

use super::Provider;

/// Providers keyed by name; read-mostly
#[derive(Default)]
pub struct PluginRegistry {
    plugins: RwLock<HashMap<String, Arc<dyn Provider>>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider. Re-registering an existing name requires
    /// `overwrite`.
    pub fn register(&self, plugin: Arc<dyn Provider>, overwrite: bool) -> Result<()> {
        let name = plugin.name().to_string();
        let mut plugins = self.plugins.write().unwrap();
        if plugins.contains_key(&name) && !overwrite {
            bail!("Plugin already registered: {}", name);
        }
        plugins.insert(name.clone(), plugin);
        info!(plugin = %name, "PluginRegistry: registered");
        Ok(())
    }

    pub fn unregister(&self, name: &str) {
        let mut plugins = self.plugins.write().unwrap();
        if plugins.remove(name).is_some() {
            info!(plugin = %name, "PluginRegistry: unregistered");
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Provider>> {
        let plugins = self.plugins.read().unwrap();
        plugins.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        let plugins = self.plugins.read().unwrap();
        plugins.contains_key(name)
    }

    pub fn list(&self) -> Vec<String> {
        let plugins = self.plugins.read().unwrap();
        let mut names: Vec<String> = plugins.keys().cloned().collect();
        names.sort();
        names
    }
}
