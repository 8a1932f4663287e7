//! Device registry.
//!
//! Devices are keyed by name and created on first reference, with the
//! endpoint supplied by that first reference. A process-wide registry is
//! available through [`global`]; [`DeviceRegistry`] can also be used on
//! its own (tests, embedding).

use crate::error::DeviceResult;
use crate::session::Device;
use leep_common::config::DeviceConfig;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};
use tracing::debug;

/// Devices by name.
pub struct DeviceRegistry {
    devices: RwLock<BTreeMap<String, Arc<Device>>>,
}

impl DeviceRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            devices: RwLock::new(BTreeMap::new()),
        }
    }

    /// Device named `config.name`, created from `config` if absent.
    ///
    /// Later references with a different endpoint get the existing
    /// device unchanged.
    ///
    /// # Errors
    /// Creation errors of a new device; the registry is unchanged.
    pub fn get_or_create(&self, config: DeviceConfig) -> DeviceResult<Arc<Device>> {
        if let Some(device) = self.devices.read().get(&config.name) {
            return Ok(device.clone());
        }
        let mut devices = self.devices.write();
        if let Some(device) = devices.get(&config.name) {
            return Ok(device.clone());
        }
        let name = config.name.clone();
        let device = Device::create(config)?;
        debug!("Registered device {}", name);
        devices.insert(name, device.clone());
        Ok(device)
    }

    /// Device by name.
    pub fn find(&self, name: &str) -> Option<Arc<Device>> {
        self.devices.read().get(name).cloned()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.devices.read().keys().cloned().collect()
    }

    /// Number of devices.
    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    /// True if no device was created yet.
    pub fn is_empty(&self) -> bool {
        self.devices.read().is_empty()
    }

    /// Stop every device driver.
    pub fn shutdown_all(&self) {
        let devices: Vec<Arc<Device>> = self.devices.read().values().cloned().collect();
        for device in devices {
            device.shutdown();
        }
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Process-wide registry ──────────────────────────────────────────

static GLOBAL_REGISTRY: LazyLock<DeviceRegistry> = LazyLock::new(DeviceRegistry::new);

/// The process-wide registry, initialized on first use.
pub fn global() -> &'static DeviceRegistry {
    &GLOBAL_REGISTRY
}

/// [`DeviceRegistry::get_or_create`] on the global registry.
pub fn get_or_create_device(config: DeviceConfig) -> DeviceResult<Arc<Device>> {
    global().get_or_create(config)
}

/// [`DeviceRegistry::find`] on the global registry.
pub fn find_device(name: &str) -> Option<Arc<Device>> {
    global().find(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(name: &str) -> DeviceConfig {
        let mut config = DeviceConfig::new(name);
        config.bind = "127.0.0.1:0".to_string();
        config
    }

    #[test]
    fn test_first_reference_wins() {
        let registry = DeviceRegistry::new();
        let first = registry.get_or_create(config("a")).unwrap();
        let mut other = config("a");
        other.peer = Some("127.0.0.1:9".to_string());
        let second = registry.get_or_create(other).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(second.peer().is_none());
        assert_eq!(registry.len(), 1);
        registry.shutdown_all();
    }

    #[test]
    fn test_bad_config_not_registered() {
        let registry = DeviceRegistry::new();
        let mut bad = config("b");
        bad.peer = Some("not a host!".to_string());
        assert!(registry.get_or_create(bad).is_err());
        assert!(registry.is_empty());
        assert!(registry.find("b").is_none());
    }

    #[test]
    fn test_global_lookup() {
        let device = get_or_create_device(config("global-test")).unwrap();
        assert!(Arc::ptr_eq(&find_device("global-test").unwrap(), &device));
        assert!(global().names().contains(&"global-test".to_string()));
        device.shutdown();
    }
}
