/*
    emucore: emulation substrate library.
    Copyright (C) 2019-2024  Rafal Michalski

    For the full copyright notice, see the lib.rs file.
*/
use core::fmt;
use std::collections::BTreeMap;

#[allow(unused_imports)]
use log::{error, warn, info, debug, trace, Level};

use crate::error::ConfigError;
use crate::machine::MachineConfig;
use super::Device;

/// Creates a device and adds it to a configuration: `(config, owner, name, clock) -> tag`.
pub type DeviceFactory = Box<dyn Fn(&mut MachineConfig, &str, &str, u32) -> Result<String, ConfigError>>;

/// Device types by their short names.
///
/// An explicit registry object: nothing is registered behind the scenes, a front end
/// populates it with the device types it knows about.
#[derive(Default)]
pub struct DeviceTypeRegistry {
    factories: BTreeMap<String, DeviceFactory>,
}

impl DeviceTypeRegistry {
    pub fn new() -> Self {
        DeviceTypeRegistry::default()
    }

    pub fn register<F>(&mut self, shortname: &str, factory: F) -> Result<(), ConfigError>
        where F: Fn(&mut MachineConfig, &str, &str, u32) -> Result<String, ConfigError> + 'static
    {
        if self.factories.contains_key(shortname) {
            return Err(ConfigError::DuplicateDeviceType(shortname.into()))
        }
        debug!("device type `{}` registered", shortname);
        self.factories.insert(shortname.into(), Box::new(factory));
        Ok(())
    }

    /// Register a device type created with [Default].
    pub fn register_default<D: Device + Default>(&mut self, shortname: &str) -> Result<(), ConfigError> {
        self.register(shortname, |config, owner, name, clock| {
            config.add_device(owner, name, clock, D::default())
        })
    }

    pub fn contains(&self, shortname: &str) -> bool {
        self.factories.contains_key(shortname)
    }

    pub fn shortnames(&self) -> impl Iterator<Item=&str> {
        self.factories.keys().map(String::as_str)
    }

    /// Create a device of the registered type.
    pub fn create(
            &self,
            config: &mut MachineConfig,
            shortname: &str,
            owner: &str,
            name: &str,
            clock: u32
        ) -> Result<String, ConfigError>
    {
        match self.factories.get(shortname) {
            Some(factory) => factory(config, owner, name, clock),
            None => Err(ConfigError::UnknownDeviceType(shortname.into()))
        }
    }
}

impl fmt::Debug for DeviceTypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.factories.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Dummy;

    impl Device for Dummy {}

    #[test]
    fn registry_create() {
        let mut registry = DeviceTypeRegistry::new();
        registry.register_default::<Dummy>("dummy").unwrap();
        assert!(matches!(registry.register_default::<Dummy>("dummy"), Err(ConfigError::DuplicateDeviceType(..))));
        assert!(registry.contains("dummy"));
        assert_eq!(registry.shortnames().collect::<Vec<_>>(), vec!["dummy"]);
        let mut config = MachineConfig::new("test");
        let tag = registry.create(&mut config, "dummy", ":", "dev", 0).unwrap();
        assert_eq!(tag, ":dev");
        assert!(matches!(registry.create(&mut config, "nope", ":", "dev2", 0),
                         Err(ConfigError::UnknownDeviceType(name)) if name == "nope"));
        assert!(matches!(registry.create(&mut config, "dummy", ":", "dev", 0), Err(ConfigError::DuplicateTag(..))));
    }
}
