use std::collections::{HashMap, HashSet};

use anyhow::{bail, Result};
use remote_exec::Credentials;
use shared::domain::ServiceDescriptor;

/// Static map of managed services, sourced from configuration.
#[derive(Debug, Clone, Default)]
pub struct ServiceRegistry {
    services: Vec<ServiceDescriptor>,
}

impl ServiceRegistry {
    pub fn new(services: Vec<ServiceDescriptor>) -> Result<Self> {
        let mut seen = HashSet::new();
        for descriptor in &services {
            if descriptor.name.trim().is_empty() {
                bail!("service entry with empty name");
            }
            if descriptor.host.trim().is_empty() {
                bail!("service '{}' has no host", descriptor.name);
            }
            if !seen.insert(descriptor.name.as_str()) {
                bail!("service '{}' is registered twice", descriptor.name);
            }
        }
        Ok(Self { services })
    }

    pub fn get(&self, name: &str) -> Option<&ServiceDescriptor> {
        self.services.iter().find(|descriptor| descriptor.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ServiceDescriptor> {
        self.services.iter()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct Device {
    pub name: String,
    pub hostname: String,
    pub credentials: Credentials,
}

/// Per-device login settings for the remote execution adapter.
#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    devices: HashMap<String, Device>,
}

impl DeviceRegistry {
    pub fn new(devices: impl IntoIterator<Item = Device>) -> Self {
        Self {
            devices: devices
                .into_iter()
                .map(|device| (device.name.to_ascii_lowercase(), device))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Device> {
        self.devices.get(&name.to_ascii_lowercase())
    }

    /// The device a service's commands run on: its explicit `device`, else
    /// whichever device answers to the service's host.
    pub fn for_service(&self, descriptor: &ServiceDescriptor) -> Option<&Device> {
        match &descriptor.device {
            Some(name) => self.get(name),
            None => self
                .devices
                .values()
                .find(|device| device.hostname.eq_ignore_ascii_case(&descriptor.host)),
        }
    }
}
