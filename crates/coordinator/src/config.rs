use std::{
    collections::BTreeMap,
    fmt, fs,
    path::PathBuf,
    time::Duration,
};

use anyhow::Context;
use coordinator_api::{DatasetLocations, Device, GracePeriods, Policy, ProbeTimeouts};
use remote_exec::Credentials;
use serde::Deserialize;
use shared::domain::ServiceDescriptor;

const DEFAULT_CONFIG_PATH: &str = "coordinator.toml";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub bind_addr: String,
    pub database_url: String,
    pub startup_grace_secs: u64,
    pub shutdown_grace_secs: u64,
    pub probe_interval_ms: u64,
    pub lightweight_probe_timeout_ms: u64,
    pub model_probe_timeout_ms: u64,
    pub command_timeout_secs: u64,
    pub reachability_timeout_secs: u64,
    pub transfer_timeout_secs: u64,
    pub frame_interval_ms: u64,
    pub max_blocking_threads: usize,
    pub datasets: DatasetSettings,
    pub services: Vec<ServiceDescriptor>,
    pub devices: BTreeMap<String, DeviceSettings>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8884".into(),
            database_url: "sqlite://./data/coordinator.db".into(),
            startup_grace_secs: 30,
            shutdown_grace_secs: 30,
            probe_interval_ms: 1000,
            lightweight_probe_timeout_ms: 1000,
            model_probe_timeout_ms: 10_000,
            command_timeout_secs: 20,
            reachability_timeout_secs: 3,
            transfer_timeout_secs: 30 * 60,
            frame_interval_ms: 100,
            max_blocking_threads: 8,
            datasets: DatasetSettings::default(),
            services: Vec::new(),
            devices: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatasetSettings {
    pub device: String,
    pub remote_dir: String,
    pub local_dir: PathBuf,
}

impl Default for DatasetSettings {
    fn default() -> Self {
        let locations = DatasetLocations::default();
        Self {
            device: locations.device,
            remote_dir: locations.remote_dir,
            local_dir: locations.local_dir,
        }
    }
}

#[derive(Clone, Deserialize)]
pub struct DeviceSettings {
    pub hostname: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub identity_file: Option<PathBuf>,
    #[serde(default)]
    pub port: Option<u16>,
}

impl fmt::Debug for DeviceSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSettings")
            .field("hostname", &self.hostname)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("identity_file", &self.identity_file)
            .field("port", &self.port)
            .finish()
    }
}

impl Settings {
    pub fn grace(&self) -> GracePeriods {
        GracePeriods {
            startup: Duration::from_secs(self.startup_grace_secs),
            shutdown: Duration::from_secs(self.shutdown_grace_secs),
        }
    }

    pub fn probe_timeouts(&self) -> ProbeTimeouts {
        ProbeTimeouts {
            lightweight: Duration::from_millis(self.lightweight_probe_timeout_ms),
            model: Duration::from_millis(self.model_probe_timeout_ms),
        }
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms.max(1))
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms.max(1))
    }

    /// The configured database as a `sqlite://` url; a blank value falls back
    /// to the default file.
    pub fn sqlite_url(&self) -> String {
        match self.database_url.trim() {
            "" => Settings::default().database_url,
            raw => storage::normalize_database_url(raw),
        }
    }

    pub fn policy(&self) -> Policy {
        Policy {
            grace: self.grace(),
            command_timeout: Duration::from_secs(self.command_timeout_secs),
            reachability_timeout: Duration::from_secs(self.reachability_timeout_secs),
            transfer_timeout: Duration::from_secs(self.transfer_timeout_secs),
            datasets: DatasetLocations {
                device: self.datasets.device.clone(),
                remote_dir: self.datasets.remote_dir.clone(),
                local_dir: self.datasets.local_dir.clone(),
            },
        }
    }

    pub fn devices(&self) -> Vec<Device> {
        self.devices
            .iter()
            .map(|(name, device)| Device {
                name: name.clone(),
                hostname: device.hostname.clone(),
                credentials: Credentials {
                    username: device.username.clone(),
                    password: device.password.clone(),
                    identity_file: device.identity_file.clone(),
                    port: device.port,
                },
            })
            .collect()
    }
}

/// Reads `coordinator.toml` (or `$COORDINATOR_CONFIG`) when present, then
/// applies environment overrides. A missing file means defaults; a malformed
/// one is an error.
pub fn load_settings() -> anyhow::Result<Settings> {
    let path = std::env::var("COORDINATOR_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
    let mut settings = match fs::read_to_string(&path) {
        Ok(raw) => parse_settings(&raw).with_context(|| format!("invalid config file '{path}'"))?,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Settings::default(),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read config file '{path}'"));
        }
    };
    apply_env_overrides(&mut settings, |key| std::env::var(key).ok());
    Ok(settings)
}

pub fn parse_settings(raw: &str) -> anyhow::Result<Settings> {
    Ok(toml::from_str(raw)?)
}

fn apply_env_overrides(settings: &mut Settings, var: impl Fn(&str) -> Option<String>) {
    if let Some(v) = var("COORDINATOR_BIND") {
        settings.bind_addr = v;
    }
    if let Some(v) = var("APP__BIND_ADDR") {
        settings.bind_addr = v;
    }

    if let Some(v) = var("DATABASE_URL") {
        settings.database_url = v;
    }
    if let Some(v) = var("APP__DATABASE_URL") {
        settings.database_url = v;
    }

    if let Some(parsed) = var("APP__STARTUP_GRACE_SECS").and_then(|v| v.parse().ok()) {
        settings.startup_grace_secs = parsed;
    }
    if let Some(parsed) = var("APP__SHUTDOWN_GRACE_SECS").and_then(|v| v.parse().ok()) {
        settings.shutdown_grace_secs = parsed;
    }
    if let Some(parsed) = var("APP__PROBE_INTERVAL_MS").and_then(|v| v.parse().ok()) {
        settings.probe_interval_ms = parsed;
    }

    if let Some(v) = var("APP__PI_PASSWORD") {
        if let Some(pi) = settings.devices.get_mut("pi") {
            pi.password = Some(v);
        }
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
