use std::{fmt, str::FromStr, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identifier unique to one coordinator process lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown {kind} value '{value}'")]
pub struct ParseDomainError {
    pub kind: &'static str,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    /// Answers its health endpoint almost immediately.
    #[default]
    Lightweight,
    /// Loads a large model before it can answer; probes get a longer timeout.
    Model,
}

fn default_health_path() -> String {
    "/health".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub name: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub kind: ServiceKind,
    #[serde(default = "default_health_path")]
    pub health_path: String,
    /// Device whose credentials are used for start/stop commands.
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default)]
    pub start_command: Option<String>,
    #[serde(default)]
    pub stop_command: Option<String>,
}

impl ServiceDescriptor {
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            kind: ServiceKind::default(),
            health_path: default_health_path(),
            device: None,
            start_command: None,
            stop_command: None,
        }
    }

    pub fn with_kind(mut self, kind: ServiceKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn health_url(&self) -> String {
        let path = if self.health_path.starts_with('/') {
            self.health_path.clone()
        } else {
            format!("/{}", self.health_path)
        };
        format!("http://{}:{}{}", self.host, self.port, path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Start,
    Stop,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Start => "start",
            EventKind::Stop => "stop",
        }
    }
}

impl FromStr for EventKind {
    type Err = ParseDomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(EventKind::Start),
            "stop" => Ok(EventKind::Stop),
            other => Err(ParseDomainError {
                kind: "event kind",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEvent {
    pub service: String,
    pub host: String,
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
}

/// The slice of the event log the status resolver needs for one (service, host).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventTail {
    pub latest: Option<ServiceEvent>,
    pub ever_started: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Started,
    Completed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Started => "started",
            JobStatus::Completed => "completed",
        }
    }
}

impl FromStr for JobStatus {
    type Err = ParseDomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "started" => Ok(JobStatus::Started),
            "completed" => Ok(JobStatus::Completed),
            other => Err(ParseDomainError {
                kind: "job status",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub session_id: SessionId,
    pub name: String,
    pub detail: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthProbeResult {
    pub service: String,
    pub is_healthy: bool,
    pub timestamp: DateTime<Utc>,
    pub latency: Duration,
}

/// Whole milliseconds in `duration`, saturating at `u64::MAX`.
pub fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceStatus {
    StartingUp,
    Healthy,
    Unhealthy,
    ShuttingDown,
    Off,
    InvincibleZombie,
}

impl ServiceStatus {
    pub const ALL: [ServiceStatus; 6] = [
        ServiceStatus::StartingUp,
        ServiceStatus::Healthy,
        ServiceStatus::Unhealthy,
        ServiceStatus::ShuttingDown,
        ServiceStatus::Off,
        ServiceStatus::InvincibleZombie,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ServiceStatus::StartingUp => "starting-up",
            ServiceStatus::Healthy => "healthy",
            ServiceStatus::Unhealthy => "unhealthy",
            ServiceStatus::ShuttingDown => "shutting-down",
            ServiceStatus::Off => "off",
            ServiceStatus::InvincibleZombie => "invincible-zombie",
        }
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
