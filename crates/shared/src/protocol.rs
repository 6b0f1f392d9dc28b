use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{EventKind, Job, JobStatus, ServiceStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStatusResponse {
    pub service: String,
    pub host: String,
    pub status: ServiceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_probe_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probe_latency_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandReport {
    pub succeeded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceActionResponse {
    pub service: String,
    pub host: String,
    pub event: EventKind,
    pub recorded_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<CommandReport>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobQuery {
    pub name: String,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobActiveResponse {
    pub name: String,
    pub detail: String,
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSummary {
    pub name: String,
    pub detail: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
}

impl From<Job> for JobSummary {
    fn from(job: Job) -> Self {
        Self {
            name: job.name,
            detail: job.detail,
            status: job.status,
            created_at: job.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetImportRequest {
    pub dataset: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingStateResponse {
    pub is_alive: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceReachabilityResponse {
    pub device: String,
    pub is_able_to_connect: bool,
}
