use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use chrono::Utc;
use futures::{stream::FuturesUnordered, Stream};
use serde::Deserialize;
use shared::domain::{HealthProbeResult, ServiceDescriptor, ServiceKind};
use tokio::sync::watch;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeTimeouts {
    pub lightweight: Duration,
    pub model: Duration,
}

impl Default for ProbeTimeouts {
    fn default() -> Self {
        Self {
            lightweight: Duration::from_secs(1),
            model: Duration::from_secs(10),
        }
    }
}

impl ProbeTimeouts {
    pub fn for_kind(&self, kind: ServiceKind) -> Duration {
        match kind {
            ServiceKind::Lightweight => self.lightweight,
            ServiceKind::Model => self.model,
        }
    }
}

#[derive(Debug, Deserialize)]
struct HealthPayload {
    is_healthy: bool,
}

/// Issues best-effort health checks. A probe never fails: every network error,
/// bad status, malformed body or timeout is reported as unhealthy.
#[derive(Clone)]
pub struct HealthProber {
    http: reqwest::Client,
    timeouts: ProbeTimeouts,
}

impl HealthProber {
    pub fn new(timeouts: ProbeTimeouts) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .context("failed to build health probe http client")?;
        Ok(Self { http, timeouts })
    }

    pub fn timeouts(&self) -> ProbeTimeouts {
        self.timeouts
    }

    pub async fn probe(&self, descriptor: &ServiceDescriptor, timeout: Duration) -> HealthProbeResult {
        let started = Instant::now();
        let url = descriptor.health_url();
        let is_healthy = match tokio::time::timeout(timeout, self.fetch(&url)).await {
            Ok(Ok(is_healthy)) => is_healthy,
            Ok(Err(err)) => {
                debug!(service = %descriptor.name, %url, "probe: request failed: {err}");
                false
            }
            Err(_) => {
                debug!(service = %descriptor.name, %url, ?timeout, "probe: timed out");
                false
            }
        };

        HealthProbeResult {
            service: descriptor.name.clone(),
            is_healthy,
            timestamp: Utc::now(),
            latency: started.elapsed(),
        }
    }

    /// Probes every descriptor at once, each with its kind's timeout, yielding
    /// results in completion order.
    pub fn probe_all<'a, I>(&'a self, descriptors: I) -> impl Stream<Item = HealthProbeResult> + 'a
    where
        I: IntoIterator<Item = &'a ServiceDescriptor>,
    {
        descriptors
            .into_iter()
            .map(|descriptor| self.probe(descriptor, self.timeouts.for_kind(descriptor.kind)))
            .collect::<FuturesUnordered<_>>()
    }

    async fn fetch(&self, url: &str) -> reqwest::Result<bool> {
        let payload = self
            .http
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json::<HealthPayload>()
            .await?;
        Ok(payload.is_healthy)
    }
}

/// Creates the board the probe scheduler writes and status queries read.
pub fn probe_board() -> (ProbePublisher, ProbeBoard) {
    let (tx, rx) = watch::channel(HashMap::new());
    (ProbePublisher { tx }, ProbeBoard { rx })
}

/// Single writer of the latest probe result per service.
pub struct ProbePublisher {
    tx: watch::Sender<HashMap<String, HealthProbeResult>>,
}

impl ProbePublisher {
    /// Stores `result` and returns the health it replaced, if any.
    pub fn publish(&self, result: HealthProbeResult) -> Option<bool> {
        let mut previous = None;
        self.tx.send_modify(|board| {
            previous = board
                .insert(result.service.clone(), result)
                .map(|old| old.is_healthy);
        });
        previous
    }
}

#[derive(Clone)]
pub struct ProbeBoard {
    rx: watch::Receiver<HashMap<String, HealthProbeResult>>,
}

impl ProbeBoard {
    pub fn latest(&self, service: &str) -> Option<HealthProbeResult> {
        self.rx.borrow().get(service).cloned()
    }
}

#[cfg(test)]
#[path = "tests/probe_tests.rs"]
mod tests;
