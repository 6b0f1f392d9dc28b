use std::time::Duration;

use chrono::{DateTime, Utc};
use shared::domain::{EventKind, EventTail, HealthProbeResult, ServiceStatus};

/// How long a service is excused from a probe that contradicts its latest intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GracePeriods {
    pub startup: Duration,
    pub shutdown: Duration,
}

impl Default for GracePeriods {
    fn default() -> Self {
        Self {
            startup: Duration::from_secs(30),
            shutdown: Duration::from_secs(30),
        }
    }
}

/// Folds the latest intent and the latest probe into one lifecycle state.
///
/// Pure: nothing is cached and `now` is an input, so any number of callers can
/// ask without triggering a probe. A missing probe counts as unhealthy, and an
/// event stamped after `now` counts as zero elapsed time.
pub fn resolve_status(
    tail: &EventTail,
    probe: Option<&HealthProbeResult>,
    now: DateTime<Utc>,
    grace: GracePeriods,
) -> ServiceStatus {
    let Some(latest) = tail.latest.as_ref() else {
        return ServiceStatus::Off;
    };
    if !tail.ever_started && latest.kind != EventKind::Start {
        return ServiceStatus::Off;
    }

    let healthy = probe.is_some_and(|probe| probe.is_healthy);
    let elapsed = (now - latest.timestamp).to_std().unwrap_or(Duration::ZERO);

    match (latest.kind, healthy) {
        (EventKind::Stop, false) => ServiceStatus::Off,
        (EventKind::Start, false) if elapsed < grace.startup => ServiceStatus::StartingUp,
        (EventKind::Start, true) => ServiceStatus::Healthy,
        (EventKind::Start, false) => ServiceStatus::Unhealthy,
        (EventKind::Stop, true) if elapsed < grace.shutdown => ServiceStatus::ShuttingDown,
        (EventKind::Stop, true) => ServiceStatus::InvincibleZombie,
    }
}
