use std::{sync::Arc, time::Duration};

use coordinator_api::{HealthProber, ProbePublisher, ServiceRegistry};
use futures::future::join_all;
use shared::domain::{duration_millis, HealthProbeResult, ServiceDescriptor};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Keeps the probe board current; this task is the board's only writer.
///
/// Every service gets its own cadence: a model endpoint that sits on its
/// full timeout only delays its own next check, never anyone else's.
pub async fn run_probe_scheduler(
    prober: HealthProber,
    services: Arc<ServiceRegistry>,
    publisher: ProbePublisher,
    interval: Duration,
) {
    if services.is_empty() {
        warn!("probe: no services registered; scheduler idle");
        return;
    }
    info!(services = services.len(), ?interval, "probe: scheduler started");

    join_all(
        services
            .iter()
            .map(|descriptor| probe_loop(&prober, descriptor, &publisher, interval)),
    )
    .await;
}

async fn probe_loop(
    prober: &HealthProber,
    descriptor: &ServiceDescriptor,
    publisher: &ProbePublisher,
    interval: Duration,
) {
    let timeout = prober.timeouts().for_kind(descriptor.kind);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        report(publisher, prober.probe(descriptor, timeout).await);
    }
}

fn report(publisher: &ProbePublisher, result: HealthProbeResult) {
    let service = result.service.clone();
    let is_healthy = result.is_healthy;
    let latency_ms = duration_millis(result.latency);
    match publisher.publish(result) {
        Some(previous) if previous != is_healthy => {
            info!(%service, is_healthy, latency_ms, "probe: health changed");
        }
        None => info!(%service, is_healthy, latency_ms, "probe: first result"),
        Some(_) => debug!(%service, is_healthy, latency_ms, "probe: result"),
    }
}
