use super::*;
use axum::{routing::get, Json, Router};
use futures::StreamExt;
use shared::domain::ServiceKind;

async fn spawn_health_server() -> u16 {
    let app = Router::new()
        .route(
            "/health",
            get(|| async { Json(serde_json::json!({ "is_healthy": true })) }),
        )
        .route(
            "/sick",
            get(|| async { Json(serde_json::json!({ "is_healthy": false })) }),
        )
        .route("/garbage", get(|| async { "<html>not json</html>" }))
        .route(
            "/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(3)).await;
                Json(serde_json::json!({ "is_healthy": true }))
            }),
        );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let port = listener.local_addr().expect("addr").port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    port
}

fn descriptor(name: &str, port: u16, path: &str) -> ServiceDescriptor {
    let mut descriptor = ServiceDescriptor::new(name, "127.0.0.1", port);
    descriptor.health_path = path.to_string();
    descriptor
}

#[tokio::test]
async fn healthy_payload_is_reported_healthy() {
    let port = spawn_health_server().await;
    let prober = HealthProber::new(ProbeTimeouts::default()).expect("prober");
    let result = prober
        .probe(&descriptor("memory", port, "/health"), Duration::from_secs(1))
        .await;
    assert!(result.is_healthy);
    assert_eq!(result.service, "memory");
}

#[tokio::test]
async fn unhealthy_malformed_and_missing_endpoints_are_not_errors() {
    let port = spawn_health_server().await;
    let prober = HealthProber::new(ProbeTimeouts::default()).expect("prober");

    for path in ["/sick", "/garbage", "/does-not-exist"] {
        let result = prober
            .probe(&descriptor("video", port, path), Duration::from_secs(1))
            .await;
        assert!(!result.is_healthy, "{path} should be unhealthy");
    }
}

#[tokio::test]
async fn refused_connection_is_unhealthy() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("addr").port();
    drop(listener);

    let prober = HealthProber::new(ProbeTimeouts::default()).expect("prober");
    let result = prober
        .probe(&descriptor("ps3-controller", port, "/health"), Duration::from_secs(1))
        .await;
    assert!(!result.is_healthy);
}

#[tokio::test]
async fn slow_service_times_out_without_delaying_others() {
    let port = spawn_health_server().await;
    let prober = HealthProber::new(ProbeTimeouts {
        lightweight: Duration::from_millis(200),
        model: Duration::from_millis(400),
    })
    .expect("prober");

    let slow = descriptor("angle-model-pi", port, "/slow").with_kind(ServiceKind::Model);
    let fast = descriptor("memory", port, "/health");
    let started = Instant::now();
    let results: Vec<HealthProbeResult> = prober.probe_all([&slow, &fast]).collect().await;

    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].service, "memory");
    assert!(results[0].is_healthy);
    assert_eq!(results[1].service, "angle-model-pi");
    assert!(!results[1].is_healthy);
    assert!(results[1].latency >= Duration::from_millis(400));
}

#[test]
fn board_keeps_latest_result_per_service() {
    let (publisher, board) = probe_board();
    assert!(board.latest("memory").is_none());

    let result = |is_healthy| HealthProbeResult {
        service: "memory".into(),
        is_healthy,
        timestamp: Utc::now(),
        latency: Duration::from_millis(3),
    };
    assert_eq!(publisher.publish(result(true)), None);
    assert_eq!(publisher.publish(result(false)), Some(true));
    assert_eq!(board.latest("memory").map(|r| r.is_healthy), Some(false));
}
