//! Health Check API Tests

use axum::http::StatusCode;
use chat_relay::config::MessageMode;
use pretty_assertions::assert_eq;

use crate::common::{json_body, TestApp};

/// Test basic health check endpoint returns 200 OK
#[tokio::test]
async fn test_health_check_returns_ok() {
    let app = TestApp::new(MessageMode::Channel);

    let response = app.get("/health").await;

    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    assert_eq!(json["status"], "healthy");
}

/// Test liveness probe endpoint
#[tokio::test]
async fn test_liveness_probe() {
    let app = TestApp::new(MessageMode::Channel);

    let response = app.get("/health/live").await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["status"], "alive");
}

/// Channel mode reports presence and connections, no bus
#[tokio::test]
async fn test_readiness_probe_channel_mode() {
    let app = TestApp::new(MessageMode::Channel);
    let _conn = app.core.state.hub.register("U1").unwrap();

    let response = app.get("/health/ready").await;

    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["mode"], "channel");
    assert_eq!(json["checks"]["presence"]["status"], "healthy");
    assert_eq!(json["checks"]["websocket"]["active_connections"], 1);
    assert!(json["checks"].get("bus").is_none());
}

/// Bus mode adds the bus check; a closed bus makes the instance unready
#[tokio::test]
async fn test_readiness_probe_bus_mode() {
    let app = TestApp::new(MessageMode::Bus);

    let json = json_body(app.get("/health/ready").await).await;
    assert_eq!(json["mode"], "bus");
    assert_eq!(json["checks"]["bus"]["status"], "healthy");

    let bus = app.core.state.bus.clone().unwrap();
    bus.close(std::time::Duration::from_secs(1)).await.unwrap();

    let response = app.get("/health/ready").await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json_body(response).await["checks"]["bus"]["status"], "unhealthy");
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let app = TestApp::new(MessageMode::Channel);
    let _conn = app.core.state.hub.register("U1").unwrap();

    let response = app.get("/metrics").await;

    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("chat_relay_connections_active"));
}
