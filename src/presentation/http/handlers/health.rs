//! Health Check Handlers
//!
//! Provides health check endpoints for Kubernetes-style liveness and readiness probes.
//!
//! # Endpoints
//! - `GET /health` - Basic health check
//! - `GET /health/live` - Liveness probe (is the server running?)
//! - `GET /health/ready` - Readiness probe (are presence cache and bus reachable?)

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use serde::Serialize;
use std::time::Instant;

use crate::startup::AppState;

/// Server start time for uptime calculation
static SERVER_START: Lazy<Instant> = Lazy::new(Instant::now);
static SERVER_START_TIME: Lazy<DateTime<Utc>> = Lazy::new(Utc::now);

/// Initialize the server start time (call during startup)
pub fn init_server_start() {
    Lazy::force(&SERVER_START);
    Lazy::force(&SERVER_START_TIME);
}

/// Basic health response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

/// Detailed health check response
#[derive(Debug, Serialize)]
pub struct DetailedHealthResponse {
    pub status: HealthStatus,
    pub version: &'static str,
    pub mode: &'static str,
    pub uptime_seconds: u64,
    pub started_at: String,
    pub checks: HealthChecks,
}

/// Individual dependency checks
#[derive(Debug, Serialize)]
pub struct HealthChecks {
    pub presence: ServiceHealth,
    /// Absent in channel mode
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bus: Option<ServiceHealth>,
    pub websocket: WebSocketHealth,
}

/// Health status for individual services
#[derive(Debug, Serialize)]
pub struct ServiceHealth {
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Connection hub health
#[derive(Debug, Serialize)]
pub struct WebSocketHealth {
    pub status: HealthStatus,
    pub active_connections: usize,
}

/// Overall health status
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Simple liveness response
#[derive(Debug, Serialize)]
pub struct LivenessResponse {
    pub status: &'static str,
}

/// Basic health check endpoint
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Liveness probe - checks if the server is running
pub async fn liveness() -> Json<LivenessResponse> {
    Json(LivenessResponse { status: "alive" })
}

/// Readiness probe - checks if the server can accept traffic
/// Returns 200 if ready, 503 if routing cannot work
pub async fn readiness(State(state): State<AppState>) -> impl IntoResponse {
    let uptime = SERVER_START.elapsed().as_secs();
    let started_at = SERVER_START_TIME.to_rfc3339();

    let presence_health = check_presence(&state).await;
    let bus_health = match &state.bus {
        Some(_) => Some(check_bus(&state).await),
        None => None,
    };

    let ws_health = WebSocketHealth {
        status: if state.hub.is_closed() {
            HealthStatus::Unhealthy
        } else {
            HealthStatus::Healthy
        },
        active_connections: state.hub.connection_count(),
    };

    let overall_status = determine_overall_status(&presence_health, bus_health.as_ref());

    let response = DetailedHealthResponse {
        status: overall_status,
        version: env!("CARGO_PKG_VERSION"),
        mode: state.settings.messaging.mode.as_str(),
        uptime_seconds: uptime,
        started_at,
        checks: HealthChecks {
            presence: presence_health,
            bus: bus_health,
            websocket: ws_health,
        },
    };

    // Return 503 if unhealthy
    let status_code = match overall_status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(response))
}

/// Check presence cache connectivity and latency
async fn check_presence(state: &AppState) -> ServiceHealth {
    let start = Instant::now();
    match state.presence.ping().await {
        Ok(()) => timed(start, 50),
        Err(e) => ServiceHealth {
            status: HealthStatus::Unhealthy,
            latency_ms: None,
            message: Some(format!("Presence cache unreachable: {}", e)),
        },
    }
}

/// Check message bus connectivity and latency
async fn check_bus(state: &AppState) -> ServiceHealth {
    let Some(bus) = &state.bus else {
        return ServiceHealth {
            status: HealthStatus::Healthy,
            latency_ms: None,
            message: None,
        };
    };
    if bus.is_closed() {
        return ServiceHealth {
            status: HealthStatus::Unhealthy,
            latency_ms: None,
            message: Some("Bus client is closed".into()),
        };
    }

    let start = Instant::now();
    match bus.ping().await {
        Ok(()) => timed(start, 100),
        Err(e) => ServiceHealth {
            status: HealthStatus::Unhealthy,
            latency_ms: None,
            message: Some(format!("Message bus unreachable: {}", e)),
        },
    }
}

fn timed(start: Instant, degraded_after_ms: u64) -> ServiceHealth {
    let latency = start.elapsed().as_millis() as u64;
    ServiceHealth {
        status: if latency < degraded_after_ms {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        },
        latency_ms: Some(latency),
        message: None,
    }
}

/// Determine overall health based on individual checks.
///
/// Presence failures never block chat traffic, so they only degrade; a
/// broken bus stops routing in bus mode.
fn determine_overall_status(presence: &ServiceHealth, bus: Option<&ServiceHealth>) -> HealthStatus {
    if let Some(bus) = bus {
        if bus.status == HealthStatus::Unhealthy {
            return HealthStatus::Unhealthy;
        }
        if bus.status == HealthStatus::Degraded {
            return HealthStatus::Degraded;
        }
    }

    if presence.status != HealthStatus::Healthy {
        return HealthStatus::Degraded;
    }

    HealthStatus::Healthy
}
