//! Health check and statistics endpoints.

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;

use crate::broadcast::BroadcasterStats;
use crate::server::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub connections: ConnectionHealthResponse,
}

#[derive(Debug, Serialize)]
pub struct ConnectionHealthResponse {
    pub total: usize,
    pub degraded: usize,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub uptime_seconds: u64,
    #[serde(flatten)]
    pub broadcaster: BroadcasterStats,
}

/// GET /health - 503 once shutdown has begun so load balancers stop routing here
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let conn_stats = state.broadcaster.connection_manager().stats();
    let shutting_down = state.broadcaster.is_shutting_down();

    let (code, status) = if shutting_down {
        (StatusCode::SERVICE_UNAVAILABLE, "shutting_down")
    } else {
        (StatusCode::OK, "healthy")
    };

    (
        code,
        Json(HealthResponse {
            status: status.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: state.start_time.elapsed().as_secs(),
            connections: ConnectionHealthResponse {
                total: conn_stats.total_connections,
                degraded: conn_stats.degraded_connections,
            },
        }),
    )
}

/// GET /stats
pub async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        uptime_seconds: state.start_time.elapsed().as_secs(),
        broadcaster: state.broadcaster.stats(),
    })
}
