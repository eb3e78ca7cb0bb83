//! API layer - HTTP endpoint handlers.

mod health;
mod metrics;
mod routes;

pub use health::{health, stats, ConnectionHealthResponse, HealthResponse, StatsResponse};
pub use metrics::prometheus_metrics;
pub use routes::api_routes;
