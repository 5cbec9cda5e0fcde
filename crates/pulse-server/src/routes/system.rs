use axum::extract::State;
use pulse_bus::BusStatus;
use pulse_util_error::FmtCompact as _;
use serde::Serialize;
use tracing::warn;

use super::AppJson;
use crate::error::ApiResult;
use crate::{SharedState, LOG_TARGET};

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub database: &'static str,
    pub cache: &'static str,
    pub bus: &'static str,
}

/// Summarize subsystem health; degraded dependencies show up in the body,
/// never as a 5xx.
pub async fn health(State(state): State<SharedState>) -> AppJson<HealthResponse> {
    let database = match state.db.probe().await {
        Ok(()) => "healthy",
        Err(err) => {
            warn!(target: LOG_TARGET, err = %err.fmt_compact(), "Database health probe failed");
            "unavailable"
        }
    };
    let cache = if state.cache.available() {
        "healthy"
    } else {
        "unavailable"
    };
    let bus = if state.bus.available() {
        "healthy"
    } else {
        "unavailable"
    };

    let status = if database == "healthy" {
        "healthy"
    } else {
        "degraded"
    };

    AppJson(HealthResponse {
        status,
        database,
        cache,
        bus,
    })
}

#[derive(Serialize)]
pub struct MetricsResponse {
    pub total_users: u64,
    pub total_posts: u64,
    pub total_follows: u64,
    pub celebrity_count: u64,
    pub cache_available: bool,
    pub bus: BusStatus,
}

pub async fn metrics(State(state): State<SharedState>) -> ApiResult<AppJson<MetricsResponse>> {
    let stats = state.db.stats().await?;

    Ok(AppJson(MetricsResponse {
        total_users: stats.users,
        total_posts: stats.posts,
        total_follows: stats.follows,
        celebrity_count: stats.celebrities,
        cache_available: state.cache.available(),
        bus: state.bus.status(),
    }))
}
