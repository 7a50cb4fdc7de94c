//! HTTP routes. Every handler reads the last publication; none samples.

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use crate::error::AgentError;
use crate::hotspots::ProfilerStats;
use crate::query::AggregatorStatus;
use crate::snapshot::Sample;
use crate::state::AppState;
use crate::types::MemoryUsage;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/memory-usage/", get(memory_usage))
        .route("/memory-usage", get(memory_usage))
        .route("/memory-usage/history/", get(history))
        .route("/memory-usage/samples/", get(samples))
        .route("/healthz", get(health))
        .with_state(state)
}

pub async fn memory_usage(State(state): State<AppState>) -> Result<Json<MemoryUsage>, AgentError> {
    let latest = state.query.latest()?;
    Ok(Json(MemoryUsage::from(latest.as_ref())))
}

pub async fn history(State(state): State<AppState>) -> Json<Vec<MemoryUsage>> {
    let series = state.query.series();
    Json(series.iter().map(|s| MemoryUsage::from(s.as_ref())).collect())
}

pub async fn samples(State(state): State<AppState>) -> Result<Json<Vec<Sample>>, AgentError> {
    Ok(Json(state.query.latest()?.samples()))
}

#[derive(Debug, Serialize)]
pub struct Health {
    pub hostname: String,
    pub uptime_secs: u64,
    pub aggregator: AggregatorStatus,
    pub profiler: Option<ProfilerStats>,
}

pub async fn health(State(state): State<AppState>) -> Result<Json<Health>, AgentError> {
    state.query.ensure_running()?;
    Ok(Json(Health {
        hostname: state.hostname.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        aggregator: state.query.status(),
        profiler: state.hotspots.as_ref().map(|t| t.stats()),
    }))
}
