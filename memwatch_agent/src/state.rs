//! Shared handler state: the read side of the aggregator plus host facts.

use std::sync::Arc;
use std::time::Instant;

use crate::hotspots::HotspotTracker;
use crate::query::QueryFacade;

#[derive(Clone)]
pub struct AppState {
    pub query: QueryFacade,
    pub hostname: String,
    pub started_at: Instant,
    // None when the profiler was disabled at startup
    pub hotspots: Option<Arc<HotspotTracker>>,
}

impl AppState {
    pub fn new(query: QueryFacade, hotspots: Option<Arc<HotspotTracker>>) -> Self {
        let hostname = hostname::get()
            .ok()
            .and_then(|s| s.into_string().ok())
            .unwrap_or_else(|| "unknown".into());
        Self {
            query,
            hostname,
            started_at: Instant::now(),
            hotspots,
        }
    }
}
