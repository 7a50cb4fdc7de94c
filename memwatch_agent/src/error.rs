//! Error taxonomy for the agent. Per-source failures never escape a tick;
//! the aggregator folds them into degraded snapshot fields.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::snapshot::SourceKind;

#[derive(Error, Debug)]
pub enum AgentError {
    /// One sampling source failed or timed out. Only its field degrades.
    #[error("{kind} source unavailable: {reason}")]
    SourceUnavailable { kind: SourceKind, reason: String },

    /// The platform memory query failed; the last known figures are reused.
    #[error("system memory query failed: {0}")]
    SystemQueryFailed(String),

    /// The query facade was asked for data before the first tick finished.
    #[error("no snapshot has been published yet")]
    NoSnapshotYet,

    #[error("shutdown in progress")]
    ShutdownInProgress,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl AgentError {
    pub fn unavailable(kind: SourceKind, reason: impl Into<String>) -> Self {
        AgentError::SourceUnavailable {
            kind,
            reason: reason.into(),
        }
    }
}

impl IntoResponse for AgentError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            AgentError::NoSnapshotYet => (
                StatusCode::SERVICE_UNAVAILABLE,
                json!({ "status": "pending", "detail": self.to_string() }),
            ),
            AgentError::ShutdownInProgress => (
                StatusCode::SERVICE_UNAVAILABLE,
                json!({ "status": "shutting_down", "detail": self.to_string() }),
            ),
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "status": "error", "detail": self.to_string() }),
            ),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_maps_to_service_unavailable() {
        let resp = AgentError::NoSnapshotYet.into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn unavailable_message_names_the_source() {
        let e = AgentError::unavailable(SourceKind::Workers, "connection refused");
        assert_eq!(
            e.to_string(),
            "workers source unavailable: connection refused"
        );
    }
}
