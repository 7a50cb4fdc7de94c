//! Read-only facade over the aggregator's publications. Readers clone an
//! `Arc` out of a watch channel; they never trigger sampling and never see
//! a snapshot that is still being built.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;

use crate::aggregator::{Published, TickPhase};
use crate::error::AgentError;
use crate::snapshot::Snapshot;

#[derive(Debug, Clone, Serialize)]
pub struct AggregatorStatus {
    pub phase: TickPhase,
    pub last_seq: Option<u64>,
    pub last_timestamp: Option<DateTime<Utc>>,
    pub history_len: usize,
    pub history_capacity: usize,
}

#[derive(Clone)]
pub struct QueryFacade {
    published: watch::Receiver<Arc<Published>>,
    phase: watch::Receiver<TickPhase>,
}

impl QueryFacade {
    pub(crate) fn new(
        published: watch::Receiver<Arc<Published>>,
        phase: watch::Receiver<TickPhase>,
    ) -> Self {
        Self { published, phase }
    }

    /// Latest snapshot and series from the same publication.
    pub fn published(&self) -> Arc<Published> {
        Arc::clone(&self.published.borrow())
    }

    pub fn latest(&self) -> Result<Arc<Snapshot>, AgentError> {
        self.published().latest.clone().ok_or(AgentError::NoSnapshotYet)
    }

    /// Oldest first.
    pub fn series(&self) -> Vec<Arc<Snapshot>> {
        self.published().series.to_vec()
    }

    pub fn phase(&self) -> TickPhase {
        *self.phase.borrow()
    }

    pub fn status(&self) -> AggregatorStatus {
        let published = self.published();
        AggregatorStatus {
            phase: self.phase(),
            last_seq: published.latest.as_ref().map(|s| s.seq),
            last_timestamp: published.latest.as_ref().map(|s| s.timestamp),
            history_len: published.series.len(),
            history_capacity: published.capacity,
        }
    }

    /// Errors once the scheduler has stopped.
    pub fn ensure_running(&self) -> Result<(), AgentError> {
        match self.phase() {
            TickPhase::Stopped => Err(AgentError::ShutdownInProgress),
            _ => Ok(()),
        }
    }
}
