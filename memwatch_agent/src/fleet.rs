//! Worker fleet collector: asks the task-queue control plane for every live
//! worker's memory and active task count.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use serde::Deserialize;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, trace, warn};

use crate::error::AgentError;
use crate::snapshot::{SourceKind, WorkerFleet, WorkerMetric};

/// Control-plane client for the task-worker pool.
#[async_trait]
pub trait FleetControl: Send + Sync {
    /// Names of the workers the broker currently considers alive.
    async fn roster(&self) -> Result<Vec<String>, AgentError>;

    /// Ask one worker for its own memory and active task count.
    async fn query_worker(&self, name: &str) -> Result<WorkerMetric, AgentError>;
}

pub struct FleetCollector {
    control: Option<Arc<dyn FleetControl>>,
}

impl FleetCollector {
    pub fn new(control: Arc<dyn FleetControl>) -> Self {
        Self {
            control: Some(control),
        }
    }

    /// No control plane configured; every collection is `Unavailable`.
    pub fn disabled() -> Self {
        Self { control: None }
    }

    /// Workers that miss the deadline are omitted. The fleet is `Unavailable`
    /// when the roster cannot be fetched or no listed worker answered.
    pub async fn collect_workers(&self, timeout: Duration) -> WorkerFleet {
        let Some(control) = self.control.as_ref() else {
            return WorkerFleet::Unavailable;
        };
        let deadline = Instant::now() + timeout;

        let roster = match timeout_at(deadline, control.roster()).await {
            Ok(Ok(names)) => names,
            Ok(Err(e)) => {
                warn!("worker roster unavailable: {e}");
                return WorkerFleet::Unavailable;
            }
            Err(_) => {
                warn!("worker roster timed out after {timeout:?}");
                return WorkerFleet::Unavailable;
            }
        };
        if roster.is_empty() {
            return WorkerFleet::Known(Vec::new());
        }

        let replies = join_all(roster.iter().map(|name| {
            let control = Arc::clone(control);
            async move {
                match timeout_at(deadline, control.query_worker(name)).await {
                    Ok(Ok(m)) => Some(m),
                    Ok(Err(e)) => {
                        trace!("worker {name} failed to report: {e}");
                        None
                    }
                    Err(_) => {
                        trace!("worker {name} missed the reply window");
                        None
                    }
                }
            }
        }))
        .await;

        let workers: Vec<WorkerMetric> = replies.into_iter().flatten().collect();
        debug!("{} of {} workers reported", workers.len(), roster.len());
        if workers.is_empty() {
            WorkerFleet::Unavailable
        } else {
            WorkerFleet::Known(workers)
        }
    }
}

// ---------- Flower-style HTTP control plane ----------

#[derive(Debug, Deserialize)]
struct Rusage {
    /// KiB on Linux.
    #[serde(default)]
    maxrss: u64,
}

#[derive(Debug, Deserialize)]
struct WorkerStats {
    #[serde(default)]
    pid: Option<u32>,
    rusage: Rusage,
}

#[derive(Debug, Deserialize)]
struct WorkerInfo {
    stats: WorkerStats,
    #[serde(default)]
    active: Vec<serde_json::Value>,
}

pub struct HttpFleetControl {
    client: reqwest::Client,
    base: String,
}

impl HttpFleetControl {
    pub fn new(base: impl Into<String>, request_timeout: Duration) -> Result<Self, AgentError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;
        Ok(Self {
            client,
            base: base.into().trim_end_matches('/').to_string(),
        })
    }

    fn workers_url(&self) -> String {
        format!("{}/api/workers", self.base)
    }
}

fn worker_metric(name: &str, info: WorkerInfo) -> WorkerMetric {
    WorkerMetric {
        worker_id: info
            .stats
            .pid
            .map(|pid| format!("{name}#{pid}"))
            .unwrap_or_else(|| name.to_string()),
        name: name.to_string(),
        resident_bytes: info.stats.rusage.maxrss.saturating_mul(1024),
        task_count: info.active.len() as u32,
    }
}

#[async_trait]
impl FleetControl for HttpFleetControl {
    async fn roster(&self) -> Result<Vec<String>, AgentError> {
        let status: HashMap<String, bool> = self
            .client
            .get(self.workers_url())
            .query(&[("status", "true")])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let mut alive: Vec<String> = status
            .into_iter()
            .filter_map(|(name, up)| up.then_some(name))
            .collect();
        alive.sort();
        Ok(alive)
    }

    async fn query_worker(&self, name: &str) -> Result<WorkerMetric, AgentError> {
        let mut body: HashMap<String, WorkerInfo> = self
            .client
            .get(self.workers_url())
            .query(&[("workername", name), ("refresh", "true")])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let info = body.remove(name).ok_or_else(|| {
            AgentError::unavailable(SourceKind::Workers, format!("{name} did not reply"))
        })?;
        Ok(worker_metric(name, info))
    }
}
