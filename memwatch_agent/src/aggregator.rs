//! Snapshot aggregator: the single writer. Each tick samples every source
//! concurrently under its own timeout, builds one immutable snapshot and
//! publishes it together with the history in a single swap.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::AgentError;
use crate::fleet::FleetCollector;
use crate::history::History;
use crate::hotspots::HotspotSource;
use crate::process::{ProcessSelector, ProcessSource};
use crate::query::QueryFacade;
use crate::snapshot::{
    HotspotEntry, ProcessMetric, Snapshot, SourceKind, SourceState, SystemMemory, WorkerFleet,
};
use crate::system::SystemSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TickPhase {
    Idle,
    Sampling,
    Publishing,
    /// The scheduler has stopped; no further ticks will run.
    Stopped,
}

/// Everything readers can see, swapped as one unit.
#[derive(Debug)]
pub struct Published {
    pub latest: Option<Arc<Snapshot>>,
    /// Oldest first.
    pub series: Arc<[Arc<Snapshot>]>,
    pub capacity: usize,
}

pub struct Sources {
    pub processes: Arc<dyn ProcessSource>,
    pub system: Arc<dyn SystemSource>,
    pub fleet: Arc<FleetCollector>,
    pub hotspots: Arc<dyn HotspotSource>,
}

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    pub interval: Duration,
    pub history_capacity: usize,
    pub top_k: usize,
    pub hotspot_count: usize,
    /// Upper bound for each source within a tick.
    pub source_timeout: Duration,
    /// Reply window handed to the fleet collector.
    pub fleet_timeout: Duration,
    /// Extra process group reported alongside the top-K list.
    pub process_group: Option<ProcessSelector>,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3),
            history_capacity: 50,
            top_k: 10,
            hotspot_count: 10,
            source_timeout: Duration::from_secs(2),
            fleet_timeout: Duration::from_millis(1500),
            process_group: None,
        }
    }
}

struct ProcessReadings {
    self_metric: Option<ProcessMetric>,
    top: Vec<ProcessMetric>,
    group: Vec<ProcessMetric>,
}

struct TickReadings {
    processes: Result<ProcessReadings, AgentError>,
    system: Result<SystemMemory, AgentError>,
    workers: WorkerFleet,
    hotspots: Result<Vec<HotspotEntry>, AgentError>,
}

pub struct Aggregator {
    sources: Sources,
    config: AggregatorConfig,
    history: History,
    seq: u64,
    last_system: Option<SystemMemory>,
    published: watch::Sender<Arc<Published>>,
    phase: watch::Sender<TickPhase>,
}

impl Aggregator {
    pub fn new(sources: Sources, config: AggregatorConfig) -> (Self, QueryFacade) {
        let history = History::new(config.history_capacity);
        let (published, published_rx) = watch::channel(Arc::new(Published {
            latest: None,
            series: history.to_series(),
            capacity: history.capacity(),
        }));
        let (phase, phase_rx) = watch::channel(TickPhase::Idle);
        let agg = Self {
            sources,
            config,
            history,
            seq: 0,
            last_system: None,
            published,
            phase,
        };
        (agg, QueryFacade::new(published_rx, phase_rx))
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    /// Run one full Sampling -> Publishing cycle right now.
    pub async fn tick(&mut self) -> Arc<Snapshot> {
        self.set_phase(TickPhase::Sampling);
        let started = Utc::now();
        let readings = self.sample_all().await;
        self.set_phase(TickPhase::Publishing);
        let snapshot = self.build(readings, started);
        let snapshot = self.publish(snapshot);
        self.set_phase(TickPhase::Idle);
        snapshot
    }

    /// Tick on a fixed interval until `cancel` fires. A tick still sampling
    /// when cancellation arrives is dropped without being published.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            "aggregator running every {:?} (history {}, top {})",
            self.config.interval, self.config.history_capacity, self.config.top_k
        );

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if cancel.is_cancelled() {
                break;
            }

            self.set_phase(TickPhase::Sampling);
            let started = Utc::now();
            let readings = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("shutdown during tick {}; readings discarded", self.seq + 1);
                    break;
                }
                r = self.sample_all() => r,
            };

            self.set_phase(TickPhase::Publishing);
            let snapshot = self.build(readings, started);
            let snapshot = self.publish(snapshot);
            debug!(
                "tick {} published: {} processes, workers {}, {} hotspots",
                snapshot.seq,
                snapshot.top_processes.as_ref().map_or(0, Vec::len),
                match &snapshot.workers {
                    WorkerFleet::Known(w) => w.len().to_string(),
                    WorkerFleet::Unavailable => "unknown".into(),
                },
                snapshot.hotspots.as_ref().map_or(0, Vec::len),
            );
            self.set_phase(TickPhase::Idle);
        }

        self.set_phase(TickPhase::Stopped);
        info!("aggregator stopped after {} ticks", self.seq);
    }

    fn set_phase(&self, phase: TickPhase) {
        self.phase.send_replace(phase);
    }

    async fn sample_all(&self) -> TickReadings {
        let limit = self.config.source_timeout;

        let processes = {
            let source = Arc::clone(&self.sources.processes);
            let mut groups = vec![ProcessSelector::SelfProcess, ProcessSelector::All];
            groups.extend(self.config.process_group.clone());
            let top_k = self.config.top_k;
            bounded_blocking(SourceKind::Process, limit, move || {
                let mut lists = source.sample_groups(&groups)?.into_iter();
                let self_metric = lists.next().and_then(|l| l.into_iter().next());
                let mut top = lists.next().unwrap_or_default();
                top.truncate(top_k);
                let group = lists.next().unwrap_or_default();
                Ok(ProcessReadings {
                    self_metric,
                    top,
                    group,
                })
            })
        };

        let system = {
            let source = Arc::clone(&self.sources.system);
            bounded_blocking(SourceKind::System, limit, move || source.sample_system())
        };

        let workers = {
            let fleet = Arc::clone(&self.sources.fleet);
            let window = self.config.fleet_timeout.min(limit);
            async move {
                timeout(limit, fleet.collect_workers(window))
                    .await
                    .unwrap_or(WorkerFleet::Unavailable)
            }
        };

        let hotspots = {
            let source = Arc::clone(&self.sources.hotspots);
            let n = self.config.hotspot_count;
            bounded_blocking(SourceKind::Hotspots, limit, move || source.top_hotspots(n))
        };

        let (processes, system, workers, hotspots) =
            tokio::join!(processes, system, workers, hotspots);
        TickReadings {
            processes,
            system,
            workers,
            hotspots,
        }
    }

    fn build(&mut self, readings: TickReadings, timestamp: DateTime<Utc>) -> Snapshot {
        let system = match readings.system {
            Ok(m) => {
                self.last_system = Some(m);
                Some(m)
            }
            Err(e) => {
                warn!("{e}; reusing last known system figures");
                self.last_system.map(|m| SystemMemory { stale: true, ..m })
            }
        };

        let (self_memory_bytes, cpu_percent, top_processes, matched_processes) =
            match readings.processes {
                Ok(p) => (
                    p.self_metric.as_ref().map(|m| m.resident_bytes),
                    p.self_metric.as_ref().map(|m| m.cpu_percent),
                    SourceState::Available(p.top),
                    SourceState::Available(p.group),
                ),
                Err(e) => {
                    warn!("{e}");
                    (None, None, SourceState::Unavailable, SourceState::Unavailable)
                }
            };

        let hotspots: SourceState<Vec<HotspotEntry>> =
            readings.hotspots.map_err(|e| warn!("{e}")).into();

        self.seq += 1;
        Snapshot {
            seq: self.seq,
            timestamp,
            self_memory_bytes,
            cpu_percent,
            system,
            top_processes,
            matched_processes,
            workers: readings.workers,
            hotspots,
        }
    }

    fn publish(&mut self, snapshot: Snapshot) -> Arc<Snapshot> {
        let snapshot = Arc::new(snapshot);
        self.history.push(Arc::clone(&snapshot));
        self.published.send_replace(Arc::new(Published {
            latest: Some(Arc::clone(&snapshot)),
            series: self.history.to_series(),
            capacity: self.history.capacity(),
        }));
        snapshot
    }
}

/// Run a blocking OS read on the blocking pool, bounded by `limit`.
async fn bounded_blocking<T, F>(kind: SourceKind, limit: Duration, f: F) -> Result<T, AgentError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, AgentError> + Send + 'static,
{
    match timeout(limit, tokio::task::spawn_blocking(f)).await {
        Ok(Ok(r)) => r,
        Ok(Err(join)) => Err(AgentError::unavailable(kind, format!("sampler task failed: {join}"))),
        Err(_) => Err(AgentError::unavailable(kind, format!("timed out after {limit:?}"))),
    }
}
