//! Domain model: one immutable `Snapshot` per tick, built from typed
//! per-source results. Unknown is always an explicit variant, never zero.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Process,
    System,
    Workers,
    Hotspots,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SourceKind::Process => "process",
            SourceKind::System => "system",
            SourceKind::Workers => "workers",
            SourceKind::Hotspots => "hotspots",
        };
        f.write_str(s)
    }
}

/// A single flat metric reading. Produced on demand from a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sample {
    pub source: SourceKind,
    pub name: String,
    pub bytes: u64,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessMetric {
    pub pid: u32,
    pub name: String,
    pub resident_bytes: u64,
    pub cpu_percent: f32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerMetric {
    pub worker_id: String,
    pub name: String,
    pub resident_bytes: u64,
    pub task_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct HotspotLocation {
    pub file: Option<String>,
    pub line: Option<u32>,
    pub symbol: String,
}

impl fmt::Display for HotspotLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.file, self.line) {
            (Some(file), Some(line)) => write!(f, "{file}:{line}"),
            (Some(file), None) => f.write_str(file),
            _ => f.write_str(&self.symbol),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HotspotEntry {
    pub location: HotspotLocation,
    pub size_bytes: u64,
    /// Estimated live allocations attributed to this site.
    pub count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SystemMemory {
    pub total_bytes: u64,
    pub available_bytes: u64,
    pub used_percent: f64,
    /// Carried over from an earlier tick because this tick's query failed.
    pub stale: bool,
}

/// Result of one source for one tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", content = "value", rename_all = "snake_case")]
pub enum SourceState<T> {
    Available(T),
    Unavailable,
}

impl<T> SourceState<T> {
    pub fn as_ref(&self) -> Option<&T> {
        match self {
            SourceState::Available(v) => Some(v),
            SourceState::Unavailable => None,
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, SourceState::Available(_))
    }
}

impl<T, E> From<Result<T, E>> for SourceState<T> {
    fn from(r: Result<T, E>) -> Self {
        match r {
            Ok(v) => SourceState::Available(v),
            Err(_) => SourceState::Unavailable,
        }
    }
}

/// Worker fleet state: `Known(vec![])` is an idle fleet, `Unavailable`
/// means the control plane could not be reached this tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "workers", rename_all = "snake_case")]
pub enum WorkerFleet {
    Known(Vec<WorkerMetric>),
    Unavailable,
}

impl WorkerFleet {
    pub fn workers(&self) -> Option<&[WorkerMetric]> {
        match self {
            WorkerFleet::Known(w) => Some(w),
            WorkerFleet::Unavailable => None,
        }
    }

    /// Aggregate fleet memory: the sum over workers that reported.
    pub fn total_bytes(&self) -> Option<u64> {
        self.workers()
            .map(|w| w.iter().map(|m| m.resident_bytes).fold(0u64, u64::saturating_add))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    /// Monotonic publish sequence, starting at 1.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub self_memory_bytes: Option<u64>,
    pub cpu_percent: Option<f32>,
    pub system: Option<SystemMemory>,
    pub top_processes: SourceState<Vec<ProcessMetric>>,
    pub matched_processes: SourceState<Vec<ProcessMetric>>,
    pub workers: WorkerFleet,
    pub hotspots: SourceState<Vec<HotspotEntry>>,
}

impl Snapshot {
    /// Flatten every known figure into individual samples.
    pub fn samples(&self) -> Vec<Sample> {
        let at = self.timestamp;
        let sample = |source, name: String, bytes| Sample {
            source,
            name,
            bytes,
            captured_at: at,
        };
        let mut out = Vec::new();
        if let Some(b) = self.self_memory_bytes {
            out.push(sample(SourceKind::Process, "self".into(), b));
        }
        if let Some(sys) = &self.system {
            out.push(sample(SourceKind::System, "total".into(), sys.total_bytes));
            out.push(sample(
                SourceKind::System,
                "available".into(),
                sys.available_bytes,
            ));
        }
        if let Some(procs) = self.top_processes.as_ref() {
            out.extend(procs.iter().map(|p| {
                sample(
                    SourceKind::Process,
                    format!("{}[{}]", p.name, p.pid),
                    p.resident_bytes,
                )
            }));
        }
        if let Some(workers) = self.workers.workers() {
            out.extend(
                workers
                    .iter()
                    .map(|w| sample(SourceKind::Workers, w.name.clone(), w.resident_bytes)),
            );
        }
        if let Some(spots) = self.hotspots.as_ref() {
            out.extend(
                spots
                    .iter()
                    .map(|h| sample(SourceKind::Hotspots, h.location.to_string(), h.size_bytes)),
            );
        }
        out
    }
}
