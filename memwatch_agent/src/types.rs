//! Response types for the polling endpoint.
//! Keep this module minimal and stable; it defines the wire format.
//! All memory figures are megabytes; unknown figures are `null`, never 0.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::snapshot::{HotspotEntry, ProcessMetric, Snapshot, WorkerMetric};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Bytes to megabytes, two decimals.
pub fn bytes_to_mb(bytes: u64) -> f64 {
    (bytes as f64 / BYTES_PER_MB * 100.0).round() / 100.0
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct NamedMemory {
    pub name: String,
    pub memory: f64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct TopView {
    pub filename: String,
    pub lineno: Option<u32>,
    pub size: f64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct MemoryUsage {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub memory_usage: Option<f64>,
    /// Sum of memory over workers that reported.
    pub celery: Option<f64>,
    pub cpu_usage: Option<f32>,
    pub total_system_memory: Option<f64>,
    pub available_memory: Option<f64>,
    pub memory_percent: Option<f64>,
    pub system_stale: bool,
    pub processes: Option<Vec<NamedMemory>>,
    pub top_views: Option<Vec<TopView>>,
    pub celery_workers: Option<Vec<NamedMemory>>,
    pub python_processes: Option<Vec<NamedMemory>>,
}

fn process_rows(procs: &[ProcessMetric]) -> Vec<NamedMemory> {
    procs
        .iter()
        .map(|p| NamedMemory {
            name: p.name.clone(),
            memory: bytes_to_mb(p.resident_bytes),
        })
        .collect()
}

fn worker_rows(workers: &[WorkerMetric]) -> Vec<NamedMemory> {
    workers
        .iter()
        .map(|w| NamedMemory {
            name: w.name.clone(),
            memory: bytes_to_mb(w.resident_bytes),
        })
        .collect()
}

fn top_views(spots: &[HotspotEntry]) -> Vec<TopView> {
    spots
        .iter()
        .map(|h| TopView {
            filename: h
                .location
                .file
                .clone()
                .unwrap_or_else(|| h.location.symbol.clone()),
            lineno: h.location.line,
            size: bytes_to_mb(h.size_bytes),
        })
        .collect()
}

impl From<&Snapshot> for MemoryUsage {
    fn from(s: &Snapshot) -> Self {
        MemoryUsage {
            seq: s.seq,
            timestamp: s.timestamp,
            memory_usage: s.self_memory_bytes.map(bytes_to_mb),
            celery: s.workers.total_bytes().map(bytes_to_mb),
            cpu_usage: s.cpu_percent,
            total_system_memory: s.system.map(|m| bytes_to_mb(m.total_bytes)),
            available_memory: s.system.map(|m| bytes_to_mb(m.available_bytes)),
            memory_percent: s.system.map(|m| round2(m.used_percent)),
            system_stale: s.system.is_some_and(|m| m.stale),
            processes: s.top_processes.as_ref().map(|p| process_rows(p)),
            top_views: s.hotspots.as_ref().map(|h| top_views(h)),
            celery_workers: s.workers.workers().map(worker_rows),
            python_processes: s.matched_processes.as_ref().map(|p| process_rows(p)),
        }
    }
}
