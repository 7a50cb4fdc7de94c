//! Scripted sources shared by the integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use memwatch_agent::aggregator::{Aggregator, AggregatorConfig, Sources};
use memwatch_agent::error::AgentError;
use memwatch_agent::fleet::{FleetCollector, FleetControl};
use memwatch_agent::hotspots::HotspotSource;
use memwatch_agent::process::{select_groups, ObservedProcess, ProcessSelector, ProcessSource};
use memwatch_agent::query::QueryFacade;
use memwatch_agent::snapshot::{
    HotspotEntry, HotspotLocation, ProcessMetric, SourceKind, SystemMemory, WorkerMetric,
};
use memwatch_agent::system::{used_percent, SystemSource};

pub const MB: u64 = 1024 * 1024;
pub const SELF_PID: u32 = 4000;

pub struct FakeProcesses {
    pub table: Vec<ObservedProcess>,
    /// Blocking delay before answering.
    pub delay: Duration,
}

impl ProcessSource for FakeProcesses {
    fn sample_groups(
        &self,
        groups: &[ProcessSelector],
    ) -> Result<Vec<Vec<ProcessMetric>>, AgentError> {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        Ok(select_groups(groups, &self.table, Some(SELF_PID)))
    }
}

pub fn process_table(n: u32) -> Vec<ObservedProcess> {
    let mut table: Vec<ObservedProcess> = (0..n)
        .map(|i| ObservedProcess {
            pid: 100 + i,
            name: if i % 3 == 0 { "python3".into() } else { format!("proc{i}") },
            cmdline: String::new(),
            // repeated sizes on purpose so ties happen
            resident_bytes: (u64::from(i % 7) + 1) * MB,
            cpu_percent: 1.0,
            first_seen: u64::from(n - i),
        })
        .collect();
    table.push(ObservedProcess {
        pid: SELF_PID,
        name: "memwatch_agent".into(),
        cmdline: String::new(),
        resident_bytes: 64 * MB,
        cpu_percent: 2.5,
        first_seen: 0,
    });
    table
}

pub struct FakeSystem {
    pub total: u64,
    pub available: u64,
}

impl SystemSource for FakeSystem {
    fn sample_system(&self) -> Result<SystemMemory, AgentError> {
        Ok(SystemMemory {
            total_bytes: self.total,
            available_bytes: self.available,
            used_percent: used_percent(self.total, self.available),
            stale: false,
        })
    }
}

pub struct FakeControl {
    pub roster_delay: Duration,
    /// name -> (reply delay, resident bytes)
    pub workers: HashMap<String, (Duration, u64)>,
}

impl FakeControl {
    pub fn healthy(workers: &[(&str, u64)]) -> Self {
        Self {
            roster_delay: Duration::ZERO,
            workers: workers
                .iter()
                .map(|(n, b)| (n.to_string(), (Duration::ZERO, *b)))
                .collect(),
        }
    }
}

#[async_trait]
impl FleetControl for FakeControl {
    async fn roster(&self) -> Result<Vec<String>, AgentError> {
        tokio::time::sleep(self.roster_delay).await;
        let mut names: Vec<String> = self.workers.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn query_worker(&self, name: &str) -> Result<WorkerMetric, AgentError> {
        let (delay, bytes) = *self
            .workers
            .get(name)
            .ok_or_else(|| AgentError::unavailable(SourceKind::Workers, "unknown worker"))?;
        tokio::time::sleep(delay).await;
        Ok(WorkerMetric {
            worker_id: name.into(),
            name: name.into(),
            resident_bytes: bytes,
            task_count: 1,
        })
    }
}

pub struct FakeHotspots;

impl HotspotSource for FakeHotspots {
    fn top_hotspots(&self, n: usize) -> Result<Vec<HotspotEntry>, AgentError> {
        Ok((0..n as u32)
            .map(|i| HotspotEntry {
                location: HotspotLocation {
                    file: Some("src/cache.rs".into()),
                    line: Some(10 + i),
                    symbol: "cache::fill".into(),
                },
                size_bytes: u64::from(n as u32 - i) * MB,
                count: 1,
            })
            .collect())
    }
}

pub fn healthy_sources() -> Sources {
    Sources {
        processes: Arc::new(FakeProcesses {
            table: process_table(25),
            delay: Duration::ZERO,
        }),
        system: Arc::new(FakeSystem {
            total: 16_000 * MB,
            available: 4_000 * MB,
        }),
        fleet: Arc::new(FleetCollector::new(Arc::new(FakeControl::healthy(&[
            ("celery@a", 100 * MB),
            ("celery@b", 50 * MB),
        ])))),
        hotspots: Arc::new(FakeHotspots),
    }
}

pub fn test_config() -> AggregatorConfig {
    AggregatorConfig {
        interval: Duration::from_millis(20),
        history_capacity: 5,
        top_k: 10,
        hotspot_count: 3,
        source_timeout: Duration::from_millis(500),
        fleet_timeout: Duration::from_millis(200),
        process_group: Some(ProcessSelector::name_matches("python").unwrap()),
    }
}

pub fn healthy_aggregator() -> (Aggregator, QueryFacade) {
    Aggregator::new(healthy_sources(), test_config())
}
