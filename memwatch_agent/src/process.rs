//! Process sampler: resident memory and CPU for this process and any
//! other processes picked by pid or name pattern.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Mutex;

use regex::Regex;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};

use crate::error::AgentError;
use crate::snapshot::{ProcessMetric, SourceKind};

#[derive(Debug, Clone)]
pub enum ProcessSelector {
    /// The monitoring process itself.
    SelfProcess,
    All,
    Pid(u32),
    /// Matched against the process name and its joined command line.
    NameMatches(Regex),
    /// Union of the inner selectors.
    Any(Vec<ProcessSelector>),
}

impl ProcessSelector {
    pub fn name_matches(pattern: &str) -> Result<Self, AgentError> {
        Regex::new(pattern)
            .map(ProcessSelector::NameMatches)
            .map_err(|e| AgentError::Config(format!("invalid process pattern {pattern:?}: {e}")))
    }

    fn matches(&self, p: &ObservedProcess, self_pid: Option<u32>) -> bool {
        match self {
            ProcessSelector::SelfProcess => Some(p.pid) == self_pid,
            ProcessSelector::All => true,
            ProcessSelector::Pid(pid) => p.pid == *pid,
            ProcessSelector::NameMatches(re) => re.is_match(&p.name) || re.is_match(&p.cmdline),
            ProcessSelector::Any(inner) => inner.iter().any(|s| s.matches(p, self_pid)),
        }
    }
}

pub trait ProcessSource: Send + Sync {
    /// One OS refresh, one ranked list per selector.
    fn sample_groups(
        &self,
        groups: &[ProcessSelector],
    ) -> Result<Vec<Vec<ProcessMetric>>, AgentError>;

    /// Union of all targets, deduplicated by pid, largest first with ties in
    /// first-seen order.
    fn sample(&self, targets: &[ProcessSelector]) -> Result<Vec<ProcessMetric>, AgentError> {
        let union = ProcessSelector::Any(targets.to_vec());
        Ok(self
            .sample_groups(std::slice::from_ref(&union))?
            .into_iter()
            .next()
            .unwrap_or_default())
    }
}

/// One row of a process enumeration, before selection.
#[derive(Debug, Clone)]
pub struct ObservedProcess {
    pub pid: u32,
    pub name: String,
    pub cmdline: String,
    pub resident_bytes: u64,
    pub cpu_percent: f32,
    /// Order in which the sampler first saw this pid; breaks size ties.
    pub first_seen: u64,
}

/// Pure selection + ranking over an enumeration.
pub fn select_groups(
    groups: &[ProcessSelector],
    observed: &[ObservedProcess],
    self_pid: Option<u32>,
) -> Vec<Vec<ProcessMetric>> {
    groups
        .iter()
        .map(|sel| {
            let mut rows: Vec<&ObservedProcess> = observed
                .iter()
                // a zero rss row is a process that exited mid-read (or a kernel thread)
                .filter(|p| p.resident_bytes > 0 || Some(p.pid) == self_pid)
                .filter(|p| sel.matches(p, self_pid))
                .collect();
            rows.sort_by_key(|p| (Reverse(p.resident_bytes), p.first_seen, p.pid));
            rows.into_iter()
                .map(|p| ProcessMetric {
                    pid: p.pid,
                    name: p.name.clone(),
                    resident_bytes: p.resident_bytes,
                    cpu_percent: p.cpu_percent,
                })
                .collect()
        })
        .collect()
}

struct Inner {
    sys: System,
    first_seen: HashMap<u32, u64>,
    next_seen: u64,
}

pub struct ProcessSampler {
    inner: Mutex<Inner>,
    self_pid: Option<u32>,
    cores: f32,
}

impl ProcessSampler {
    pub fn new() -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1) as f32;
        Self {
            inner: Mutex::new(Inner {
                sys: System::new(),
                first_seen: HashMap::new(),
                next_seen: 0,
            }),
            self_pid: sysinfo::get_current_pid().ok().map(|p| p.as_u32()),
            cores,
        }
    }

    pub fn self_pid(&self) -> Option<u32> {
        self.self_pid
    }

    fn enumerate(&self) -> Result<Vec<ObservedProcess>, AgentError> {
        if !sysinfo::IS_SUPPORTED_SYSTEM {
            return Err(AgentError::unavailable(
                SourceKind::Process,
                "platform not supported by sysinfo",
            ));
        }
        // A timed-out read may still hold the handle; report busy instead of queueing.
        let mut guard = self
            .inner
            .try_lock()
            .map_err(|_| AgentError::unavailable(SourceKind::Process, "previous read still running"))?;
        let inner = &mut *guard;

        let kind = ProcessRefreshKind::nothing()
            .with_memory()
            .with_cpu()
            .with_cmd(UpdateKind::OnlyIfNotSet);
        inner
            .sys
            .refresh_processes_specifics(ProcessesToUpdate::All, true, kind);

        let procs = inner.sys.processes();
        inner
            .first_seen
            .retain(|pid, _| procs.contains_key(&Pid::from_u32(*pid)));

        let mut pids: Vec<&Pid> = procs.keys().collect();
        pids.sort();
        let mut out = Vec::with_capacity(pids.len());
        for pid in pids {
            let Some(p) = procs.get(pid) else { continue };
            let pid = pid.as_u32();
            let first_seen = *inner.first_seen.entry(pid).or_insert_with(|| {
                inner.next_seen += 1;
                inner.next_seen
            });
            let cmdline = p
                .cmd()
                .iter()
                .map(|s| s.to_string_lossy())
                .collect::<Vec<_>>()
                .join(" ");
            out.push(ObservedProcess {
                pid,
                name: p.name().to_string_lossy().into_owned(),
                cmdline,
                resident_bytes: p.memory(),
                cpu_percent: (p.cpu_usage() / self.cores).clamp(0.0, 100.0),
                first_seen,
            });
        }
        Ok(out)
    }
}

impl Default for ProcessSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessSource for ProcessSampler {
    fn sample_groups(
        &self,
        groups: &[ProcessSelector],
    ) -> Result<Vec<Vec<ProcessMetric>>, AgentError> {
        let observed = self.enumerate()?;
        Ok(select_groups(groups, &observed, self.self_pid))
    }
}
