//! Whole-machine memory figures via sysinfo.

use std::sync::{Arc, Mutex};

use sysinfo::System;

use crate::error::AgentError;
use crate::snapshot::SystemMemory;

pub trait SystemSource: Send + Sync {
    fn sample_system(&self) -> Result<SystemMemory, AgentError>;
}

/// `(total - available) / total * 100`, clamped to 0..=100.
pub fn used_percent(total: u64, available: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let used = total.saturating_sub(available) as f64;
    (used / total as f64 * 100.0).clamp(0.0, 100.0)
}

pub struct SystemSampler {
    sys: Arc<Mutex<System>>,
}

impl SystemSampler {
    pub fn new() -> Self {
        Self {
            sys: Arc::new(Mutex::new(System::new())),
        }
    }
}

impl Default for SystemSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemSource for SystemSampler {
    fn sample_system(&self) -> Result<SystemMemory, AgentError> {
        if !sysinfo::IS_SUPPORTED_SYSTEM {
            return Err(AgentError::SystemQueryFailed(
                "platform not supported by sysinfo".into(),
            ));
        }
        let mut sys = self
            .sys
            .try_lock()
            .map_err(|_| AgentError::SystemQueryFailed("previous query still running".into()))?;
        sys.refresh_memory();
        let total_bytes = sys.total_memory();
        let available_bytes = sys.available_memory().min(total_bytes);
        if total_bytes == 0 {
            return Err(AgentError::SystemQueryFailed(
                "platform reported zero total memory".into(),
            ));
        }
        Ok(SystemMemory {
            total_bytes,
            available_bytes,
            used_percent: used_percent(total_bytes, available_bytes),
            stale: false,
        })
    }
}
