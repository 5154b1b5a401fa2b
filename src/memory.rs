//! Host memory utilization probe.
//!
//! The partition cache asks a [`MemoryProbe`] whether the host is under
//! memory pressure before and during its LRU eviction pass.

use std::sync::{Mutex, PoisonError};

use sysinfo::System;

pub trait MemoryProbe: Send + Sync {
    /// Used memory as a percentage of total, in `[0, 100]`.
    fn utilization_percent(&self) -> f64;
}

/// Reads system memory via `sysinfo`, refreshing on every call.
pub struct SystemMemoryProbe {
    system: Mutex<System>,
}

impl SystemMemoryProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SystemMemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SystemMemoryProbe {
    fn utilization_percent(&self) -> f64 {
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        system.refresh_memory();
        let total = system.total_memory();
        if total == 0 {
            return 0.0;
        }
        system.used_memory() as f64 / total as f64 * 100.0
    }
}
