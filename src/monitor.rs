//! Per-session CPU / memory sampling and budget enforcement.

use crate::config::Config;
use crate::session::types::SessionId;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex as StdMutex, RwLock as StdRwLock};
use sysinfo::System;
use tokio::sync::watch;
use tracing::{debug, instrument, warn};

/// One reading for a single OS process.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ProcessSample {
    /// Share of total machine CPU, 0.0..=1.0.
    pub cpu_fraction: f64,
    pub memory_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SystemMemory {
    pub used_bytes: u64,
    pub total_bytes: u64,
}

/// Source of process readings. `sysinfo` in production; tests substitute their own.
pub trait ResourceSampler: Send {
    /// Readings for the pids still alive; missing pids are absent from the map.
    fn sample(&mut self, pids: &[u32]) -> HashMap<u32, ProcessSample>;
    fn system_memory(&mut self) -> SystemMemory;
}

pub struct SysinfoSampler {
    system: System,
    cpu_count: f64,
}

impl SysinfoSampler {
    pub fn new() -> Self {
        let cpu_count = std::thread::available_parallelism()
            .map(|n| n.get() as f64)
            .unwrap_or(1.0);
        Self {
            system: System::new(),
            cpu_count,
        }
    }
}

impl Default for SysinfoSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceSampler for SysinfoSampler {
    /// Each reading covers the pid and every process descended from it.
    fn sample(&mut self, pids: &[u32]) -> HashMap<u32, ProcessSample> {
        if pids.is_empty() {
            return HashMap::new();
        }
        self.system.refresh_processes();
        let mut own = HashMap::new();
        let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
        for (pid, process) in self.system.processes() {
            // Linux lists threads too; they share their process's memory.
            if process.thread_kind().is_some() {
                continue;
            }
            own.insert(
                pid.as_u32(),
                ProcessSample {
                    cpu_fraction: process.cpu_usage() as f64 / 100.0 / self.cpu_count,
                    memory_bytes: process.memory(),
                },
            );
            if let Some(parent) = process.parent() {
                children.entry(parent.as_u32()).or_default().push(pid.as_u32());
            }
        }
        pids.iter()
            .filter_map(|&root| tree_total(root, &children, &own).map(|total| (root, total)))
            .collect()
    }

    fn system_memory(&mut self) -> SystemMemory {
        self.system.refresh_memory();
        SystemMemory {
            used_bytes: self.system.used_memory(),
            total_bytes: self.system.total_memory(),
        }
    }
}

/// Sums `own` readings over `root` and its descendants. None if `root` is gone.
fn tree_total(
    root: u32,
    children: &HashMap<u32, Vec<u32>>,
    own: &HashMap<u32, ProcessSample>,
) -> Option<ProcessSample> {
    let mut total = *own.get(&root)?;
    let mut seen = HashSet::from([root]);
    let mut stack: Vec<u32> = children.get(&root).cloned().unwrap_or_default();
    while let Some(pid) = stack.pop() {
        if !seen.insert(pid) {
            continue;
        }
        if let Some(reading) = own.get(&pid) {
            total.cpu_fraction += reading.cpu_fraction;
            total.memory_bytes = total.memory_bytes.saturating_add(reading.memory_bytes);
        }
        if let Some(grandchildren) = children.get(&pid) {
            stack.extend(grandchildren);
        }
    }
    total.cpu_fraction = total.cpu_fraction.clamp(0.0, 1.0);
    Some(total)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ResourceBudgets {
    pub memory_bytes: u64,
    pub cpu_alert_fraction: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ResourceUsage {
    pub cpu_fraction: f64,
    pub memory_bytes: u64,
}

/// Pool-wide picture published after every sweep. `create` reads it for soft admission.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct PoolUtilization {
    pub sampled_sessions: usize,
    pub session_memory_bytes: u64,
    pub session_cpu_fraction: f64,
    pub system_memory_fraction: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BudgetViolation {
    /// Fatal: the session goes to Error.
    Memory { session_id: SessionId, used_bytes: u64, budget_bytes: u64 },
    /// Load signal only.
    Cpu { session_id: SessionId, cpu_fraction: f64 },
    /// The registered process vanished for several consecutive samples.
    HealthCheck { session_id: SessionId, misses: u32 },
}

#[derive(Debug, Clone, Copy)]
struct Target {
    pid: u32,
    misses: u32,
}

pub struct SessionResourceMonitor {
    sampler: StdMutex<Box<dyn ResourceSampler>>,
    targets: StdMutex<HashMap<SessionId, Target>>,
    budgets: StdRwLock<ResourceBudgets>,
    health_failure_limit: u32,
    utilization: watch::Sender<PoolUtilization>,
}

impl std::fmt::Debug for SessionResourceMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionResourceMonitor")
            .field("health_failure_limit", &self.health_failure_limit)
            .finish_non_exhaustive()
    }
}

impl SessionResourceMonitor {
    pub fn new(config: &Config) -> Self {
        Self::with_sampler(config, Box::new(SysinfoSampler::new()))
    }

    pub fn with_sampler(config: &Config, sampler: Box<dyn ResourceSampler>) -> Self {
        let (utilization, _) = watch::channel(PoolUtilization::default());
        Self {
            sampler: StdMutex::new(sampler),
            targets: StdMutex::new(HashMap::new()),
            budgets: StdRwLock::new(ResourceBudgets {
                memory_bytes: config.session_memory_budget_bytes,
                cpu_alert_fraction: config.cpu_alert_fraction,
            }),
            health_failure_limit: config.health_failure_limit.max(1),
            utilization,
        }
    }

    pub fn register(&self, session_id: SessionId, pid: u32) {
        if let Ok(mut targets) = self.targets.lock() {
            targets.insert(session_id, Target { pid, misses: 0 });
        }
        debug!(%session_id, pid, "Session registered with resource monitor");
    }

    pub fn detach(&self, session_id: &SessionId) {
        if let Ok(mut targets) = self.targets.lock() {
            if targets.remove(session_id).is_some() {
                debug!(%session_id, "Session detached from resource monitor");
            }
        }
    }

    pub fn is_tracking(&self, session_id: &SessionId) -> bool {
        self.targets
            .lock()
            .map(|targets| targets.contains_key(session_id))
            .unwrap_or(false)
    }

    pub fn budgets(&self) -> ResourceBudgets {
        match self.budgets.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Administrative: replaces the per-session budgets.
    pub fn set_budgets(&self, budgets: ResourceBudgets) {
        match self.budgets.write() {
            Ok(mut guard) => *guard = budgets,
            Err(poisoned) => *poisoned.into_inner() = budgets,
        }
    }

    pub fn utilization(&self) -> PoolUtilization {
        *self.utilization.borrow()
    }

    pub fn subscribe_utilization(&self) -> watch::Receiver<PoolUtilization> {
        self.utilization.subscribe()
    }

    /// Samples every registered session and refreshes the pool-wide utilization.
    /// Sessions whose process could not be read are omitted and accrue a health miss.
    #[instrument(skip(self))]
    pub fn sample(&self) -> Vec<(SessionId, ResourceUsage)> {
        let snapshot: Vec<(SessionId, u32)> = match self.targets.lock() {
            Ok(targets) => targets.iter().map(|(id, t)| (*id, t.pid)).collect(),
            Err(_) => return Vec::new(),
        };
        let pids: Vec<u32> = snapshot.iter().map(|(_, pid)| *pid).collect();

        let (readings, system) = match self.sampler.lock() {
            Ok(mut sampler) => (sampler.sample(&pids), sampler.system_memory()),
            Err(e) => {
                warn!(error = %e, "Resource sampler lock poisoned; skipping sweep");
                return Vec::new();
            }
        };

        let mut usages = Vec::with_capacity(readings.len());
        if let Ok(mut targets) = self.targets.lock() {
            for (session_id, pid) in snapshot {
                let Some(target) = targets.get_mut(&session_id) else {
                    continue; // detached mid-sweep
                };
                match readings.get(&pid) {
                    Some(reading) => {
                        target.misses = 0;
                        usages.push((
                            session_id,
                            ResourceUsage {
                                cpu_fraction: reading.cpu_fraction,
                                memory_bytes: reading.memory_bytes,
                            },
                        ));
                    }
                    None => target.misses += 1,
                }
            }
        }

        let system_memory_fraction = if system.total_bytes == 0 {
            0.0
        } else {
            system.used_bytes as f64 / system.total_bytes as f64
        };
        let utilization = PoolUtilization {
            sampled_sessions: usages.len(),
            session_memory_bytes: usages.iter().map(|(_, u)| u.memory_bytes).sum(),
            session_cpu_fraction: usages.iter().map(|(_, u)| u.cpu_fraction).sum(),
            system_memory_fraction,
        };
        self.utilization.send_replace(utilization);
        debug!(?utilization, "Resource sweep complete");

        usages
    }

    /// Compares samples against the current budgets. Also reports sessions whose
    /// process has been missing for `health_failure_limit` consecutive sweeps.
    pub fn enforce(&self, samples: &[(SessionId, ResourceUsage)]) -> Vec<BudgetViolation> {
        let budgets = self.budgets();
        let mut violations = Vec::new();

        for (session_id, usage) in samples {
            if usage.memory_bytes > budgets.memory_bytes {
                warn!(%session_id, used = usage.memory_bytes, budget = budgets.memory_bytes, "Session exceeded memory budget");
                violations.push(BudgetViolation::Memory {
                    session_id: *session_id,
                    used_bytes: usage.memory_bytes,
                    budget_bytes: budgets.memory_bytes,
                });
            } else if usage.cpu_fraction > budgets.cpu_alert_fraction {
                debug!(%session_id, cpu = usage.cpu_fraction, "Session above CPU alert threshold");
                violations.push(BudgetViolation::Cpu {
                    session_id: *session_id,
                    cpu_fraction: usage.cpu_fraction,
                });
            }
        }

        if let Ok(targets) = self.targets.lock() {
            for (session_id, target) in targets.iter() {
                if target.misses >= self.health_failure_limit {
                    violations.push(BudgetViolation::HealthCheck {
                        session_id: *session_id,
                        misses: target.misses,
                    });
                }
            }
        }

        violations
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Arc;

    /// Reports the configured memory for every live pid.
    #[derive(Clone, Default)]
    pub struct FixedSampler {
        pub memory_bytes: Arc<StdMutex<u64>>,
        pub missing: Arc<StdMutex<bool>>,
    }

    impl ResourceSampler for FixedSampler {
        fn sample(&mut self, pids: &[u32]) -> HashMap<u32, ProcessSample> {
            if *self.missing.lock().unwrap() {
                return HashMap::new();
            }
            let memory_bytes = *self.memory_bytes.lock().unwrap();
            pids.iter()
                .map(|pid| (*pid, ProcessSample { cpu_fraction: 0.05, memory_bytes }))
                .collect()
        }

        fn system_memory(&mut self) -> SystemMemory {
            SystemMemory { used_bytes: 50, total_bytes: 100 }
        }
    }
}
