//! Resource monitor for the coordinator and its worker processes.
//!
//! Reads the OS process table through `sysinfo` instead of trusting
//! in-process counters, which cannot see memory leaked by native code.
//! Processes that exit between enumeration and query are skipped.

use std::time::Duration;

use serde::Serialize;
use sysinfo::{Pid, Process, ProcessStatus, System};
use thiserror::Error;
use tracing::{debug, error};

use crate::gauges::Sample;

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("cannot determine own pid: {0}")]
    CurrentPid(&'static str),
    #[error("coordinator process {0} missing from process table")]
    ParentMissing(u32),
}

/// Which processes count as workers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    /// Every child process of the current process.
    Children,
    /// An explicit set, e.g. the pool's own workers.
    Pids(Vec<u32>),
}

/// Memory totals for the coordinator and its workers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResourceSnapshot {
    pub parent_rss: u64,
    pub workers_rss_sum: u64,
    pub worker_count: usize,
    pub per_worker_avg: u64,
}

impl ResourceSnapshot {
    pub fn total(&self) -> u64 {
        self.parent_rss + self.workers_rss_sum
    }
}

/// CPU percentages; 100 is one fully used core.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CpuSnapshot {
    pub parent: f32,
    pub workers: f32,
    pub total: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WorkerMemory {
    pub pid: u32,
    /// Memory private to the worker; falls back to resident when unavailable.
    pub unique_bytes: u64,
    pub resident_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    pub resident_bytes: u64,
    pub cpu_percent: f32,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessTree {
    pub parent: Option<ProcessInfo>,
    pub workers: Vec<ProcessInfo>,
}

pub struct ResourceMonitor {
    system: System,
    parent: Result<Pid, &'static str>,
    scope: Scope,
}

impl Default for ResourceMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceMonitor {
    /// Monitor the children of the current process.
    pub fn new() -> Self {
        Self::with_scope(Scope::Children)
    }

    /// Monitor an explicit set of worker pids.
    pub fn for_pids(pids: impl IntoIterator<Item = u32>) -> Self {
        Self::with_scope(Scope::Pids(pids.into_iter().collect()))
    }

    pub fn with_scope(scope: Scope) -> Self {
        Self {
            system: System::new(),
            parent: sysinfo::get_current_pid(),
            scope,
        }
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Replace the explicit pid set, e.g. after workers were recycled.
    pub fn set_pids(&mut self, pids: impl IntoIterator<Item = u32>) {
        self.scope = Scope::Pids(pids.into_iter().collect());
    }

    /// Refresh the process table and return the live workers, sorted by pid.
    fn refresh(&mut self) -> Vec<Pid> {
        let parent = self.parent.ok();
        let mut live: Vec<Pid> = match &self.scope {
            Scope::Children => {
                self.system.refresh_processes();
                self.system
                    .processes()
                    .iter()
                    .filter(|(_, process)| parent.is_some() && process.parent() == parent)
                    .filter(|(_, process)| is_running(process))
                    .map(|(pid, _)| *pid)
                    .collect()
            }
            Scope::Pids(pids) => {
                if let Some(parent) = parent {
                    self.system.refresh_process(parent);
                }
                pids.iter()
                    .map(|pid| Pid::from_u32(*pid))
                    .filter(|pid| {
                        self.system.refresh_process(*pid)
                            && self.system.process(*pid).is_some_and(is_running)
                    })
                    .collect()
            }
        };
        live.sort_unstable();
        live
    }

    /// Pids of the live worker processes.
    pub fn workers(&mut self) -> Vec<u32> {
        self.refresh().into_iter().map(Pid::as_u32).collect()
    }

    fn parent_process(&self) -> Result<&Process, MonitorError> {
        let pid = self.parent.map_err(MonitorError::CurrentPid)?;
        self.system
            .process(pid)
            .ok_or(MonitorError::ParentMissing(pid.as_u32()))
    }

    fn memory_of(&self, workers: &[Pid]) -> Result<ResourceSnapshot, MonitorError> {
        let parent_rss = self.parent_process()?.memory();
        let workers_rss_sum: u64 = workers
            .iter()
            .filter_map(|pid| self.system.process(*pid))
            .map(Process::memory)
            .sum();
        let worker_count = workers.len();
        let per_worker_avg = match worker_count {
            0 => 0,
            n => workers_rss_sum / n as u64,
        };
        Ok(ResourceSnapshot {
            parent_rss,
            workers_rss_sum,
            worker_count,
            per_worker_avg,
        })
    }

    /// Resident memory of the coordinator and its workers. Zeroed on failure.
    pub fn aggregate_memory(&mut self) -> ResourceSnapshot {
        let workers = self.refresh();
        self.memory_or_zero(&workers)
    }

    fn memory_or_zero(&self, workers: &[Pid]) -> ResourceSnapshot {
        self.memory_of(workers).unwrap_or_else(|e| {
            error!(error = %e, "Failed to collect memory usage");
            ResourceSnapshot::default()
        })
    }

    fn cpu_of(&self, workers: &[Pid]) -> Result<CpuSnapshot, MonitorError> {
        let parent = self.parent_process()?.cpu_usage();
        let workers: f32 = workers
            .iter()
            .filter_map(|pid| self.system.process(*pid))
            .map(Process::cpu_usage)
            .sum();
        Ok(CpuSnapshot {
            parent,
            workers,
            total: parent + workers,
        })
    }

    /// CPU usage over the time since this monitor last refreshed the process
    /// table, by any method. Never sleeps; the first call after construction
    /// reports zero. Use [`sample`](Self::sample) when memory is needed too,
    /// so the window is not cut short by a second refresh.
    pub fn aggregate_cpu(&mut self) -> CpuSnapshot {
        let workers = self.refresh();
        self.cpu_or_zero(&workers)
    }

    fn cpu_or_zero(&self, workers: &[Pid]) -> CpuSnapshot {
        self.cpu_of(workers).unwrap_or_else(|e| {
            error!(error = %e, "Failed to collect CPU usage");
            CpuSnapshot::default()
        })
    }

    /// Memory and CPU from a single refresh. CPU covers the interval since
    /// the previous call, so calling this once per tick measures the whole tick.
    pub fn sample(&mut self) -> Sample {
        let workers = self.refresh();
        Sample {
            memory: self.memory_or_zero(&workers),
            cpu: self.cpu_or_zero(&workers),
        }
    }

    /// Per-worker unique and resident memory.
    pub fn worker_memory(&mut self) -> Vec<WorkerMemory> {
        self.refresh()
            .into_iter()
            .filter_map(|pid| {
                let resident_bytes = self.system.process(pid)?.memory();
                let unique_bytes = unique_memory(pid.as_u32()).unwrap_or(resident_bytes);
                Some(WorkerMemory {
                    pid: pid.as_u32(),
                    unique_bytes,
                    resident_bytes,
                })
            })
            .collect()
    }

    pub fn process_tree(&mut self) -> ProcessTree {
        let workers = self.refresh();
        ProcessTree {
            parent: self.parent_process().ok().map(process_info),
            workers: workers
                .iter()
                .filter_map(|pid| self.system.process(*pid))
                .map(process_info)
                .collect(),
        }
    }

    /// Per-worker CPU measured over `window` (at least sysinfo's minimum interval).
    pub async fn sample_cpu(&mut self, window: Duration) -> Vec<(u32, f32)> {
        self.refresh();
        tokio::time::sleep(window.max(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL)).await;
        let samples: Vec<(u32, f32)> = self
            .refresh()
            .into_iter()
            .filter_map(|pid| Some((pid.as_u32(), self.system.process(pid)?.cpu_usage())))
            .collect();
        debug!(workers = samples.len(), "Sampled worker CPU");
        samples
    }
}

fn is_running(process: &Process) -> bool {
    process.thread_kind().is_none()
        && !matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead)
}

fn process_info(process: &Process) -> ProcessInfo {
    ProcessInfo {
        pid: process.pid().as_u32(),
        name: process.name().to_string(),
        resident_bytes: process.memory(),
        cpu_percent: process.cpu_usage(),
        status: process.status().to_string(),
    }
}

/// Sum of private pages from an `smaps_rollup` listing, in bytes.
fn parse_private_bytes(smaps: &str) -> Option<u64> {
    let mut total = None;
    for line in smaps.lines() {
        let Some(rest) = line
            .strip_prefix("Private_Clean:")
            .or_else(|| line.strip_prefix("Private_Dirty:"))
        else {
            continue;
        };
        let kib: u64 = rest.trim().trim_end_matches("kB").trim().parse().ok()?;
        total = Some(total.unwrap_or(0) + kib * 1024);
    }
    total
}

#[cfg(target_os = "linux")]
fn unique_memory(pid: u32) -> Option<u64> {
    let smaps = std::fs::read_to_string(format!("/proc/{pid}/smaps_rollup")).ok()?;
    parse_private_bytes(&smaps)
}

#[cfg(not(target_os = "linux"))]
fn unique_memory(_pid: u32) -> Option<u64> {
    None
}

#[cfg(test)]
#[path = "monitor_test.rs"]
mod tests;
