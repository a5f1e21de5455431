//! Process-isolated worker pool.
//!
//! [`WorkerPool`] is a cheap, cloneable handle. The pool state itself lives
//! on a single coordinator task which owns a fixed number of `spworker`
//! processes, hands each job to exactly one idle worker, recycles workers
//! after a task quota, and drains or kills them on shutdown. Callers never
//! block a thread while a job runs: `submit` suspends on a completion channel
//! bounded by the outer deadline.

mod actor;
mod error;
mod slot;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use speech_pool_common::{Job, JobResult};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::config::{Config, PoolConfig};
use crate::monitor::{ResourceMonitor, WorkerMemory};
use crate::worker::WorkerArgs;
use actor::{Activity, Command, Coordinator};

pub use error::PoolError;

/// Wait bound used by [`WorkerPool::restart_if_idle`].
pub const RESTART_IF_IDLE_WAIT: Duration = Duration::from_secs(5);

/// CPU sampling window for idle detection.
const IDLE_CPU_WINDOW: Duration = Duration::from_millis(100);

/// Slack on top of the shutdown timeout before the handle stops waiting.
const SHUTDOWN_SLACK: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolState {
    #[default]
    Running,
    /// No longer accepting jobs, waiting for outstanding ones.
    Draining,
    Closed,
}

/// Coordinator state as of its last event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub state: PoolState,
    pub size: usize,
    pub workers: usize,
    pub busy: usize,
    pub pending: usize,
    pub queued: usize,
    pub worker_pids: Vec<u32>,
    /// Workers retired after reaching the recycle quota.
    pub recycled: u64,
    pub restarts: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolHealth {
    pub pool_size: usize,
    pub timeout_secs: u64,
    pub status: PoolState,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolStats {
    pub pool_size: usize,
    pub worker_count: usize,
    pub pending: usize,
    pub queued: usize,
    pub idle: bool,
    pub workers: Vec<WorkerMemory>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownMode {
    /// Every outstanding job finished and every worker exited on its own.
    Graceful,
    /// The timeout expired and workers were killed.
    Forced,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    pub mode: ShutdownMode,
    pub elapsed: Duration,
    /// Jobs failed with [`PoolError::Closed`] because they could not finish in time.
    pub abandoned: usize,
}

/// Handle to a running worker pool.
#[derive(Clone)]
pub struct WorkerPool {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<PoolStatus>,
    config: Arc<PoolConfig>,
}

impl WorkerPool {
    /// Spawn `pool.size` workers and the coordinator task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: &Config) -> anyhow::Result<Self> {
        config.pool.validate()?;
        let program = config.pool.worker_program()?;
        Self::start_with(config.pool.clone(), program, WorkerArgs::command_line(config))
    }

    fn start_with(
        pool: PoolConfig,
        program: PathBuf,
        args: Vec<std::ffi::OsString>,
    ) -> anyhow::Result<Self> {
        let (commands, receiver) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(PoolStatus::default());
        info!(
            size = pool.size,
            recycle_quota = pool.recycle_quota,
            inner_timeout_secs = pool.inner_timeout_secs,
            program = %program.display(),
            "Starting worker pool"
        );
        let coordinator = Coordinator::new(pool.clone(), program, args, receiver, status_tx)?;
        tokio::spawn(coordinator.run());

        Ok(Self {
            commands,
            status,
            config: Arc::new(pool),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Build a job that uses the pool's inner deadline.
    pub fn job(
        &self,
        input_path: impl Into<PathBuf>,
        language: impl Into<String>,
        correlation_id: impl Into<String>,
    ) -> Job {
        Job::new(
            input_path,
            language,
            correlation_id,
            self.config.inner_timeout(),
        )
    }

    /// Run `job` on a worker, waiting at most `job.deadline` plus the outer margin.
    pub async fn submit(&self, job: Job) -> Result<JobResult, PoolError> {
        let outer = job.deadline + self.config.outer_margin();
        self.submit_with_timeout(job, outer).await
    }

    /// Run `job` on a worker, waiting at most `outer`.
    ///
    /// On timeout the job is abandoned: the worker keeps it until it answers
    /// or is recycled, and the late answer is discarded.
    pub async fn submit_with_timeout(
        &self,
        job: Job,
        outer: Duration,
    ) -> Result<JobResult, PoolError> {
        let correlation_id = job.correlation_id.clone();
        let (reply, result) = oneshot::channel();
        self.commands
            .send(Command::Submit { job, reply })
            .map_err(|_| PoolError::Closed)?;

        match tokio::time::timeout(outer, result).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(PoolError::Closed),
            Err(_) => {
                warn!(
                    correlation_id = speech_pool_common::job::short_id(&correlation_id),
                    waited_ms = outer.as_millis() as u64,
                    "Job exceeded outer deadline, abandoning"
                );
                Err(PoolError::Timeout {
                    correlation_id,
                    waited: outer,
                })
            }
        }
    }

    /// Cheap synchronous health summary.
    pub fn health(&self) -> PoolHealth {
        let status = self.status.borrow();
        PoolHealth {
            pool_size: self.config.size,
            timeout_secs: self.config.inner_timeout_secs,
            status: status.state,
        }
    }

    pub fn status(&self) -> PoolStatus {
        self.status.borrow().clone()
    }

    pub fn worker_pids(&self) -> Vec<u32> {
        self.status.borrow().worker_pids.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.status.borrow().state != PoolState::Running || self.commands.is_closed()
    }

    async fn activity(&self) -> Result<Activity, PoolError> {
        let (reply, activity) = oneshot::channel();
        self.commands
            .send(Command::Activity { reply })
            .map_err(|_| PoolError::Closed)?;
        activity.await.map_err(|_| PoolError::Closed)
    }

    /// True when nothing is pending, queued or on the pipes, and no worker
    /// is using noticeable CPU. A stopped pool reports busy.
    pub async fn is_idle(&self) -> bool {
        let Ok(activity) = self.activity().await else {
            return false;
        };
        if activity.has_work() {
            return false;
        }
        let mut monitor = ResourceMonitor::for_pids(activity.worker_pids);
        let threshold = self.config.idle_cpu_threshold;
        let busy = monitor
            .sample_cpu(IDLE_CPU_WINDOW)
            .await
            .into_iter()
            .find(|(_, cpu)| *cpu > threshold);
        if let Some((pid, cpu)) = busy {
            debug!(pid, cpu, "Worker still using CPU");
            return false;
        }
        true
    }

    /// Poll [`is_idle`](Self::is_idle) every `poll_interval` for up to `wait`.
    pub async fn wait_idle(&self, wait: Duration) -> bool {
        let started = tokio::time::Instant::now();
        let mut last_log = started;
        loop {
            if self.is_idle().await {
                return true;
            }
            if started.elapsed() >= wait {
                return false;
            }
            if last_log.elapsed() >= Duration::from_secs(1) {
                let status = self.status();
                info!(
                    waited_ms = started.elapsed().as_millis() as u64,
                    pending = status.pending,
                    queued = status.queued,
                    "Waiting for pool to become idle"
                );
                last_log = tokio::time::Instant::now();
            }
            tokio::time::sleep(self.config.poll_interval()).await;
        }
    }

    pub async fn stats(&self) -> PoolStats {
        let activity = self.activity().await.unwrap_or_default();
        let idle = self.is_idle().await;
        let workers = ResourceMonitor::for_pids(activity.worker_pids.iter().copied()).worker_memory();
        PoolStats {
            pool_size: self.config.size,
            worker_count: workers.len(),
            pending: activity.pending,
            queued: activity.queued,
            idle,
            workers,
        }
    }

    /// Replace every worker with a fresh process.
    ///
    /// Waits up to `wait_timeout` for the pool to go idle. Returns `true`
    /// when it did, `false` when busy workers had to be killed. Jobs
    /// submitted meanwhile are queued and run on the new workers.
    pub async fn restart(&self, wait_timeout: Duration) -> Result<bool, PoolError> {
        info!(wait_ms = wait_timeout.as_millis() as u64, "Restarting worker pool");
        let idle = self.wait_idle(wait_timeout).await;
        if !idle {
            warn!("Pool not idle within wait timeout, forcing restart");
        }
        let (reply, done) = oneshot::channel();
        self.commands
            .send(Command::Restart { force: !idle, reply })
            .map_err(|_| PoolError::Closed)?;
        done.await.map_err(|_| PoolError::Closed)??;
        Ok(idle)
    }

    /// Restart only if the pool is idle right now. Returns whether it restarted.
    pub async fn restart_if_idle(&self) -> Result<bool, PoolError> {
        if !self.is_idle().await {
            debug!("Pool busy, skipping restart");
            return Ok(false);
        }
        self.restart(RESTART_IF_IDLE_WAIT).await
    }

    /// Stop accepting jobs, let outstanding ones finish for up to `timeout`,
    /// then kill whatever is left.
    pub async fn shutdown(&self, timeout: Duration) -> ShutdownReport {
        let started = tokio::time::Instant::now();
        let (reply, report) = oneshot::channel();
        if self
            .commands
            .send(Command::Shutdown { timeout, reply })
            .is_err()
        {
            return ShutdownReport {
                mode: ShutdownMode::Graceful,
                elapsed: Duration::ZERO,
                abandoned: 0,
            };
        }
        match tokio::time::timeout(timeout + SHUTDOWN_SLACK, report).await {
            Ok(Ok(report)) => report,
            Ok(Err(_)) => ShutdownReport {
                mode: ShutdownMode::Graceful,
                elapsed: started.elapsed(),
                abandoned: 0,
            },
            Err(_) => {
                warn!("Coordinator did not confirm shutdown in time");
                ShutdownReport {
                    mode: ShutdownMode::Forced,
                    elapsed: started.elapsed(),
                    abandoned: self.status().pending,
                }
            }
        }
    }
}
