//! The coordinator task: sole owner of the worker processes.
//!
//! Every mutation of pool state (dispatch, recycle, restart, shutdown) happens
//! on this task in response to a [`Command`] or a finished exchange, so none
//! of it needs a lock.

use std::collections::{HashMap, VecDeque};
use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

use speech_pool_common::job::short_id;
use speech_pool_common::wire::WireError;
use speech_pool_common::{FailureKind, Job, JobFailure, JobResult};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{self, JoinError, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::slot::{Exchange, SlotState, WorkerSlot, exchange, reap};
use super::{PoolError, PoolState, PoolStatus, ShutdownMode, ShutdownReport};
use crate::config::PoolConfig;

/// Time a retired worker gets to exit once its stdin is closed.
const RETIRE_GRACE: Duration = Duration::from_secs(10);

/// Bound on reaping killed workers during a forced stop.
const KILL_REAP_TIMEOUT: Duration = Duration::from_secs(1);

pub(crate) type Reply = oneshot::Sender<Result<JobResult, PoolError>>;

pub(crate) enum Command {
    Submit {
        job: Job,
        reply: Reply,
    },
    Activity {
        reply: oneshot::Sender<Activity>,
    },
    Restart {
        force: bool,
        reply: oneshot::Sender<Result<usize, PoolError>>,
    },
    Shutdown {
        timeout: Duration,
        reply: oneshot::Sender<ShutdownReport>,
    },
}

/// Outstanding work as seen by the coordinator, for idle detection.
#[derive(Debug, Clone, Default)]
pub(crate) struct Activity {
    pub pending: usize,
    pub queued: usize,
    /// Exchanges whose request or reply is still on the pipes.
    pub in_transit: usize,
    pub busy: usize,
    pub worker_pids: Vec<u32>,
}

impl Activity {
    pub fn has_work(&self) -> bool {
        self.pending > 0 || self.queued > 0 || self.in_transit > 0 || self.busy > 0
    }
}

struct Queued {
    job: Job,
    reply: Reply,
}

struct Pending {
    reply: Reply,
    slot_id: u64,
    dispatched: Instant,
}

/// Identifies the job an exchange task is carrying, in case the task itself fails.
struct InFlight {
    slot_id: u64,
    correlation_id: String,
}

struct Drain {
    started: Instant,
    deadline: Instant,
    replies: Vec<oneshot::Sender<ShutdownReport>>,
}

pub(crate) struct Coordinator {
    config: PoolConfig,
    program: PathBuf,
    args: Vec<OsString>,
    slots: Vec<WorkerSlot>,
    /// Retired workers not yet reaped. They still count against the pool size.
    exiting: usize,
    next_slot_id: u64,
    queue: VecDeque<Queued>,
    pending: HashMap<String, Pending>,
    closed: bool,
    drain: Option<Drain>,
    spawn_error: Option<String>,
    exchanges: JoinSet<Exchange>,
    in_flight: HashMap<task::Id, InFlight>,
    reapers: JoinSet<()>,
    commands: mpsc::UnboundedReceiver<Command>,
    status: watch::Sender<PoolStatus>,
    recycled: u64,
    restarts: u64,
}

impl Coordinator {
    /// Spawn the initial workers. Fails if any of them cannot be started.
    pub fn new(
        config: PoolConfig,
        program: PathBuf,
        args: Vec<OsString>,
        commands: mpsc::UnboundedReceiver<Command>,
        status: watch::Sender<PoolStatus>,
    ) -> Result<Self, PoolError> {
        let mut coordinator = Self {
            config,
            program,
            args,
            slots: Vec::new(),
            exiting: 0,
            next_slot_id: 0,
            queue: VecDeque::new(),
            pending: HashMap::new(),
            closed: false,
            drain: None,
            spawn_error: None,
            exchanges: JoinSet::new(),
            in_flight: HashMap::new(),
            reapers: JoinSet::new(),
            commands,
            status,
            recycled: 0,
            restarts: 0,
        };
        while coordinator.slots.len() < coordinator.config.size {
            coordinator.spawn_slot()?;
        }
        coordinator.publish();
        Ok(coordinator)
    }

    pub async fn run(mut self) {
        loop {
            let deadline = self.drain.as_ref().map(|drain| drain.deadline);
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => {
                        info!("All pool handles dropped, stopping workers");
                        self.kill_all().await;
                        return;
                    }
                },
                Some(joined) = self.exchanges.join_next_with_id() => self.on_exchange(joined),
                Some(_) = self.reapers.join_next() => {
                    self.exiting = self.exiting.saturating_sub(1);
                    self.dispatch();
                }
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.finish_forced().await;
                    return;
                }
            }
            if self.is_drained() {
                self.finish_graceful().await;
                return;
            }
            self.publish();
        }
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Submit { job, reply } => self.submit(job, reply),
            Command::Activity { reply } => {
                let _ = reply.send(self.activity());
            }
            Command::Restart { force, reply } => {
                let _ = reply.send(self.restart(force));
            }
            Command::Shutdown { timeout, reply } => self.begin_shutdown(timeout, reply),
        }
    }

    fn spawn_slot(&mut self) -> Result<(), PoolError> {
        let id = self.next_slot_id;
        self.next_slot_id += 1;
        let slot = WorkerSlot::spawn(id, &self.program, &self.args)?;
        self.slots.push(slot);
        self.spawn_error = None;
        Ok(())
    }

    /// Top the pool back up to its configured size.
    fn replenish(&mut self) {
        if self.closed {
            return;
        }
        while self.slots.len() + self.exiting < self.config.size {
            if let Err(e) = self.spawn_slot() {
                error!(error = %e, "Failed to replace worker");
                self.spawn_error = Some(e.to_string());
                break;
            }
        }
    }

    fn submit(&mut self, job: Job, reply: Reply) {
        if self.closed {
            let _ = reply.send(Err(PoolError::Closed));
            return;
        }
        let id = job.correlation_id.clone();
        if self.pending.contains_key(&id) || self.queue.iter().any(|q| q.job.correlation_id == id) {
            warn!(correlation_id = short_id(&id), "Rejecting duplicate job");
            let _ = reply.send(Err(PoolError::Duplicate(id)));
            return;
        }

        self.queue.push_back(Queued { job, reply });
        self.dispatch();

        if self.queue.len() > self.config.queue_capacity {
            if let Some(rejected) = self.queue.pop_back() {
                let queued = self.queue.len();
                warn!(correlation_id = short_id(&id), queued, "Queue full, rejecting job");
                let _ = rejected.reply.send(Err(PoolError::Exhausted { queued }));
            }
        }
    }

    /// Hand queued jobs to idle workers.
    fn dispatch(&mut self) {
        self.queue.retain(|queued| {
            let abandoned = queued.reply.is_closed();
            if abandoned {
                debug!(correlation_id = queued.job.short_id(), "Dropping abandoned job from queue");
            }
            !abandoned
        });
        self.replenish();

        while !self.queue.is_empty() {
            let Some(idx) = self.idle_slot() else {
                break;
            };
            let Some(queued) = self.queue.pop_front() else {
                break;
            };
            self.start(idx, queued);
        }

        // Nothing can run the queue if no worker is alive or on its way.
        let stranded = self.slots.is_empty() && (self.closed || self.exiting == 0);
        if stranded && !self.queue.is_empty() {
            let error = match (&self.spawn_error, self.closed) {
                (_, true) => PoolError::Closed,
                (Some(message), false) => PoolError::Spawn(message.clone()),
                (None, false) => PoolError::Spawn("no workers available".to_string()),
            };
            for queued in self.queue.drain(..) {
                let _ = queued.reply.send(Err(error.clone()));
            }
        }
    }

    /// Index of an idle, live worker. Idle workers that died are replaced.
    fn idle_slot(&mut self) -> Option<usize> {
        loop {
            let idx = self
                .slots
                .iter()
                .position(|slot| slot.state == SlotState::Idle)?;
            if self.slots[idx].is_alive() {
                return Some(idx);
            }
            let slot = self.slots.swap_remove(idx);
            warn!(slot = slot.id, pid = slot.pid, "Idle worker died, replacing");
            self.retire(slot);
            self.replenish();
        }
    }

    fn start(&mut self, idx: usize, queued: Queued) {
        let Queued { job, reply } = queued;
        let slot = &mut self.slots[idx];
        let Some(io) = slot.take_io() else {
            error!(slot = slot.id, pid = slot.pid, "Idle worker has no pipes, replacing");
            let slot = self.slots.swap_remove(idx);
            self.retire(slot);
            self.queue.push_front(Queued { job, reply });
            self.replenish();
            return;
        };

        slot.state = SlotState::Busy {
            correlation_id: job.correlation_id.clone(),
        };
        let slot_id = slot.id;
        info!(
            correlation_id = job.short_id(),
            slot = slot_id,
            pid = slot.pid,
            tasks_completed = slot.tasks_completed,
            "Job dispatched"
        );
        self.pending.insert(
            job.correlation_id.clone(),
            Pending {
                reply,
                slot_id,
                dispatched: Instant::now(),
            },
        );
        let correlation_id = job.correlation_id.clone();
        let handle = self.exchanges.spawn(exchange(slot_id, io, job));
        self.in_flight.insert(
            handle.id(),
            InFlight {
                slot_id,
                correlation_id,
            },
        );
    }

    fn on_exchange(&mut self, joined: Result<(task::Id, Exchange), JoinError>) {
        let exchange = match joined {
            Ok((id, exchange)) => {
                self.in_flight.remove(&id);
                exchange
            }
            Err(e) => {
                self.on_exchange_failed(e);
                return;
            }
        };
        let Exchange {
            slot_id,
            correlation_id,
            reply,
            io,
        } = exchange;
        let Some(idx) = self.slots.iter().position(|slot| slot.id == slot_id) else {
            warn!(slot = slot_id, correlation_id = short_id(&correlation_id), "Reply from unknown worker");
            return;
        };
        let pid = self.slots[idx].pid;

        let result = match reply {
            Ok(reply) => {
                if reply.correlation_id != correlation_id {
                    warn!(
                        expected = short_id(&correlation_id),
                        got = short_id(&reply.correlation_id),
                        pid,
                        "Worker answered with a different correlation id"
                    );
                }
                reply.result
            }
            Err(e) => {
                self.slots[idx].state = SlotState::Dead;
                let message = match e {
                    WireError::Closed => format!("worker process {pid} exited during the job"),
                    other => format!("lost contact with worker process {pid}: {other}"),
                };
                JobResult::Failure(JobFailure::new(FailureKind::Crash, message))
            }
        };
        // A worker exits on its own after reporting a deadline overrun.
        if result.failure_kind() == Some(FailureKind::Timeout) {
            self.slots[idx].state = SlotState::Dead;
        }

        self.deliver(&correlation_id, pid, result);

        let slot = &mut self.slots[idx];
        slot.tasks_completed += 1;
        slot.restore_io(io);
        if slot.state == SlotState::Dead {
            let slot = self.slots.swap_remove(idx);
            self.retire(slot);
        } else if slot.retiring || slot.tasks_completed >= self.config.recycle_quota {
            info!(
                slot = slot.id,
                pid = slot.pid,
                tasks_completed = slot.tasks_completed,
                "Recycling worker"
            );
            self.recycled += 1;
            let slot = self.slots.swap_remove(idx);
            self.retire(slot);
        } else {
            slot.state = SlotState::Idle;
        }

        self.dispatch();
    }

    /// The exchange task panicked or was cancelled and took the worker's pipes
    /// with it. Fail its job and replace the worker.
    fn on_exchange_failed(&mut self, e: JoinError) {
        let Some(InFlight {
            slot_id,
            correlation_id,
        }) = self.in_flight.remove(&e.id())
        else {
            error!(error = %e, "Unknown worker exchange task failed");
            return;
        };
        error!(
            slot = slot_id,
            correlation_id = short_id(&correlation_id),
            error = %e,
            "Worker exchange task failed"
        );

        let mut pid = 0;
        if let Some(idx) = self.slots.iter().position(|slot| slot.id == slot_id) {
            let mut slot = self.slots.swap_remove(idx);
            pid = slot.pid;
            slot.kill();
            self.retire(slot);
        }
        let message = format!("lost contact with worker process {pid}: {e}");
        self.deliver(
            &correlation_id,
            pid,
            JobResult::Failure(JobFailure::new(FailureKind::Crash, message)),
        );
        self.dispatch();
    }

    fn deliver(&mut self, correlation_id: &str, pid: u32, result: JobResult) {
        let Some(pending) = self.pending.remove(correlation_id) else {
            warn!(correlation_id = short_id(correlation_id), pid, "Result for unknown job");
            return;
        };
        let elapsed_ms = pending.dispatched.elapsed().as_millis() as u64;
        match &result {
            JobResult::Success(transcript) => info!(
                correlation_id = short_id(correlation_id),
                slot = pending.slot_id,
                pid,
                elapsed_ms,
                segments = transcript.segments.len(),
                "Job completed"
            ),
            JobResult::Failure(failure) => error!(
                correlation_id = short_id(correlation_id),
                slot = pending.slot_id,
                pid,
                elapsed_ms,
                kind = ?failure.kind,
                message = %failure.message,
                trace = %failure.diagnostic_trace,
                "Job failed"
            ),
        }
        if pending.reply.send(Ok(result)).is_err() {
            warn!(
                correlation_id = short_id(correlation_id),
                elapsed_ms,
                "Caller gave up on job, discarding late result"
            );
        }
    }

    /// Close the worker's stdin and reap it in the background.
    fn retire(&mut self, slot: WorkerSlot) {
        let grace = match &self.drain {
            Some(drain) => drain
                .deadline
                .saturating_duration_since(Instant::now())
                .min(RETIRE_GRACE),
            None => RETIRE_GRACE,
        };
        let pid = slot.pid;
        debug!(slot = slot.id, pid, tasks_completed = slot.tasks_completed, "Retiring worker");
        self.exiting += 1;
        self.reapers.spawn(reap(slot.into_child(), pid, grace));
    }

    fn activity(&self) -> Activity {
        Activity {
            pending: self.pending.len(),
            queued: self.queue.len(),
            in_transit: self.exchanges.len(),
            busy: self
                .slots
                .iter()
                .filter(|slot| matches!(slot.state, SlotState::Busy { .. }))
                .count(),
            worker_pids: self.slots.iter().map(|slot| slot.pid).collect(),
        }
    }

    /// Replace every worker. Busy workers are killed when `force` is set,
    /// otherwise they are replaced once their current job finishes.
    fn restart(&mut self, force: bool) -> Result<usize, PoolError> {
        if self.closed {
            return Err(PoolError::Closed);
        }
        let mut kept = Vec::new();
        let mut replaced = 0;
        for mut slot in std::mem::take(&mut self.slots) {
            replaced += 1;
            let SlotState::Busy { correlation_id } = slot.state.clone() else {
                self.retire(slot);
                continue;
            };
            if force {
                warn!(
                    slot = slot.id,
                    pid = slot.pid,
                    correlation_id = short_id(&correlation_id),
                    "Killing busy worker for restart"
                );
                slot.kill();
            } else {
                slot.retiring = true;
            }
            kept.push(slot);
        }
        self.slots = kept;
        self.restarts += 1;
        info!(replaced, force, restarts = self.restarts, "Worker pool restarted");
        self.dispatch();
        Ok(replaced)
    }

    fn begin_shutdown(&mut self, timeout: Duration, reply: oneshot::Sender<ShutdownReport>) {
        if let Some(drain) = &mut self.drain {
            drain.replies.push(reply);
            return;
        }
        self.closed = true;
        let started = Instant::now();
        info!(
            timeout_ms = timeout.as_millis() as u64,
            pending = self.pending.len(),
            queued = self.queue.len(),
            "Shutting down worker pool"
        );
        self.drain = Some(Drain {
            started,
            deadline: started + timeout,
            replies: vec![reply],
        });
        self.dispatch();
    }

    fn is_drained(&self) -> bool {
        self.drain.is_some()
            && self.queue.is_empty()
            && self.pending.is_empty()
            && self.exchanges.is_empty()
    }

    async fn finish_graceful(&mut self) {
        let Some(deadline) = self.drain.as_ref().map(|drain| drain.deadline) else {
            return;
        };
        for slot in std::mem::take(&mut self.slots) {
            self.retire(slot);
        }
        let reapers = &mut self.reapers;
        let reaped = tokio::time::timeout_at(deadline, async {
            while reapers.join_next().await.is_some() {}
        })
        .await;

        let mode = match reaped {
            Ok(()) => ShutdownMode::Graceful,
            Err(_) => {
                warn!("Workers still exiting at shutdown deadline, killing");
                self.reapers.shutdown().await;
                ShutdownMode::Forced
            }
        };
        self.report(mode, 0);
    }

    async fn finish_forced(&mut self) {
        warn!(
            pending = self.pending.len(),
            queued = self.queue.len(),
            "Shutdown deadline exceeded, killing workers"
        );
        let abandoned = self.kill_all().await;
        self.report(ShutdownMode::Forced, abandoned);
    }

    /// Kill every worker and fail all outstanding jobs. Returns how many jobs were failed.
    async fn kill_all(&mut self) -> usize {
        self.closed = true;
        self.exchanges.abort_all();
        for slot in std::mem::take(&mut self.slots) {
            let pid = slot.pid;
            self.exiting += 1;
            self.reapers
                .spawn(reap(slot.into_child(), pid, Duration::ZERO));
        }

        let mut abandoned = 0;
        for (correlation_id, pending) in self.pending.drain() {
            debug!(correlation_id = short_id(&correlation_id), "Failing in-flight job");
            let _ = pending.reply.send(Err(PoolError::Closed));
            abandoned += 1;
        }
        for queued in self.queue.drain(..) {
            let _ = queued.reply.send(Err(PoolError::Closed));
            abandoned += 1;
        }

        let reapers = &mut self.reapers;
        let reaped = tokio::time::timeout(KILL_REAP_TIMEOUT, async {
            while reapers.join_next().await.is_some() {}
        })
        .await;
        if reaped.is_err() {
            warn!("Timed out reaping killed workers");
            self.reapers.abort_all();
        }
        self.exchanges.shutdown().await;
        self.in_flight.clear();
        abandoned
    }

    fn report(&mut self, mode: ShutdownMode, abandoned: usize) {
        let Some(drain) = self.drain.take() else {
            return;
        };
        let report = ShutdownReport {
            mode,
            elapsed: drain.started.elapsed(),
            abandoned,
        };
        info!(
            mode = ?report.mode,
            elapsed_ms = report.elapsed.as_millis() as u64,
            abandoned,
            "Worker pool stopped"
        );
        for reply in drain.replies {
            let _ = reply.send(report.clone());
        }
        self.publish();
    }

    fn publish(&self) {
        let state = if self.drain.is_some() {
            PoolState::Draining
        } else if self.closed {
            PoolState::Closed
        } else {
            PoolState::Running
        };
        let activity = self.activity();
        self.status.send_replace(PoolStatus {
            state,
            size: self.config.size,
            workers: self.slots.len(),
            busy: activity.busy,
            pending: activity.pending,
            queued: activity.queued,
            worker_pids: activity.worker_pids,
            recycled: self.recycled,
            restarts: self.restarts,
        });
    }
}

#[cfg(test)]
#[path = "actor_test.rs"]
mod tests;
