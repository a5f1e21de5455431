//! Coordinator-side bookkeeping for one worker process.

use std::ffi::OsString;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use speech_pool_common::wire::{WireError, WorkerReply, WorkerRequest, recv_frame, send_frame};
use speech_pool_common::Job;
use tokio::io::BufReader;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, warn};

use super::PoolError;

/// Lifecycle of a slot. Retired slots are removed from the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SlotState {
    Idle,
    Busy { correlation_id: String },
    Dead,
}

/// Pipes to a worker. Moved into the exchange task while a job runs.
pub(crate) struct WorkerIo {
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

pub(crate) struct WorkerSlot {
    pub id: u64,
    pub pid: u32,
    pub tasks_completed: u32,
    pub state: SlotState,
    /// Retire after the current job instead of returning to idle.
    pub retiring: bool,
    child: Child,
    io: Option<WorkerIo>,
}

impl WorkerSlot {
    pub fn spawn(id: u64, program: &Path, args: &[OsString]) -> Result<Self, PoolError> {
        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        // Keep workers out of the terminal's process group so Ctrl+C reaches
        // only the coordinator, which then shuts them down in order.
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command
            .spawn()
            .map_err(|e| PoolError::Spawn(format!("{}: {e}", program.display())))?;
        let pid = child
            .id()
            .ok_or_else(|| PoolError::Spawn("worker exited during startup".to_string()))?;
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(PoolError::Spawn("worker pipes unavailable".to_string()));
        };

        debug!(slot = id, pid, "Worker spawned");
        Ok(Self {
            id,
            pid,
            tasks_completed: 0,
            state: SlotState::Idle,
            retiring: false,
            child,
            io: Some(WorkerIo {
                stdin,
                stdout: BufReader::new(stdout),
            }),
        })
    }

    /// Non-blocking liveness check.
    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    pub fn take_io(&mut self) -> Option<WorkerIo> {
        self.io.take()
    }

    pub fn restore_io(&mut self, io: WorkerIo) {
        self.io = Some(io);
    }

    /// Send SIGKILL without waiting.
    pub fn kill(&mut self) {
        if let Err(e) = self.child.start_kill() {
            debug!(slot = self.id, pid = self.pid, error = %e, "Kill failed, worker already gone");
        }
        self.state = SlotState::Dead;
    }

    /// Close the worker's stdin and hand back the process for reaping.
    pub fn into_child(self) -> Child {
        drop(self.io);
        self.child
    }
}

/// Result of one request/reply round trip with a worker.
pub(crate) struct Exchange {
    pub slot_id: u64,
    pub correlation_id: String,
    pub reply: Result<WorkerReply, WireError>,
    pub io: WorkerIo,
}

/// Write `job` to the worker and wait for its reply.
pub(crate) async fn exchange(slot_id: u64, mut io: WorkerIo, job: Job) -> Exchange {
    let correlation_id = job.correlation_id.clone();
    let reply: Result<WorkerReply, WireError> = async {
        send_frame(&mut io.stdin, &WorkerRequest::Run(job)).await?;
        recv_frame(&mut io.stdout).await
    }
    .await;
    Exchange {
        slot_id,
        correlation_id,
        reply,
        io,
    }
}

/// Wait up to `grace` for a worker to exit on its own, then kill it.
pub(crate) async fn reap(mut child: Child, pid: u32, grace: Duration) {
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => debug!(pid, %status, "Worker exited"),
        Ok(Err(e)) => warn!(pid, error = %e, "Failed to wait for worker"),
        Err(_) => {
            if !grace.is_zero() {
                warn!(pid, grace_ms = grace.as_millis() as u64, "Worker did not exit, killing");
            }
            if let Err(e) = child.kill().await {
                warn!(pid, error = %e, "Failed to kill worker");
            }
        }
    }
}
