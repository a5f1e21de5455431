//! Worker process entry point.
//!
//! A worker reads [`WorkerRequest`] frames from stdin, runs each job against
//! the recognizer under the job's deadline, and writes one [`WorkerReply`]
//! per job to stdout. From the coordinator's point of view every job maps to
//! exactly one reply: errors, panics and deadline overruns all come back as
//! [`JobResult::Failure`].
//!
//! The recognizer runs on its own thread so the deadline can fire while it is
//! stuck in native code. A thread cannot be cancelled, so after a timeout the
//! worker reports the failure and exits; the OS reclaims whatever the stuck
//! call was holding.

use std::ffi::OsString;
use std::io::{self, Read, Write};
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use speech_pool_common::job::{TIMING_RECOGNITION, TIMING_SERIALIZATION, TIMING_TOTAL};
use speech_pool_common::wire::{WorkerReply, WorkerRequest, read_frame, write_frame};
use speech_pool_common::{FailureKind, Job, JobFailure, JobResult, Transcript};
use tracing::{error, info, warn};

use crate::config::{Config, LogLevel, RecognizerBackend, RecognizerConfig};
use crate::logging;
use crate::recognize::{self, Recognition, Recognizer};

/// Command line of the worker binary, built by the coordinator from its config.
#[derive(Debug, Clone, Parser)]
#[command(name = "spworker")]
#[command(about = "speech-pool worker process, spawned by the pool coordinator")]
#[command(version)]
pub struct WorkerArgs {
    /// Recognizer backend
    #[arg(long, value_enum, default_value_t = RecognizerBackend::Scripted)]
    pub backend: RecognizerBackend,
    /// Model file for the whisper backend
    #[arg(long)]
    pub model: Option<PathBuf>,
    /// Inference threads
    #[arg(long, default_value_t = 4)]
    pub threads: u16,
    /// Log level when SPEECH_POOL_LOG is not set
    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,
}

impl WorkerArgs {
    /// Arguments to pass to a worker for the given configuration.
    pub fn command_line(config: &Config) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "--backend".into(),
            config.recognizer.backend.as_str().into(),
            "--threads".into(),
            config.recognizer.threads.to_string().into(),
            "--log-level".into(),
            config.logging.level.as_str().into(),
        ];
        if let Some(model) = &config.recognizer.model_path {
            args.push("--model".into());
            args.push(model.clone().into_os_string());
        }
        args
    }

    pub fn recognizer_config(&self) -> RecognizerConfig {
        RecognizerConfig {
            backend: self.backend,
            model_path: self.model.clone(),
            threads: self.threads,
        }
    }
}

/// Why [`serve`] stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeExit {
    /// stdin closed: the coordinator retired this worker.
    InputClosed,
    /// A job overran its deadline and its recognizer thread may still be running.
    DeadlineExceeded,
}

/// Outcome of one job plus the recognizer, if it is still safe to reuse.
pub struct Execution {
    pub result: JobResult,
    pub recognizer: Option<Box<dyn Recognizer>>,
}

static LAST_PANIC: Mutex<Option<String>> = Mutex::new(None);

/// Record location and backtrace of panics so they can be attached to the failure.
pub fn install_panic_hook() {
    panic::set_hook(Box::new(|info| {
        let backtrace = std::backtrace::Backtrace::force_capture();
        let trace = format!("{info}\n{backtrace}");
        if let Ok(mut slot) = LAST_PANIC.lock() {
            *slot = Some(trace);
        }
    }));
}

fn take_panic_trace() -> String {
    LAST_PANIC
        .lock()
        .ok()
        .and_then(|mut slot| slot.take())
        .unwrap_or_default()
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "recognizer panicked".to_string()
    }
}

fn transcript_from(recognition: Recognition, recognition_secs: f64) -> Transcript {
    let converted = Instant::now();
    let mut transcript = Transcript {
        segments: recognition.segments,
        full_text: recognition.full_text,
        detected_language: recognition.detected_language,
        speaker_count: recognition.speaker_count,
        ..Transcript::default()
    };
    transcript
        .timings
        .insert(TIMING_RECOGNITION.to_string(), recognition_secs);
    transcript.timings.insert(
        TIMING_SERIALIZATION.to_string(),
        converted.elapsed().as_secs_f64(),
    );
    transcript
}

/// Run one job on a dedicated thread, bounded by `job.deadline`.
pub fn run_job(job: &Job, mut recognizer: Box<dyn Recognizer>) -> Execution {
    let started = Instant::now();
    let (tx, rx) = mpsc::channel();
    let path = job.input_path.clone();
    let language = job.language.clone();

    let spawned = thread::Builder::new()
        .name("recognizer".to_string())
        .spawn(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                recognizer.recognize(&path, &language)
            }));
            let _ = tx.send((outcome, recognizer));
        });
    if let Err(e) = spawned {
        return Execution {
            result: JobResult::Failure(
                JobFailure::new(FailureKind::Crash, "failed to start recognizer thread")
                    .with_trace(e.to_string()),
            ),
            recognizer: None,
        };
    }

    let mut execution = match rx.recv_timeout(job.deadline) {
        Ok((Ok(Ok(recognition)), recognizer)) => Execution {
            result: JobResult::Success(transcript_from(
                recognition,
                started.elapsed().as_secs_f64(),
            )),
            recognizer: Some(recognizer),
        },
        Ok((Ok(Err(err)), recognizer)) => Execution {
            result: JobResult::Failure(
                JobFailure::new(FailureKind::Unhandled, err.to_string())
                    .with_trace(format!("{err:?}")),
            ),
            recognizer: Some(recognizer),
        },
        // State after a panic is unknown; a fresh recognizer is built for the next job.
        Ok((Err(payload), _)) => Execution {
            result: JobResult::Failure(
                JobFailure::new(FailureKind::Crash, panic_message(payload.as_ref()))
                    .with_trace(take_panic_trace()),
            ),
            recognizer: None,
        },
        Err(RecvTimeoutError::Timeout) => Execution {
            result: JobResult::failure(
                FailureKind::Timeout,
                format!(
                    "Transcription exceeded timeout of {} seconds",
                    job.deadline.as_secs_f64()
                ),
            ),
            recognizer: None,
        },
        Err(RecvTimeoutError::Disconnected) => Execution {
            result: JobResult::failure(
                FailureKind::Crash,
                "recognizer thread exited without a result",
            ),
            recognizer: None,
        },
    };

    if let JobResult::Success(transcript) = &mut execution.result {
        transcript
            .timings
            .insert(TIMING_TOTAL.to_string(), started.elapsed().as_secs_f64());
    }
    execution
}

/// Best-effort removal of the job's input file.
fn remove_input(job: &Job) {
    match std::fs::remove_file(&job.input_path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(
            correlation_id = job.short_id(),
            path = %job.input_path.display(),
            error = %e,
            "Failed to delete input file"
        ),
    }
}

/// Serve jobs from `reader` until it closes or a job overruns its deadline.
///
/// `make_recognizer` is called lazily, once per process unless a job panics.
pub fn serve<R, W, F>(reader: &mut R, writer: &mut W, mut make_recognizer: F) -> Result<ServeExit>
where
    R: Read,
    W: Write,
    F: FnMut() -> Result<Box<dyn Recognizer>>,
{
    let pid = std::process::id();
    let mut recognizer: Option<Box<dyn Recognizer>> = None;

    loop {
        let request: Option<WorkerRequest> =
            read_frame(reader).context("Failed to read job from coordinator")?;
        let Some(WorkerRequest::Run(job)) = request else {
            info!(pid, "Input closed, worker exiting");
            return Ok(ServeExit::InputClosed);
        };

        info!(
            correlation_id = job.short_id(),
            pid,
            language = %job.language,
            deadline_secs = job.deadline.as_secs_f64(),
            "Job started"
        );

        let instance = match recognizer.take() {
            Some(instance) => Ok(instance),
            None => make_recognizer(),
        };
        let execution = match instance {
            Ok(instance) => run_job(&job, instance),
            Err(err) => Execution {
                result: JobResult::Failure(
                    JobFailure::new(
                        FailureKind::Unhandled,
                        format!("recognizer unavailable: {err}"),
                    )
                    .with_trace(format!("{err:?}")),
                ),
                recognizer: None,
            },
        };
        remove_input(&job);
        recognizer = execution.recognizer;

        let deadline_exceeded = execution.result.failure_kind() == Some(FailureKind::Timeout);
        match &execution.result {
            JobResult::Success(transcript) => info!(
                correlation_id = job.short_id(),
                pid,
                segments = transcript.segments.len(),
                "Job completed"
            ),
            JobResult::Failure(failure) => error!(
                correlation_id = job.short_id(),
                pid,
                kind = ?failure.kind,
                message = %failure.message,
                "Job failed"
            ),
        }

        let reply = WorkerReply {
            correlation_id: job.correlation_id,
            pid,
            result: execution.result,
        };
        write_frame(writer, &reply).context("Failed to write result to coordinator")?;

        if deadline_exceeded {
            warn!(pid, "Deadline exceeded, worker exiting");
            return Ok(ServeExit::DeadlineExceeded);
        }
    }
}

/// Run the worker process on stdin/stdout.
pub fn run(args: WorkerArgs) -> Result<()> {
    logging::init_worker(args.log_level)?;
    install_panic_hook();
    #[cfg(feature = "whisper")]
    whisper_rs::install_logging_hooks();

    let config = args.recognizer_config();
    info!(pid = std::process::id(), backend = config.backend.as_str(), "Worker started");

    let stdin = io::stdin();
    let stdout = io::stdout();
    let exit = serve(&mut stdin.lock(), &mut stdout.lock(), || {
        recognize::build(&config)
    })?;

    info!(pid = std::process::id(), reason = ?exit, "Worker stopped");
    Ok(())
}

#[cfg(test)]
#[path = "worker_test.rs"]
mod tests;
