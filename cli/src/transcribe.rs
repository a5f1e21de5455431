//! `spctl transcribe`: submit files concurrently and print results as they finish.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;
use serde_json::{Value, json};
use speech_pool_common::JobResult;
use speech_pool_core::{PoolError, WorkerPool};
use tempfile::TempDir;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

#[derive(Debug, Args)]
pub struct TranscribeArgs {
    /// Audio files to transcribe
    #[arg(required = true)]
    pub files: Vec<PathBuf>,

    /// Language code, or "auto" to detect it
    #[arg(long, default_value = "auto")]
    pub language: String,

    /// Include worker diagnostics in failed results
    #[arg(long)]
    pub verbose: bool,
}

/// One submitted file.
struct Submission {
    file: PathBuf,
    staged: PathBuf,
    correlation_id: String,
}

/// Copy `file` into `staging` under a unique name. Workers delete their input.
fn stage(staging: &Path, file: &Path, correlation_id: &str) -> Result<PathBuf> {
    let mut name = correlation_id.to_string();
    if let Some(ext) = file.extension().and_then(|ext| ext.to_str()) {
        name.push('.');
        name.push_str(ext);
    }
    let staged = staging.join(name);
    std::fs::copy(file, &staged)
        .with_context(|| format!("Failed to stage input: {}", file.display()))?;
    Ok(staged)
}

/// JSON line describing one outcome.
fn outcome_line(
    file: &Path,
    correlation_id: &str,
    outcome: &Result<JobResult, PoolError>,
    verbose: bool,
) -> Value {
    let file = file.display().to_string();
    match outcome {
        Ok(JobResult::Success(transcript)) => json!({
            "file": file,
            "correlation_id": correlation_id,
            "status": "success",
            "transcript": transcript,
            "audio_duration": transcript.audio_duration(),
            "confidence_average": transcript.confidence_average(),
        }),
        Ok(JobResult::Failure(failure)) => {
            let mut line = json!({
                "file": file,
                "correlation_id": correlation_id,
                "status": "failure",
                "kind": failure.kind,
                "error": failure.user_message(),
            });
            if verbose {
                line["message"] = json!(failure.message);
                line["diagnostic_trace"] = json!(failure.diagnostic_trace);
            }
            line
        }
        Err(e) => {
            let mut line = json!({
                "file": file,
                "correlation_id": correlation_id,
                "status": "error",
                "retryable": e.is_retryable(),
                "error": e.user_message(),
            });
            if verbose {
                line["message"] = json!(e.to_string());
            }
            line
        }
    }
}

fn succeeded(outcome: &Result<JobResult, PoolError>) -> bool {
    matches!(outcome, Ok(result) if result.is_success())
}

/// Returns whether every file was transcribed.
pub async fn run(pool: WorkerPool, args: TranscribeArgs) -> Result<bool> {
    let staging = TempDir::new().context("Failed to create staging directory")?;
    let mut jobs = JoinSet::new();

    for file in args.files {
        let correlation_id = uuid::Uuid::new_v4().to_string();
        let staged = stage(staging.path(), &file, &correlation_id)?;
        let job = pool.job(&staged, &args.language, &correlation_id);
        let submission = Submission {
            file,
            staged,
            correlation_id,
        };
        let pool = pool.clone();
        jobs.spawn(async move {
            let outcome = pool.submit(job).await;
            (submission, outcome)
        });
    }
    info!(files = jobs.len(), language = %args.language, "Submitted files");

    let mut all_succeeded = true;
    loop {
        let joined = tokio::select! {
            joined = jobs.join_next() => joined,
            _ = tokio::signal::ctrl_c() => {
                warn!(remaining = jobs.len(), "Interrupted, shutting down pool");
                all_succeeded = false;
                pool.shutdown(pool.config().shutdown_timeout()).await;
                continue;
            }
        };
        let Some(joined) = joined else {
            break;
        };
        let (submission, outcome) = joined.context("Submission task failed")?;

        all_succeeded &= succeeded(&outcome);
        let line = outcome_line(
            &submission.file,
            &submission.correlation_id,
            &outcome,
            args.verbose,
        );
        println!("{line}");

        // Normally already deleted by the worker
        if submission.staged.exists() {
            debug!(path = %submission.staged.display(), "Removing staged input");
            let _ = std::fs::remove_file(&submission.staged);
        }
    }
    Ok(all_succeeded)
}
