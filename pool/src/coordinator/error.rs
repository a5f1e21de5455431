use std::time::Duration;

use thiserror::Error;

/// Coordinator-level failures surfaced to callers of the pool.
///
/// Worker-side problems never show up here: they arrive as
/// [`JobResult::Failure`](speech_pool_common::JobResult::Failure).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("job {correlation_id} got no answer within {waited:?}")]
    Timeout {
        correlation_id: String,
        waited: Duration,
    },
    #[error("worker pool is closed")]
    Closed,
    #[error("worker pool is saturated ({queued} jobs waiting)")]
    Exhausted { queued: usize },
    #[error("job {0} is already queued or running")]
    Duplicate(String),
    #[error("failed to spawn worker: {0}")]
    Spawn(String),
}

impl PoolError {
    /// Whether the same job may succeed if submitted again later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PoolError::Timeout { .. } | PoolError::Exhausted { .. })
    }

    /// Message safe to hand to an untrusted caller.
    pub fn user_message(&self) -> String {
        if self.is_retryable() {
            "Transcription service is busy, please retry".to_string()
        } else {
            "Transcription failed: service unavailable".to_string()
        }
    }
}
