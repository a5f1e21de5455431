//! Job and result records exchanged between the coordinator and workers.
//!
//! Everything here crosses a process boundary, so every type is a plain
//! serializable record: no handles, no references into the other side's memory.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Timing key for the recognizer call itself.
pub const TIMING_RECOGNITION: &str = "recognition_seconds";
/// Timing key for converting recognizer output into wire records.
pub const TIMING_SERIALIZATION: &str = "serialization_seconds";
/// Timing key for the whole job inside the worker.
pub const TIMING_TOTAL: &str = "total_seconds";

/// One unit of work: transcribe `input_path` within `deadline`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub input_path: PathBuf,
    pub language: String,
    pub correlation_id: String,
    /// Inner deadline, enforced by the worker process.
    pub deadline: Duration,
}

impl Job {
    pub fn new(
        input_path: impl Into<PathBuf>,
        language: impl Into<String>,
        correlation_id: impl Into<String>,
        deadline: Duration,
    ) -> Self {
        Self {
            input_path: input_path.into(),
            language: language.into(),
            correlation_id: correlation_id.into(),
            deadline,
        }
    }

    /// First eight characters of the correlation id, used as a log field.
    pub fn short_id(&self) -> &str {
        short_id(&self.correlation_id)
    }
}

/// Shorten a correlation id for log lines.
pub fn short_id(id: &str) -> &str {
    match id.char_indices().nth(8) {
        Some((idx, _)) => &id[..idx],
        None => id,
    }
}

/// Why a segment could not be constructed.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SegmentError {
    #[error("start time must be a finite value >= 0, got {0}")]
    NegativeStart(f64),
    #[error("end time {end} is before start time {start}")]
    EndBeforeStart { start: f64, end: f64 },
    #[error("confidence must be within [0, 1], got {0}")]
    ConfidenceOutOfRange(f64),
}

/// Raw segment fields as they appear on the wire, before validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SegmentFields {
    text: String,
    start_time: f64,
    end_time: f64,
    confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    speaker_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    language: Option<String>,
}

/// A transcribed span of audio. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "SegmentFields", into = "SegmentFields")]
pub struct Segment {
    text: String,
    start_time: f64,
    end_time: f64,
    confidence: f64,
    speaker_id: Option<String>,
    language: Option<String>,
}

impl Segment {
    /// Create a segment, validating timestamps and confidence.
    pub fn new(
        text: impl Into<String>,
        start_time: f64,
        end_time: f64,
        confidence: f64,
    ) -> Result<Self, SegmentError> {
        if !start_time.is_finite() || start_time < 0.0 {
            return Err(SegmentError::NegativeStart(start_time));
        }
        if !end_time.is_finite() || end_time < start_time {
            return Err(SegmentError::EndBeforeStart {
                start: start_time,
                end: end_time,
            });
        }
        if !(0.0..=1.0).contains(&confidence) {
            return Err(SegmentError::ConfidenceOutOfRange(confidence));
        }
        Ok(Self {
            text: text.into(),
            start_time,
            end_time,
            confidence,
            speaker_id: None,
            language: None,
        })
    }

    pub fn with_speaker(mut self, speaker_id: impl Into<String>) -> Self {
        self.speaker_id = Some(speaker_id.into());
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn start_time(&self) -> f64 {
        self.start_time
    }

    pub fn end_time(&self) -> f64 {
        self.end_time
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    pub fn speaker_id(&self) -> Option<&str> {
        self.speaker_id.as_deref()
    }

    pub fn language(&self) -> Option<&str> {
        self.language.as_deref()
    }
}

impl TryFrom<SegmentFields> for Segment {
    type Error = SegmentError;

    fn try_from(fields: SegmentFields) -> Result<Self, Self::Error> {
        let mut segment = Segment::new(
            fields.text,
            fields.start_time,
            fields.end_time,
            fields.confidence,
        )?;
        segment.speaker_id = fields.speaker_id;
        segment.language = fields.language;
        Ok(segment)
    }
}

impl From<Segment> for SegmentFields {
    fn from(segment: Segment) -> Self {
        Self {
            text: segment.text,
            start_time: segment.start_time,
            end_time: segment.end_time,
            confidence: segment.confidence,
            speaker_id: segment.speaker_id,
            language: segment.language,
        }
    }
}

/// Successful transcription of one job.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Transcript {
    pub segments: Vec<Segment>,
    pub full_text: String,
    pub detected_language: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speaker_count: Option<u32>,
    /// Named durations in seconds, see the `TIMING_*` keys.
    #[serde(default)]
    pub timings: BTreeMap<String, f64>,
}

impl Transcript {
    /// Audio duration covered by the segments (latest end time).
    pub fn audio_duration(&self) -> f64 {
        self.segments
            .iter()
            .map(Segment::end_time)
            .fold(0.0, f64::max)
    }

    /// Mean segment confidence, 0 when there are no segments.
    pub fn confidence_average(&self) -> f64 {
        if self.segments.is_empty() {
            return 0.0;
        }
        let sum: f64 = self.segments.iter().map(Segment::confidence).sum();
        sum / self.segments.len() as f64
    }

    /// Time spent in the worker, preferring the total if it was recorded.
    pub fn processing_time(&self) -> f64 {
        if let Some(total) = self.timings.get(TIMING_TOTAL) {
            return *total;
        }
        self.timings.values().sum()
    }
}

/// Category of a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The inner deadline fired before the recognizer returned.
    Timeout,
    /// The recognizer panicked or the worker process died.
    Crash,
    /// The recognizer returned an error.
    Unhandled,
}

/// Failed job with enough detail to log a diagnosis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobFailure {
    pub kind: FailureKind,
    pub message: String,
    /// Backtrace or error chain. Logged, not shown to callers.
    #[serde(default)]
    pub diagnostic_trace: String,
}

impl JobFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            diagnostic_trace: String::new(),
        }
    }

    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        self.diagnostic_trace = trace.into();
        self
    }

    /// Message safe to hand to an untrusted caller.
    pub fn user_message(&self) -> String {
        match self.kind {
            FailureKind::Timeout => {
                format!("Transcription timed out, please retry: {}", self.message)
            }
            FailureKind::Crash | FailureKind::Unhandled => {
                format!("Transcription failed: {}", self.message)
            }
        }
    }
}

/// Outcome of one job: exactly one variant, never both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobResult {
    Success(Transcript),
    Failure(JobFailure),
}

impl JobResult {
    pub fn failure(kind: FailureKind, message: impl Into<String>) -> Self {
        JobResult::Failure(JobFailure::new(kind, message))
    }

    pub fn is_success(&self) -> bool {
        matches!(self, JobResult::Success(_))
    }

    pub fn as_failure(&self) -> Option<&JobFailure> {
        match self {
            JobResult::Success(_) => None,
            JobResult::Failure(failure) => Some(failure),
        }
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            JobResult::Success(_) => None,
            JobResult::Failure(failure) => Some(failure.kind),
        }
    }
}

#[cfg(test)]
#[path = "job_test.rs"]
mod tests;
