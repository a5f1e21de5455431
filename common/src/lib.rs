//! Types and protocol shared by the speech-pool coordinator and its workers.

pub mod dirs;
pub mod job;
pub mod wire;

pub use job::{FailureKind, Job, JobFailure, JobResult, Segment, SegmentError, Transcript};
