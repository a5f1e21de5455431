//! Speech recognition backends.
//!
//! The recognizer is the opaque, possibly leaking, possibly blocking call the
//! worker process exists to contain. Backends convert their native results
//! into plain [`Segment`] records before returning, so nothing owned by the
//! native library outlives the call.

use anyhow::Result;
use speech_pool_common::Segment;
use std::path::Path;

use crate::config::{RecognizerBackend, RecognizerConfig};

mod scripted;
#[cfg(feature = "whisper")]
mod whisper;

pub use scripted::{Script, ScriptOutcome, ScriptedRecognizer};
#[cfg(feature = "whisper")]
pub use whisper::WhisperRecognizer;

/// Language value meaning "detect it".
pub const AUTO_LANGUAGE: &str = "auto";

/// Output of one recognizer call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Recognition {
    pub segments: Vec<Segment>,
    pub full_text: String,
    pub detected_language: String,
    pub speaker_count: Option<u32>,
}

impl Recognition {
    /// Build a recognition from segments, joining their text and counting speakers.
    pub fn from_segments(segments: Vec<Segment>, detected_language: impl Into<String>) -> Self {
        let full_text = segments
            .iter()
            .map(|s| s.text().trim())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        let mut speakers: Vec<&str> = segments.iter().filter_map(Segment::speaker_id).collect();
        speakers.sort_unstable();
        speakers.dedup();
        let speaker_count = (!speakers.is_empty()).then_some(speakers.len() as u32);

        Self {
            segments,
            full_text,
            detected_language: detected_language.into(),
            speaker_count,
        }
    }
}

/// Speech-to-text recognizer.
///
/// Implementations may leak native memory and may block without any way to
/// cancel them; callers run them inside a disposable worker process.
pub trait Recognizer: Send {
    /// Recognize speech in the audio file at `audio`.
    ///
    /// # Arguments
    /// * `audio` - Path to the input file
    /// * `language` - Language code (e.g. "en-US") or "auto"
    fn recognize(&mut self, audio: &Path, language: &str) -> Result<Recognition>;
}

/// Create the recognizer selected by the configuration.
pub fn build(config: &RecognizerConfig) -> Result<Box<dyn Recognizer>> {
    match config.backend {
        RecognizerBackend::Scripted => Ok(Box::new(ScriptedRecognizer::new())),
        RecognizerBackend::Whisper => build_whisper(config),
    }
}

#[cfg(feature = "whisper")]
fn build_whisper(config: &RecognizerConfig) -> Result<Box<dyn Recognizer>> {
    use anyhow::Context;

    let model_path = config
        .model_path
        .as_ref()
        .context("recognizer.model_path is required for the whisper backend")?;
    Ok(Box::new(WhisperRecognizer::new(model_path, config.threads)?))
}

#[cfg(not(feature = "whisper"))]
fn build_whisper(_config: &RecognizerConfig) -> Result<Box<dyn Recognizer>> {
    anyhow::bail!("whisper backend not available: built without the `whisper` feature")
}
