//! Whisper recognition backend.
//!
//! Uses whisper.cpp via whisper-rs for speech-to-text.

use super::{AUTO_LANGUAGE, Recognition, Recognizer};
use crate::audio;
use anyhow::{Context, Result};
use speech_pool_common::Segment;
use std::path::Path;
use tracing::{debug, info};
use whisper_rs::{
    FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters, WhisperState,
};

/// Whisper speech-to-text recognizer.
///
/// The underlying WhisperContext is leaked intentionally: it lives as long as
/// the worker process, and the process is recycled by the pool.
pub struct WhisperRecognizer {
    state: WhisperState,
    threads: u16,
}

impl WhisperRecognizer {
    /// Load a Whisper model.
    ///
    /// # Arguments
    /// * `model_path` - Path to the Whisper GGML model file
    /// * `threads` - Inference threads
    pub fn new(model_path: impl AsRef<Path>, threads: u16) -> Result<Self> {
        info!(
            path = %model_path.as_ref().display(),
            threads,
            "Loading Whisper model"
        );

        let ctx = WhisperContext::new_with_params(
            model_path.as_ref().to_str().context("Invalid model path")?,
            WhisperContextParameters::default(),
        )
        .context("Failed to load Whisper model")?;

        let ctx_ref: &'static WhisperContext = Box::leak(Box::new(ctx));

        let state = ctx_ref
            .create_state()
            .context("Failed to create Whisper state")?;

        info!("Whisper model and state loaded successfully");

        Ok(Self { state, threads })
    }
}

/// Whisper wants "en", not "en-US".
fn whisper_language(language: &str) -> Option<String> {
    if language == AUTO_LANGUAGE {
        return None;
    }
    language
        .split(['-', '_'])
        .next()
        .map(|code| code.to_lowercase())
}

impl Recognizer for WhisperRecognizer {
    fn recognize(&mut self, path: &Path, language: &str) -> Result<Recognition> {
        let audio = audio::load_for_recognition(path)?;
        debug!(
            samples = audio.samples.len(),
            duration_secs = audio.duration_secs(),
            "Recognizing audio with Whisper"
        );

        let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });

        let lang = whisper_language(language);
        params.set_language(lang.as_deref());
        params.set_n_threads(i32::from(self.threads));

        params.set_print_special(false);
        params.set_print_progress(false);
        params.set_print_realtime(false);
        params.set_print_timestamps(false);

        self.state
            .full(params, &audio.samples)
            .context("Whisper inference failed")?;

        let detected_language = match lang {
            Some(code) => code,
            None => self
                .state
                .full_lang_id_from_state()
                .ok()
                .and_then(whisper_rs::get_lang_str)
                .unwrap_or("und")
                .to_string(),
        };

        // Convert everything to owned records before the state is reused.
        let num_segments = self.state.full_n_segments();
        let mut segments = Vec::new();
        for i in 0..num_segments {
            let Some(segment) = self.state.get_segment(i) else {
                continue;
            };
            let Ok(text) = segment.to_str_lossy() else {
                continue;
            };
            // Timestamps are in centiseconds
            let start = segment.start_timestamp().max(0) as f64 / 100.0;
            let end = (segment.end_timestamp().max(0) as f64 / 100.0).max(start);
            let confidence = f64::from(1.0 - segment.no_speech_probability()).clamp(0.0, 1.0);
            segments.push(
                Segment::new(text.trim(), start, end, confidence)?
                    .with_language(detected_language.clone()),
            );
        }

        debug!(segments = segments.len(), "Recognition complete");

        Ok(Recognition::from_segments(segments, detected_language))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_whisper_language_codes() {
        assert_eq!(whisper_language("auto"), None);
        assert_eq!(whisper_language("en-US").as_deref(), Some("en"));
        assert_eq!(whisper_language("ar_AE").as_deref(), Some("ar"));
        assert_eq!(whisper_language("DE").as_deref(), Some("de"));
    }
}
