//! Scripted recognizer backend.
//!
//! Interprets the input file as a TOML script describing how the "recognition"
//! behaves: how long it takes, how much memory it leaks, whether it fails,
//! panics, hangs or takes the whole process down. Lets the pool be exercised
//! end to end without a speech model.
//!
//! ```toml
//! outcome = "success"
//! delay_ms = 250
//! spin_ms = 0
//! leak_bytes = 1048576
//! detected_language = "en-US"
//!
//! [[segments]]
//! text = "hello there"
//! start_time = 0.0
//! end_time = 1.4
//! confidence = 0.92
//! speaker_id = "spk_0"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use speech_pool_common::Segment;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::{AUTO_LANGUAGE, Recognition, Recognizer};

/// What the scripted call does after its delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ScriptOutcome {
    #[default]
    Success,
    /// Return an error.
    Error,
    /// Panic inside the recognizer.
    Panic,
    /// Block forever, ignoring any deadline.
    Hang,
    /// Abort the whole process, like a segfault in native code.
    Abort,
}

/// A recognition script.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Script {
    pub outcome: ScriptOutcome,
    pub delay_ms: u64,
    /// Burn CPU for this long, like a native call stuck in a busy loop.
    pub spin_ms: u64,
    /// Bytes deliberately leaked per call, imitating a leaking native SDK.
    pub leak_bytes: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Defaults to the requested language, or "und" when it was "auto".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detected_language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speaker_count: Option<u32>,
    pub segments: Vec<Segment>,
}

impl Script {
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse recognition script")
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string(self).context("Failed to serialize recognition script")
    }
}

/// Recognizer driven by [`Script`] files.
#[derive(Debug, Default)]
pub struct ScriptedRecognizer {
    calls: u64,
}

impl ScriptedRecognizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of calls served by this instance.
    pub fn calls(&self) -> u64 {
        self.calls
    }
}

impl Recognizer for ScriptedRecognizer {
    fn recognize(&mut self, audio: &Path, language: &str) -> Result<Recognition> {
        self.calls += 1;
        let content = std::fs::read_to_string(audio)
            .with_context(|| format!("Failed to read script: {}", audio.display()))?;
        let script = Script::parse(&content)?;
        debug!(outcome = ?script.outcome, delay_ms = script.delay_ms, "Running script");

        if script.leak_bytes > 0 {
            let leaked: &'static mut [u8] = Box::leak(vec![1u8; script.leak_bytes].into_boxed_slice());
            debug!(bytes = leaked.len(), "Leaked buffer");
        }

        if script.delay_ms > 0 {
            std::thread::sleep(Duration::from_millis(script.delay_ms));
        }

        if script.spin_ms > 0 {
            let until = Instant::now() + Duration::from_millis(script.spin_ms);
            let mut spins: u64 = 0;
            while Instant::now() < until {
                spins = std::hint::black_box(spins.wrapping_add(1));
            }
            debug!(spins, "Spin finished");
        }

        let message = script
            .message
            .clone()
            .unwrap_or_else(|| "scripted failure".to_string());

        match script.outcome {
            ScriptOutcome::Success => {}
            ScriptOutcome::Error => anyhow::bail!(message),
            ScriptOutcome::Panic => panic!("{message}"),
            ScriptOutcome::Hang => loop {
                std::thread::park();
            },
            ScriptOutcome::Abort => {
                warn!("Script requested process abort");
                std::process::abort();
            }
        }

        let detected_language = script.detected_language.unwrap_or_else(|| {
            if language == AUTO_LANGUAGE {
                "und".to_string()
            } else {
                language.to_string()
            }
        });
        let mut recognition = Recognition::from_segments(script.segments, detected_language);
        if script.speaker_count.is_some() {
            recognition.speaker_count = script.speaker_count;
        }
        Ok(recognition)
    }
}
