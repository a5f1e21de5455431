//! Configuration management for speech-pool.
//!
//! Handles loading, saving, and providing defaults for the pool configuration.

use anyhow::{Context, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the worker binary looked up next to the current executable.
pub const WORKER_BINARY: &str = "spworker";

/// Main configuration struct.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub pool: PoolConfig,
    pub recognizer: RecognizerConfig,
    pub metrics: MetricsConfig,
    pub logging: LoggingConfig,
}

/// Worker pool sizing, deadlines and recycling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of worker processes.
    pub size: usize,
    /// Jobs a worker handles before it is retired and replaced.
    pub recycle_quota: u32,
    /// Deadline enforced inside the worker against the recognizer call.
    pub inner_timeout_secs: u64,
    /// Extra time the coordinator waits beyond the inner deadline.
    pub outer_margin_secs: u64,
    /// Interval of the idle and drain wait loops.
    pub poll_interval_ms: u64,
    /// Jobs allowed to wait for a free worker before submissions are refused.
    pub queue_capacity: usize,
    /// Graceful drain window used on application shutdown.
    pub shutdown_timeout_secs: u64,
    /// Worker CPU percentage above which the pool is not considered idle.
    pub idle_cpu_threshold: f32,
    /// Worker executable. Defaults to `spworker` next to the current executable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_program: Option<PathBuf>,
}

/// Which recognizer the workers run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecognizerConfig {
    pub backend: RecognizerBackend,
    /// GGML model file for the whisper backend.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_path: Option<PathBuf>,
    /// Inference threads per worker.
    pub threads: u16,
}

/// Supported recognizer backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RecognizerBackend {
    /// Reads a TOML script from the input file. For smoke and load tests.
    #[default]
    Scripted,
    /// whisper.cpp via whisper-rs (requires the `whisper` feature).
    Whisper,
}

impl RecognizerBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecognizerBackend::Scripted => "scripted",
            RecognizerBackend::Whisper => "whisper",
        }
    }
}

/// Background resource sampling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub interval_secs: u64,
    /// Delay before the first sample, so workers have time to start.
    pub startup_delay_secs: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "error", "warn", "info", "debug", "trace".
    pub level: LogLevel,
    /// Also write logs to the state directory.
    pub file: bool,
}

/// Log verbosity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }

    /// Filter directive covering the speech-pool crates.
    pub fn as_directive(&self) -> String {
        let level = self.as_str();
        format!("speech_pool_core={level},spctl={level},speech_pool_common={level}")
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 4,
            recycle_quota: 100,
            inner_timeout_secs: 300,
            outer_margin_secs: 10,
            poll_interval_ms: 100,
            queue_capacity: 256,
            shutdown_timeout_secs: 30,
            idle_cpu_threshold: 1.0,
            worker_program: None,
        }
    }
}

impl Default for RecognizerConfig {
    fn default() -> Self {
        Self {
            backend: RecognizerBackend::default(),
            model_path: None,
            threads: 4,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            interval_secs: 15,
            startup_delay_secs: 5,
        }
    }
}

impl PoolConfig {
    pub fn inner_timeout(&self) -> Duration {
        Duration::from_secs(self.inner_timeout_secs)
    }

    pub fn outer_margin(&self) -> Duration {
        Duration::from_secs(self.outer_margin_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Resolve the worker executable path.
    pub fn worker_program(&self) -> Result<PathBuf> {
        if let Some(path) = &self.worker_program {
            return Ok(path.clone());
        }
        let path = std::env::current_exe()
            .context("Failed to locate current executable")?
            .parent()
            .context("Current executable has no parent directory")?
            .join(WORKER_BINARY);
        if !path.exists() {
            anyhow::bail!("Worker binary not found at: {}", path.display());
        }
        Ok(path)
    }

    /// Check invariants the pool relies on.
    pub fn validate(&self) -> Result<()> {
        if self.size == 0 {
            anyhow::bail!("pool.size must be at least 1");
        }
        if self.recycle_quota == 0 {
            anyhow::bail!("pool.recycle_quota must be at least 1");
        }
        if self.inner_timeout_secs == 0 {
            anyhow::bail!("pool.inner_timeout_secs must be at least 1");
        }
        if self.poll_interval_ms == 0 {
            anyhow::bail!("pool.poll_interval_ms must be at least 1");
        }
        Ok(())
    }
}

impl MetricsConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn startup_delay(&self) -> Duration {
        Duration::from_secs(self.startup_delay_secs)
    }
}

impl Config {
    /// Returns the default config directory path.
    /// `~/.config/speech-pool/` (or `$XDG_CONFIG_HOME/speech-pool/`)
    pub fn config_dir() -> Result<PathBuf> {
        speech_pool_common::dirs::config_dir()
    }

    /// Returns the default config file path.
    /// `~/.config/speech-pool/config.toml`
    pub fn config_path() -> Result<PathBuf> {
        Self::config_dir().map(|p| p.join("config.toml"))
    }

    /// Load configuration from the default path.
    /// Returns defaults if the file doesn't exist.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        Self::load_from(&path)
    }

    /// Load configuration from a specific path.
    /// Returns defaults if the file doesn't exist.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).context("Failed to parse config file as TOML")?;
        config.pool.validate()?;
        Ok(config)
    }

    /// Save configuration to the default path.
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        self.save_to(&path)
    }

    /// Save configuration to a specific path.
    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let content = self.to_toml()?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Serialize to pretty TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config to TOML")
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
