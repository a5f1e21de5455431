//! XDG directory utilities for speech-pool.

use std::path::PathBuf;

use anyhow::{Context, Result};
use xdg::BaseDirectories;

const APP_NAME: &str = "speech-pool";

fn base_dirs() -> BaseDirectories {
    BaseDirectories::with_prefix(APP_NAME)
}

/// Return the XDG state directory, creating it if needed.
/// `~/.local/state/speech-pool/`
pub fn state_dir() -> Result<PathBuf> {
    let dir = base_dirs()
        .get_state_home()
        .context("Failed to get XDG state directory (HOME not set?)")?;
    std::fs::create_dir_all(&dir).context("Failed to create state directory")?;
    Ok(dir)
}

/// Return the XDG config directory (no creation - config may not exist yet).
/// `~/.config/speech-pool/`
pub fn config_dir() -> Result<PathBuf> {
    base_dirs()
        .get_config_home()
        .context("Could not determine config directory (HOME not set?)")
}

/// CLI log file.
/// `~/.local/state/speech-pool/spctl.log`
pub fn log_path() -> Result<PathBuf> {
    Ok(state_dir()?.join("spctl.log"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_path_in_xdg_state() {
        let path = log_path().unwrap();
        assert!(path.to_string_lossy().contains("speech-pool"));
        assert!(path.to_string_lossy().ends_with("spctl.log"));
    }

    #[test]
    fn test_config_dir_has_app_prefix() {
        let dir = config_dir().unwrap();
        assert!(dir.ends_with("speech-pool"));
    }
}
