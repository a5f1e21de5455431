use super::*;
use tempfile::TempDir;

#[test]
fn test_default_config_values() {
    let config = Config::default();

    assert_eq!(config.pool.size, 4);
    assert_eq!(config.pool.recycle_quota, 100);
    assert_eq!(config.pool.inner_timeout(), Duration::from_secs(300));
    assert_eq!(config.pool.outer_margin(), Duration::from_secs(10));
    assert_eq!(config.pool.poll_interval(), Duration::from_millis(100));
    assert!(config.pool.worker_program.is_none());

    assert_eq!(config.recognizer.backend, RecognizerBackend::Scripted);
    assert_eq!(config.metrics.interval(), Duration::from_secs(15));
    assert_eq!(config.logging.level, LogLevel::Info);
    assert!(!config.logging.file);
}

#[test]
fn test_load_valid_config_from_file() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("config.toml");

    let toml_content = r#"
[pool]
size = 2
recycle_quota = 1
inner_timeout_secs = 60
outer_margin_secs = 3
worker_program = "/opt/speech-pool/spworker"

[recognizer]
backend = "whisper"
model_path = "/models/ggml-base.bin"
threads = 2

[metrics]
interval_secs = 5
"#;

    std::fs::write(&config_path, toml_content).unwrap();

    let config = Config::load_from(&config_path).unwrap();

    assert_eq!(config.pool.size, 2);
    assert_eq!(config.pool.recycle_quota, 1);
    assert_eq!(config.pool.inner_timeout(), Duration::from_secs(60));
    assert_eq!(config.pool.outer_margin(), Duration::from_secs(3));
    assert_eq!(
        config.pool.worker_program().unwrap(),
        PathBuf::from("/opt/speech-pool/spworker")
    );
    assert_eq!(config.recognizer.backend, RecognizerBackend::Whisper);
    assert_eq!(
        config.recognizer.model_path,
        Some(PathBuf::from("/models/ggml-base.bin"))
    );
    assert_eq!(config.recognizer.threads, 2);
    assert_eq!(config.metrics.interval(), Duration::from_secs(5));
    // Unspecified fields fall back to defaults
    assert_eq!(config.metrics.startup_delay(), Duration::from_secs(5));
}

#[test]
fn test_missing_config_file_returns_defaults() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("nonexistent.toml");

    let config = Config::load_from(&config_path).unwrap();

    assert_eq!(config, Config::default());
}

#[test]
fn test_invalid_toml_returns_error() {
    let result = Config::parse("this is not valid { toml [");

    assert!(result.is_err());
    assert!(result.unwrap_err().to_string().contains("TOML"));
}

#[test]
fn test_invalid_backend_returns_error() {
    let toml_content = r#"
[recognizer]
backend = "azure"
"#;

    assert!(Config::parse(toml_content).is_err());
}

#[test]
fn test_zero_pool_size_rejected() {
    let toml_content = r#"
[pool]
size = 0
"#;

    let err = Config::parse(toml_content).unwrap_err();
    assert!(err.to_string().contains("pool.size"));
}

#[test]
fn test_zero_quota_rejected() {
    let toml_content = r#"
[pool]
recycle_quota = 0
"#;

    assert!(Config::parse(toml_content).is_err());
}

#[test]
fn test_config_paths() {
    let config_dir = Config::config_dir().unwrap();
    let config_path = Config::config_path().unwrap();

    assert!(config_dir.ends_with("speech-pool"));
    assert!(config_path.ends_with("config.toml"));
    assert_eq!(config_path.parent().unwrap(), config_dir);
}

#[test]
fn test_save_and_load_roundtrip() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("config.toml");

    let original = Config {
        pool: PoolConfig {
            size: 8,
            recycle_quota: 25,
            worker_program: Some(PathBuf::from("/usr/local/bin/spworker")),
            ..Default::default()
        },
        recognizer: RecognizerConfig {
            backend: RecognizerBackend::Whisper,
            model_path: Some(PathBuf::from("/models/ggml-small.bin")),
            threads: 8,
        },
        metrics: MetricsConfig {
            interval_secs: 30,
            startup_delay_secs: 0,
        },
        logging: LoggingConfig {
            level: LogLevel::Debug,
            file: true,
        },
    };

    original.save_to(&config_path).unwrap();
    let loaded = Config::load_from(&config_path).unwrap();

    assert_eq!(original, loaded);
}

#[test]
fn test_save_creates_parent_directories() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("nested/dir/config.toml");

    Config::default().save_to(&config_path).unwrap();

    assert!(config_path.exists());
}

#[test]
fn test_unset_paths_not_serialized() {
    let toml_str = Config::default().to_toml().unwrap();

    assert!(!toml_str.contains("worker_program"));
    assert!(!toml_str.contains("model_path"));
    assert!(toml_str.contains("backend = \"scripted\""));
}

#[test]
fn test_log_directive_covers_crates() {
    let directive = LogLevel::Debug.as_directive();
    assert!(directive.contains("speech_pool_core=debug"));
    assert!(directive.contains("spctl=debug"));
}
