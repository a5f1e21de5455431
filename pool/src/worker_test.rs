use super::*;
use crate::recognize::{Script, ScriptOutcome, ScriptedRecognizer};
use speech_pool_common::Segment;
use std::io::Cursor;
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;

struct FailingRecognizer;

impl Recognizer for FailingRecognizer {
    fn recognize(&mut self, _audio: &Path, _language: &str) -> Result<Recognition> {
        anyhow::bail!("decoder rejected input")
    }
}

struct PanickingRecognizer;

impl Recognizer for PanickingRecognizer {
    fn recognize(&mut self, _audio: &Path, _language: &str) -> Result<Recognition> {
        panic!("native state corrupted")
    }
}

struct SlowRecognizer(Duration);

impl Recognizer for SlowRecognizer {
    fn recognize(&mut self, _audio: &Path, language: &str) -> Result<Recognition> {
        std::thread::sleep(self.0);
        Ok(Recognition::from_segments(Vec::new(), language))
    }
}

fn job(path: &Path, id: &str, deadline: Duration) -> Job {
    Job::new(path, "en-US", id, deadline)
}

fn write_script(dir: &TempDir, name: &str, script: &Script) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, script.to_toml().unwrap()).unwrap();
    path
}

fn requests(jobs: &[Job]) -> Cursor<Vec<u8>> {
    let mut input = Vec::new();
    for job in jobs {
        write_frame(&mut input, &WorkerRequest::Run(job.clone())).unwrap();
    }
    Cursor::new(input)
}

fn replies(output: Vec<u8>) -> Vec<WorkerReply> {
    let mut reader = Cursor::new(output);
    let mut replies = Vec::new();
    while let Some(reply) = read_frame(&mut reader).unwrap() {
        replies.push(reply);
    }
    replies
}

fn scripted() -> Result<Box<dyn Recognizer>> {
    Ok(Box::new(ScriptedRecognizer::new()))
}

#[test]
fn test_run_job_success_records_timings() {
    let dir = TempDir::new().unwrap();
    let path = write_script(
        &dir,
        "ok.toml",
        &Script {
            segments: vec![Segment::new("hello", 0.0, 1.0, 0.9).unwrap()],
            ..Default::default()
        },
    );

    let execution = run_job(
        &job(&path, "job-1", Duration::from_secs(5)),
        Box::new(ScriptedRecognizer::new()),
    );

    let JobResult::Success(transcript) = &execution.result else {
        panic!("expected success, got {:?}", execution.result);
    };
    assert_eq!(transcript.full_text, "hello");
    assert_eq!(transcript.detected_language, "en-US");
    assert!(transcript.timings.contains_key(TIMING_RECOGNITION));
    assert!(transcript.timings.contains_key(TIMING_SERIALIZATION));
    assert!(transcript.timings.contains_key(TIMING_TOTAL));
    assert!(execution.recognizer.is_some());
}

#[test]
fn test_run_job_error_is_unhandled_and_keeps_recognizer() {
    let dir = TempDir::new().unwrap();
    let execution = run_job(
        &job(&dir.path().join("x.wav"), "job-1", Duration::from_secs(5)),
        Box::new(FailingRecognizer),
    );

    let failure = execution.result.as_failure().unwrap();
    assert_eq!(failure.kind, FailureKind::Unhandled);
    assert_eq!(failure.message, "decoder rejected input");
    assert!(execution.recognizer.is_some());
}

#[test]
fn test_run_job_panic_is_crash_and_drops_recognizer() {
    let dir = TempDir::new().unwrap();
    let execution = run_job(
        &job(&dir.path().join("x.wav"), "job-1", Duration::from_secs(5)),
        Box::new(PanickingRecognizer),
    );

    let failure = execution.result.as_failure().unwrap();
    assert_eq!(failure.kind, FailureKind::Crash);
    assert_eq!(failure.message, "native state corrupted");
    assert!(execution.recognizer.is_none());
}

#[test]
fn test_run_job_deadline_is_timeout() {
    let dir = TempDir::new().unwrap();
    let started = Instant::now();
    let execution = run_job(
        &job(&dir.path().join("x.wav"), "job-1", Duration::from_millis(200)),
        Box::new(SlowRecognizer(Duration::from_secs(3))),
    );

    assert!(started.elapsed() < Duration::from_secs(2));
    let failure = execution.result.as_failure().unwrap();
    assert_eq!(failure.kind, FailureKind::Timeout);
    assert!(failure.message.contains("exceeded timeout"));
    assert!(execution.recognizer.is_none());
}

#[test]
fn test_serve_replies_once_per_job_and_deletes_inputs() {
    let dir = TempDir::new().unwrap();
    let ok = write_script(&dir, "ok.toml", &Script::default());
    let bad = write_script(
        &dir,
        "bad.toml",
        &Script {
            outcome: ScriptOutcome::Error,
            message: Some("bad audio".to_string()),
            ..Default::default()
        },
    );
    let jobs = [
        job(&ok, "job-ok", Duration::from_secs(5)),
        job(&bad, "job-bad", Duration::from_secs(5)),
    ];

    let mut input = requests(&jobs);
    let mut output = Vec::new();
    let mut built = 0;
    let exit = serve(&mut input, &mut output, || {
        built += 1;
        scripted()
    })
    .unwrap();

    assert_eq!(exit, ServeExit::InputClosed);
    // An error result does not poison the recognizer
    assert_eq!(built, 1);

    let replies = replies(output);
    assert_eq!(replies.len(), 2);
    assert_eq!(replies[0].correlation_id, "job-ok");
    assert!(replies[0].result.is_success());
    assert_eq!(replies[0].pid, std::process::id());
    assert_eq!(replies[1].correlation_id, "job-bad");
    assert_eq!(
        replies[1].result.failure_kind(),
        Some(FailureKind::Unhandled)
    );

    assert!(!ok.exists());
    assert!(!bad.exists());
}

#[test]
fn test_serve_rebuilds_recognizer_after_panic() {
    let dir = TempDir::new().unwrap();
    let boom = write_script(
        &dir,
        "boom.toml",
        &Script {
            outcome: ScriptOutcome::Panic,
            ..Default::default()
        },
    );
    let ok = write_script(&dir, "ok.toml", &Script::default());
    let jobs = [
        job(&boom, "job-boom", Duration::from_secs(5)),
        job(&ok, "job-ok", Duration::from_secs(5)),
    ];

    let mut input = requests(&jobs);
    let mut output = Vec::new();
    let mut built = 0;
    serve(&mut input, &mut output, || {
        built += 1;
        scripted()
    })
    .unwrap();

    assert_eq!(built, 2);
    let replies = replies(output);
    assert_eq!(replies[0].result.failure_kind(), Some(FailureKind::Crash));
    assert!(replies[1].result.is_success());
}

#[test]
fn test_serve_exits_after_deadline() {
    let dir = TempDir::new().unwrap();
    let slow = write_script(
        &dir,
        "slow.toml",
        &Script {
            delay_ms: 2_000,
            ..Default::default()
        },
    );
    let ok = write_script(&dir, "ok.toml", &Script::default());
    let jobs = [
        job(&slow, "job-slow", Duration::from_millis(100)),
        job(&ok, "job-never", Duration::from_secs(5)),
    ];

    let mut input = requests(&jobs);
    let mut output = Vec::new();
    let exit = serve(&mut input, &mut output, scripted).unwrap();

    assert_eq!(exit, ServeExit::DeadlineExceeded);
    let replies = replies(output);
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].correlation_id, "job-slow");
    assert_eq!(replies[0].result.failure_kind(), Some(FailureKind::Timeout));
    // The second job was never read
    assert!(ok.exists());
}

#[test]
fn test_serve_reports_recognizer_build_failure() {
    let dir = TempDir::new().unwrap();
    let path = write_script(&dir, "ok.toml", &Script::default());
    let mut input = requests(&[job(&path, "job-1", Duration::from_secs(5))]);
    let mut output = Vec::new();

    let exit = serve(&mut input, &mut output, || anyhow::bail!("model file missing")).unwrap();

    assert_eq!(exit, ServeExit::InputClosed);
    let replies = replies(output);
    let failure = replies[0].result.as_failure().unwrap();
    assert_eq!(failure.kind, FailureKind::Unhandled);
    assert!(failure.message.contains("recognizer unavailable"));
    assert!(failure.message.contains("model file missing"));
}

#[test]
fn test_serve_empty_input_exits_cleanly() {
    let mut input = Cursor::new(Vec::new());
    let mut output = Vec::new();
    let exit = serve(&mut input, &mut output, scripted).unwrap();
    assert_eq!(exit, ServeExit::InputClosed);
    assert!(output.is_empty());
}

#[test]
fn test_command_line_round_trips_through_clap() {
    let mut config = Config::default();
    config.recognizer.backend = RecognizerBackend::Whisper;
    config.recognizer.model_path = Some(PathBuf::from("/models/base.bin"));
    config.recognizer.threads = 2;
    config.logging.level = LogLevel::Debug;

    let mut argv = vec![OsString::from("spworker")];
    argv.extend(WorkerArgs::command_line(&config));
    let args = WorkerArgs::try_parse_from(argv).unwrap();

    assert_eq!(args.recognizer_config(), config.recognizer);
    assert_eq!(args.log_level, LogLevel::Debug);
}
