use super::*;

/// Coordinator with one worker running `program`, without its event loop.
fn coordinator(program: &str, args: &[&str]) -> Coordinator {
    let (_commands, receiver) = mpsc::unbounded_channel();
    let (status, _) = watch::channel(PoolStatus::default());
    let config = PoolConfig {
        size: 1,
        ..PoolConfig::default()
    };
    Coordinator::new(
        config,
        PathBuf::from(program),
        args.iter().map(OsString::from).collect(),
        receiver,
        status,
    )
    .unwrap()
}

fn job(correlation_id: &str) -> Job {
    Job::new(
        "/nonexistent/input.wav",
        "en-US",
        correlation_id,
        Duration::from_secs(5),
    )
}

#[tokio::test]
async fn test_failed_exchange_task_fails_job_and_retires_worker() {
    // `sleep` never answers, so the exchange stays in flight until aborted.
    let mut coordinator = coordinator("sleep", &["30"]);
    let pid = coordinator.slots[0].pid;

    let (reply, result) = oneshot::channel();
    coordinator.submit(job("job-lost"), reply);
    assert_eq!(coordinator.activity().busy, 1);
    assert_eq!(coordinator.in_flight.len(), 1);

    coordinator.exchanges.abort_all();
    let joined = coordinator.exchanges.join_next_with_id().await.unwrap();
    assert!(joined.is_err());
    coordinator.on_exchange(joined);

    let result = result.await.unwrap().unwrap();
    let failure = result.as_failure().unwrap();
    assert_eq!(failure.kind, FailureKind::Crash);
    assert!(failure.message.contains(&pid.to_string()));
    assert!(coordinator.pending.is_empty());
    assert!(coordinator.in_flight.is_empty());
    assert!(coordinator.slots.iter().all(|slot| slot.pid != pid));
    assert_eq!(coordinator.activity().busy, 0);

    coordinator.kill_all().await;
}

#[tokio::test]
async fn test_duplicate_id_rejected_while_in_flight() {
    let mut coordinator = coordinator("sleep", &["30"]);

    let (first, _first_result) = oneshot::channel();
    coordinator.submit(job("job-same"), first);
    let (second, second_result) = oneshot::channel();
    coordinator.submit(job("job-same"), second);

    assert_eq!(
        second_result.await.unwrap(),
        Err(PoolError::Duplicate("job-same".to_string()))
    );

    assert_eq!(coordinator.kill_all().await, 1);
}
