use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use warden::{
    BackoffKind, CircuitBreakerConfig, CircuitState, DeadLetterFilter, EventPayload, FencingToken,
    InstanceId, IntervalSchedule, JobDefinition, JobId, JobRunner, JobRunnerBuilder, JobStatus,
    KeyValueStore, LockConfig, ManualSchedule, MemoryStore, RetryConfig, RunnerConfig,
};
use warden_testkit::{FaultyStore, Outcome, RecordingPublisher, ScriptedHandler, init_tracing};

fn retry(max_retries: u32) -> RetryConfig {
    RetryConfig::default()
        .with_max_retries(max_retries)
        .with_strategy(BackoffKind::Exponential, 100)
        .with_jitter(false)
}

fn runner(
    store: Arc<dyn KeyValueStore>,
    instance: &str,
    events: &RecordingPublisher,
    jobs: Vec<JobDefinition>,
) -> JobRunner {
    let mut builder = JobRunnerBuilder::new()
        .with_store(store)
        .with_instance_id(InstanceId::new(instance))
        .with_events(Arc::new(events.clone()))
        .with_retry(retry(3));
    for job in jobs {
        builder = builder.with_job(job);
    }
    builder.build().unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_job_is_dead_lettered() {
    init_tracing();
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let events = RecordingPublisher::new();
    let handler = ScriptedHandler::always_fail("smtp unavailable");
    let job_id = JobId::from("daily-report");
    let runner = runner(
        store,
        "a",
        &events,
        vec![
            JobDefinition::new(job_id.clone(), ManualSchedule, Arc::new(handler.clone()))
                .with_payload(serde_json::json!({"recipients": 3})),
        ],
    );

    let execution = runner.run_job(&job_id).await.unwrap();

    assert_eq!(execution.status, JobStatus::Failed);
    assert_eq!(execution.attempts, 3);
    handler.assert_call_count_eq(3);
    assert!(handler.calls().iter().all(|call| call.held));
    assert_eq!(
        handler.calls().iter().map(|call| call.attempt).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );

    let entries = runner
        .dead_letters()
        .query(&DeadLetterFilter::for_job("daily-report"))
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);
    let entry = &entries[0];
    assert_eq!(Some(entry.id), execution.dead_letter_id);
    assert_eq!(entry.attempts, 3);
    assert_eq!(entry.error, "smtp unavailable");
    assert_eq!(entry.payload["recipients"], 3);
    assert_eq!(entry.fencing_token, Some(FencingToken(1)));
    assert_eq!(entry.execution_id, Some(execution.id));
    assert!(entry.first_failed_at <= entry.last_failed_at);

    assert_eq!(
        events.names_for(&job_id),
        vec![
            "lock_acquired",
            "job_started",
            "job_retrying",
            "job_retrying",
            "job_failed",
            "job_dead_lettered",
            "lock_released",
        ]
    );
    assert!(!runner.locks().is_locked(&job_id).await.unwrap());

    let stats = runner.stats();
    assert_eq!(stats.totals.dead_lettered, 1);
    assert_eq!(stats.per_job[&job_id].failed, 1);
}

#[tokio::test(start_paused = true)]
async fn test_retry_delays_follow_backoff() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let events = RecordingPublisher::new();
    let handler = ScriptedHandler::fail_times(2, "flaky");
    let job_id = JobId::from("a");
    let runner = runner(
        store,
        "a",
        &events,
        vec![JobDefinition::new(job_id.clone(), ManualSchedule, Arc::new(handler.clone()))],
    );

    let started = tokio::time::Instant::now();
    let execution = runner.run_job(&job_id).await.unwrap();
    assert_eq!(execution.status, JobStatus::Succeeded);
    assert_eq!(execution.attempts, 3);
    assert!(started.elapsed() >= Duration::from_millis(300));

    let delays: Vec<u64> = events
        .payloads()
        .into_iter()
        .filter_map(|payload| match payload {
            EventPayload::JobRetrying { delay_ms, .. } => Some(delay_ms),
            _ => None,
        })
        .collect();
    assert_eq!(delays, vec![100, 200]);
}

#[tokio::test(start_paused = true)]
async fn test_replay_runs_dead_lettered_job_again() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let events = RecordingPublisher::new();
    let handler = ScriptedHandler::always_fail("downstream down");
    let job_id = JobId::from("sync");
    let runner = runner(
        store,
        "a",
        &events,
        vec![JobDefinition::new(job_id.clone(), ManualSchedule, Arc::new(handler.clone()))],
    );

    let failed = runner.run_job(&job_id).await.unwrap();
    let entry_id = failed.dead_letter_id.unwrap();

    handler.set_fallback(Outcome::Succeed);
    handler.clear();
    let replayed = runner.replay(entry_id).await.unwrap();

    assert_eq!(replayed.status, JobStatus::Succeeded);
    assert_eq!(replayed.fencing_token, Some(FencingToken(2)));
    handler.assert_call_count_eq(1);
    assert_eq!(runner.dead_letters().len().await.unwrap(), 0);
    assert!(runner.replay(entry_id).await.is_err());
}

#[tokio::test]
async fn test_never_runs_without_lock() {
    let faulty = Arc::new(FaultyStore::memory());
    let events = RecordingPublisher::new();
    let handler = ScriptedHandler::always_ok();
    let job_id = JobId::from("a");
    let runner = runner(
        faulty.clone(),
        "a",
        &events,
        vec![JobDefinition::new(job_id.clone(), ManualSchedule, Arc::new(handler.clone()))],
    );

    faulty.set_failing(true);
    let execution = runner.run_job(&job_id).await.unwrap();

    assert_eq!(execution.status, JobStatus::Skipped);
    assert_eq!(execution.fencing_token, None);
    handler.assert_call_count_eq(0);
    assert_eq!(events.names_for(&job_id), vec!["lock_failed", "job_skipped"]);
}

#[tokio::test(start_paused = true)]
async fn test_two_runners_one_execution() {
    init_tracing();
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let events = RecordingPublisher::new();
    let handler = ScriptedHandler::always_ok().with_delay(Duration::from_millis(500));
    let job_id = JobId::from("daily-report");
    let job = JobDefinition::new(job_id.clone(), ManualSchedule, Arc::new(handler.clone()));
    let a = runner(store.clone(), "instance-a", &events, vec![job.clone()]);
    let b = runner(store.clone(), "instance-b", &events, vec![job]);

    let (first, second) = tokio::join!(a.run_job(&job_id), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        b.run_job(&job_id).await
    });
    let (first, second) = (first.unwrap(), second.unwrap());

    assert_eq!(first.status, JobStatus::Succeeded);
    assert_eq!(first.fencing_token, Some(FencingToken(1)));
    assert_eq!(second.status, JobStatus::Skipped);
    handler.assert_call_count_eq(1);

    let later = b.run_job(&job_id).await.unwrap();
    assert_eq!(later.status, JobStatus::Succeeded);
    assert_eq!(later.fencing_token, Some(FencingToken(2)));
    assert_eq!(handler.fencing_tokens(), vec![FencingToken(1), FencingToken(2)]);
}

#[tokio::test]
async fn test_same_job_does_not_overlap_within_process() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let events = RecordingPublisher::new();
    let handler = ScriptedHandler::always_ok().with_delay(Duration::from_millis(50));
    let job_id = JobId::from("a");
    let runner = runner(
        store,
        "a",
        &events,
        vec![JobDefinition::new(job_id.clone(), ManualSchedule, Arc::new(handler.clone()))],
    );

    let (first, second) = tokio::join!(runner.run_job(&job_id), runner.run_job(&job_id));
    let mut statuses = vec![first.unwrap().status, second.unwrap().status];
    statuses.sort_by_key(|status| status.as_str());

    assert_eq!(statuses, vec![JobStatus::Skipped, JobStatus::Succeeded]);
    handler.assert_call_count_eq(1);
}

#[tokio::test(start_paused = true)]
async fn test_breaker_stops_calling_failing_dependency() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let events = RecordingPublisher::new();
    let handler = ScriptedHandler::always_fail("mail server 503");
    let job_id = JobId::from("newsletter");
    let runner = JobRunnerBuilder::new()
        .with_store(store)
        .with_events(Arc::new(events.clone()))
        .with_retry(retry(5))
        .with_circuit_config(
            CircuitBreakerConfig::default()
                .with_thresholds(2, 1, 2)
                .with_reset_timeout_ms(60_000),
        )
        .with_job(
            JobDefinition::new(job_id.clone(), ManualSchedule, Arc::new(handler.clone()))
                .with_breaker("mailer"),
        )
        .build()
        .unwrap();

    let execution = runner.run_job(&job_id).await.unwrap();

    assert_eq!(execution.status, JobStatus::Failed);
    assert_eq!(execution.attempts, 5);
    handler.assert_call_count_eq(2);
    assert_eq!(runner.breakers().get("mailer").unwrap().state(), CircuitState::Open);
    assert_eq!(events.count("circuit_state_changed"), 1);
    assert_eq!(events.count("circuit_rejected"), 3);
    assert!(execution.error.unwrap().contains("mailer"));
}

#[tokio::test]
async fn test_tick_loop_runs_due_jobs_until_shutdown() {
    init_tracing();
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let events = RecordingPublisher::new();
    let handler = ScriptedHandler::always_ok();
    let job_id = JobId::from("heartbeat");
    let runner = JobRunnerBuilder::new()
        .with_store(store)
        .with_events(Arc::new(events.clone()))
        .with_runner_config(RunnerConfig {
            tick_interval_ms: 10,
            ..RunnerConfig::default()
        })
        .with_job(JobDefinition::new(
            job_id.clone(),
            IntervalSchedule::every_ms(50),
            Arc::new(handler.clone()),
        ))
        .build()
        .unwrap();

    runner.start().unwrap();
    assert!(runner.start().is_err());
    tokio::time::sleep(Duration::from_millis(300)).await;
    runner.shutdown().await.unwrap();

    let calls = handler.call_count();
    assert!(calls >= 2, "expected at least two runs, got {calls}");
    assert!(runner.locks().held_jobs().is_empty());
    assert!(runner.is_shutdown());
    assert!(runner.start().is_err());

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(handler.call_count(), calls);
}

#[tokio::test]
async fn test_shutdown_waits_for_in_flight_job() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let events = RecordingPublisher::new();
    let handler = ScriptedHandler::always_ok().with_delay(Duration::from_millis(100));
    let job_id = JobId::from("a");
    let runner = runner(
        store.clone(),
        "a",
        &events,
        vec![JobDefinition::new(job_id.clone(), ManualSchedule, Arc::new(handler.clone()))],
    );

    let in_flight = {
        let runner = runner.clone();
        let job_id = job_id.clone();
        tokio::spawn(async move { runner.run_job(&job_id).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    runner.shutdown().await.unwrap();

    let execution = in_flight.await.unwrap().unwrap();
    assert_eq!(execution.status, JobStatus::Succeeded);
    assert!(!store.exists("lock:a").await.unwrap());

    // New executions are refused once shut down.
    let refused = runner.run_job(&job_id).await.unwrap();
    assert_eq!(refused.status, JobStatus::Skipped);
    handler.assert_call_count_eq(1);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_releases_stuck_job_lease() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let events = RecordingPublisher::new();
    let handler = ScriptedHandler::always_ok().with_delay(Duration::from_secs(3_600));
    let job_id = JobId::from("stuck");
    let runner = JobRunnerBuilder::new()
        .with_store(store.clone())
        .with_events(Arc::new(events.clone()))
        .with_lock_config(LockConfig::default().with_ttl_ms(7_200_000))
        .with_runner_config(RunnerConfig {
            shutdown_grace_ms: 1_000,
            ..RunnerConfig::default()
        })
        .with_job(JobDefinition::new(job_id.clone(), ManualSchedule, Arc::new(handler.clone())))
        .build()
        .unwrap();

    let in_flight = {
        let runner = runner.clone();
        let job_id = job_id.clone();
        tokio::spawn(async move { runner.run_job(&job_id).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(store.exists("lock:stuck").await.unwrap());

    runner.shutdown().await.unwrap();
    assert!(!store.exists("lock:stuck").await.unwrap());
    assert_eq!(runner.stats().running, vec![job_id]);
    in_flight.abort();
}

#[tokio::test]
async fn test_tick_uses_schedule() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let events = RecordingPublisher::new();
    let handler = ScriptedHandler::always_ok();
    let job_id = JobId::from("hourly");
    let runner = runner(
        store,
        "a",
        &events,
        vec![JobDefinition::new(
            job_id.clone(),
            IntervalSchedule::new(Duration::from_secs(3_600)),
            Arc::new(handler.clone()),
        )],
    );

    let due_at = runner.next_due(&job_id).unwrap();
    assert!(runner.tick(due_at - chrono::Duration::seconds(1)).await.is_empty());

    let executions = runner.tick(due_at).await;
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].status, JobStatus::Succeeded);
    assert!(runner.next_due(&job_id).unwrap() > due_at);
    assert!(runner.next_due(&job_id).unwrap() > Utc::now());
    assert_eq!(runner.recent_executions(5).len(), 1);
}
