use std::sync::Arc;
use std::time::Duration;

use jobrunner_application::{JobClient, JobOptions, JobServer, ServerMode};
use jobrunner_core::{AppConfig, HandlerRegistry};
use jobrunner_dispatcher::{ContinuationManager, JobScheduler};
use jobrunner_domain::{
    Clock, ContinuationPolicy, JobId, JobPayload, JobRepository, JobState, ManualClock,
    SharedClock, SharedStorage, SystemClock,
};
use jobrunner_infrastructure::{InMemoryJobStorage, SqliteJobStorage};
use jobrunner_testing_utils::{
    filter_states, init_test_logging, manual_clock, wait_for_state, FailingHandler,
    RecordingHandler,
};
use jobrunner_worker::{ExecutionOutcome, WorkerPool, WorkerSettings};
use serde_json::json;
use tokio::sync::broadcast;

const OWNER: &str = "scenario-worker:0";

/// 在模拟时间下逐步驱动各组件
struct Harness {
    storage: SharedStorage,
    clock: ManualClock,
    handlers: HandlerRegistry,
    client: JobClient,
    scheduler: JobScheduler,
    continuations: Arc<ContinuationManager>,
    pool: WorkerPool,
}

fn harness() -> Harness {
    let config = AppConfig::default();
    let storage: SharedStorage = Arc::new(InMemoryJobStorage::new());
    let (clock, shared) = manual_clock();
    let handlers = HandlerRegistry::new();
    let continuations = Arc::new(ContinuationManager::new(
        Arc::clone(&storage),
        Arc::clone(&shared),
        &config.continuation,
    ));
    let client = JobClient::new(
        Arc::clone(&storage),
        Arc::clone(&shared),
        Arc::clone(&continuations),
        &config.retry,
        &config.expiration,
    );
    let scheduler = JobScheduler::new(Arc::clone(&storage), Arc::clone(&shared), &config.scheduler);
    let pool = WorkerPool::new(
        Arc::clone(&storage),
        shared,
        handlers.clone(),
        Arc::clone(&continuations),
        WorkerSettings::from_config(&config.worker, &config.retry, &config.expiration),
    );
    Harness {
        storage,
        clock,
        handlers,
        client,
        scheduler,
        continuations,
        pool,
    }
}

impl Harness {
    async fn states(&self, id: &JobId) -> Vec<JobState> {
        self.storage
            .state_history(id)
            .await
            .unwrap()
            .into_iter()
            .map(|entry| entry.state)
            .collect()
    }

    async fn state(&self, id: &JobId) -> JobState {
        self.storage.get_job(id).await.unwrap().unwrap().state
    }
}

#[tokio::test]
async fn test_immediate_job_runs_once() {
    let h = harness();
    let recorder = RecordingHandler::new("greet");
    h.handlers.register(recorder.clone()).await;

    let id = h
        .client
        .enqueue(JobPayload::new("greet", json!({"name": "A"})))
        .await
        .unwrap();

    assert_eq!(
        h.pool.process_next(OWNER).await.unwrap(),
        Some(ExecutionOutcome::Succeeded)
    );
    assert_eq!(h.pool.process_next(OWNER).await.unwrap(), None);

    assert_eq!(
        h.states(&id).await,
        vec![
            JobState::Created,
            JobState::Enqueued,
            JobState::Processing,
            JobState::Succeeded
        ]
    );
    assert_eq!(recorder.calls(), vec![(id, json!({"name": "A"}))]);
}

#[tokio::test]
async fn test_delayed_job_is_invisible_until_due() {
    let h = harness();
    let id = h
        .client
        .schedule(JobPayload::handler_only("greet"), chrono::Duration::seconds(10))
        .await
        .unwrap();

    let lease_for = chrono::Duration::minutes(5);
    h.clock.advance(chrono::Duration::seconds(9));
    assert_eq!(h.scheduler.run_once().await.unwrap(), 0);
    let now = h.clock.now();
    assert!(h
        .storage
        .fetch_next_eligible("default", OWNER, now, now + lease_for)
        .await
        .unwrap()
        .is_none());

    h.clock.advance(chrono::Duration::seconds(1));
    assert_eq!(h.scheduler.run_once().await.unwrap(), 1);
    let now = h.clock.now();
    let leased = h
        .storage
        .fetch_next_eligible("default", OWNER, now, now + lease_for)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(leased.job.id, id);
}

#[tokio::test]
async fn test_failing_job_retries_then_dead_letters() {
    let h = harness();
    let failing = FailingHandler::always("flaky");
    h.handlers.register(failing.clone()).await;

    let id = h
        .client
        .enqueue_with(
            JobPayload::handler_only("flaky"),
            JobOptions::new().with_max_retries(2),
        )
        .await
        .unwrap();

    for attempt in 1..=2 {
        let outcome = h.pool.process_next(OWNER).await.unwrap();
        assert!(
            matches!(outcome, Some(ExecutionOutcome::Retrying { attempt: a, .. }) if a == attempt)
        );
        assert_eq!(h.state(&id).await, JobState::Scheduled);
        h.clock.advance(chrono::Duration::hours(2));
        assert_eq!(h.scheduler.run_once().await.unwrap(), 1);
    }
    assert_eq!(
        h.pool.process_next(OWNER).await.unwrap(),
        Some(ExecutionOutcome::DeadLettered)
    );

    let observed = filter_states(
        &h.states(&id).await,
        &[
            JobState::Processing,
            JobState::Failed,
            JobState::Scheduled,
            JobState::Deleted,
        ],
    );
    assert_eq!(
        observed,
        vec![
            JobState::Processing,
            JobState::Failed,
            JobState::Scheduled,
            JobState::Processing,
            JobState::Failed,
            JobState::Scheduled,
            JobState::Processing,
            JobState::Failed,
            JobState::Deleted,
        ]
    );
    assert_eq!(failing.attempts(), 3);

    let job = h.storage.get_job(&id).await.unwrap().unwrap();
    assert_eq!(job.retry_count, 2);
    assert!(job.last_failure.is_some());
}

#[tokio::test]
async fn test_continuation_with_deleted_parent_keeps_waiting() {
    let h = harness();
    h.handlers.register(RecordingHandler::new("step")).await;

    let succeeded = h.client.enqueue(JobPayload::handler_only("step")).await.unwrap();
    let doomed = h.client.enqueue(JobPayload::handler_only("step")).await.unwrap();
    let child = h
        .client
        .continue_with_options(
            vec![succeeded, doomed],
            JobPayload::handler_only("step"),
            ContinuationPolicy::OnlyOnSucceeded,
            JobOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(
        h.pool.process_next(OWNER).await.unwrap(),
        Some(ExecutionOutcome::Succeeded)
    );
    assert!(h.client.cancel(&doomed).await.unwrap());
    assert_eq!(h.state(&succeeded).await, JobState::Succeeded);
    assert_eq!(h.state(&doomed).await, JobState::Deleted);

    h.clock.advance(chrono::Duration::days(7));
    assert_eq!(h.continuations.reconcile().await.unwrap(), 0);
    assert_eq!(h.pool.process_next(OWNER).await.unwrap(), None);
    assert_eq!(h.state(&child).await, JobState::AwaitingContinuation);
}

#[tokio::test]
async fn test_continuation_runs_after_all_parents_succeed() {
    let h = harness();
    let recorder = RecordingHandler::new("step");
    h.handlers.register(recorder.clone()).await;

    let first = h.client.enqueue(JobPayload::handler_only("step")).await.unwrap();
    let second = h.client.enqueue(JobPayload::handler_only("step")).await.unwrap();
    let child = h
        .client
        .continue_with_options(
            vec![first, second],
            JobPayload::handler_only("step"),
            ContinuationPolicy::OnlyOnSucceeded,
            JobOptions::default(),
        )
        .await
        .unwrap();

    h.pool.process_next(OWNER).await.unwrap();
    assert_eq!(h.state(&child).await, JobState::AwaitingContinuation);
    h.pool.process_next(OWNER).await.unwrap();
    assert_eq!(h.state(&child).await, JobState::Enqueued);
    h.pool.process_next(OWNER).await.unwrap();

    assert_eq!(recorder.executed_ids(), vec![first, second, child]);
}

fn fast_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.worker.worker_count = 2;
    config.worker.poll_interval_ms = 10;
    config.scheduler.poll_interval_ms = 20;
    config.recurring.poll_interval_ms = 50;
    config.worker.shutdown_timeout_seconds = 5;
    config
}

async fn run_server_end_to_end(storage: SharedStorage) {
    let clock: SharedClock = Arc::new(SystemClock);
    let handlers = HandlerRegistry::new();
    let recorder = RecordingHandler::new("greet");
    handlers.register(recorder.clone()).await;

    let server = Arc::new(JobServer::new(
        fast_config(),
        Arc::clone(&storage),
        clock,
        handlers,
    ));
    let client = server.client();

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let running = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.run(ServerMode::Server, shutdown_rx).await })
    };

    let immediate = client.enqueue(JobPayload::handler_only("greet")).await.unwrap();
    let delayed = client
        .schedule(
            JobPayload::handler_only("greet"),
            chrono::Duration::milliseconds(100),
        )
        .await
        .unwrap();
    let child = client
        .continue_with(immediate, JobPayload::handler_only("greet"))
        .await
        .unwrap();

    for id in [immediate, delayed, child] {
        assert!(
            wait_for_state(storage.as_ref(), &id, JobState::Succeeded, Duration::from_secs(10))
                .await,
            "任务 {id} 未在期限内完成"
        );
    }
    assert_eq!(recorder.call_count(), 3);

    shutdown_tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(10), running)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_server_runs_jobs_with_memory_storage() {
    init_test_logging();
    run_server_end_to_end(Arc::new(InMemoryJobStorage::new())).await;
}

#[tokio::test]
async fn test_server_runs_jobs_with_sqlite_storage() {
    init_test_logging();
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("jobs.db").display());
    let storage = SqliteJobStorage::connect(&url, 5).await.unwrap();
    run_server_end_to_end(Arc::new(storage)).await;
}

#[tokio::test]
async fn test_server_fires_recurring_jobs() {
    let storage: SharedStorage = Arc::new(InMemoryJobStorage::new());
    let handlers = HandlerRegistry::new();
    let recorder = RecordingHandler::new("tick");
    handlers.register(recorder.clone()).await;

    let server = Arc::new(JobServer::new(
        fast_config(),
        Arc::clone(&storage),
        Arc::new(SystemClock),
        handlers,
    ));
    server
        .recurring_jobs()
        .add_or_update("every-second", JobPayload::handler_only("tick"), "* * * * * *")
        .await
        .unwrap();

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let running = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.run(ServerMode::Server, shutdown_rx).await })
    };

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while recorder.call_count() < 2 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(recorder.call_count() >= 2);

    let definition = server
        .recurring_jobs()
        .get("every-second")
        .await
        .unwrap()
        .unwrap();
    assert!(definition.last_job_id.is_some());

    shutdown_tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(10), running)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}
