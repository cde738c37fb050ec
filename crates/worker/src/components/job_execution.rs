use std::sync::Arc;

use chrono::{DateTime, Utc};
use jobrunner_core::{HandlerRegistry, JobContext};
use jobrunner_dispatcher::ContinuationManager;
use jobrunner_domain::{
    FailureDetail, FailureKind, JobId, JobRecord, JobState, LeasedJob, SharedClock,
    SharedStorage, StateTransition,
};
use jobrunner_errors::{JobError, JobResult};
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, error, info, instrument, warn};

use super::HeartbeatManager;
use crate::settings::WorkerSettings;

/// 一次执行的最终结果
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Succeeded,
    /// 已安排重试
    Retrying {
        attempt: u32,
        retry_at: DateTime<Utc>,
    },
    /// 不再重试，进入 Deleted
    DeadLettered,
    /// 租约丢失，既不提交结果也不修改任务
    Abandoned,
    /// 取出后任务状态已变化，没有执行
    Skipped,
}

enum HandlerOutcome {
    Finished(JobResult<()>),
    TimedOut,
    Missing,
}

/// 任务执行器：在租约保护下运行处理器并提交结果
pub struct JobExecutor {
    storage: SharedStorage,
    clock: SharedClock,
    handlers: HandlerRegistry,
    continuations: Arc<ContinuationManager>,
    heartbeat: HeartbeatManager,
    settings: WorkerSettings,
}

impl JobExecutor {
    pub fn new(
        storage: SharedStorage,
        clock: SharedClock,
        handlers: HandlerRegistry,
        continuations: Arc<ContinuationManager>,
        settings: WorkerSettings,
    ) -> Self {
        let heartbeat = HeartbeatManager::new(
            Arc::clone(&storage),
            Arc::clone(&clock),
            settings.heartbeat_interval,
            settings.lease_duration(),
        );
        Self {
            storage,
            clock,
            handlers,
            continuations,
            heartbeat,
            settings,
        }
    }

    #[instrument(skip(self, leased), fields(job_id = %leased.job.id, owner = %leased.lease.owner))]
    pub async fn execute(&self, leased: LeasedJob) -> JobResult<ExecutionOutcome> {
        let LeasedJob { job, lease } = leased;
        let owner = lease.owner.as_str();

        let start = StateTransition::to(JobState::Processing, self.clock.now())
            .with_reason(format!("由 {owner} 开始执行"))
            .require_lease(owner);
        if !self
            .storage
            .compare_and_transition(&job.id, JobState::Enqueued, start)
            .await?
        {
            debug!("任务 {} 在开始执行前状态已变化，跳过", job.id);
            self.storage.release_lease(&job.id, owner).await?;
            return Ok(ExecutionOutcome::Skipped);
        }

        let attempt = job.retry_count + 1;
        info!("开始执行{}，第 {} 次尝试", job.entity_description(), attempt);

        let cancellation = CancellationToken::new();
        let outcome = match self.spawn_handler(&job, attempt, cancellation.clone()).await {
            None => HandlerOutcome::Missing,
            Some(mut handle) => {
                let heartbeat = self.heartbeat.keep_alive(job.id, owner, cancellation.clone());
                tokio::select! {
                    joined = tokio::time::timeout(self.settings.execution_timeout, &mut handle) => {
                        match joined {
                            Ok(Ok(result)) => HandlerOutcome::Finished(result),
                            Ok(Err(join_error)) => HandlerOutcome::Finished(Err(JobError::handler(
                                format!("处理器异常退出: {join_error}"),
                            ))),
                            Err(_) => {
                                handle.abort();
                                HandlerOutcome::TimedOut
                            }
                        }
                    }
                    stopped = heartbeat => {
                        handle.abort();
                        return match stopped {
                            JobError::LeaseExpired { .. } => {
                                warn!("任务 {} 的租约已失效，放弃本次执行: {}", job.id, stopped);
                                Ok(ExecutionOutcome::Abandoned)
                            }
                            fatal => {
                                error!("任务 {} 续约时存储出现致命错误: {}", job.id, fatal);
                                Err(fatal)
                            }
                        };
                    }
                }
            }
        };

        let at = self.clock.now();
        let cancelled = cancellation.is_cancelled();
        match outcome {
            HandlerOutcome::Finished(Ok(())) => self.complete(&job, owner, at).await,
            HandlerOutcome::Finished(Err(e)) => {
                let kind = if e.is_abort() || cancelled {
                    FailureKind::Aborted
                } else {
                    FailureKind::Recoverable
                };
                self.fail(&job, owner, kind, e.to_string(), attempt, cancelled, at)
                    .await
            }
            HandlerOutcome::TimedOut => {
                let message = format!("执行超过 {:?}", self.settings.execution_timeout);
                self.fail(&job, owner, FailureKind::TimedOut, message, attempt, cancelled, at)
                    .await
            }
            HandlerOutcome::Missing => {
                let message = JobError::HandlerNotFound(job.payload.handler.clone()).to_string();
                self.fail(&job, owner, FailureKind::HandlerMissing, message, attempt, cancelled, at)
                    .await
            }
        }
    }

    async fn spawn_handler(
        &self,
        job: &JobRecord,
        attempt: u32,
        cancellation: CancellationToken,
    ) -> Option<AbortOnDropHandle<JobResult<()>>> {
        let handler = self.handlers.get(&job.payload.handler).await?;
        let ctx = JobContext::new(
            job.id,
            job.queue.clone(),
            job.payload.arguments.clone(),
            attempt,
            cancellation,
        );
        // 执行被丢弃（例如关闭超时后槽位被中止）时处理器任务随之中止
        Some(AbortOnDropHandle::new(tokio::spawn(async move {
            handler.handle(ctx).await
        })))
    }

    async fn complete(
        &self,
        job: &JobRecord,
        owner: &str,
        at: DateTime<Utc>,
    ) -> JobResult<ExecutionOutcome> {
        let transition = StateTransition::to(JobState::Succeeded, at)
            .with_reason("执行成功")
            .expire_at(at + self.settings.succeeded_ttl)
            .require_lease(owner)
            .release_lease();
        self.commit(job, transition, ExecutionOutcome::Succeeded)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn fail(
        &self,
        job: &JobRecord,
        owner: &str,
        kind: FailureKind,
        message: String,
        attempt: u32,
        cancelled: bool,
        at: DateTime<Utc>,
    ) -> JobResult<ExecutionOutcome> {
        warn!("任务 {} 第 {} 次执行失败 ({:?}): {}", job.id, attempt, kind, message);

        let failed = StateTransition::to(JobState::Failed, at)
            .with_reason(message.clone())
            .with_failure(FailureDetail {
                kind,
                message,
                attempt,
                occurred_at: at,
            })
            .require_lease(owner)
            .release_lease();

        let can_retry = kind != FailureKind::Aborted && job.retry_count < job.max_retries;
        if can_retry {
            let retry_at = self.settings.backoff.next_attempt_at(at, job.retry_count);
            let scheduled = StateTransition::to(JobState::Scheduled, at)
                .with_reason(format!("第 {} 次重试", job.retry_count + 1))
                .activate_at(retry_at)
                .increment_retry();
            return self
                .commit(
                    job,
                    failed.then(scheduled),
                    ExecutionOutcome::Retrying { attempt, retry_at },
                )
                .await;
        }

        let reason = if cancelled {
            "任务已被取消"
        } else if kind == FailureKind::Aborted {
            "处理器中止，不再重试"
        } else {
            "重试次数已用尽"
        };
        let deleted = StateTransition::to(JobState::Deleted, at)
            .with_reason(reason)
            .expire_at(at + self.settings.deleted_ttl);
        self.commit(job, failed.then(deleted), ExecutionOutcome::DeadLettered)
            .await
    }

    async fn commit(
        &self,
        job: &JobRecord,
        transition: StateTransition,
        outcome: ExecutionOutcome,
    ) -> JobResult<ExecutionOutcome> {
        let final_state = transition.final_state();
        if !self
            .storage
            .compare_and_transition(&job.id, JobState::Processing, transition)
            .await?
        {
            warn!("任务 {} 的租约在提交结果前失效，结果被丢弃", job.id);
            return Ok(ExecutionOutcome::Abandoned);
        }

        info!("任务 {} 执行结束，状态: {}", job.id, final_state);
        if final_state.is_terminal() {
            self.notify_continuations(&job.id).await;
        }
        Ok(outcome)
    }

    async fn notify_continuations(&self, parent_id: &JobId) {
        // 失败时由延续任务巡检补偿
        if let Err(e) = self.continuations.on_parent_finished(parent_id).await {
            warn!("激活任务 {} 的延续任务失败: {}", parent_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use jobrunner_core::ContinuationConfig;
    use jobrunner_domain::{Clock, ContinuationPolicy, JobStateMachine};
    use jobrunner_infrastructure::InMemoryJobStorage;
    use jobrunner_testing_utils::{
        manual_clock, FailingHandler, FaultyStorage, JobRecordBuilder, ManualClock,
        RecordingHandler, SlowHandler,
    };

    struct Fixture {
        memory: InMemoryJobStorage,
        storage: SharedStorage,
        clock: ManualClock,
        handlers: HandlerRegistry,
        executor: JobExecutor,
    }

    fn settings() -> WorkerSettings {
        WorkerSettings {
            heartbeat_interval: Duration::from_millis(20),
            execution_timeout: Duration::from_secs(5),
            ..WorkerSettings::default()
        }
    }

    fn fixture_with(settings: WorkerSettings) -> Fixture {
        let memory = InMemoryJobStorage::new();
        let storage: SharedStorage = Arc::new(memory.clone());
        let (clock, shared_clock) = manual_clock();
        let handlers = HandlerRegistry::new();
        let continuations = Arc::new(ContinuationManager::new(
            Arc::clone(&storage),
            Arc::clone(&shared_clock),
            &ContinuationConfig::default(),
        ));
        let executor = JobExecutor::new(
            Arc::clone(&storage),
            shared_clock,
            handlers.clone(),
            continuations,
            settings,
        );
        Fixture {
            memory,
            storage,
            clock,
            handlers,
            executor,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(settings())
    }

    impl Fixture {
        async fn enqueue(&self, job: JobRecord) -> JobId {
            let id = self.storage.create_job(&job).await.unwrap();
            assert!(self
                .storage
                .compare_and_transition(
                    &id,
                    JobState::Created,
                    StateTransition::to(JobState::Enqueued, self.clock.now()),
                )
                .await
                .unwrap());
            id
        }

        async fn lease(&self, owner: &str) -> LeasedJob {
            let now = self.clock.now();
            self.storage
                .fetch_next_eligible("default", owner, now, now + chrono::Duration::minutes(5))
                .await
                .unwrap()
                .unwrap()
        }

        async fn lease_for(&self, owner: &str, duration: chrono::Duration) -> Option<LeasedJob> {
            let now = self.clock.now();
            self.storage
                .fetch_next_eligible("default", owner, now, now + duration)
                .await
                .unwrap()
        }

        async fn run_next(&self) -> ExecutionOutcome {
            let leased = self.lease("worker-1").await;
            self.executor.execute(leased).await.unwrap()
        }

        async fn job(&self, id: &JobId) -> JobRecord {
            self.storage.get_job(id).await.unwrap().unwrap()
        }

        async fn path(&self, id: &JobId) -> Vec<JobState> {
            self.storage
                .state_history(id)
                .await
                .unwrap()
                .into_iter()
                .map(|entry| entry.state)
                .collect()
        }

        /// 模拟延迟调度器把到期的重试任务放回队列
        async fn release_retry(&self, id: &JobId) {
            assert!(self
                .storage
                .compare_and_transition(
                    id,
                    JobState::Scheduled,
                    StateTransition::to(JobState::Enqueued, self.clock.now()),
                )
                .await
                .unwrap());
            self.clock.advance(chrono::Duration::hours(2));
        }
    }

    #[tokio::test]
    async fn test_success_releases_lease_and_sets_expiry() {
        let f = fixture();
        let handler = RecordingHandler::new("email");
        f.handlers.register(handler.clone()).await;
        let id = f
            .enqueue(
                JobRecordBuilder::new()
                    .with_handler("email")
                    .with_arguments(serde_json::json!({"to": "ops@example.com"}))
                    .build(),
            )
            .await;

        assert_eq!(f.run_next().await, ExecutionOutcome::Succeeded);

        let job = f.job(&id).await;
        assert_eq!(job.state, JobState::Succeeded);
        assert_eq!(
            job.expire_at,
            Some(f.clock.now() + WorkerSettings::default().succeeded_ttl)
        );
        assert!(f.memory.lease_of(&id).await.is_none());
        assert_eq!(
            handler.calls(),
            vec![(id, serde_json::json!({"to": "ops@example.com"}))]
        );
        assert_eq!(
            f.path(&id).await,
            vec![
                JobState::Created,
                JobState::Enqueued,
                JobState::Processing,
                JobState::Succeeded
            ]
        );
    }

    #[tokio::test]
    async fn test_failures_retry_then_dead_letter() {
        let f = fixture();
        let handler = FailingHandler::always("flaky");
        f.handlers.register(handler.clone()).await;
        let id = f
            .enqueue(
                JobRecordBuilder::new()
                    .with_handler("flaky")
                    .with_max_retries(2)
                    .build(),
            )
            .await;

        for expected_retry in 1..=2u32 {
            let now = f.clock.now();
            let outcome = f.run_next().await;
            let ExecutionOutcome::Retrying { attempt, retry_at } = outcome else {
                panic!("expected retry, got {outcome:?}");
            };
            assert_eq!(attempt, expected_retry);
            assert!(retry_at > now);

            let job = f.job(&id).await;
            assert_eq!(job.state, JobState::Scheduled);
            assert_eq!(job.retry_count, expected_retry);
            assert_eq!(job.activate_at, Some(retry_at));
            let failure = job.last_failure.unwrap();
            assert_eq!(failure.kind, FailureKind::Recoverable);
            assert_eq!(failure.attempt, expected_retry);

            f.release_retry(&id).await;
        }

        assert_eq!(f.run_next().await, ExecutionOutcome::DeadLettered);
        let job = f.job(&id).await;
        assert_eq!(job.state, JobState::Deleted);
        assert_eq!(job.retry_count, 2);
        assert!(job.expire_at.is_some());
        assert_eq!(handler.attempts(), 3);
        assert!(JobStateMachine::validate_path(&f.path(&id).await));
    }

    #[tokio::test]
    async fn test_abort_skips_remaining_retries() {
        let f = fixture();
        f.handlers.register(FailingHandler::aborting("strict")).await;
        let id = f
            .enqueue(
                JobRecordBuilder::new()
                    .with_handler("strict")
                    .with_max_retries(5)
                    .build(),
            )
            .await;

        assert_eq!(f.run_next().await, ExecutionOutcome::DeadLettered);
        let job = f.job(&id).await;
        assert_eq!(job.state, JobState::Deleted);
        assert_eq!(job.retry_count, 0);
        assert_eq!(job.last_failure.unwrap().kind, FailureKind::Aborted);
    }

    #[tokio::test]
    async fn test_missing_handler_is_recoverable() {
        let f = fixture();
        let id = f
            .enqueue(
                JobRecordBuilder::new()
                    .with_handler("not-registered")
                    .with_max_retries(1)
                    .build(),
            )
            .await;

        assert!(matches!(
            f.run_next().await,
            ExecutionOutcome::Retrying { attempt: 1, .. }
        ));
        let failure = f.job(&id).await.last_failure.unwrap();
        assert_eq!(failure.kind, FailureKind::HandlerMissing);
        assert!(failure.message.contains("not-registered"));
    }

    #[tokio::test]
    async fn test_execution_timeout() {
        let f = fixture_with(WorkerSettings {
            execution_timeout: Duration::from_millis(50),
            ..settings()
        });
        let handler = SlowHandler::new("slow", Duration::from_secs(30));
        f.handlers.register(handler.clone()).await;
        let id = f
            .enqueue(JobRecordBuilder::new().with_handler("slow").build())
            .await;

        assert_eq!(f.run_next().await, ExecutionOutcome::DeadLettered);
        let failure = f.job(&id).await.last_failure.unwrap();
        assert_eq!(failure.kind, FailureKind::TimedOut);
        assert_eq!(handler.started(), 1);
    }

    #[tokio::test]
    async fn test_cancellation_request_reaches_handler() {
        let f = Arc::new(fixture());
        let handler = SlowHandler::new("slow", Duration::from_secs(30));
        f.handlers.register(handler.clone()).await;
        let id = f
            .enqueue(
                JobRecordBuilder::new()
                    .with_handler("slow")
                    .with_max_retries(3)
                    .build(),
            )
            .await;

        let leased = f.lease("worker-1").await;
        let runner = Arc::clone(&f);
        let execution = tokio::spawn(async move { runner.executor.execute(leased).await });

        while handler.started() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(f.storage.request_cancellation(&id).await.unwrap());

        let outcome = tokio::time::timeout(Duration::from_secs(2), execution)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(outcome, ExecutionOutcome::DeadLettered);
        assert_eq!(handler.cancelled(), 1);

        let job = f.job(&id).await;
        assert_eq!(job.state, JobState::Deleted);
        assert!(!job.cancellation_requested);
    }

    #[tokio::test]
    async fn test_lost_lease_abandons_without_mutation() {
        let f = Arc::new(fixture());
        let handler = SlowHandler::new("slow", Duration::from_secs(30));
        f.handlers.register(handler.clone()).await;
        let id = f
            .enqueue(JobRecordBuilder::new().with_handler("slow").build())
            .await;

        let leased = f.lease("worker-1").await;
        let runner = Arc::clone(&f);
        let execution = tokio::spawn(async move { runner.executor.execute(leased).await });

        while handler.started() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        // 时钟越过租约到期时间，下一次心跳续约失败
        f.clock.advance(chrono::Duration::minutes(10));

        let outcome = tokio::time::timeout(Duration::from_secs(2), execution)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(outcome, ExecutionOutcome::Abandoned);
        assert_eq!(f.job(&id).await.state, JobState::Processing);

        let reclaimed = f.lease("worker-2").await;
        assert_eq!(reclaimed.job.id, id);
        assert_eq!(reclaimed.job.state, JobState::Enqueued);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_is_skipped() {
        let f = fixture();
        f.handlers.register(RecordingHandler::new("email")).await;
        let id = f
            .enqueue(JobRecordBuilder::new().with_handler("email").build())
            .await;
        let leased = f.lease("worker-1").await;

        assert!(f
            .storage
            .compare_and_transition(
                &id,
                JobState::Enqueued,
                StateTransition::to(JobState::Deleted, f.clock.now()),
            )
            .await
            .unwrap());

        assert_eq!(
            f.executor.execute(leased).await.unwrap(),
            ExecutionOutcome::Skipped
        );
        assert!(f.memory.lease_of(&id).await.is_none());
    }

    #[tokio::test]
    async fn test_success_activates_continuations() {
        let f = fixture();
        f.handlers.register(RecordingHandler::new("step")).await;
        let parent = f
            .enqueue(JobRecordBuilder::new().with_handler("step").build())
            .await;

        let child = JobRecordBuilder::new()
            .with_handler("step")
            .with_parents(vec![parent])
            .with_policy(ContinuationPolicy::OnlyOnSucceeded)
            .build();
        let child_id = f.storage.create_job(&child).await.unwrap();
        f.storage
            .compare_and_transition(
                &child_id,
                JobState::Created,
                StateTransition::to(JobState::AwaitingContinuation, f.clock.now()),
            )
            .await
            .unwrap();

        assert_eq!(f.run_next().await, ExecutionOutcome::Succeeded);
        assert_eq!(f.job(&child_id).await.state, JobState::Enqueued);
    }

    #[tokio::test]
    async fn test_heartbeat_keeps_long_job_from_being_reclaimed() {
        let f = Arc::new(fixture_with(WorkerSettings {
            lease_timeout: Duration::from_secs(1),
            ..settings()
        }));
        let handler = SlowHandler::new("slow", Duration::from_millis(500));
        f.handlers.register(handler.clone()).await;
        let id = f
            .enqueue(JobRecordBuilder::new().with_handler("slow").build())
            .await;

        let leased = f
            .lease_for("worker-1", chrono::Duration::seconds(1))
            .await
            .unwrap();
        let runner = Arc::clone(&f);
        let execution = tokio::spawn(async move { runner.executor.execute(leased).await });

        while handler.started() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        // 模拟时间累计超过租约时长，每一步都短于租约，心跳持续续约
        for _ in 0..5 {
            f.clock.advance(chrono::Duration::milliseconds(600));
            tokio::time::sleep(Duration::from_millis(60)).await;
        }
        assert!(f
            .lease_for("worker-2", chrono::Duration::seconds(1))
            .await
            .is_none());
        assert_eq!(f.job(&id).await.state, JobState::Processing);

        let outcome = tokio::time::timeout(Duration::from_secs(2), execution)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(outcome, ExecutionOutcome::Succeeded);
        assert_eq!(handler.started(), 1);
    }

    #[tokio::test]
    async fn test_fatal_store_error_during_heartbeat_is_returned() {
        let memory = InMemoryJobStorage::new();
        let faulty = FaultyStorage::new(Arc::new(memory.clone()));
        let storage: SharedStorage = Arc::new(faulty.clone());
        let (clock, shared_clock) = manual_clock();
        let handlers = HandlerRegistry::new();
        let handler = SlowHandler::new("slow", Duration::from_millis(300));
        handlers.register(handler.clone()).await;
        let continuations = Arc::new(ContinuationManager::new(
            Arc::clone(&storage),
            Arc::clone(&shared_clock),
            &ContinuationConfig::default(),
        ));
        let executor = JobExecutor::new(
            Arc::clone(&storage),
            shared_clock,
            handlers,
            continuations,
            settings(),
        );

        let job = JobRecordBuilder::new().with_handler("slow").build();
        let id = storage.create_job(&job).await.unwrap();
        storage
            .compare_and_transition(
                &id,
                JobState::Created,
                StateTransition::to(JobState::Enqueued, clock.now()),
            )
            .await
            .unwrap();
        let now = clock.now();
        let leased = storage
            .fetch_next_eligible("default", "worker-1", now, now + chrono::Duration::minutes(5))
            .await
            .unwrap()
            .unwrap();

        faulty.fail_renewals();
        let result = tokio::time::timeout(Duration::from_secs(2), executor.execute(leased))
            .await
            .unwrap();
        let err = result.unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(handler.finished(), 0);
        assert_eq!(
            storage.get_job(&id).await.unwrap().unwrap().state,
            JobState::Processing
        );
    }
}
