use std::sync::Arc;

use chrono::{DateTime, Utc};
use jobrunner_core::{ExpirationConfig, RetryConfig};
use jobrunner_dispatcher::ContinuationManager;
use jobrunner_domain::{
    ContinuationPolicy, JobId, JobPayload, JobRecord, JobState, JobStateChanger, JobStateMachine,
    JobStorage, SharedClock, SharedStorage, StateHistoryEntry, StateTransition,
};
use jobrunner_errors::{JobError, JobResult};
use tracing::{debug, info};

/// 创建任务时的可选参数
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobOptions {
    pub queue: Option<String>,
    pub max_retries: Option<u32>,
}

impl JobOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// 任务客户端
///
/// 面向业务代码的入口：立即执行、延迟执行、延续执行与取消。
/// 新任务先以 Created 状态写入，再通过条件转换进入目标状态，
/// 进程在两步之间崩溃时留下的 Created 记录会按过期时间被清理。
#[derive(Clone)]
pub struct JobClient {
    storage: SharedStorage,
    clock: SharedClock,
    continuations: Arc<ContinuationManager>,
    default_max_retries: u32,
    created_ttl: chrono::Duration,
    deleted_ttl: chrono::Duration,
}

impl JobClient {
    pub fn new(
        storage: SharedStorage,
        clock: SharedClock,
        continuations: Arc<ContinuationManager>,
        retry: &RetryConfig,
        expiration: &ExpirationConfig,
    ) -> Self {
        Self {
            storage,
            clock,
            continuations,
            default_max_retries: retry.default_max_retries,
            created_ttl: expiration.created_ttl(),
            deleted_ttl: expiration.deleted_ttl(),
        }
    }

    pub async fn enqueue(&self, payload: JobPayload) -> JobResult<JobId> {
        self.enqueue_with(payload, JobOptions::default()).await
    }

    pub async fn enqueue_with(&self, payload: JobPayload, options: JobOptions) -> JobResult<JobId> {
        let job = self.create(payload, &options, Vec::new(), ContinuationPolicy::default()).await?;
        let now = self.clock.now();
        self.changer()
            .transition(
                &job.id,
                JobState::Created,
                StateTransition::to(JobState::Enqueued, now).with_reason("立即执行"),
            )
            .await?;
        info!("任务已入队: {}", job.entity_description());
        Ok(job.id)
    }

    /// 延迟 `delay` 后执行
    pub async fn schedule(&self, payload: JobPayload, delay: chrono::Duration) -> JobResult<JobId> {
        let at = self.clock.now() + delay;
        self.schedule_at(payload, at).await
    }

    pub async fn schedule_at(&self, payload: JobPayload, at: DateTime<Utc>) -> JobResult<JobId> {
        self.schedule_with(payload, at, JobOptions::default()).await
    }

    pub async fn schedule_with(
        &self,
        payload: JobPayload,
        at: DateTime<Utc>,
        options: JobOptions,
    ) -> JobResult<JobId> {
        let job = self.create(payload, &options, Vec::new(), ContinuationPolicy::default()).await?;
        let transition = StateTransition::to(JobState::Scheduled, self.clock.now())
            .with_reason(format!("计划于 {} 执行", at.format("%Y-%m-%d %H:%M:%S UTC")))
            .activate_at(at);
        self.changer()
            .transition(&job.id, JobState::Created, transition)
            .await?;
        info!("任务已计划: {}，执行时间: {}", job.entity_description(), at);
        Ok(job.id)
    }

    /// 父任务成功后执行
    pub async fn continue_with(&self, parent: JobId, payload: JobPayload) -> JobResult<JobId> {
        self.continue_with_options(
            vec![parent],
            payload,
            ContinuationPolicy::OnlyOnSucceeded,
            JobOptions::default(),
        )
        .await
    }

    /// 所有父任务满足 `policy` 后执行。
    /// 父任务在子任务创建前就已完成时，子任务会立即入队。
    pub async fn continue_with_options(
        &self,
        parents: Vec<JobId>,
        payload: JobPayload,
        policy: ContinuationPolicy,
        options: JobOptions,
    ) -> JobResult<JobId> {
        if parents.is_empty() {
            return Err(JobError::validation_error("延续任务至少需要一个父任务"));
        }
        for parent in &parents {
            if self.storage.get_job(parent).await?.is_none() {
                return Err(JobError::job_not_found(parent));
            }
        }

        let job = self.create(payload, &options, parents, policy).await?;
        let transition = StateTransition::to(JobState::AwaitingContinuation, self.clock.now())
            .with_reason("等待父任务完成");
        self.changer()
            .transition(&job.id, JobState::Created, transition)
            .await?;

        let awaiting = JobRecord {
            state: JobState::AwaitingContinuation,
            ..job
        };
        if self.continuations.try_activate(&awaiting).await? {
            debug!("父任务均已完成，延续任务 {} 直接入队", awaiting.id);
        } else {
            info!("延续任务已创建: {}", awaiting.entity_description());
        }
        Ok(awaiting.id)
    }

    /// 取消任务。
    ///
    /// 尚未执行的任务直接进入 Deleted；执行中的任务记录取消请求，
    /// 由心跳转发给处理器。状态发生变化或记录了请求时返回 true，
    /// 任务已处于终态时返回 false。
    pub async fn cancel(&self, id: &JobId) -> JobResult<bool> {
        loop {
            let job = self
                .storage
                .get_job(id)
                .await?
                .ok_or_else(|| JobError::job_not_found(id))?;

            if JobStateMachine::is_cancellable(job.state) {
                let now = self.clock.now();
                let transition = StateTransition::to(JobState::Deleted, now)
                    .with_reason("任务已被取消")
                    .expire_at(now + self.deleted_ttl);
                if self
                    .storage
                    .compare_and_transition(id, job.state, transition)
                    .await?
                {
                    info!("任务 {} 已取消 (原状态: {})", id, job.state);
                    self.continuations.on_parent_finished(id).await?;
                    return Ok(true);
                }
                // 状态已被并发修改，重新读取
                continue;
            }

            if job.state == JobState::Processing {
                if self.storage.request_cancellation(id).await? {
                    info!("任务 {} 正在执行，已记录取消请求", id);
                    return Ok(true);
                }
                continue;
            }

            debug!("任务 {} 已处于 {} 状态，无需取消", id, job.state);
            return Ok(false);
        }
    }

    pub async fn get_job(&self, id: &JobId) -> JobResult<Option<JobRecord>> {
        self.storage.get_job(id).await
    }

    pub async fn history(&self, id: &JobId) -> JobResult<Vec<StateHistoryEntry>> {
        self.storage.state_history(id).await
    }

    async fn create(
        &self,
        payload: JobPayload,
        options: &JobOptions,
        parents: Vec<JobId>,
        policy: ContinuationPolicy,
    ) -> JobResult<JobRecord> {
        if payload.handler.trim().is_empty() {
            return Err(JobError::validation_error("处理器名称不能为空"));
        }
        let now = self.clock.now();
        let mut job = JobRecord::new(payload, now)
            .with_max_retries(options.max_retries.unwrap_or(self.default_max_retries))
            .with_parents(parents, policy)
            .with_expiration(Some(now + self.created_ttl));
        if let Some(queue) = &options.queue {
            job = job.with_queue(queue.clone());
        }
        self.storage.create_job(&job).await?;
        Ok(job)
    }

    fn changer(&self) -> JobStateChanger<'_, dyn JobStorage> {
        JobStateChanger::new(self.storage.as_ref())
    }
}
