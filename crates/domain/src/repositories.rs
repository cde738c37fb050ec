//! 持久化契约
//!
//! 所有组件之间的协调都通过这里定义的存储接口完成，
//! 每个调用都是原子的：要么完整提交，要么没有任何可见的效果。

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, Stream};
use jobrunner_errors::{JobError, JobResult};

use crate::entities::{
    JobId, JobRecord, JobState, LeaseRenewal, LeasedJob, RecurringJobDefinition,
    StateHistoryEntry,
};
use crate::state_machine::StateTransition;

/// 任务仓储抽象
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// 持久化一个处于 Created 状态的新任务，ID重复时返回 DuplicateId
    async fn create_job(&self, job: &JobRecord) -> JobResult<JobId>;

    async fn get_job(&self, id: &JobId) -> JobResult<Option<JobRecord>>;

    async fn state_history(&self, id: &JobId) -> JobResult<Vec<StateHistoryEntry>>;

    /// 条件更新：只有持久化状态等于 expected 时才提交整条转换链。
    /// 状态已变更返回 false，非法转换返回错误。
    async fn compare_and_transition(
        &self,
        id: &JobId,
        expected: JobState,
        transition: StateTransition,
    ) -> JobResult<bool>;

    /// 取出队列中最早创建的可执行任务并加租约。
    /// 租约已过期的 Processing 任务会在同一单元内先回到 Enqueued。
    async fn fetch_next_eligible(
        &self,
        queue: &str,
        owner: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> JobResult<Option<LeasedJob>>;

    async fn renew_lease(
        &self,
        id: &JobId,
        owner: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> JobResult<LeaseRenewal>;

    async fn release_lease(&self, id: &JobId, owner: &str) -> JobResult<()>;

    /// 按ID游标分页列出已到期的 Scheduled 任务
    async fn list_due_scheduled(
        &self,
        now: DateTime<Utc>,
        after: Option<JobId>,
        limit: usize,
    ) -> JobResult<Vec<JobRecord>>;

    async fn find_children(&self, parent_id: &JobId) -> JobResult<Vec<JobRecord>>;

    async fn list_awaiting_continuations(
        &self,
        after: Option<JobId>,
        limit: usize,
    ) -> JobResult<Vec<JobRecord>>;

    /// 为 Processing 任务记录取消请求，任务不在执行中时返回 false
    async fn request_cancellation(&self, id: &JobId) -> JobResult<bool>;

    /// 删除已过期的 Created 与终态记录，返回删除数量
    async fn sweep_expired(&self, now: DateTime<Utc>) -> JobResult<u64>;

    async fn count_by_state(&self, state: JobState) -> JobResult<u64>;
}

/// 周期任务仓储抽象
#[async_trait]
pub trait RecurringJobRepository: Send + Sync {
    /// 按ID插入或更新定义，更新时保留 created_at 与触发记录。
    /// CRON表达式未变化时保留已存储的 next_fire_at，不会回退其他节点推进过的触发时间。
    async fn upsert_recurring(&self, definition: &RecurringJobDefinition) -> JobResult<()>;

    async fn get_recurring(&self, id: &str) -> JobResult<Option<RecurringJobDefinition>>;

    async fn list_recurring(&self) -> JobResult<Vec<RecurringJobDefinition>>;

    async fn remove_recurring(&self, id: &str) -> JobResult<bool>;

    async fn list_due_recurring(&self, now: DateTime<Utc>)
        -> JobResult<Vec<RecurringJobDefinition>>;

    /// 在同一单元内创建任务并推进下次触发时间，
    /// 只有 next_fire_at 仍等于 expected_next_fire 时才提交。
    async fn fire_recurring(
        &self,
        id: &str,
        expected_next_fire: DateTime<Utc>,
        job: &JobRecord,
        fired_at: DateTime<Utc>,
        next_fire: DateTime<Utc>,
    ) -> JobResult<bool>;
}

pub trait JobStorage: JobRepository + RecurringJobRepository {}

impl<T: JobRepository + RecurringJobRepository + ?Sized> JobStorage for T {}

pub type SharedStorage = Arc<dyn JobStorage>;

/// 以流的形式分页读取到期的 Scheduled 任务
pub fn due_scheduled_stream<'a, R>(
    repo: &'a R,
    now: DateTime<Utc>,
    page_size: usize,
) -> impl Stream<Item = JobResult<JobRecord>> + Send + 'a
where
    R: JobRepository + ?Sized,
{
    let pages = stream::try_unfold(Some(None::<JobId>), move |cursor| async move {
        let Some(after) = cursor else {
            return Ok(None);
        };
        let page = repo.list_due_scheduled(now, after, page_size).await?;
        if page.is_empty() {
            return Ok(None);
        }
        let next_cursor = if page.len() < page_size {
            None
        } else {
            page.last().map(|job| Some(job.id))
        };
        Ok::<_, JobError>(Some((stream::iter(page.into_iter().map(Ok)), next_cursor)))
    });
    futures::TryStreamExt::try_flatten(pages)
}
