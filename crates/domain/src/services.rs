//! 领域服务
//!
//! 在持久化契约之上封装状态转换的并发语义。

use jobrunner_errors::{JobError, JobResult};

use crate::entities::{JobId, JobState};
use crate::repositories::JobRepository;
use crate::state_machine::{JobStateMachine, StateTransition};

/// 状态变更服务
///
/// 先在本地校验转换边，再交给存储做条件更新。
/// 条件更新失败时读取当前状态并返回 `StaleState`，调用方可据此放弃本次操作。
pub struct JobStateChanger<'a, R: JobRepository + ?Sized> {
    repo: &'a R,
}

impl<'a, R: JobRepository + ?Sized> JobStateChanger<'a, R> {
    pub fn new(repo: &'a R) -> Self {
        Self { repo }
    }

    pub async fn transition(
        &self,
        id: &JobId,
        expected: JobState,
        transition: StateTransition,
    ) -> JobResult<()> {
        JobStateMachine::ensure_transition(id, expected, transition.to)?;

        if self
            .repo
            .compare_and_transition(id, expected, transition)
            .await?
        {
            return Ok(());
        }

        let actual = self
            .repo
            .get_job(id)
            .await?
            .map(|job| job.state.to_string())
            .unwrap_or_else(|| "MISSING".to_string());
        Err(JobError::StaleState {
            job_id: id.to_string(),
            expected: expected.to_string(),
            actual,
        })
    }

    /// 与 `transition` 相同，但把状态冲突视为正常的竞争失败
    pub async fn try_transition(
        &self,
        id: &JobId,
        expected: JobState,
        transition: StateTransition,
    ) -> JobResult<bool> {
        match self.transition(id, expected, transition).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_stale() => Ok(false),
            Err(e) => Err(e),
        }
    }
}
