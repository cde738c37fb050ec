use chrono::{DateTime, Utc};
use jobrunner_errors::{JobError, JobResult};

use crate::entities::{FailureDetail, JobId, JobRecord, JobState, StateHistoryEntry};

/// 任务状态机：维护合法的状态转换边
pub struct JobStateMachine;

impl JobStateMachine {
    pub fn allowed_targets(from: JobState) -> &'static [JobState] {
        use JobState::*;
        match from {
            Created => &[Enqueued, Scheduled, AwaitingContinuation, Deleted],
            Enqueued => &[Processing, Deleted],
            Scheduled => &[Enqueued, Deleted],
            AwaitingContinuation => &[Enqueued, Deleted],
            Processing => &[Succeeded, Failed, Enqueued],
            Failed => &[Scheduled, Deleted],
            Succeeded | Deleted => &[],
        }
    }

    pub fn can_transition(from: JobState, to: JobState) -> bool {
        Self::allowed_targets(from).contains(&to)
    }

    pub fn ensure_transition(job_id: &JobId, from: JobState, to: JobState) -> JobResult<()> {
        if Self::can_transition(from, to) {
            Ok(())
        } else {
            Err(JobError::InvalidTransition {
                job_id: job_id.to_string(),
                from: from.to_string(),
                to: to.to_string(),
            })
        }
    }

    /// 尚未开始执行的任务可以直接取消
    pub fn is_cancellable(state: JobState) -> bool {
        matches!(
            state,
            JobState::Created
                | JobState::Enqueued
                | JobState::Scheduled
                | JobState::AwaitingContinuation
        )
    }

    /// 校验一条完整的状态路径，首个状态必须是 Created
    pub fn validate_path(path: &[JobState]) -> bool {
        match path.first() {
            Some(JobState::Created) => path
                .windows(2)
                .all(|pair| Self::can_transition(pair[0], pair[1])),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ActivationChange {
    #[default]
    Keep,
    Set(DateTime<Utc>),
    Clear,
}

/// 与状态转换在同一存储单元内提交的附带变更
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransitionEffects {
    pub activate_at: ActivationChange,
    pub increment_retry: bool,
    pub failure: Option<FailureDetail>,
    /// None 表示清除过期时间
    pub expire_at: Option<DateTime<Utc>>,
    /// 仅当该持有者持有有效租约时才允许提交
    pub require_lease_owner: Option<String>,
    pub release_lease: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StateTransition {
    pub to: JobState,
    pub at: DateTime<Utc>,
    pub reason: Option<String>,
    pub effects: TransitionEffects,
    pub then: Option<Box<StateTransition>>,
}

impl StateTransition {
    pub fn to(state: JobState, at: DateTime<Utc>) -> Self {
        Self {
            to: state,
            at,
            reason: None,
            effects: TransitionEffects::default(),
            then: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn activate_at(mut self, at: DateTime<Utc>) -> Self {
        self.effects.activate_at = ActivationChange::Set(at);
        self
    }

    pub fn clear_activation(mut self) -> Self {
        self.effects.activate_at = ActivationChange::Clear;
        self
    }

    pub fn increment_retry(mut self) -> Self {
        self.effects.increment_retry = true;
        self
    }

    pub fn with_failure(mut self, failure: FailureDetail) -> Self {
        self.effects.failure = Some(failure);
        self
    }

    pub fn expire_at(mut self, at: DateTime<Utc>) -> Self {
        self.effects.expire_at = Some(at);
        self
    }

    pub fn require_lease(mut self, owner: impl Into<String>) -> Self {
        self.effects.require_lease_owner = Some(owner.into());
        self
    }

    pub fn release_lease(mut self) -> Self {
        self.effects.release_lease = true;
        self
    }

    pub fn then(mut self, next: StateTransition) -> Self {
        let tail = match self.then.take() {
            Some(tail) => (*tail).then(next),
            None => next,
        };
        self.then = Some(Box::new(tail));
        self
    }

    /// 链中的全部步骤
    pub fn steps(&self) -> Vec<&StateTransition> {
        let mut steps = vec![self];
        let mut current = self;
        while let Some(next) = current.then.as_deref() {
            steps.push(next);
            current = next;
        }
        steps
    }

    pub fn final_state(&self) -> JobState {
        self.steps().last().map_or(self.to, |step| step.to)
    }

    /// 链中任一步骤要求的租约持有者
    pub fn required_lease_owner(&self) -> Option<&str> {
        self.steps()
            .into_iter()
            .find_map(|step| step.effects.require_lease_owner.as_deref())
    }

    pub fn releases_lease(&self) -> bool {
        self.steps().iter().any(|step| step.effects.release_lease)
    }
}

/// 在内存中对任务记录应用一条转换链，返回需要追加的状态历史。
/// 调用方负责持久化以及租约相关的校验。
pub fn apply_transition(
    job: &mut JobRecord,
    expected: JobState,
    transition: &StateTransition,
) -> JobResult<Vec<StateHistoryEntry>> {
    if job.state != expected {
        return Err(JobError::StaleState {
            job_id: job.id.to_string(),
            expected: expected.to_string(),
            actual: job.state.to_string(),
        });
    }

    let mut next = job.clone();
    let mut history = Vec::new();
    for step in transition.steps() {
        JobStateMachine::ensure_transition(&next.id, next.state, step.to)?;

        next.state = step.to;
        next.state_changed_at = step.at;
        match step.effects.activate_at {
            ActivationChange::Keep => {}
            ActivationChange::Set(at) => next.activate_at = Some(at),
            ActivationChange::Clear => next.activate_at = None,
        }
        if step.effects.increment_retry {
            if next.retry_count >= next.max_retries {
                return Err(JobError::validation_error(format!(
                    "任务 {} 的重试次数已达上限 {}",
                    next.id, next.max_retries
                )));
            }
            next.retry_count += 1;
        }
        if let Some(failure) = &step.effects.failure {
            next.last_failure = Some(failure.clone());
        }
        next.expire_at = step.effects.expire_at;
        if step.to != JobState::Processing {
            next.cancellation_requested = false;
        }

        history.push(StateHistoryEntry {
            state: step.to,
            reason: step.reason.clone(),
            at: step.at,
        });
    }

    *job = next;
    Ok(history)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{FailureKind, JobPayload};
    use chrono::Duration;
    use crate::entities::JobState::*;

    fn job_in(state: JobState) -> JobRecord {
        let mut job = JobRecord::new(JobPayload::handler_only("noop"), Utc::now());
        job.state = state;
        job
    }

    #[test]
    fn test_legal_edges() {
        assert!(JobStateMachine::can_transition(Created, Enqueued));
        assert!(JobStateMachine::can_transition(Scheduled, Enqueued));
        assert!(JobStateMachine::can_transition(Processing, Enqueued));
        assert!(JobStateMachine::can_transition(Failed, Scheduled));
        assert!(JobStateMachine::can_transition(Failed, Deleted));
    }

    #[test]
    fn test_illegal_edges() {
        assert!(!JobStateMachine::can_transition(Succeeded, Enqueued));
        assert!(!JobStateMachine::can_transition(Deleted, Enqueued));
        assert!(!JobStateMachine::can_transition(Processing, Deleted));
        assert!(!JobStateMachine::can_transition(Created, Processing));
        assert!(!JobStateMachine::can_transition(Scheduled, Processing));

        let id = JobId::new();
        let err = JobStateMachine::ensure_transition(&id, Succeeded, Scheduled).unwrap_err();
        assert!(matches!(err, JobError::InvalidTransition { .. }));
    }

    #[test]
    fn test_terminal_states_have_no_exits() {
        for state in JobState::ALL {
            assert_eq!(
                state.is_terminal(),
                JobStateMachine::allowed_targets(state).is_empty()
            );
        }
    }

    #[test]
    fn test_validate_path() {
        assert!(JobStateMachine::validate_path(&[
            Created, Enqueued, Processing, Succeeded
        ]));
        assert!(JobStateMachine::validate_path(&[
            Created, Enqueued, Processing, Failed, Scheduled, Enqueued, Processing, Failed,
            Deleted
        ]));
        assert!(!JobStateMachine::validate_path(&[Enqueued, Processing]));
        assert!(!JobStateMachine::validate_path(&[
            Created, Enqueued, Succeeded
        ]));
        assert!(!JobStateMachine::validate_path(&[]));
    }

    #[test]
    fn test_apply_transition_chain() {
        let now = Utc::now();
        let mut job = job_in(Processing).with_max_retries(2);
        job.cancellation_requested = true;

        let failure = FailureDetail {
            kind: FailureKind::Recoverable,
            message: "boom".to_string(),
            attempt: 1,
            occurred_at: now,
        };
        let retry_at = now + Duration::seconds(15);
        let transition = StateTransition::to(Failed, now)
            .with_failure(failure.clone())
            .then(
                StateTransition::to(Scheduled, now)
                    .activate_at(retry_at)
                    .increment_retry(),
            );

        let history = apply_transition(&mut job, Processing, &transition).unwrap();
        assert_eq!(
            history.iter().map(|h| h.state).collect::<Vec<_>>(),
            vec![Failed, Scheduled]
        );
        assert_eq!(job.state, Scheduled);
        assert_eq!(job.retry_count, 1);
        assert_eq!(job.activate_at, Some(retry_at));
        assert_eq!(job.last_failure, Some(failure));
        assert!(!job.cancellation_requested);
    }

    #[test]
    fn test_apply_transition_rejects_stale_and_illegal() {
        let now = Utc::now();
        let mut job = job_in(Enqueued);

        let err = apply_transition(&mut job, Scheduled, &StateTransition::to(Enqueued, now))
            .unwrap_err();
        assert!(err.is_stale());

        let err = apply_transition(&mut job, Enqueued, &StateTransition::to(Succeeded, now))
            .unwrap_err();
        assert!(matches!(err, JobError::InvalidTransition { .. }));
        assert_eq!(job.state, Enqueued);
    }

    #[test]
    fn test_retry_count_never_exceeds_max() {
        let now = Utc::now();
        let mut job = job_in(Failed).with_max_retries(1);
        job.retry_count = 1;

        let result = apply_transition(
            &mut job,
            Failed,
            &StateTransition::to(Scheduled, now).increment_retry(),
        );
        assert!(result.is_err());
        assert_eq!(job.retry_count, 1);
        assert_eq!(job.state, Failed);
    }

    #[test]
    fn test_chain_builder_appends_to_tail() {
        let now = Utc::now();
        let chain = StateTransition::to(Enqueued, now)
            .then(StateTransition::to(Processing, now))
            .then(StateTransition::to(Succeeded, now));
        let states: Vec<_> = chain.steps().iter().map(|s| s.to).collect();
        assert_eq!(states, vec![Enqueued, Processing, Succeeded]);
        assert_eq!(chain.final_state(), Succeeded);
    }
}
