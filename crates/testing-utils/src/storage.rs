//! Storage wrapper with injectable faults

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobrunner_domain::{
    JobId, JobRecord, JobRepository, JobState, LeaseRenewal, LeasedJob, RecurringJobDefinition,
    RecurringJobRepository, SharedStorage, StateHistoryEntry, StateTransition,
};
use jobrunner_errors::{JobError, JobResult};

/// Delegates to an inner store; lease renewal can be switched to a fatal error
#[derive(Clone)]
pub struct FaultyStorage {
    inner: SharedStorage,
    fail_renewals: Arc<AtomicBool>,
}

impl FaultyStorage {
    pub fn new(inner: SharedStorage) -> Self {
        Self {
            inner,
            fail_renewals: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn fail_renewals(&self) {
        self.fail_renewals.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl JobRepository for FaultyStorage {
    async fn create_job(&self, job: &JobRecord) -> JobResult<JobId> {
        self.inner.create_job(job).await
    }

    async fn get_job(&self, id: &JobId) -> JobResult<Option<JobRecord>> {
        self.inner.get_job(id).await
    }

    async fn state_history(&self, id: &JobId) -> JobResult<Vec<StateHistoryEntry>> {
        self.inner.state_history(id).await
    }

    async fn compare_and_transition(
        &self,
        id: &JobId,
        expected: JobState,
        transition: StateTransition,
    ) -> JobResult<bool> {
        self.inner.compare_and_transition(id, expected, transition).await
    }

    async fn fetch_next_eligible(
        &self,
        queue: &str,
        owner: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> JobResult<Option<LeasedJob>> {
        self.inner
            .fetch_next_eligible(queue, owner, now, lease_until)
            .await
    }

    async fn renew_lease(
        &self,
        id: &JobId,
        owner: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> JobResult<LeaseRenewal> {
        if self.fail_renewals.load(Ordering::SeqCst) {
            return Err(JobError::fatal("storage unavailable"));
        }
        self.inner.renew_lease(id, owner, now, lease_until).await
    }

    async fn release_lease(&self, id: &JobId, owner: &str) -> JobResult<()> {
        self.inner.release_lease(id, owner).await
    }

    async fn list_due_scheduled(
        &self,
        now: DateTime<Utc>,
        after: Option<JobId>,
        limit: usize,
    ) -> JobResult<Vec<JobRecord>> {
        self.inner.list_due_scheduled(now, after, limit).await
    }

    async fn find_children(&self, parent_id: &JobId) -> JobResult<Vec<JobRecord>> {
        self.inner.find_children(parent_id).await
    }

    async fn list_awaiting_continuations(
        &self,
        after: Option<JobId>,
        limit: usize,
    ) -> JobResult<Vec<JobRecord>> {
        self.inner.list_awaiting_continuations(after, limit).await
    }

    async fn request_cancellation(&self, id: &JobId) -> JobResult<bool> {
        self.inner.request_cancellation(id).await
    }

    async fn sweep_expired(&self, now: DateTime<Utc>) -> JobResult<u64> {
        self.inner.sweep_expired(now).await
    }

    async fn count_by_state(&self, state: JobState) -> JobResult<u64> {
        self.inner.count_by_state(state).await
    }
}

#[async_trait]
impl RecurringJobRepository for FaultyStorage {
    async fn upsert_recurring(&self, definition: &RecurringJobDefinition) -> JobResult<()> {
        self.inner.upsert_recurring(definition).await
    }

    async fn get_recurring(&self, id: &str) -> JobResult<Option<RecurringJobDefinition>> {
        self.inner.get_recurring(id).await
    }

    async fn list_recurring(&self) -> JobResult<Vec<RecurringJobDefinition>> {
        self.inner.list_recurring().await
    }

    async fn remove_recurring(&self, id: &str) -> JobResult<bool> {
        self.inner.remove_recurring(id).await
    }

    async fn list_due_recurring(
        &self,
        now: DateTime<Utc>,
    ) -> JobResult<Vec<RecurringJobDefinition>> {
        self.inner.list_due_recurring(now).await
    }

    async fn fire_recurring(
        &self,
        id: &str,
        expected_next_fire: DateTime<Utc>,
        job: &JobRecord,
        fired_at: DateTime<Utc>,
        next_fire: DateTime<Utc>,
    ) -> JobResult<bool> {
        self.inner
            .fire_recurring(id, expected_next_fire, job, fired_at, next_fire)
            .await
    }
}
