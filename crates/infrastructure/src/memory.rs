use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobrunner_domain::{
    apply_transition, JobId, JobRecord, JobRepository, JobState, Lease, LeaseRenewal, LeasedJob,
    RecurringJobDefinition, RecurringJobRepository, StateHistoryEntry, StateTransition,
};
use jobrunner_errors::{JobError, JobResult};
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Clone)]
struct StoredJob {
    /// 创建顺序，用于队列内 FIFO
    seq: u64,
    record: JobRecord,
}

#[derive(Debug, Default)]
struct MemoryState {
    jobs: HashMap<JobId, StoredJob>,
    leases: HashMap<JobId, Lease>,
    history: HashMap<JobId, Vec<StateHistoryEntry>>,
    recurring: HashMap<String, RecurringJobDefinition>,
    next_seq: u64,
}

impl MemoryState {
    fn insert_created(&mut self, job: &JobRecord) -> JobResult<()> {
        if job.state != JobState::Created {
            return Err(JobError::validation_error(format!(
                "新任务必须处于 CREATED 状态: {}",
                job.state
            )));
        }
        if self.jobs.contains_key(&job.id) {
            return Err(JobError::DuplicateId {
                job_id: job.id.to_string(),
            });
        }
        self.next_seq += 1;
        self.jobs.insert(
            job.id,
            StoredJob {
                seq: self.next_seq,
                record: job.clone(),
            },
        );
        self.history.insert(
            job.id,
            vec![StateHistoryEntry {
                state: JobState::Created,
                reason: None,
                at: job.created_at,
            }],
        );
        Ok(())
    }

    fn has_valid_lease(&self, id: &JobId, now: DateTime<Utc>) -> bool {
        self.leases.get(id).is_some_and(|lease| lease.is_valid_at(now))
    }

    fn transition(
        &mut self,
        id: &JobId,
        expected: JobState,
        transition: &StateTransition,
    ) -> JobResult<bool> {
        let Some(stored) = self.jobs.get(id) else {
            return Ok(false);
        };
        if stored.record.state != expected {
            return Ok(false);
        }
        if let Some(owner) = transition.required_lease_owner() {
            let held = self
                .leases
                .get(id)
                .is_some_and(|lease| lease.is_held_by(owner, transition.at));
            if !held {
                return Ok(false);
            }
        }

        let mut record = stored.record.clone();
        let entries = apply_transition(&mut record, expected, transition)?;

        if let Some(stored) = self.jobs.get_mut(id) {
            stored.record = record;
        }
        self.history.entry(*id).or_default().extend(entries);
        if transition.releases_lease() {
            self.leases.remove(id);
        }
        Ok(true)
    }
}

/// 内存存储，语义与 SQLite 存储一致，用于测试与单进程部署
#[derive(Debug, Clone, Default)]
pub struct InMemoryJobStorage {
    state: Arc<Mutex<MemoryState>>,
}

impl InMemoryJobStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn job_count(&self) -> usize {
        self.state.lock().await.jobs.len()
    }

    pub async fn lease_of(&self, id: &JobId) -> Option<Lease> {
        self.state.lock().await.leases.get(id).cloned()
    }
}

#[async_trait]
impl JobRepository for InMemoryJobStorage {
    async fn create_job(&self, job: &JobRecord) -> JobResult<JobId> {
        let mut state = self.state.lock().await;
        state.insert_created(job)?;
        debug!("创建任务: {}", job.entity_description());
        Ok(job.id)
    }

    async fn get_job(&self, id: &JobId) -> JobResult<Option<JobRecord>> {
        let state = self.state.lock().await;
        Ok(state.jobs.get(id).map(|stored| stored.record.clone()))
    }

    async fn state_history(&self, id: &JobId) -> JobResult<Vec<StateHistoryEntry>> {
        let state = self.state.lock().await;
        Ok(state.history.get(id).cloned().unwrap_or_default())
    }

    async fn compare_and_transition(
        &self,
        id: &JobId,
        expected: JobState,
        transition: StateTransition,
    ) -> JobResult<bool> {
        let mut state = self.state.lock().await;
        state.transition(id, expected, &transition)
    }

    async fn fetch_next_eligible(
        &self,
        queue: &str,
        owner: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> JobResult<Option<LeasedJob>> {
        let mut state = self.state.lock().await;

        let candidate = state
            .jobs
            .values()
            .filter(|stored| stored.record.queue == queue)
            .filter(|stored| match stored.record.state {
                JobState::Enqueued => {
                    stored.record.is_activation_elapsed(now)
                        && !state.has_valid_lease(&stored.record.id, now)
                }
                JobState::Processing => !state.has_valid_lease(&stored.record.id, now),
                _ => false,
            })
            .min_by_key(|stored| stored.seq)
            .map(|stored| (stored.record.id, stored.record.state));

        let Some((id, current)) = candidate else {
            return Ok(None);
        };

        if current == JobState::Processing {
            let requeue = StateTransition::to(JobState::Enqueued, now)
                .with_reason("租约已过期，重新入队")
                .clear_activation();
            state.transition(&id, JobState::Processing, &requeue)?;
            debug!("回收租约过期的任务: {}", id);
        }

        let lease = Lease {
            job_id: id,
            owner: owner.to_string(),
            acquired_at: now,
            expires_at: lease_until,
        };
        state.leases.insert(id, lease.clone());

        let job = state
            .jobs
            .get(&id)
            .map(|stored| stored.record.clone())
            .ok_or_else(|| JobError::job_not_found(id))?;
        Ok(Some(LeasedJob { job, lease }))
    }

    async fn renew_lease(
        &self,
        id: &JobId,
        owner: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> JobResult<LeaseRenewal> {
        let mut state = self.state.lock().await;
        let cancellation_requested = state
            .jobs
            .get(id)
            .is_some_and(|stored| stored.record.cancellation_requested);

        match state.leases.get_mut(id) {
            Some(lease) if lease.is_held_by(owner, now) => {
                lease.expires_at = lease_until;
                Ok(LeaseRenewal {
                    expires_at: lease_until,
                    cancellation_requested,
                })
            }
            _ => Err(JobError::lease_expired(id, owner)),
        }
    }

    async fn release_lease(&self, id: &JobId, owner: &str) -> JobResult<()> {
        let mut state = self.state.lock().await;
        if state.leases.get(id).is_some_and(|lease| lease.owner == owner) {
            state.leases.remove(id);
        }
        Ok(())
    }

    async fn list_due_scheduled(
        &self,
        now: DateTime<Utc>,
        after: Option<JobId>,
        limit: usize,
    ) -> JobResult<Vec<JobRecord>> {
        let state = self.state.lock().await;
        let mut due: Vec<JobRecord> = state
            .jobs
            .values()
            .map(|stored| &stored.record)
            .filter(|job| job.state == JobState::Scheduled && job.is_activation_elapsed(now))
            .filter(|job| after.map_or(true, |cursor| job.id > cursor))
            .cloned()
            .collect();
        due.sort_by_key(|job| job.id);
        due.truncate(limit);
        Ok(due)
    }

    async fn find_children(&self, parent_id: &JobId) -> JobResult<Vec<JobRecord>> {
        let state = self.state.lock().await;
        let mut children: Vec<&StoredJob> = state
            .jobs
            .values()
            .filter(|stored| stored.record.parents.contains(parent_id))
            .collect();
        children.sort_by_key(|stored| stored.seq);
        Ok(children.into_iter().map(|s| s.record.clone()).collect())
    }

    async fn list_awaiting_continuations(
        &self,
        after: Option<JobId>,
        limit: usize,
    ) -> JobResult<Vec<JobRecord>> {
        let state = self.state.lock().await;
        let mut waiting: Vec<JobRecord> = state
            .jobs
            .values()
            .map(|stored| &stored.record)
            .filter(|job| job.state == JobState::AwaitingContinuation)
            .filter(|job| after.map_or(true, |cursor| job.id > cursor))
            .cloned()
            .collect();
        waiting.sort_by_key(|job| job.id);
        waiting.truncate(limit);
        Ok(waiting)
    }

    async fn request_cancellation(&self, id: &JobId) -> JobResult<bool> {
        let mut state = self.state.lock().await;
        match state.jobs.get_mut(id) {
            Some(stored) if stored.record.state == JobState::Processing => {
                stored.record.cancellation_requested = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn sweep_expired(&self, now: DateTime<Utc>) -> JobResult<u64> {
        let mut state = self.state.lock().await;
        let expired: Vec<JobId> = state
            .jobs
            .values()
            .filter(|stored| stored.record.is_expired(now))
            .map(|stored| stored.record.id)
            .collect();
        for id in &expired {
            state.jobs.remove(id);
            state.history.remove(id);
            state.leases.remove(id);
        }
        Ok(expired.len() as u64)
    }

    async fn count_by_state(&self, job_state: JobState) -> JobResult<u64> {
        let state = self.state.lock().await;
        Ok(state
            .jobs
            .values()
            .filter(|stored| stored.record.state == job_state)
            .count() as u64)
    }
}

#[async_trait]
impl RecurringJobRepository for InMemoryJobStorage {
    async fn upsert_recurring(&self, definition: &RecurringJobDefinition) -> JobResult<()> {
        let mut state = self.state.lock().await;
        match state.recurring.get_mut(&definition.id) {
            Some(existing) => {
                if existing.cron != definition.cron {
                    existing.cron = definition.cron.clone();
                    existing.next_fire_at = definition.next_fire_at;
                }
                existing.payload = definition.payload.clone();
                existing.queue = definition.queue.clone();
                existing.updated_at = definition.updated_at;
            }
            None => {
                state
                    .recurring
                    .insert(definition.id.clone(), definition.clone());
            }
        }
        Ok(())
    }

    async fn get_recurring(&self, id: &str) -> JobResult<Option<RecurringJobDefinition>> {
        Ok(self.state.lock().await.recurring.get(id).cloned())
    }

    async fn list_recurring(&self) -> JobResult<Vec<RecurringJobDefinition>> {
        let state = self.state.lock().await;
        let mut definitions: Vec<_> = state.recurring.values().cloned().collect();
        definitions.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(definitions)
    }

    async fn remove_recurring(&self, id: &str) -> JobResult<bool> {
        Ok(self.state.lock().await.recurring.remove(id).is_some())
    }

    async fn list_due_recurring(
        &self,
        now: DateTime<Utc>,
    ) -> JobResult<Vec<RecurringJobDefinition>> {
        let state = self.state.lock().await;
        let mut due: Vec<_> = state
            .recurring
            .values()
            .filter(|definition| definition.is_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|definition| definition.next_fire_at);
        Ok(due)
    }

    async fn fire_recurring(
        &self,
        id: &str,
        expected_next_fire: DateTime<Utc>,
        job: &JobRecord,
        fired_at: DateTime<Utc>,
        next_fire: DateTime<Utc>,
    ) -> JobResult<bool> {
        let mut state = self.state.lock().await;
        match state.recurring.get(id) {
            Some(definition) if definition.next_fire_at == expected_next_fire => {}
            _ => return Ok(false),
        }

        state.insert_created(job)?;
        let enqueue = StateTransition::to(JobState::Enqueued, fired_at)
            .with_reason(format!("由周期任务 {id} 触发"));
        state.transition(&job.id, JobState::Created, &enqueue)?;

        if let Some(definition) = state.recurring.get_mut(id) {
            definition.last_fired_at = Some(fired_at);
            definition.last_job_id = Some(job.id);
            definition.next_fire_at = next_fire;
            definition.updated_at = fired_at;
        }
        Ok(true)
    }
}
