//! Test data builders for creating job records with sensible defaults

use chrono::{DateTime, Utc};
use jobrunner_domain::{
    ContinuationPolicy, JobId, JobPayload, JobRecord, JobState, RecurringJobDefinition,
};

use crate::helpers::test_epoch;

/// Builder for creating test JobRecord entities
pub struct JobRecordBuilder {
    job: JobRecord,
}

impl JobRecordBuilder {
    pub fn new() -> Self {
        Self {
            job: JobRecord::new(JobPayload::handler_only("test_handler"), test_epoch()),
        }
    }

    pub fn with_id(mut self, id: JobId) -> Self {
        self.job.id = id;
        self
    }

    pub fn with_handler(mut self, handler: &str) -> Self {
        self.job.payload.handler = handler.to_string();
        self
    }

    pub fn with_arguments(mut self, arguments: serde_json::Value) -> Self {
        self.job.payload.arguments = arguments;
        self
    }

    pub fn with_queue(mut self, queue: &str) -> Self {
        self.job.queue = queue.to_string();
        self
    }

    pub fn with_state(mut self, state: JobState) -> Self {
        self.job.state = state;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.job.max_retries = max_retries;
        self
    }

    pub fn with_parents(mut self, parents: Vec<JobId>) -> Self {
        self.job.parents = parents;
        self
    }

    pub fn with_policy(mut self, policy: ContinuationPolicy) -> Self {
        self.job.continuation_policy = policy;
        self
    }

    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.job.created_at = at;
        self.job.state_changed_at = at;
        self
    }

    pub fn expires_at(mut self, at: DateTime<Utc>) -> Self {
        self.job.expire_at = Some(at);
        self
    }

    pub fn build(self) -> JobRecord {
        self.job
    }
}

impl Default for JobRecordBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for creating test RecurringJobDefinition entities
pub struct RecurringDefinitionBuilder {
    definition: RecurringJobDefinition,
}

impl RecurringDefinitionBuilder {
    pub fn new(id: &str) -> Self {
        let now = test_epoch();
        Self {
            definition: RecurringJobDefinition::new(
                id,
                "* * * * *",
                JobPayload::handler_only("test_handler"),
                now,
                now,
            ),
        }
    }

    pub fn with_cron(mut self, cron: &str) -> Self {
        self.definition.cron = cron.to_string();
        self
    }

    pub fn with_handler(mut self, handler: &str) -> Self {
        self.definition.payload.handler = handler.to_string();
        self
    }

    pub fn with_queue(mut self, queue: &str) -> Self {
        self.definition.queue = queue.to_string();
        self
    }

    pub fn next_fire_at(mut self, at: DateTime<Utc>) -> Self {
        self.definition.next_fire_at = at;
        self
    }

    pub fn build(self) -> RecurringJobDefinition {
        self.definition
    }
}
