use std::sync::Arc;

use jobrunner_dispatcher::{CronSchedule, RecurringJobRegistry};
use jobrunner_domain::{
    JobId, JobPayload, RecurringJobDefinition, SharedClock, SharedStorage, DEFAULT_QUEUE,
};
use jobrunner_errors::{JobError, JobResult};
use tracing::info;

/// 周期任务管理
///
/// 按ID注册或更新周期任务定义。重复注册同一定义是幂等的：
/// CRON表达式未变化时保留原有的下次触发时间。
#[derive(Clone)]
pub struct RecurringJobManager {
    storage: SharedStorage,
    clock: SharedClock,
    registry: Arc<RecurringJobRegistry>,
}

impl RecurringJobManager {
    pub fn new(
        storage: SharedStorage,
        clock: SharedClock,
        registry: Arc<RecurringJobRegistry>,
    ) -> Self {
        Self {
            storage,
            clock,
            registry,
        }
    }

    pub async fn add_or_update(&self, id: &str, payload: JobPayload, cron: &str) -> JobResult<()> {
        self.add_or_update_with(id, payload, cron, DEFAULT_QUEUE).await
    }

    pub async fn add_or_update_with(
        &self,
        id: &str,
        payload: JobPayload,
        cron: &str,
        queue: &str,
    ) -> JobResult<()> {
        if id.trim().is_empty() {
            return Err(JobError::validation_error("周期任务ID不能为空"));
        }
        if payload.handler.trim().is_empty() {
            return Err(JobError::validation_error("处理器名称不能为空"));
        }
        CronSchedule::validate(cron)?;

        let now = self.clock.now();
        let existing = self.storage.get_recurring(id).await?;
        let next_fire_at = match &existing {
            Some(current) if current.cron == cron => current.next_fire_at,
            _ => RecurringJobRegistry::first_fire_after(cron, now)?,
        };

        let mut definition = RecurringJobDefinition::new(id, cron, payload, next_fire_at, now)
            .with_queue(queue);
        if let Some(current) = existing {
            definition.created_at = current.created_at;
            definition.last_fired_at = current.last_fired_at;
            definition.last_job_id = current.last_job_id;
        }

        self.storage.upsert_recurring(&definition).await?;
        info!(
            "周期任务 {} 已注册，CRON: {}，下次触发时间: {}",
            id, cron, definition.next_fire_at
        );
        Ok(())
    }

    /// 删除定义，不存在时返回 false
    pub async fn remove_if_exists(&self, id: &str) -> JobResult<bool> {
        let removed = self.storage.remove_recurring(id).await?;
        if removed {
            info!("周期任务 {} 已删除", id);
        }
        Ok(removed)
    }

    pub async fn trigger(&self, id: &str) -> JobResult<JobId> {
        self.registry.trigger(id).await
    }

    pub async fn get(&self, id: &str) -> JobResult<Option<RecurringJobDefinition>> {
        self.storage.get_recurring(id).await
    }

    pub async fn list(&self) -> JobResult<Vec<RecurringJobDefinition>> {
        self.storage.list_recurring().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobrunner_core::{ExpirationConfig, RecurringConfig, RetryConfig};
    use jobrunner_domain::{Clock, JobState, ManualClock};
    use jobrunner_infrastructure::InMemoryJobStorage;
    use jobrunner_testing_utils::manual_clock;

    fn fixture() -> (SharedStorage, ManualClock, RecurringJobManager) {
        let storage: SharedStorage = Arc::new(InMemoryJobStorage::new());
        let (clock, shared) = manual_clock();
        let registry = Arc::new(RecurringJobRegistry::new(
            Arc::clone(&storage),
            Arc::clone(&shared),
            &RecurringConfig::default(),
            &RetryConfig::default(),
            &ExpirationConfig::default(),
        ));
        let manager = RecurringJobManager::new(Arc::clone(&storage), shared, registry);
        (storage, clock, manager)
    }

    #[tokio::test]
    async fn test_add_or_update_is_idempotent() {
        let (_storage, clock, manager) = fixture();
        manager
            .add_or_update("report", JobPayload::handler_only("build_report"), "0 * * * *")
            .await
            .unwrap();
        let first = manager.get("report").await.unwrap().unwrap();
        assert_eq!(first.next_fire_at, clock.now() + chrono::Duration::hours(1));

        clock.advance(chrono::Duration::minutes(30));
        manager
            .add_or_update("report", JobPayload::handler_only("build_report"), "0 * * * *")
            .await
            .unwrap();
        let second = manager.get("report").await.unwrap().unwrap();
        assert_eq!(second.next_fire_at, first.next_fire_at);
        assert_eq!(second.created_at, first.created_at);
        assert_eq!(manager.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_changed_cron_recomputes_next_fire() {
        let (_storage, clock, manager) = fixture();
        manager
            .add_or_update("cleanup", JobPayload::handler_only("cleanup"), "0 0 * * *")
            .await
            .unwrap();
        manager
            .add_or_update_with(
                "cleanup",
                JobPayload::handler_only("cleanup"),
                "*/5 * * * *",
                "maintenance",
            )
            .await
            .unwrap();

        let definition = manager.get("cleanup").await.unwrap().unwrap();
        assert_eq!(definition.cron, "*/5 * * * *");
        assert_eq!(definition.queue, "maintenance");
        assert_eq!(
            definition.next_fire_at,
            clock.now() + chrono::Duration::minutes(5)
        );
    }

    #[tokio::test]
    async fn test_invalid_cron_is_rejected() {
        let (_storage, _clock, manager) = fixture();
        let err = manager
            .add_or_update("broken", JobPayload::handler_only("noop"), "every minute")
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::InvalidCron { .. }));
        assert!(manager.get("broken").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_remove_if_exists() {
        let (_storage, _clock, manager) = fixture();
        manager
            .add_or_update("report", JobPayload::handler_only("build_report"), "0 * * * *")
            .await
            .unwrap();
        assert!(manager.remove_if_exists("report").await.unwrap());
        assert!(!manager.remove_if_exists("report").await.unwrap());
    }

    #[tokio::test]
    async fn test_trigger_enqueues_without_moving_schedule() {
        let (storage, _clock, manager) = fixture();
        manager
            .add_or_update("report", JobPayload::handler_only("build_report"), "0 * * * *")
            .await
            .unwrap();
        let before = manager.get("report").await.unwrap().unwrap();

        let job_id = manager.trigger("report").await.unwrap();
        let job = storage.get_job(&job_id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Enqueued);
        assert_eq!(job.payload.handler, "build_report");

        let after = manager.get("report").await.unwrap().unwrap();
        assert_eq!(after.next_fire_at, before.next_fire_at);

        let err = manager.trigger("missing").await.unwrap_err();
        assert!(matches!(err, JobError::RecurringJobNotFound { .. }));
    }
}
