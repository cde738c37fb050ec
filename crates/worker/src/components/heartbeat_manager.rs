use std::time::Duration;

use jobrunner_domain::{JobId, SharedClock, SharedStorage};
use jobrunner_errors::JobError;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 租约心跳
///
/// 执行期间定期续约，同时把存储中记录的取消请求转发给处理器的取消令牌。
pub struct HeartbeatManager {
    storage: SharedStorage,
    clock: SharedClock,
    interval: Duration,
    lease_duration: chrono::Duration,
}

impl HeartbeatManager {
    pub fn new(
        storage: SharedStorage,
        clock: SharedClock,
        interval: Duration,
        lease_duration: chrono::Duration,
    ) -> Self {
        Self {
            storage,
            clock,
            interval,
            lease_duration,
        }
    }

    /// 持续续约，只在租约丢失或存储出现致命错误时返回
    pub async fn keep_alive(
        &self,
        job_id: JobId,
        owner: &str,
        cancellation: CancellationToken,
    ) -> JobError {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let now = self.clock.now();
            match self
                .storage
                .renew_lease(&job_id, owner, now, now + self.lease_duration)
                .await
            {
                Ok(renewal) => {
                    debug!("任务 {} 续约成功，租约到期: {}", job_id, renewal.expires_at);
                    if renewal.cancellation_requested && !cancellation.is_cancelled() {
                        info!("任务 {} 收到取消请求，通知处理器", job_id);
                        cancellation.cancel();
                    }
                }
                Err(e @ JobError::LeaseExpired { .. }) => return e,
                Err(e) if e.is_fatal() => return e,
                Err(e) => warn!("任务 {} 续约失败，下个周期重试: {}", job_id, e),
            }
        }
    }
}
