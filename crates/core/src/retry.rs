use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::RetryConfig;

/// 指数退避
///
/// 第 n 次重试的延迟落在 `[base_n, base_n + jitter * (base_{n+1} - base_n)]`，
/// 其中 `base_n = min(base * multiplier^n, max)`。抖动只会向下一档靠近，
/// 因此延迟随重试次数单调不减且不超过 `max`。
#[derive(Debug, Clone, PartialEq)]
pub struct RetryBackoff {
    base: Duration,
    max: Duration,
    multiplier: f64,
    jitter_factor: f64,
}

impl RetryBackoff {
    pub fn new(base: Duration, max: Duration, multiplier: f64, jitter_factor: f64) -> Self {
        Self {
            base,
            max: max.max(base),
            multiplier: multiplier.max(1.0),
            jitter_factor: jitter_factor.clamp(0.0, 1.0),
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
            config.backoff_multiplier,
            config.jitter_factor,
        )
    }

    /// 存储瞬时错误时组件循环使用的退避
    pub fn for_store_errors() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(30), 2.0, 0.1)
    }

    pub fn max_delay(&self) -> Duration {
        self.max
    }

    fn step(&self, retry: u32) -> f64 {
        let base = self.base.as_secs_f64();
        let max = self.max.as_secs_f64();
        let exponent = retry.min(i32::MAX as u32) as i32;
        (base * self.multiplier.powi(exponent)).min(max)
    }

    /// `sample` 取值 `[0, 1]`
    pub fn delay_with_sample(&self, retry: u32, sample: f64) -> Duration {
        let current = self.step(retry);
        let next = self.step(retry.saturating_add(1));
        let jitter = self.jitter_factor * sample.clamp(0.0, 1.0) * (next - current);
        Duration::from_secs_f64((current + jitter).min(next))
    }

    pub fn delay(&self, retry: u32) -> Duration {
        self.delay_with_sample(retry, rand::random::<f64>())
    }

    pub fn next_attempt_at(&self, now: DateTime<Utc>, retry: u32) -> DateTime<Utc> {
        let delay = chrono::Duration::from_std(self.delay(retry))
            .unwrap_or_else(|_| chrono::Duration::milliseconds(self.max.as_millis() as i64));
        now + delay
    }
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}
