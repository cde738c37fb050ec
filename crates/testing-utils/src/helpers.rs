use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use jobrunner_domain::{JobId, JobRepository, JobState, ManualClock, SharedClock};

/// Fixed, millisecond-aligned start time so records survive storage round-trips unchanged
pub fn test_epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

pub fn manual_clock() -> (ManualClock, SharedClock) {
    let clock = ManualClock::new(test_epoch());
    let shared: SharedClock = Arc::new(clock.clone());
    (clock, shared)
}

/// Set up logging for tests (call once per test binary)
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("debug")
        .try_init();
}

/// Poll the repository until the job reaches `state` or the timeout elapses
pub async fn wait_for_state<R>(repo: &R, id: &JobId, state: JobState, timeout: Duration) -> bool
where
    R: JobRepository + ?Sized,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Ok(Some(job)) = repo.get_job(id).await {
            if job.state == state {
                return true;
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Keep only the listed states, preserving order
pub fn filter_states(history: &[JobState], keep: &[JobState]) -> Vec<JobState> {
    history
        .iter()
        .copied()
        .filter(|state| keep.contains(state))
        .collect()
}
