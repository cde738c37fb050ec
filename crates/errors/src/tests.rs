use crate::*;

#[test]
fn test_job_error_display() {
    let stale = JobError::StaleState {
        job_id: "job-1".to_string(),
        expected: "SCHEDULED".to_string(),
        actual: "ENQUEUED".to_string(),
    };
    assert_eq!(
        stale.to_string(),
        "任务状态已变更: 任务 job-1 期望状态 SCHEDULED, 实际状态 ENQUEUED"
    );

    let not_found = JobError::job_not_found("job-2");
    assert_eq!(not_found.to_string(), "任务未找到: job-2");

    let timeout = JobError::ExecutionTimeout;
    assert_eq!(timeout.to_string(), "任务执行超时");

    let lease = JobError::lease_expired("job-3", "host:1:abc:0");
    assert_eq!(lease.to_string(), "租约已失效: 任务 job-3, 持有者 host:1:abc:0");
}

#[test]
fn test_error_classification() {
    assert!(JobError::transient("busy").is_retryable());
    assert!(!JobError::transient("busy").is_fatal());

    assert!(JobError::fatal("disk corrupted").is_fatal());
    assert!(!JobError::fatal("disk corrupted").is_retryable());

    assert!(JobError::Database(sqlx::Error::PoolTimedOut).is_retryable());
    assert!(JobError::Database(sqlx::Error::RowNotFound).is_fatal());

    let stale = JobError::StaleState {
        job_id: "j".to_string(),
        expected: "A".to_string(),
        actual: "B".to_string(),
    };
    assert!(stale.is_stale());
    assert!(!stale.is_fatal());

    assert!(JobError::abort("bad input").is_abort());
    assert!(!JobError::handler("flaky").is_abort());
}

#[test]
fn test_error_conversions() {
    let json_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
    let err: JobError = json_err.into();
    assert!(matches!(err, JobError::Serialization(_)));

    let err: JobError = anyhow::anyhow!("boom").into();
    assert!(matches!(err, JobError::Internal(ref m) if m == "boom"));
}
