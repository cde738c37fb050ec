//! Test doubles for job handlers

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use jobrunner_core::{JobContext, JobHandler};
use jobrunner_domain::JobId;
use jobrunner_errors::{JobError, JobResult};

/// Records every invocation and succeeds
#[derive(Debug, Clone)]
pub struct RecordingHandler {
    name: String,
    calls: Arc<Mutex<Vec<(JobId, serde_json::Value)>>>,
}

impl RecordingHandler {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn calls(&self) -> Vec<(JobId, serde_json::Value)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn executed_ids(&self) -> Vec<JobId> {
        self.calls().into_iter().map(|(id, _)| id).collect()
    }
}

#[async_trait]
impl JobHandler for RecordingHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, ctx: JobContext) -> JobResult<()> {
        self.calls
            .lock()
            .unwrap()
            .push((ctx.job_id, ctx.arguments.clone()));
        Ok(())
    }
}

/// Fails the first `failures` invocations, then succeeds
#[derive(Debug, Clone)]
pub struct FailingHandler {
    name: String,
    failures: u32,
    abort: bool,
    attempts: Arc<AtomicU32>,
}

impl FailingHandler {
    pub fn new(name: &str, failures: u32) -> Self {
        Self {
            name: name.to_string(),
            failures,
            abort: false,
            attempts: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn always(name: &str) -> Self {
        Self::new(name, u32::MAX)
    }

    /// Fails with `HandlerAbort` instead of a recoverable error
    pub fn aborting(name: &str) -> Self {
        Self {
            abort: true,
            ..Self::always(name)
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobHandler for FailingHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, _ctx: JobContext) -> JobResult<()> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt > self.failures {
            return Ok(());
        }
        if self.abort {
            Err(JobError::abort(format!("attempt {attempt} aborted")))
        } else {
            Err(JobError::handler(format!("attempt {attempt} failed")))
        }
    }
}

/// Runs until cancelled or until `duration` elapses
#[derive(Debug, Clone)]
pub struct SlowHandler {
    name: String,
    duration: Duration,
    started: Arc<AtomicU32>,
    finished: Arc<AtomicU32>,
    cancelled: Arc<AtomicU32>,
}

impl SlowHandler {
    pub fn new(name: &str, duration: Duration) -> Self {
        Self {
            name: name.to_string(),
            duration,
            started: Arc::new(AtomicU32::new(0)),
            finished: Arc::new(AtomicU32::new(0)),
            cancelled: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn started(&self) -> u32 {
        self.started.load(Ordering::SeqCst)
    }

    /// Runs that slept the full duration
    pub fn finished(&self) -> u32 {
        self.finished.load(Ordering::SeqCst)
    }

    pub fn cancelled(&self) -> u32 {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobHandler for SlowHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, ctx: JobContext) -> JobResult<()> {
        self.started.fetch_add(1, Ordering::SeqCst);
        tokio::select! {
            _ = tokio::time::sleep(self.duration) => {
                self.finished.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            _ = ctx.cancelled() => {
                self.cancelled.fetch_add(1, Ordering::SeqCst);
                Err(JobError::abort("cancelled"))
            }
        }
    }
}
