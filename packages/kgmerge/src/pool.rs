//! Deferred execution of batch work
//!
//! Orchestrators submit one unit of work per batch to a `JobPool` and keep
//! the returned `Job`s in a `JobSet`. Completion handling runs on the
//! orchestrator's own task, at the points where it reaps the set, so the
//! state it mutates (error sentinel, finished counters) needs no locking.
//!
//! `TaskPool` runs work on tokio's blocking pool. A semaphore bounds how many
//! batches run at once; jobs waiting for a permit are queued. Cancelling a
//! queued job guarantees its work never starts. Work that is already running
//! is not interrupted, only its result is discarded; it keeps its permit
//! until it returns.

use std::fmt;
use std::sync::Arc;

use futures_util::future::select_all;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinHandle};

use crate::error::{PipelineError, Result};
use crate::resource::PoolTuning;

/// Unit of work: returns a document count.
pub type Work = Box<dyn FnOnce() -> Result<usize> + Send + 'static>;

/// Human-readable description of a job, for logs and progress reporting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProgressInfo {
    pub category: String,
    pub source: String,
    pub step: String,
    pub description: String,
}

impl ProgressInfo {
    pub fn new(category: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            source: source.into(),
            ..Self::default()
        }
    }

    pub fn with_step(mut self, step: impl Into<String>) -> Self {
        self.step = step.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

impl fmt::Display for ProgressInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.category, self.source)?;
        if !self.step.is_empty() {
            write!(f, " [{}]", self.step)?;
        }
        if !self.description.is_empty() {
            write!(f, " {}", self.description)?;
        }
        Ok(())
    }
}

/// Executes deferred work.
pub trait JobPool: Send + Sync {
    /// Submit `work`; must be called from within a tokio runtime.
    fn defer(&self, pinfo: ProgressInfo, work: Work) -> Job;

    /// Maximum number of jobs running at once.
    fn concurrency(&self) -> usize;
}

/// Handle to deferred work.
pub struct Job {
    pinfo: ProgressInfo,
    handle: JoinHandle<Result<usize>>,
}

impl Job {
    /// Wrap a spawned task (for custom `JobPool` implementations).
    pub fn from_handle(pinfo: ProgressInfo, handle: JoinHandle<Result<usize>>) -> Self {
        Self { pinfo, handle }
    }

    pub fn pinfo(&self) -> &ProgressInfo {
        &self.pinfo
    }

    pub fn done(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn cancel(&self) {
        self.handle.abort();
    }

    pub async fn result(self) -> Result<usize> {
        settle(&self.pinfo, self.handle.await)
    }
}

fn settle(pinfo: &ProgressInfo, joined: std::result::Result<Result<usize>, JoinError>) -> Result<usize> {
    match joined {
        Ok(result) => result,
        Err(e) if e.is_cancelled() => Err(PipelineError::Cancelled(pinfo.to_string())),
        Err(e) => Err(PipelineError::WorkerPanicked(format!("{}: {}", pinfo, e))),
    }
}

/// Blocking-pool executor with bounded concurrency.
pub struct TaskPool {
    permits: Arc<Semaphore>,
    concurrency: usize,
}

impl TaskPool {
    pub fn new(concurrency: usize) -> Self {
        let concurrency = concurrency.max(1);
        Self {
            permits: Arc::new(Semaphore::new(concurrency)),
            concurrency,
        }
    }

    /// Size the pool from detected host resources.
    pub fn auto_tuned() -> Self {
        let tuning = PoolTuning::detect();
        tracing::debug!(
            "worker pool auto-tuned to {} (memory pressure {:.2})",
            tuning.concurrency,
            tuning.memory_pressure
        );
        Self::new(tuning.concurrency)
    }

    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }
}

impl JobPool for TaskPool {
    fn defer(&self, pinfo: ProgressInfo, work: Work) -> Job {
        let permits = Arc::clone(&self.permits);
        let handle = tokio::spawn(async move {
            let permit = permits
                .acquire_owned()
                .await
                .map_err(|_| PipelineError::Cancelled("worker pool closed".into()))?;
            // The permit lives as long as the work, even if the job is aborted.
            let blocking = tokio::task::spawn_blocking(move || {
                let _permit = permit;
                work()
            });
            match blocking.await {
                Ok(result) => result,
                Err(e) => Err(PipelineError::WorkerPanicked(e.to_string())),
            }
        });
        Job { pinfo, handle }
    }

    fn concurrency(&self) -> usize {
        self.concurrency
    }
}

/// Result of one settled job.
#[derive(Debug)]
pub struct JobOutcome {
    pub batch: usize,
    pub pinfo: ProgressInfo,
    pub result: Result<usize>,
}

/// Jobs owned by one orchestrator invocation.
#[derive(Default)]
pub struct JobSet {
    jobs: Vec<(usize, Job)>,
}

impl JobSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, batch: usize, job: Job) {
        self.jobs.push((batch, job));
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Remove and return every job that has already finished.
    pub async fn reap(&mut self) -> Vec<JobOutcome> {
        let mut finished = Vec::new();
        let mut i = 0;
        while i < self.jobs.len() {
            if self.jobs[i].1.done() {
                finished.push(self.jobs.remove(i));
            } else {
                i += 1;
            }
        }

        let mut outcomes = Vec::with_capacity(finished.len());
        for (batch, job) in finished {
            let pinfo = job.pinfo.clone();
            let result = job.result().await;
            outcomes.push(JobOutcome { batch, pinfo, result });
        }
        outcomes
    }

    /// Wait for whichever job finishes next. `None` once the set is empty.
    pub async fn next_completed(&mut self) -> Option<JobOutcome> {
        if self.jobs.is_empty() {
            return None;
        }
        let (joined, index, _) = select_all(self.jobs.iter_mut().map(|(_, job)| &mut job.handle)).await;
        let (batch, job) = self.jobs.remove(index);
        Some(JobOutcome {
            batch,
            result: settle(&job.pinfo, joined),
            pinfo: job.pinfo,
        })
    }

    /// Cancel every job not yet finished; returns how many were cancelled.
    pub fn cancel_pending(&self) -> usize {
        let mut cancelled = 0;
        for (_, job) in &self.jobs {
            if !job.done() {
                job.cancel();
                cancelled += 1;
            }
        }
        cancelled
    }
}
