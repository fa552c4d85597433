//! Parallel indexing of merged documents into a search sink
//!
//! `Indexer::do_index` walks the edge collection (or an explicit id list) in
//! batches, one `IndexingTask` per batch on the job pool. Finished jobs are
//! reaped before every submission; the first failure cancels every job not
//! yet finished and is returned as is. When all jobs have settled the
//! schedule must account for exactly `total` documents.

pub mod schedule;
pub mod task;

pub use schedule::{Schedule, ScheduleState};
pub use task::{validate_ids, IndexMode, IndexingTask, MAX_ID_LENGTH};

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Local};
use serde::Serialize;
use tracing::{error, info};

use crate::batching::{check_batch_size, iter_n};
use crate::error::{PipelineError, Result};
use crate::mapper::IndexMapping;
use crate::metrics::{BatchKind, PipelineMetrics};
use crate::pool::{JobOutcome, JobPool, JobSet, ProgressInfo};
use crate::sink::SearchSink;
use crate::store::{require_collection, Collection, DocumentStore, IdBatches};

#[derive(Debug, Clone, Serialize)]
pub struct IndexSummary {
    pub count: usize,
    pub created_at: DateTime<Local>,
}

pub struct Indexer {
    database: String,
    edges: Arc<dyn Collection>,
    nodes: Arc<dyn Collection>,
    sink: Arc<dyn SearchSink>,
    pool: Arc<dyn JobPool>,
    mapping: IndexMapping,
    metrics: Arc<PipelineMetrics>,
}

impl Indexer {
    /// Both collections must already exist in `store`.
    pub fn new(
        store: &dyn DocumentStore,
        edge_collection: &str,
        node_collection: &str,
        sink: Arc<dyn SearchSink>,
        pool: Arc<dyn JobPool>,
    ) -> Result<Self> {
        let nodes = store
            .collection(node_collection)
            .ok_or_else(|| PipelineError::MissingNodeCollection {
                collection: node_collection.to_string(),
                database: store.name().to_string(),
                discovered: store.collection_names(),
            })?;
        let edges = require_collection(store, edge_collection)?;

        Ok(Self {
            database: store.name().to_string(),
            edges,
            nodes,
            sink,
            pool,
            mapping: IndexMapping::default(),
            metrics: Arc::new(PipelineMetrics::new()),
        })
    }

    pub fn with_mapping(mut self, mapping: IndexMapping) -> Self {
        self.mapping = mapping;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<PipelineMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    fn identity(&self) -> String {
        format!(
            "database: {} | edge collection: {} | node collection: {} | index: {}",
            self.database,
            self.edges.name(),
            self.nodes.name(),
            self.sink.name()
        )
    }

    /// Fold settled jobs into the schedule; keeps the first error.
    fn absorb(&self, outcomes: Vec<JobOutcome>, schedule: &mut Schedule, failure: &mut Option<PipelineError>) {
        for outcome in outcomes {
            match outcome.result {
                Ok(count) => schedule.add_finished(count),
                Err(err) => {
                    error!("index batch #{} failed: {}", outcome.batch, err);
                    failure.get_or_insert(err);
                }
            }
        }
    }

    fn cancel_all(&self, jobs: &JobSet) {
        let cancelled = jobs.cancel_pending();
        if cancelled > 0 {
            info!("cancelled {} outstanding index job(s)", cancelled);
        }
        self.metrics.record_cancelled(cancelled as u64);
    }

    pub async fn do_index(&self, batch_size: usize, ids: Option<Vec<String>>, mode: IndexMode) -> Result<IndexSummary> {
        check_batch_size(batch_size)?;
        let ids = ids.filter(|ids| !ids.is_empty());

        if mode == IndexMode::Purge {
            info!("purging index '{}' before indexing", self.sink.name());
        }
        self.sink.prepare(&self.mapping.to_json(), mode == IndexMode::Purge)?;

        let (total, mut id_provider): (usize, IdBatches) = match ids {
            Some(ids) => {
                info!(
                    "Indexing from '{}' with specific list of _ids, create indexer job with batch_size={}.",
                    self.edges.name(),
                    batch_size
                );
                let batches: Vec<Result<Vec<String>>> = iter_n(&ids, batch_size).map(Ok).collect();
                (ids.len(), Box::new(batches.into_iter()))
            }
            None => {
                info!(
                    "Fetch _ids from '{}', and create indexer job with batch_size={}.",
                    self.edges.name(),
                    batch_size
                );
                (self.edges.count()?, self.edges.stream_ids(batch_size)?)
            }
        };

        let mut schedule = Schedule::new(total, batch_size);
        let mut jobs = JobSet::new();
        let mut failure: Option<PipelineError> = None;

        while let Some(batch_num) = schedule.next() {
            let batch_ids = match id_provider.next() {
                Some(Ok(batch_ids)) => batch_ids,
                Some(Err(err)) => {
                    self.cancel_all(&jobs);
                    return Err(err);
                }
                None => break,
            };
            tokio::task::yield_now().await;

            // Stop scheduling and cancel in-flight work on the first failure.
            self.absorb(jobs.reap().await, &mut schedule, &mut failure);
            if let Some(err) = failure.take() {
                self.cancel_all(&jobs);
                return Err(err);
            }

            info!("{}", schedule);
            let pinfo = ProgressInfo::new("index", self.sink.name())
                .with_step(self.edges.name())
                .with_description(schedule.suffix(self.edges.name()));
            let task = IndexingTask::new(
                Arc::clone(&self.edges),
                Arc::clone(&self.nodes),
                Arc::clone(&self.sink),
                batch_ids,
                mode,
                format!("index_{} #{}", self.sink.name(), batch_num),
            );
            let metrics = Arc::clone(&self.metrics);
            let job = self.pool.defer(
                pinfo,
                Box::new(move || {
                    let started = Instant::now();
                    let result = task.dispatch();
                    let elapsed_ms = started.elapsed().as_millis() as u64;
                    match &result {
                        Ok(count) => metrics.record_success(BatchKind::Index, elapsed_ms, *count as u64),
                        Err(_) => metrics.record_failure(BatchKind::Index, elapsed_ms),
                    }
                    result
                }),
            );
            self.metrics.record_dispatch();
            jobs.push(batch_num, job);
        }

        info!("{}", schedule);
        while let Some(outcome) = jobs.next_completed().await {
            self.absorb(vec![outcome], &mut schedule, &mut failure);
            if let Some(err) = failure.take() {
                self.cancel_all(&jobs);
                return Err(err);
            }
        }

        if let Err(err) = schedule.completed() {
            let context = self.identity();
            error!("{}", context);
            return Err(match err {
                PipelineError::SchedulerMismatch { total, finished, .. } => PipelineError::SchedulerMismatch {
                    total,
                    finished,
                    context,
                },
                other => other,
            });
        }

        info!("{}", schedule);
        Ok(IndexSummary {
            count: total,
            created_at: Local::now(),
        })
    }
}
