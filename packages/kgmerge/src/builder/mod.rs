//! Parallel build: merges node and edge sources into one target collection
//!
//! `NodeEdgeBuilder::merge_source` walks a source collection in batches and
//! hands each batch to `worker::merge_batch` on the job pool. Batches are
//! submitted in id order from a single control task; completions are reaped
//! on that same task after every submission, so the first failed batch stops
//! further scheduling. Batches already submitted keep running; their results
//! are ignored once the build has failed.

pub mod strategy;
pub mod worker;

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info};

use crate::batching::{batch_count, check_batch_size, id_feed_size, iter_n, repartition};
use crate::config::PipelineConfig;
use crate::diagnostics::FailureDump;
use crate::error::{PipelineError, Result};
use crate::mapper::MapperFactory;
use crate::metrics::PipelineMetrics;
use crate::pool::{JobPool, JobSet, ProgressInfo};
use crate::store::{require_collection, Collection, DocumentStore, IdBatches};

use self::strategy::{strategy_for, MergeStrategy};
use self::worker::{merge_batch, MergeRequest};

/// Per-source count of ids submitted for merging.
pub type MergeCounts = BTreeMap<String, usize>;

fn percent(done: usize, total: usize) -> f64 {
    if total == 0 {
        100.0
    } else {
        done as f64 / total as f64 * 100.0
    }
}

pub struct NodeEdgeBuilder {
    config: PipelineConfig,
    source_store: Arc<dyn DocumentStore>,
    target: Arc<dyn Collection>,
    pool: Arc<dyn JobPool>,
    mapper: Arc<dyn MapperFactory>,
    strategy: Arc<dyn MergeStrategy>,
    dump: Option<FailureDump>,
    metrics: Arc<PipelineMetrics>,
}

impl NodeEdgeBuilder {
    /// Wire a builder from configuration. The target collection is created
    /// in `target_store` when missing.
    pub fn new(
        config: PipelineConfig,
        source_store: Arc<dyn DocumentStore>,
        target_store: Arc<dyn DocumentStore>,
        pool: Arc<dyn JobPool>,
    ) -> Result<Self> {
        config.validate()?;
        let strategy = strategy_for(&config.merge_strategy)?;
        let mapper = config.mapper_factory()?;
        let target = target_store.create_collection(&config.target_collection)?;
        let dump = config.log_folder.clone().map(FailureDump::new);

        info!(
            "build '{}' (datasource '{}') into '{}.{}' using {} merge",
            config.build_name,
            config.datasource_name(),
            target_store.name(),
            target.name(),
            strategy.name()
        );

        Ok(Self {
            config,
            source_store,
            target,
            pool,
            mapper,
            strategy,
            dump,
            metrics: Arc::new(PipelineMetrics::new()),
        })
    }

    pub fn with_mapper(mut self, mapper: Arc<dyn MapperFactory>) -> Self {
        self.mapper = mapper;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<PipelineMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn target(&self) -> &Arc<dyn Collection> {
        &self.target
    }

    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    /// Id batches for `source`: explicit ids, filtered enumeration, or full
    /// enumeration in super-batches re-split to `batch_size`.
    fn id_batches(&self, source: &dyn Collection, batch_size: usize, ids: Option<Vec<String>>) -> Result<IdBatches> {
        let src_name = source.name();
        let query = self.config.filter_for(src_name);

        if let Some(ids) = ids {
            if query.is_some() {
                info!("Query/filter involved, but also specific list of _ids. Ignoring query and use _ids");
            }
            info!(
                "Merging '{}' specific list of {} _ids, create merger job with batch_size={}",
                src_name,
                ids.len(),
                batch_size
            );
            let batches: Vec<Result<Vec<String>>> = iter_n(&ids, batch_size).map(Ok).collect();
            return Ok(Box::new(batches.into_iter()));
        }

        let id_batch_size = id_feed_size(batch_size);
        match query {
            Some(query) => {
                info!("Query/filter involved for '{}', enumerating matching _ids", src_name);
                Ok(Box::new(repartition(source.stream_filtered(query, id_batch_size)?, batch_size)))
            }
            None => {
                info!(
                    "Fetch _ids from '{}' with batch_size={}, and create merger job with batch_size={}",
                    src_name, id_batch_size, batch_size
                );
                Ok(Box::new(repartition(source.stream_ids(id_batch_size)?, batch_size)))
            }
        }
    }

    /// Merge one source into the target collection.
    ///
    /// Returns `{src_name: ids submitted}`. Any failed batch fails the whole
    /// call; no partial count is reported.
    pub async fn merge_source(&self, src_name: &str, batch_size: usize, ids: Option<Vec<String>>) -> Result<MergeCounts> {
        check_batch_size(batch_size)?;
        let source = require_collection(self.source_store.as_ref(), src_name)?;

        let upsert = self.config.is_upsert(src_name);
        if !upsert {
            debug!(
                "Documents from source '{}' will be stored only if a previous document exists with same _id",
                src_name
            );
        }

        // An empty explicit list means "no explicit ids".
        let ids = ids.filter(|ids| !ids.is_empty());
        let total = match &ids {
            Some(ids) => ids.len(),
            None => source.count()?,
        };
        let btotal = batch_count(total, batch_size);
        let cleaner = self.config.cleaner_for(src_name);
        info!(
            "Documents from source '{}' will be merged using {}",
            src_name,
            self.strategy.name()
        );

        let mut jobs = JobSet::new();
        let mut bnum = 1;
        let mut cnt = 0;

        for batch in self.id_batches(source.as_ref(), batch_size, ids)? {
            let doc_ids = batch?;
            tokio::task::yield_now().await;

            cnt += doc_ids.len();
            let pct = percent(cnt, total);
            info!(
                "Creating merger job #{}/{}, to process '{}' {}/{} ({:.1}%)",
                bnum, btotal, src_name, cnt, total, pct
            );
            let pinfo = ProgressInfo::new("merge", &self.config.build_name)
                .with_step(src_name)
                .with_description(format!("#{}/{} ({:.1}%)", bnum, btotal, pct));

            let request = MergeRequest {
                source: Arc::clone(&source),
                destination: Arc::clone(&self.target),
                ids: doc_ids,
                mapper: Arc::clone(&self.mapper),
                cleaner: cleaner.clone(),
                strategy: Arc::clone(&self.strategy),
                upsert,
                batch: bnum,
                dump: self.dump.clone(),
                metrics: Arc::clone(&self.metrics),
            };
            self.metrics.record_dispatch();
            jobs.push(bnum, self.pool.defer(pinfo, Box::new(move || merge_batch(request))));
            bnum += 1;

            // Raise as soon as a failure is known.
            for outcome in jobs.reap().await {
                if let Err(err) = outcome.result {
                    return Err(PipelineError::BatchFailed {
                        batch: outcome.batch,
                        source_name: src_name.to_string(),
                        reason: err.to_string(),
                    });
                }
            }
        }
        info!("{} jobs created for merging step", bnum - 1);

        let mut written = 0usize;
        let mut failed = 0usize;
        let mut first: Option<String> = None;
        while let Some(outcome) = jobs.next_completed().await {
            match outcome.result {
                Ok(n) => written += n,
                Err(err) => {
                    failed += 1;
                    first.get_or_insert_with(|| format!("batch #{}: {}", outcome.batch, err));
                }
            }
        }
        if failed > 0 {
            return Err(PipelineError::SomeBatchesFailed {
                source_name: src_name.to_string(),
                failed,
                first: first.unwrap_or_default(),
            });
        }

        debug!("'{}': {} documents written for {} ids", src_name, written, cnt);
        Ok(BTreeMap::from([(src_name.to_string(), cnt)]))
    }

    /// Merge every configured source, root sources first.
    pub async fn merge_all(&self, batch_size: usize) -> Result<MergeCounts> {
        let mut counts = MergeCounts::new();
        for src_name in self.config.merge_order() {
            counts.extend(self.merge_source(&src_name, batch_size, None).await?);
        }
        info!("build '{}' merged {} source(s)", self.config.build_name, counts.len());
        Ok(counts)
    }
}
