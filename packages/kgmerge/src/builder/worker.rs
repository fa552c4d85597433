//! Batch merge worker
//!
//! One call merges one batch of source ids into the target collection:
//! fetch, clean, map, fold in stored documents, write. Runs on a blocking
//! pool thread; everything it touches is owned by the `MergeRequest`.

use std::sync::Arc;
use std::time::Instant;

use serde_json::json;

use crate::builder::strategy::{merge_stored, MergeStrategy};
use crate::diagnostics::FailureDump;
use crate::error::Result;
use crate::mapper::MapperFactory;
use crate::metrics::{BatchKind, PipelineMetrics};
use crate::record::{Record, RecordExt};
use crate::store::Collection;

/// Per-document cleaning step applied before mapping.
pub type DocumentCleaner = Arc<dyn Fn(Record) -> Record + Send + Sync>;

/// Cleaner that removes the given top-level fields.
pub fn drop_fields(fields: Vec<String>) -> DocumentCleaner {
    Arc::new(move |mut doc: Record| {
        for field in &fields {
            doc.remove(field);
        }
        doc
    })
}

/// Everything one merge batch needs.
pub struct MergeRequest {
    pub source: Arc<dyn Collection>,
    pub destination: Arc<dyn Collection>,
    pub ids: Vec<String>,
    pub mapper: Arc<dyn MapperFactory>,
    pub cleaner: Option<DocumentCleaner>,
    pub strategy: Arc<dyn MergeStrategy>,
    pub upsert: bool,
    pub batch: usize,
    pub dump: Option<FailureDump>,
    pub metrics: Arc<PipelineMetrics>,
}

impl MergeRequest {
    fn dump_name(&self) -> String {
        FailureDump::batch_name(self.destination.name(), self.source.name(), self.batch)
    }
}

/// Merge one batch; returns the number of documents written.
///
/// On failure the error, the input ids and the documents computed so far are
/// dumped (when a log folder is configured) before the error is returned.
pub fn merge_batch(req: MergeRequest) -> Result<usize> {
    let started = Instant::now();
    let mut docs = Vec::new();
    let outcome = run(&req, &mut docs);
    let elapsed_ms = started.elapsed().as_millis() as u64;

    match outcome {
        Ok(written) => {
            tracing::debug!(
                "batch #{} of '{}': {} of {} ids written in {}ms",
                req.batch,
                req.source.name(),
                written,
                req.ids.len(),
                elapsed_ms
            );
            req.metrics.record_success(BatchKind::Merge, elapsed_ms, written as u64);
            Ok(written)
        }
        Err(err) => {
            req.metrics.record_failure(BatchKind::Merge, elapsed_ms);
            tracing::error!(
                code = err.code(),
                "batch #{} failed merging '{}' into '{}': {}",
                req.batch,
                req.source.name(),
                req.destination.name(),
                err
            );
            if let Some(dump) = &req.dump {
                let context = json!({
                    "source": req.source.name(),
                    "destination": req.destination.name(),
                    "mapper": req.mapper.name(),
                    "cleaner": req.cleaner.is_some(),
                    "upsert": req.upsert,
                    "merger": req.strategy.name(),
                    "batch": req.batch,
                });
                dump.record(&req.dump_name(), &err, context, &req.ids, &docs);
            }
            Err(err)
        }
    }
}

fn run(req: &MergeRequest, docs: &mut Vec<Record>) -> Result<usize> {
    let fetched = req.strategy.fetch_source(req.source.as_ref(), &req.ids)?;
    let cleaned = match &req.cleaner {
        Some(clean) => fetched.into_iter().map(|doc| clean(doc)).collect(),
        None => fetched,
    };

    let mut mapper = req.mapper.create();
    mapper.load()?;
    *docs = mapper.process(cleaned)?;

    let doc_ids: Vec<String> = docs.iter().filter_map(|d| d.doc_id().map(str::to_string)).collect();
    let stored = req.strategy.fetch_destination(req.destination.as_ref(), &doc_ids)?;
    *docs = merge_stored(req.strategy.as_ref(), std::mem::take(docs), stored);

    req.destination.write(docs.as_slice(), req.upsert)
}
