//! Integration test: build and index pipelines end to end.
//!
//! Validates that:
//! - id enumeration splits a large source into exactly ceil(total / batch) batches
//! - the first failed build batch stops further dispatch
//! - update-only sources never create documents
//! - a failing index batch cancels outstanding work and fails the run
//! - a dropped batch surfaces as a scheduler mismatch
//! - files -> build -> index produces merged, node-embedded documents

use std::collections::HashSet;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kgmerge::loader::{load_edges, load_merged_edges, load_nodes};
use kgmerge::mapper::{DocumentMapper, MapperFactory};
use kgmerge::pool::{Job, JobPool, ProgressInfo, Work};
use kgmerge::record::DocQuery;
use kgmerge::store::IdBatches;
use kgmerge::{
    Collection, DocumentStore, IndexMode, Indexer, JsonlSink, MemoryCollection, MemorySink, MemoryStore,
    NodeEdgeBuilder, PipelineConfig, PipelineError, Record, RecordExt, Result, SearchSink, TaskPool,
};
use serde_json::{json, Value};
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn doc(value: Value) -> Record {
    value.as_object().cloned().unwrap()
}

fn config(sources: &[&str], roots: &[&str]) -> PipelineConfig {
    serde_json::from_value(json!({
        "build_name": "kg",
        "sources": sources,
        "root_sources": roots,
        "target_collection": "merged",
    }))
    .unwrap()
}

/// Source collection with `total` synthetic edges, generated on demand.
/// Records the size of every `find_by_ids` call.
struct SyntheticEdges {
    total: usize,
    fetches: Mutex<Vec<usize>>,
}

impl SyntheticEdges {
    fn new(total: usize) -> Self {
        Self {
            total,
            fetches: Mutex::new(Vec::new()),
        }
    }

    fn id(i: usize) -> String {
        format!("edge_{:07}", i)
    }
}

impl Collection for SyntheticEdges {
    fn name(&self) -> &str {
        "synthetic_edges"
    }

    fn count(&self) -> Result<usize> {
        Ok(self.total)
    }

    fn find_by_ids(&self, ids: &[String]) -> Result<Vec<Record>> {
        self.fetches.lock().unwrap().push(ids.len());
        Ok(ids.iter().map(|id| doc(json!({"_id": id, "subject": "n1"}))).collect())
    }

    fn stream_ids(&self, batch_size: usize) -> Result<IdBatches> {
        let total = self.total;
        let starts = (0..total).step_by(batch_size);
        Ok(Box::new(starts.map(move |start| {
            Ok((start..(start + batch_size).min(total)).map(Self::id).collect())
        })))
    }

    fn stream_filtered(&self, _query: &DocQuery, batch_size: usize) -> Result<IdBatches> {
        self.stream_ids(batch_size)
    }

    fn write(&self, _docs: &[Record], _upsert: bool) -> Result<usize> {
        Err(PipelineError::Store("read-only source".into()))
    }
}

/// Target collection that only counts what it is asked to write.
#[derive(Default)]
struct CountingTarget {
    written: AtomicUsize,
}

impl Collection for CountingTarget {
    fn name(&self) -> &str {
        "merged"
    }

    fn count(&self) -> Result<usize> {
        Ok(self.written.load(Ordering::SeqCst))
    }

    fn find_by_ids(&self, _ids: &[String]) -> Result<Vec<Record>> {
        Ok(Vec::new())
    }

    fn stream_ids(&self, _batch_size: usize) -> Result<IdBatches> {
        Ok(Box::new(std::iter::empty()))
    }

    fn stream_filtered(&self, _query: &DocQuery, _batch_size: usize) -> Result<IdBatches> {
        Ok(Box::new(std::iter::empty()))
    }

    fn write(&self, docs: &[Record], _upsert: bool) -> Result<usize> {
        self.written.fetch_add(docs.len(), Ordering::SeqCst);
        Ok(docs.len())
    }
}

/// Store exposing one source and one target collection.
struct FixedStore {
    source: Arc<SyntheticEdges>,
    target: Arc<CountingTarget>,
}

impl DocumentStore for FixedStore {
    fn name(&self) -> &str {
        "fixed"
    }

    fn collection(&self, name: &str) -> Option<Arc<dyn Collection>> {
        match name {
            "synthetic_edges" => Some(self.source.clone()),
            "merged" => Some(self.target.clone()),
            _ => None,
        }
    }

    fn collection_names(&self) -> Vec<String> {
        vec!["merged".to_string(), "synthetic_edges".to_string()]
    }

    fn create_collection(&self, name: &str) -> Result<Arc<dyn Collection>> {
        self.collection(name).ok_or_else(|| PipelineError::Store(format!("cannot create '{}'", name)))
    }
}

/// Sink whose first bulk call fails after a delay.
struct FailingSink {
    calls: AtomicUsize,
}

impl SearchSink for FailingSink {
    fn name(&self) -> &str {
        "failing"
    }

    fn bulk_index(&self, docs: Vec<Record>) -> Result<usize> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(100));
        if call == 0 {
            return Err(PipelineError::Sink("bulk request rejected".into()));
        }
        Ok(docs.len())
    }

    fn existing_ids(&self, _ids: &[String]) -> Result<HashSet<String>> {
        Ok(HashSet::new())
    }

    fn purge(&self) -> Result<()> {
        Ok(())
    }
}

/// Collection that over-reports its size.
struct OverCounted {
    inner: MemoryCollection,
    claimed: usize,
}

impl Collection for OverCounted {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn count(&self) -> Result<usize> {
        Ok(self.claimed)
    }

    fn find_by_ids(&self, ids: &[String]) -> Result<Vec<Record>> {
        self.inner.find_by_ids(ids)
    }

    fn stream_ids(&self, batch_size: usize) -> Result<IdBatches> {
        self.inner.stream_ids(batch_size)
    }

    fn stream_filtered(&self, query: &DocQuery, batch_size: usize) -> Result<IdBatches> {
        self.inner.stream_filtered(query, batch_size)
    }

    fn write(&self, docs: &[Record], upsert: bool) -> Result<usize> {
        self.inner.write(docs, upsert)
    }
}

struct OverCountedStore {
    edges: Arc<OverCounted>,
    nodes: Arc<MemoryCollection>,
}

impl DocumentStore for OverCountedStore {
    fn name(&self) -> &str {
        "target"
    }

    fn collection(&self, name: &str) -> Option<Arc<dyn Collection>> {
        match name {
            "merged" => Some(self.edges.clone()),
            "nodes" => Some(self.nodes.clone()),
            _ => None,
        }
    }

    fn collection_names(&self) -> Vec<String> {
        vec!["merged".to_string(), "nodes".to_string()]
    }

    fn create_collection(&self, name: &str) -> Result<Arc<dyn Collection>> {
        self.collection(name).ok_or_else(|| PipelineError::Store(format!("cannot create '{}'", name)))
    }
}

/// Pool whose jobs have settled by the time `defer` returns.
struct SettledPool;

impl JobPool for SettledPool {
    fn defer(&self, pinfo: ProgressInfo, work: Work) -> Job {
        let handle = tokio::task::spawn_blocking(work);
        while !handle.is_finished() {
            std::thread::sleep(Duration::from_millis(1));
        }
        Job::from_handle(pinfo, handle)
    }

    fn concurrency(&self) -> usize {
        1
    }
}

/// Mapper that rejects any batch containing `poison`.
struct PoisonMapper {
    poison: &'static str,
}

impl DocumentMapper for PoisonMapper {
    fn process(&self, docs: Vec<Record>) -> Result<Vec<Record>> {
        if docs.iter().any(|d| d.doc_id() == Some(self.poison)) {
            return Err(PipelineError::Store(format!("cannot map '{}'", self.poison)));
        }
        Ok(docs)
    }
}

struct PoisonMapperFactory(&'static str);

impl MapperFactory for PoisonMapperFactory {
    fn name(&self) -> &str {
        "poison"
    }

    fn create(&self) -> Box<dyn DocumentMapper> {
        Box::new(PoisonMapper { poison: self.0 })
    }
}

fn edge_store(n: usize) -> MemoryStore {
    let store = MemoryStore::new("target");
    store
        .memory_collection("merged")
        .unwrap()
        .insert_many((0..n).map(|i| doc(json!({"_id": format!("e{:03}", i), "subject": {"id": "n1"}}))))
        .unwrap();
    store.memory_collection("nodes").unwrap();
    store
}

fn write_lines(path: &Path, lines: &[Value]) {
    let mut f = std::fs::File::create(path).unwrap();
    for line in lines {
        writeln!(f, "{}", line).unwrap();
    }
}

// ---------------------------------------------------------------------------
// Tests: Build
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn large_source_is_split_into_three_batches() {
    let store = Arc::new(FixedStore {
        source: Arc::new(SyntheticEdges::new(250_000)),
        target: Arc::new(CountingTarget::default()),
    });

    let builder = NodeEdgeBuilder::new(
        config(&["synthetic_edges"], &[]),
        store.clone(),
        store.clone(),
        Arc::new(TaskPool::new(3)),
    )
    .unwrap();

    let counts = builder.merge_source("synthetic_edges", 100_000, None).await.unwrap();
    assert_eq!(counts["synthetic_edges"], 250_000);

    let mut sizes = store.source.fetches.lock().unwrap().clone();
    sizes.sort_unstable();
    assert_eq!(sizes, vec![50_000, 100_000, 100_000]);
    assert_eq!(store.target.written.load(Ordering::SeqCst), 250_000);
    assert_eq!(builder.metrics().snapshot().batches_dispatched, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn update_only_source_does_not_create_documents() {
    let store = Arc::new(MemoryStore::new("kg"));
    store
        .memory_collection("nodes")
        .unwrap()
        .insert_many(vec![doc(json!({"_id": "n_absent", "name": "aspirin"}))])
        .unwrap();

    let builder = NodeEdgeBuilder::new(
        config(&["edges", "nodes"], &["edges"]),
        store.clone(),
        store.clone(),
        Arc::new(TaskPool::new(2)),
    )
    .unwrap();

    let counts = builder.merge_source("nodes", 10, None).await.unwrap();
    assert_eq!(counts["nodes"], 1);
    assert_eq!(builder.metrics().snapshot().docs_written, 0);
    assert!(store.memory_collection("merged").unwrap().get("n_absent").is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failing_build_batch_fails_the_source() {
    let store = Arc::new(FixedStore {
        source: Arc::new(SyntheticEdges::new(10)),
        target: Arc::new(CountingTarget::default()),
    });
    // The source is read-only, so using it as the target fails every write.
    let mut cfg = config(&["synthetic_edges"], &[]);
    cfg.target_collection = "synthetic_edges".into();

    let builder = NodeEdgeBuilder::new(cfg, store.clone(), store.clone(), Arc::new(TaskPool::new(1))).unwrap();
    let err = builder.merge_source("synthetic_edges", 5, None).await.unwrap_err();
    assert!(
        matches!(err, PipelineError::BatchFailed { .. } | PipelineError::SomeBatchesFailed { .. }),
        "unexpected error: {:?}",
        err
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn first_failed_batch_stops_dispatch() {
    let store = Arc::new(MemoryStore::new("kg"));
    store
        .memory_collection("edges")
        .unwrap()
        .insert_many((0..10).map(|i| doc(json!({"_id": format!("e{:02}", i), "subject": "n1"}))))
        .unwrap();

    let builder = NodeEdgeBuilder::new(config(&["edges"], &[]), store.clone(), store.clone(), Arc::new(SettledPool))
        .unwrap()
        .with_mapper(Arc::new(PoisonMapperFactory("e00")));

    match builder.merge_source("edges", 3, None).await {
        Err(PipelineError::BatchFailed { batch, source_name, .. }) => {
            assert_eq!(batch, 1);
            assert_eq!(source_name, "edges");
        }
        other => panic!("expected first batch failure, got {:?}", other),
    }

    // Four batches were available; only the failing one went out.
    let snap = builder.metrics().snapshot();
    assert_eq!(snap.batches_dispatched, 1);
    assert_eq!(snap.batches_failed, 1);
    assert_eq!(store.memory_collection("merged").unwrap().count().unwrap(), 0);
}

// ---------------------------------------------------------------------------
// Tests: Index
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn index_failure_cancels_outstanding_batches() {
    let store = edge_store(50);
    let sink = Arc::new(FailingSink {
        calls: AtomicUsize::new(0),
    });

    let indexer = Indexer::new(&store, "merged", "nodes", sink.clone(), Arc::new(TaskPool::new(1))).unwrap();
    let result = indexer.do_index(10, None, IndexMode::Index).await;

    assert!(matches!(result, Err(PipelineError::Sink(_))));
    assert!(sink.calls.load(Ordering::SeqCst) < 5);

    let snap = indexer.metrics().snapshot();
    assert_eq!(snap.batches_dispatched, 5);
    assert!(snap.batches_cancelled >= 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dropped_batch_is_a_scheduler_mismatch() {
    let inner = MemoryCollection::new("merged");
    inner
        .insert_many((0..90).map(|i| doc(json!({"_id": format!("e{:03}", i)}))))
        .unwrap();
    let store = OverCountedStore {
        edges: Arc::new(OverCounted { inner, claimed: 100 }),
        nodes: Arc::new(MemoryCollection::new("nodes")),
    };

    let indexer = Indexer::new(
        &store,
        "merged",
        "nodes",
        Arc::new(MemorySink::new("kg")),
        Arc::new(TaskPool::new(2)),
    )
    .unwrap();

    match indexer.do_index(30, None, IndexMode::Index).await {
        Err(PipelineError::SchedulerMismatch {
            total,
            finished,
            context,
        }) => {
            assert_eq!(total, 100);
            assert_eq!(finished, 90);
            assert!(context.contains("merged"));
            assert!(context.contains("target"));
        }
        other => panic!("expected scheduler mismatch, got {:?}", other),
    }
}

#[test]
fn missing_node_collection_is_fatal_at_construction() {
    let store = MemoryStore::new("target");
    store.memory_collection("merged").unwrap();

    let err = Indexer::new(
        &store,
        "merged",
        "rtx_kg2_nodes",
        Arc::new(MemorySink::new("kg")),
        Arc::new(TaskPool::new(1)),
    )
    .err()
    .unwrap();
    assert!(err.is_construction_error());
    assert_eq!(err.code(), "MISSING_NODE_COLLECTION");
}

// ---------------------------------------------------------------------------
// Tests: Files -> build -> index
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn files_to_index_end_to_end() {
    let dir = TempDir::new().unwrap();
    write_lines(
        &dir.path().join("nodes.jsonl"),
        &[
            json!({"id": "CHEBI:15365", "name": "aspirin", "category": "biolink:SmallMolecule"}),
            json!({"id": "MONDO:0005010", "name": "pain", "category": "biolink:Disease"}),
        ],
    );
    write_lines(
        &dir.path().join("edges.jsonl"),
        &[
            json!({"id": "e1", "subject": "CHEBI:15365", "object": "MONDO:0005010", "predicate": "biolink:treats"}),
            json!({"id": "e2", "subject": "MONDO:0005010", "object": "CHEBI:15365", "predicate": "biolink:related_to"}),
        ],
    );

    // Streaming join straight from the files.
    let merged: Vec<Record> = load_merged_edges(dir.path())
        .unwrap()
        .collect::<Result<Vec<_>>>()
        .unwrap();
    assert_eq!(merged.len(), 2);
    assert_eq!(merged[0]["subject"]["name"], "aspirin");

    // Raw edges through the build; the indexer resolves their node ids.
    let store = Arc::new(MemoryStore::new("kg"));
    let edges: Vec<Record> = load_edges(dir.path()).unwrap().collect::<Result<Vec<_>>>().unwrap();
    store.memory_collection("kg_edges").unwrap().insert_many(edges).unwrap();
    let nodes: Vec<Record> = load_nodes(dir.path()).unwrap().collect::<Result<Vec<_>>>().unwrap();
    store.memory_collection("kg_nodes").unwrap().insert_many(nodes).unwrap();

    let pool = Arc::new(TaskPool::new(2));
    let builder = NodeEdgeBuilder::new(config(&["kg_edges"], &[]), store.clone(), store.clone(), pool.clone()).unwrap();
    let counts = builder.merge_all(1).await.unwrap();
    assert_eq!(counts["kg_edges"], 2);

    let out = dir.path().join("index.jsonl");
    let sink = Arc::new(JsonlSink::create("kg_index", &out).unwrap());
    let summary = Indexer::new(store.as_ref(), "merged", "kg_nodes", sink.clone(), pool)
        .unwrap()
        .do_index(1, None, IndexMode::Index)
        .await
        .unwrap();
    assert_eq!(summary.count, 2);

    sink.flush().unwrap();
    let lines: Vec<Value> = std::fs::read_to_string(&out)
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(lines.len(), 2);
    for line in &lines {
        assert!(line["subject"].is_object());
        assert!(line["object"].is_object());
    }
    let treats = lines.iter().find(|l| l["_id"] == "e1").unwrap();
    assert_eq!(treats["subject"]["name"], "aspirin");
    assert_eq!(treats["object"]["name"], "pain");
}
