//! kgmerge - knowledge-graph node/edge merge and indexing pipeline
//!
//! Joins the node and edge streams of a knowledge graph into merged edge
//! documents (each `subject`/`object` carrying the full node record) and
//! bulk-loads those documents into a search sink.
//!
//! - `loader`: streaming join straight from `nodes.jsonl[.gz]` / `edges.jsonl[.gz]`
//! - `builder`: parallel, batched merge of source collections into a target collection
//! - `indexer`: parallel, cancellable batch indexing with schedule reconciliation
//! - `ontology`: memoized ancestor lookup for category/predicate enrichment

pub mod batching;
pub mod builder;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod indexer;
pub mod loader;
pub mod mapper;
pub mod metrics;
pub mod ontology;
pub mod pool;
pub mod record;
pub mod resource;
pub mod sink;
pub mod store;

pub use builder::{MergeCounts, NodeEdgeBuilder};
pub use config::{IndexConfig, PipelineConfig};
pub use error::{PipelineError, Result};
pub use indexer::{IndexMode, IndexSummary, Indexer, Schedule};
pub use loader::{DanglingReferencePolicy, MergedEdges};
pub use pool::{Job, JobPool, JobSet, TaskPool};
pub use record::{DocQuery, Record, RecordExt};
pub use sink::{JsonlSink, MemorySink, SearchSink};
pub use store::{Collection, DocumentStore, MemoryCollection, MemoryStore};
