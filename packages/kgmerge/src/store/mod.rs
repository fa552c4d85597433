//! Document store abstractions
//!
//! The pipeline reads source documents and reads/writes merged documents
//! through these traits only. Physical storage is someone else's concern;
//! `memory` provides an in-process implementation used by the CLI and tests.

pub mod memory;

pub use memory::{MemoryCollection, MemoryStore};

use std::sync::Arc;

use crate::error::{PipelineError, Result};
use crate::record::{DocQuery, Record};

/// Lazy sequence of id batches.
pub type IdBatches = Box<dyn Iterator<Item = Result<Vec<String>>> + Send>;

/// A named collection of documents keyed by `_id`.
///
/// Calls are blocking; workers run them on the blocking pool.
pub trait Collection: Send + Sync {
    fn name(&self) -> &str;

    // === SOURCE SIDE ===

    /// Live document count.
    fn count(&self) -> Result<usize>;

    /// Documents whose `_id` is in `ids`. Unknown ids are simply absent.
    fn find_by_ids(&self, ids: &[String]) -> Result<Vec<Record>>;

    /// All ids, `batch_size` at a time.
    fn stream_ids(&self, batch_size: usize) -> Result<IdBatches>;

    /// Ids of documents matching `query`, `batch_size` at a time.
    fn stream_filtered(&self, query: &DocQuery, batch_size: usize) -> Result<IdBatches>;

    // === TARGET SIDE ===

    /// Persist `docs`, returning the number of documents written.
    ///
    /// With `upsert`, missing documents are inserted. Without it, documents
    /// whose `_id` is not already stored are silently skipped.
    fn write(&self, docs: &[Record], upsert: bool) -> Result<usize>;
}

/// A database: a namespace of collections.
pub trait DocumentStore: Send + Sync {
    fn name(&self) -> &str;

    fn collection(&self, name: &str) -> Option<Arc<dyn Collection>>;

    fn collection_names(&self) -> Vec<String>;

    /// Return the collection, creating it empty if needed.
    fn create_collection(&self, name: &str) -> Result<Arc<dyn Collection>>;
}

/// Look up a collection that must already exist.
pub fn require_collection(store: &dyn DocumentStore, name: &str) -> Result<Arc<dyn Collection>> {
    store
        .collection(name)
        .ok_or_else(|| PipelineError::CollectionNotFound {
            name: name.to_string(),
            available: store.collection_names(),
        })
}
