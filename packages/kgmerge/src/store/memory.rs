//! In-memory document store
//!
//! - `MemoryStore` holds a thread-safe map of collections, like a database
//!   registry
//! - each `MemoryCollection` keeps its documents ordered by `_id`, so id
//!   enumeration is deterministic
//! - `write` follows field-level `$set` semantics: fields of the new document
//!   overwrite stored ones, other stored fields are kept

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{PipelineError, Result};
use crate::record::{describe, DocQuery, Record, RecordExt};
use crate::store::{Collection, DocumentStore, IdBatches};

fn chunk_ids(ids: Vec<String>, batch_size: usize) -> Result<IdBatches> {
    if batch_size == 0 {
        return Err(PipelineError::Config("batch_size must be > 0".into()));
    }
    let batches: Vec<Result<Vec<String>>> = ids.chunks(batch_size).map(|c| Ok(c.to_vec())).collect();
    Ok(Box::new(batches.into_iter()))
}

/// Ordered, lock-protected collection.
pub struct MemoryCollection {
    name: String,
    docs: RwLock<BTreeMap<String, Record>>,
}

impl MemoryCollection {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            docs: RwLock::new(BTreeMap::new()),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, BTreeMap<String, Record>>> {
        self.docs
            .read()
            .map_err(|_| PipelineError::Store(format!("collection '{}' lock poisoned", self.name)))
    }

    fn write_lock(&self) -> Result<RwLockWriteGuard<'_, BTreeMap<String, Record>>> {
        self.docs
            .write()
            .map_err(|_| PipelineError::Store(format!("collection '{}' lock poisoned", self.name)))
    }

    /// Replace-or-insert raw documents (used to seed source collections).
    pub fn insert_many(&self, docs: impl IntoIterator<Item = Record>) -> Result<usize> {
        let mut map = self.write_lock()?;
        let mut inserted = 0;
        for doc in docs {
            let id = doc
                .doc_id()
                .map(str::to_string)
                .ok_or_else(|| PipelineError::Store(format!("document {} has no _id", describe(&doc))))?;
            map.insert(id, doc);
            inserted += 1;
        }
        Ok(inserted)
    }

    pub fn get(&self, id: &str) -> Option<Record> {
        self.read().ok().and_then(|m| m.get(id).cloned())
    }

    pub fn clear(&self) -> Result<()> {
        self.write_lock()?.clear();
        Ok(())
    }
}

impl Collection for MemoryCollection {
    fn name(&self) -> &str {
        &self.name
    }

    fn count(&self) -> Result<usize> {
        Ok(self.read()?.len())
    }

    fn find_by_ids(&self, ids: &[String]) -> Result<Vec<Record>> {
        let map = self.read()?;
        Ok(ids.iter().filter_map(|id| map.get(id).cloned()).collect())
    }

    fn stream_ids(&self, batch_size: usize) -> Result<IdBatches> {
        let ids: Vec<String> = self.read()?.keys().cloned().collect();
        chunk_ids(ids, batch_size)
    }

    fn stream_filtered(&self, query: &DocQuery, batch_size: usize) -> Result<IdBatches> {
        let ids: Vec<String> = self
            .read()?
            .iter()
            .filter(|(_, doc)| query.matches(doc))
            .map(|(id, _)| id.clone())
            .collect();
        chunk_ids(ids, batch_size)
    }

    fn write(&self, docs: &[Record], upsert: bool) -> Result<usize> {
        let mut map = self.write_lock()?;
        let mut written = 0;
        for doc in docs {
            let id = doc
                .doc_id()
                .map(str::to_string)
                .ok_or_else(|| PipelineError::Store(format!("document {} has no _id", describe(doc))))?;
            match map.get_mut(&id) {
                Some(stored) => {
                    for (k, v) in doc {
                        stored.insert(k.clone(), v.clone());
                    }
                    written += 1;
                }
                None if upsert => {
                    map.insert(id, doc.clone());
                    written += 1;
                }
                None => {}
            }
        }
        Ok(written)
    }
}

/// Thread-safe registry of in-memory collections.
pub struct MemoryStore {
    name: String,
    collections: RwLock<HashMap<String, Arc<MemoryCollection>>>,
}

impl MemoryStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            collections: RwLock::new(HashMap::new()),
        }
    }

    /// Typed handle, creating the collection if needed.
    pub fn memory_collection(&self, name: &str) -> Result<Arc<MemoryCollection>> {
        let mut collections = self
            .collections
            .write()
            .map_err(|_| PipelineError::Store(format!("store '{}' lock poisoned", self.name)))?;
        Ok(Arc::clone(
            collections
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(MemoryCollection::new(name))),
        ))
    }
}

impl DocumentStore for MemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn collection(&self, name: &str) -> Option<Arc<dyn Collection>> {
        let collections = self.collections.read().ok()?;
        collections
            .get(name)
            .map(|c| Arc::clone(c) as Arc<dyn Collection>)
    }

    fn collection_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .collections
            .read()
            .map(|c| c.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    fn create_collection(&self, name: &str) -> Result<Arc<dyn Collection>> {
        Ok(self.memory_collection(name)? as Arc<dyn Collection>)
    }
}
