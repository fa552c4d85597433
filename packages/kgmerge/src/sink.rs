//! Search index sinks
//!
//! The indexer only needs bulk writes plus a handful of maintenance calls.
//! `MemorySink` keeps documents in process; `JsonlSink` appends them to a
//! JSON-lines file (one indexed document per line).

use std::collections::{BTreeMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use serde_json::Value;

use crate::error::{PipelineError, Result};
use crate::record::{describe, Record, RecordExt};

/// Bulk-loading target for merged documents.
pub trait SearchSink: Send + Sync {
    fn name(&self) -> &str;

    /// Install the field mapping. With `recreate`, existing content is dropped.
    fn prepare(&self, _mapping: &Value, _recreate: bool) -> Result<()> {
        Ok(())
    }

    /// Index `docs` by `_id`, returning the number indexed. Re-indexing an
    /// id already present never produces a second copy of it.
    fn bulk_index(&self, docs: Vec<Record>) -> Result<usize>;

    /// Subset of `ids` already present in the index.
    fn existing_ids(&self, ids: &[String]) -> Result<HashSet<String>>;

    /// Drop every indexed document.
    fn purge(&self) -> Result<()>;
}

fn require_id(doc: &Record) -> Result<String> {
    doc.doc_id()
        .map(str::to_string)
        .ok_or_else(|| PipelineError::Sink(format!("document {} has no _id", describe(doc))))
}

/// In-process index.
pub struct MemorySink {
    name: String,
    docs: RwLock<BTreeMap<String, Record>>,
    mapping: RwLock<Option<Value>>,
}

impl MemorySink {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            docs: RwLock::new(BTreeMap::new()),
            mapping: RwLock::new(None),
        }
    }

    pub fn len(&self) -> usize {
        self.docs.read().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: &str) -> Option<Record> {
        self.docs.read().ok().and_then(|d| d.get(id).cloned())
    }

    pub fn mapping(&self) -> Option<Value> {
        self.mapping.read().ok().and_then(|m| m.clone())
    }

    fn poisoned(&self) -> PipelineError {
        PipelineError::Sink(format!("index '{}' lock poisoned", self.name))
    }
}

impl SearchSink for MemorySink {
    fn name(&self) -> &str {
        &self.name
    }

    fn prepare(&self, mapping: &Value, recreate: bool) -> Result<()> {
        if recreate {
            self.purge()?;
        }
        *self.mapping.write().map_err(|_| self.poisoned())? = Some(mapping.clone());
        Ok(())
    }

    fn bulk_index(&self, docs: Vec<Record>) -> Result<usize> {
        let mut index = self.docs.write().map_err(|_| self.poisoned())?;
        let mut count = 0;
        for doc in docs {
            index.insert(require_id(&doc)?, doc);
            count += 1;
        }
        Ok(count)
    }

    fn existing_ids(&self, ids: &[String]) -> Result<HashSet<String>> {
        let index = self.docs.read().map_err(|_| self.poisoned())?;
        Ok(ids.iter().filter(|id| index.contains_key(*id)).cloned().collect())
    }

    fn purge(&self) -> Result<()> {
        self.docs.write().map_err(|_| self.poisoned())?.clear();
        Ok(())
    }
}

/// Append-only JSON-lines index file.
///
/// Keeps the set of written ids so `existing_ids` works for resumed runs
/// within one process. Lines are never rewritten: an id that was already
/// written keeps its first line and later copies are dropped.
pub struct JsonlSink {
    name: String,
    path: PathBuf,
    inner: Mutex<JsonlState>,
}

struct JsonlState {
    writer: BufWriter<File>,
    ids: HashSet<String>,
}

impl JsonlSink {
    pub fn create(name: impl Into<String>, path: &Path) -> Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            name: name.into(),
            path: path.to_path_buf(),
            inner: Mutex::new(JsonlState {
                writer: BufWriter::new(file),
                ids: HashSet::new(),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn flush(&self) -> Result<()> {
        let mut state = self.lock()?;
        state.writer.flush()?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, JsonlState>> {
        self.inner
            .lock()
            .map_err(|_| PipelineError::Sink(format!("index '{}' lock poisoned", self.name)))
    }
}

impl SearchSink for JsonlSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn bulk_index(&self, docs: Vec<Record>) -> Result<usize> {
        let mut state = self.lock()?;
        let mut count = 0;
        for doc in docs {
            let id = require_id(&doc)?;
            count += 1;
            if state.ids.contains(&id) {
                continue;
            }
            serde_json::to_writer(&mut state.writer, &doc)?;
            state.writer.write_all(b"\n")?;
            state.ids.insert(id);
        }
        state.writer.flush()?;
        Ok(count)
    }

    fn existing_ids(&self, ids: &[String]) -> Result<HashSet<String>> {
        let state = self.lock()?;
        Ok(ids.iter().filter(|id| state.ids.contains(*id)).cloned().collect())
    }

    fn purge(&self) -> Result<()> {
        let mut state = self.lock()?;
        let file = OpenOptions::new().write(true).truncate(true).open(&self.path)?;
        state.writer = BufWriter::new(file);
        state.ids.clear();
        Ok(())
    }
}
