//! One batch of indexing work
//!
//! Reads merged edge documents for a list of ids and bulk-loads them into
//! the search sink. Subject/object fields that are still plain node ids are
//! resolved from the node collection first. The returned count includes
//! invalid ids so the schedule's totals reconcile with the ids requested.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::error::{PipelineError, Result};
use crate::record::{Record, RecordExt, OBJECT_FIELD, SUBJECT_FIELD};
use crate::sink::SearchSink;
use crate::store::Collection;

/// Longest id accepted by the search sink, in bytes.
pub const MAX_ID_LENGTH: usize = 512;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexMode {
    /// Index every id.
    #[default]
    Index,
    /// Empty the sink first, then index every id.
    Purge,
    /// Index only ids the sink does not have yet.
    Resume,
}

impl IndexMode {
    pub fn as_str(self) -> &'static str {
        match self {
            IndexMode::Index => "index",
            IndexMode::Purge => "purge",
            IndexMode::Resume => "resume",
        }
    }
}

impl FromStr for IndexMode {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "index" => Ok(IndexMode::Index),
            "purge" => Ok(IndexMode::Purge),
            "resume" => Ok(IndexMode::Resume),
            other => Err(PipelineError::UnknownMode(other.to_string())),
        }
    }
}

impl fmt::Display for IndexMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Split ids into (valid, invalid). Empty ids and ids over `MAX_ID_LENGTH`
/// bytes are invalid.
pub fn validate_ids(ids: Vec<String>) -> (Vec<String>, Vec<String>) {
    let (valid, invalid): (Vec<String>, Vec<String>) = ids
        .into_iter()
        .partition(|id| !id.is_empty() && id.len() <= MAX_ID_LENGTH);
    for id in &invalid {
        let shown: String = id.chars().take(64).collect();
        warn!("skipping invalid id ({} bytes): '{}'", id.len(), shown);
    }
    (valid, invalid)
}

pub struct IndexingTask {
    edges: Arc<dyn Collection>,
    nodes: Arc<dyn Collection>,
    sink: Arc<dyn SearchSink>,
    ids: Vec<String>,
    invalid_ids: Vec<String>,
    mode: IndexMode,
    name: String,
}

impl IndexingTask {
    pub fn new(
        edges: Arc<dyn Collection>,
        nodes: Arc<dyn Collection>,
        sink: Arc<dyn SearchSink>,
        ids: Vec<String>,
        mode: IndexMode,
        name: impl Into<String>,
    ) -> Self {
        let (ids, invalid_ids) = validate_ids(ids);
        Self {
            edges,
            nodes,
            sink,
            ids,
            invalid_ids,
            mode,
            name: name.into(),
        }
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn invalid_ids(&self) -> &[String] {
        &self.invalid_ids
    }

    pub fn dispatch(&self) -> Result<usize> {
        match self.mode {
            IndexMode::Index | IndexMode::Purge => self.index(&self.ids),
            IndexMode::Resume => self.resume(),
        }
    }

    fn index(&self, ids: &[String]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(self.invalid_ids.len());
        }
        let docs = self.edges.find_by_ids(ids)?;
        info!("{}: {} documents.", self.name, ids.len());
        let docs = self.embed_nodes(docs)?;
        let indexed = self.sink.bulk_index(docs)?;
        Ok(indexed + self.invalid_ids.len())
    }

    fn resume(&self) -> Result<usize> {
        let existing: HashSet<String> = self.sink.existing_ids(&self.ids)?;
        let missing: Vec<String> = self.ids.iter().filter(|id| !existing.contains(*id)).cloned().collect();
        info!(
            "{}: resuming, {} already indexed, {} missing",
            self.name,
            existing.len(),
            missing.len()
        );
        Ok(self.index(&missing)? + existing.len())
    }

    /// Replace subject/object node ids with node documents where possible.
    fn embed_nodes(&self, mut docs: Vec<Record>) -> Result<Vec<Record>> {
        let wanted: Vec<String> = docs
            .iter()
            .flat_map(|doc| [SUBJECT_FIELD, OBJECT_FIELD].into_iter().filter_map(move |f| doc.get(f)))
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        if wanted.is_empty() {
            return Ok(docs);
        }

        let nodes: HashMap<String, Record> = self
            .nodes
            .find_by_ids(&wanted)?
            .into_iter()
            .filter_map(|node| node.doc_id().map(str::to_string).map(|id| (id, node)))
            .collect();

        for doc in &mut docs {
            for field in [SUBJECT_FIELD, OBJECT_FIELD] {
                let node = match doc.get(field).and_then(Value::as_str) {
                    Some(id) => nodes.get(id),
                    None => continue,
                };
                match node {
                    Some(node) => {
                        doc.insert(field.to_string(), Value::Object(node.clone()));
                    }
                    None => warn!(
                        "{}: {} of {} not found in '{}'",
                        self.name,
                        field,
                        crate::record::describe(doc),
                        self.nodes.name()
                    ),
                }
            }
        }
        Ok(docs)
    }
}
