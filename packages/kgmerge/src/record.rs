//! Graph records and document queries
//!
//! Nodes, edges and merged documents all share one representation: a JSON
//! object keyed by field name. The `_id` field is the document identifier
//! used by every collection and sink.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Identifier field present on every stored document.
pub const ID_FIELD: &str = "_id";

/// Source-level identifier carried by node records.
pub const NODE_ID_FIELD: &str = "id";

pub const SUBJECT_FIELD: &str = "subject";
pub const OBJECT_FIELD: &str = "object";
pub const PREDICATE_FIELD: &str = "predicate";

/// A node, edge or merged document.
pub type Record = Map<String, Value>;

/// Accessors shared by all record kinds.
pub trait RecordExt {
    /// Document identifier, if it is a string.
    fn doc_id(&self) -> Option<&str>;

    fn set_doc_id(&mut self, id: impl Into<String>);

    /// True when `field` holds an embedded object rather than a reference.
    fn is_embedded(&self, field: &str) -> bool;
}

impl RecordExt for Record {
    fn doc_id(&self) -> Option<&str> {
        self.get(ID_FIELD).and_then(Value::as_str)
    }

    fn set_doc_id(&mut self, id: impl Into<String>) {
        self.insert(ID_FIELD.to_string(), Value::String(id.into()));
    }

    fn is_embedded(&self, field: &str) -> bool {
        matches!(self.get(field), Some(Value::Object(_)))
    }
}

/// Short label for a record in error messages.
pub fn describe(record: &Record) -> String {
    match record.doc_id() {
        Some(id) => format!("'{}'", id),
        None => format!("<{} fields>", record.len()),
    }
}

/// Field-equality filter over documents (AND semantics).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocQuery {
    pub filter: Map<String, Value>,
}

impl DocQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter.insert(name.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.filter.is_empty()
    }

    /// Every filter field must be present with an equal value.
    pub fn matches(&self, record: &Record) -> bool {
        self.filter
            .iter()
            .all(|(k, v)| record.get(k).map_or(false, |actual| actual == v))
    }
}
