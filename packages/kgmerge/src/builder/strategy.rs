//! Merge strategies
//!
//! A strategy decides how a batch reads its source documents, which stored
//! destination documents it looks at, and how a stored document is folded
//! into a freshly mapped one. Strategies are picked by name from the build
//! configuration.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::error::{PipelineError, Result};
use crate::record::{Record, RecordExt, OBJECT_FIELD, SUBJECT_FIELD};
use crate::store::Collection;

pub trait MergeStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn fetch_source(&self, source: &dyn Collection, ids: &[String]) -> Result<Vec<Record>> {
        source.find_by_ids(ids)
    }

    fn fetch_destination(&self, destination: &dyn Collection, ids: &[String]) -> Result<Vec<Record>> {
        destination.find_by_ids(ids)
    }

    /// Fold a previously stored document into the fresh one.
    fn merge(&self, fresh: Record, stored: Record) -> Record;
}

/// Node payload carried by a stored document: its embedded `subject`, or the
/// whole stored document when the subject was never resolved.
fn stored_subject(stored: Record) -> Value {
    if stored.is_embedded(SUBJECT_FIELD) {
        let mut stored = stored;
        stored.remove(SUBJECT_FIELD).unwrap_or(Value::Null)
    } else {
        Value::Object(stored)
    }
}

/// Injects the stored subject node; every other field comes from the fresh
/// document.
pub struct NodeEdgeMerge;

impl MergeStrategy for NodeEdgeMerge {
    fn name(&self) -> &'static str {
        "node_edge"
    }

    fn merge(&self, mut fresh: Record, stored: Record) -> Record {
        fresh.insert(SUBJECT_FIELD.to_string(), stored_subject(stored));
        fresh
    }
}

/// Like `NodeEdgeMerge`, and also carries over an embedded `object` node.
pub struct SubjectObjectMerge;

impl MergeStrategy for SubjectObjectMerge {
    fn name(&self) -> &'static str {
        "subject_object"
    }

    fn merge(&self, mut fresh: Record, mut stored: Record) -> Record {
        if stored.is_embedded(OBJECT_FIELD) {
            if let Some(object) = stored.remove(OBJECT_FIELD) {
                fresh.insert(OBJECT_FIELD.to_string(), object);
            }
        }
        fresh.insert(SUBJECT_FIELD.to_string(), stored_subject(stored));
        fresh
    }
}

pub fn strategy_for(name: &str) -> Result<Arc<dyn MergeStrategy>> {
    match name {
        "node_edge" => Ok(Arc::new(NodeEdgeMerge)),
        "subject_object" => Ok(Arc::new(SubjectObjectMerge)),
        other => Err(PipelineError::UnknownStrategy(other.to_string())),
    }
}

/// Merge stored documents onto fresh ones by `_id`.
///
/// Fresh documents keep their order; a repeated `_id` keeps the last fresh
/// document at the position of the first. Stored documents without a fresh
/// counterpart are ignored.
pub fn merge_stored(strategy: &dyn MergeStrategy, fresh: Vec<Record>, stored: Vec<Record>) -> Vec<Record> {
    let mut slots: Vec<Option<Record>> = Vec::with_capacity(fresh.len());
    let mut by_id: HashMap<String, usize> = HashMap::with_capacity(fresh.len());

    for doc in fresh {
        match doc.doc_id().map(str::to_string) {
            Some(id) => match by_id.get(&id) {
                Some(&slot) => slots[slot] = Some(doc),
                None => {
                    by_id.insert(id, slots.len());
                    slots.push(Some(doc));
                }
            },
            None => slots.push(Some(doc)),
        }
    }

    for old in stored {
        let slot = match old.doc_id().and_then(|id| by_id.get(id)) {
            Some(&slot) => slot,
            None => continue,
        };
        if let Some(doc) = slots[slot].take() {
            slots[slot] = Some(strategy.merge(doc, old));
        }
    }

    slots.into_iter().flatten().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_node_edge_takes_embedded_subject() {
        let fresh = doc(json!({"_id": "e1", "subject": "n1", "predicate": "treats"}));
        let stored = doc(json!({"_id": "e1", "subject": {"id": "n1", "name": "aspirin"}, "predicate": "old"}));
        let merged = NodeEdgeMerge.merge(fresh, stored);
        assert_eq!(merged["subject"]["name"], "aspirin");
        assert_eq!(merged["predicate"], "treats");
    }

    #[test]
    fn test_node_edge_falls_back_to_whole_stored_document() {
        let fresh = doc(json!({"_id": "n1", "subject": "n1"}));
        let stored = doc(json!({"_id": "n1", "name": "aspirin"}));
        let merged = NodeEdgeMerge.merge(fresh, stored);
        assert_eq!(merged["subject"], json!({"_id": "n1", "name": "aspirin"}));
    }

    #[test]
    fn test_subject_object_keeps_fresh_object_when_stored_is_reference() {
        let fresh = doc(json!({"_id": "e1", "subject": "n1", "object": {"id": "n2"}}));
        let stored = doc(json!({"_id": "e1", "subject": {"id": "n1"}, "object": "n2"}));
        let merged = SubjectObjectMerge.merge(fresh, stored);
        assert_eq!(merged["subject"], json!({"id": "n1"}));
        assert_eq!(merged["object"], json!({"id": "n2"}));
    }

    #[test]
    fn test_subject_object_carries_embedded_object() {
        let fresh = doc(json!({"_id": "e1", "subject": "n1", "object": "n2"}));
        let stored = doc(json!({"_id": "e1", "subject": {"id": "n1"}, "object": {"id": "n2", "name": "x"}}));
        let merged = SubjectObjectMerge.merge(fresh, stored);
        assert_eq!(merged["object"]["name"], "x");
    }

    #[test]
    fn test_strategy_for() {
        assert_eq!(strategy_for("node_edge").unwrap().name(), "node_edge");
        assert_eq!(strategy_for("subject_object").unwrap().name(), "subject_object");
        assert!(matches!(strategy_for("nope"), Err(PipelineError::UnknownStrategy(_))));
    }

    #[test]
    fn test_merge_stored_keeps_order_and_ignores_unmatched() {
        let fresh = vec![
            doc(json!({"_id": "b", "subject": "x"})),
            doc(json!({"_id": "a", "subject": "y"})),
        ];
        let stored = vec![
            doc(json!({"_id": "a", "subject": {"id": "y"}})),
            doc(json!({"_id": "zzz", "subject": {"id": "q"}})),
        ];
        let merged = merge_stored(&NodeEdgeMerge, fresh, stored);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0]["_id"], "b");
        assert_eq!(merged[0]["subject"], "x");
        assert_eq!(merged[1]["subject"], json!({"id": "y"}));
    }

    #[test]
    fn test_merge_stored_collapses_duplicate_ids() {
        let fresh = vec![
            doc(json!({"_id": "a", "v": 1})),
            doc(json!({"_id": "b", "v": 1})),
            doc(json!({"_id": "a", "v": 2})),
        ];
        let merged = merge_stored(&NodeEdgeMerge, fresh, vec![]);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0]["v"], 2);
    }
}
