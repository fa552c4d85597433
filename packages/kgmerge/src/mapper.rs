//! Document mappers and search-index mappings
//!
//! A mapper transforms source documents before they are merged into the
//! target collection. Mappers are created per batch through a shared
//! `MapperFactory` and loaded inside the worker, so no mapper instance ever
//! crosses a batch boundary.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::{PipelineError, Result};
use crate::ontology::BiolinkEnricher;
use crate::record::{Record, OBJECT_FIELD, PREDICATE_FIELD, SUBJECT_FIELD};

/// Per-batch document transform.
pub trait DocumentMapper: Send {
    /// Acquire whatever the mapper needs; called once per batch.
    fn load(&mut self) -> Result<()> {
        Ok(())
    }

    fn process(&self, docs: Vec<Record>) -> Result<Vec<Record>>;
}

/// Creates a fresh mapper for every batch.
pub trait MapperFactory: Send + Sync {
    fn name(&self) -> &str;

    fn create(&self) -> Box<dyn DocumentMapper>;
}

/// Passes documents through unchanged.
pub struct IdentityMapper;

impl DocumentMapper for IdentityMapper {
    fn process(&self, docs: Vec<Record>) -> Result<Vec<Record>> {
        Ok(docs)
    }
}

pub struct IdentityMapperFactory;

impl MapperFactory for IdentityMapperFactory {
    fn name(&self) -> &str {
        "identity"
    }

    fn create(&self) -> Box<dyn DocumentMapper> {
        Box::new(IdentityMapper)
    }
}

/// Biolink enrichment: predicate ancestors on edges, category ancestors on
/// nodes, including nodes embedded as `subject`/`object`.
pub struct BiolinkMapper {
    enricher: Arc<BiolinkEnricher>,
    loaded: bool,
}

impl BiolinkMapper {
    pub fn new(enricher: Arc<BiolinkEnricher>) -> Self {
        Self {
            enricher,
            loaded: false,
        }
    }

    fn enrich(&self, mut doc: Record) -> Record {
        if doc.contains_key(PREDICATE_FIELD) {
            self.enricher.process_predicate(&mut doc);
        }
        for field in [SUBJECT_FIELD, OBJECT_FIELD] {
            if let Some(Value::Object(node)) = doc.get_mut(field) {
                self.enricher.process_category(node);
            }
        }
        if doc.contains_key("category") {
            self.enricher.process_category(&mut doc);
        }
        doc
    }
}

impl DocumentMapper for BiolinkMapper {
    fn load(&mut self) -> Result<()> {
        self.loaded = true;
        Ok(())
    }

    fn process(&self, docs: Vec<Record>) -> Result<Vec<Record>> {
        if !self.loaded {
            return Err(PipelineError::Config("biolink mapper used before load()".into()));
        }
        Ok(docs.into_iter().map(|d| self.enrich(d)).collect())
    }
}

pub struct BiolinkMapperFactory {
    enricher: Arc<BiolinkEnricher>,
}

impl BiolinkMapperFactory {
    pub fn new(enricher: Arc<BiolinkEnricher>) -> Self {
        Self { enricher }
    }
}

impl MapperFactory for BiolinkMapperFactory {
    fn name(&self) -> &str {
        "biolink"
    }

    fn create(&self) -> Box<dyn DocumentMapper> {
        Box::new(BiolinkMapper::new(Arc::clone(&self.enricher)))
    }
}

// ── Index mappings ──────────────────────────────────────────────────

/// Field mapping sent to the search sink before indexing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexMapping {
    Edges,
    Nodes,
    #[default]
    MergedEdges,
    Kg2MergedEdges,
}

fn default_text() -> Value {
    json!({"type": "text", "fields": {"keyword": {"type": "keyword", "ignore_above": 256}}})
}

fn unindexed_text() -> Value {
    json!({"type": "text", "index": false})
}

fn props(fields: &[&str]) -> Map<String, Value> {
    fields
        .iter()
        .map(|f| (f.to_string(), default_text()))
        .collect()
}

const EDGE_TEXT_FIELDS: &[&str] = &[
    "agent_type",
    "anatomical_context_qualifier",
    "knowledge_level",
    "object",
    "original_object",
    "original_subject",
    "population_context_qualifier",
    "predicate",
    "primary_knowledge_source",
    "publications",
    "sex_qualifier",
    "species_context_qualifier",
    "subject",
];

fn node_properties() -> Map<String, Value> {
    let mut p = props(&["id", "name", "category", "equivalent_identifiers"]);
    p.insert("information_content".into(), json!({"type": "float"}));
    p
}

impl IndexMapping {
    /// Mapping body in search-engine `{"properties": ...}` form.
    pub fn to_json(self) -> Value {
        let properties = match self {
            IndexMapping::Edges => props(EDGE_TEXT_FIELDS),
            IndexMapping::Nodes => node_properties(),
            IndexMapping::MergedEdges => {
                let mut p = props(EDGE_TEXT_FIELDS);
                let node = json!({"type": "object", "properties": node_properties()});
                p.insert(SUBJECT_FIELD.into(), node.clone());
                p.insert(OBJECT_FIELD.into(), node);
                p
            }
            IndexMapping::Kg2MergedEdges => {
                let mut p = props(&[
                    "agent_type",
                    "knowledge_level",
                    "predicate",
                    "all_predicates",
                    "primary_knowledge_source",
                    "publications",
                ]);
                p.insert("domain_range_exclusion".into(), json!({"type": "boolean", "index": false}));
                p.insert("id".into(), json!({"type": "long", "index": false}));
                p.insert("kg2_ids".into(), unindexed_text());
                p.insert("publications_info".into(), json!({"type": "object", "enabled": false}));
                for f in ["qualified_object_aspect", "qualified_object_direction", "qualified_predicate"] {
                    p.insert(f.into(), unindexed_text());
                }

                let mut node = props(&[
                    "all_categories",
                    "all_names",
                    "category",
                    "equivalent_curies",
                    "id",
                    "name",
                    "publications",
                ]);
                node.insert("description".into(), unindexed_text());
                node.insert("iri".into(), unindexed_text());
                let node = json!({"type": "object", "properties": node});
                p.insert(SUBJECT_FIELD.into(), node.clone());
                p.insert(OBJECT_FIELD.into(), node);
                p
            }
        };
        json!({ "properties": properties })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ontology::HierarchyOntology;

    fn enricher() -> Arc<BiolinkEnricher> {
        let ontology = HierarchyOntology::new()
            .with_parent("Gene", "NamedThing")
            .with_parent("interacts_with", "related_to");
        Arc::new(BiolinkEnricher::new(Arc::new(ontology)))
    }

    fn doc(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_identity_mapper_is_passthrough() {
        let mut mapper = IdentityMapperFactory.create();
        mapper.load().unwrap();
        let docs = vec![doc(json!({"_id": "1", "x": 1}))];
        assert_eq!(mapper.process(docs.clone()).unwrap(), docs);
    }

    #[test]
    fn test_biolink_mapper_enriches_embedded_nodes() {
        let factory = BiolinkMapperFactory::new(enricher());
        let mut mapper = factory.create();
        mapper.load().unwrap();

        let out = mapper
            .process(vec![doc(json!({
                "_id": "e1",
                "predicate": "biolink:interacts_with",
                "subject": {"id": "G:1", "category": "biolink:Gene"},
                "object": "G:2"
            }))])
            .unwrap();

        assert_eq!(out[0]["predicate"], json!("interacts_with"));
        assert_eq!(out[0]["all_predicates"], json!(["interacts_with", "related_to"]));
        assert_eq!(out[0]["subject"]["category"], json!("Gene"));
        assert_eq!(out[0]["subject"]["all_categories"], json!(["Gene", "NamedThing"]));
        assert_eq!(out[0]["object"], json!("G:2"));
    }

    #[test]
    fn test_biolink_mapper_requires_load() {
        let mapper = BiolinkMapperFactory::new(enricher()).create();
        assert!(mapper.process(vec![]).is_err());
    }

    #[test]
    fn test_factories_create_independent_mappers() {
        let factory = BiolinkMapperFactory::new(enricher());
        let mut first = factory.create();
        first.load().unwrap();
        let second = factory.create();
        assert!(first.process(vec![]).is_ok());
        assert!(second.process(vec![]).is_err());
    }

    #[test]
    fn test_merged_edges_mapping_nests_nodes() {
        let mapping = IndexMapping::MergedEdges.to_json();
        assert_eq!(mapping["properties"]["subject"]["type"], json!("object"));
        assert_eq!(
            mapping["properties"]["object"]["properties"]["information_content"]["type"],
            json!("float")
        );
        assert_eq!(mapping["properties"]["predicate"]["type"], json!("text"));
    }

    #[test]
    fn test_kg2_mapping_disables_unsearched_fields() {
        let mapping = IndexMapping::Kg2MergedEdges.to_json();
        assert_eq!(mapping["properties"]["publications_info"]["enabled"], json!(false));
        assert_eq!(mapping["properties"]["subject"]["properties"]["iri"]["index"], json!(false));
        assert!(mapping["properties"].get("sex_qualifier").is_none());
    }
}
