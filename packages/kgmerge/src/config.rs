//! Build and index configuration
//!
//! Loaded from YAML or JSON (picked by file extension). Everything except
//! the build name, sources and target collection has a default.
//!
//! ```yaml
//! build_name: rtx_kg2
//! sources: [rtx_kg2_nodes, rtx_kg2_edges]
//! root_sources: [rtx_kg2_nodes]
//! target_collection: rtx_kg2_merged
//! merge_strategy: node_edge
//! mapper: biolink
//! ontology_path: biolink_hierarchy.yaml
//! log_folder: logs
//! index:
//!   name: rtx_kg2_index
//!   node_collection: rtx_kg2_nodes
//!   mapping: kg2_merged_edges
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::builder::strategy::strategy_for;
use crate::builder::worker::{drop_fields, DocumentCleaner};
use crate::error::{PipelineError, Result};
use crate::indexer::IndexMode;
use crate::mapper::{BiolinkMapperFactory, IdentityMapperFactory, IndexMapping, MapperFactory};
use crate::ontology::{BiolinkEnricher, HierarchyOntology};
use crate::pool::{JobPool, TaskPool};
use crate::record::DocQuery;

pub const DEFAULT_BATCH_SIZE: usize = 100_000;
pub const DEFAULT_INDEX_BATCH_SIZE: usize = 10_000;

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_index_batch_size() -> usize {
    DEFAULT_INDEX_BATCH_SIZE
}

fn default_strategy() -> String {
    "node_edge".to_string()
}

fn default_mapper() -> String {
    "identity".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub build_name: String,
    /// Source collections in merge order; the first names the datasource.
    pub sources: Vec<String>,
    /// Sources allowed to insert new documents. Empty means all of them.
    #[serde(default)]
    pub root_sources: Vec<String>,
    pub target_collection: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_strategy")]
    pub merge_strategy: String,
    #[serde(default = "default_mapper")]
    pub mapper: String,
    #[serde(default)]
    pub source_filters: BTreeMap<String, DocQuery>,
    #[serde(default)]
    pub drop_fields: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub log_folder: Option<PathBuf>,
    #[serde(default)]
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub ontology_path: Option<PathBuf>,
    #[serde(default)]
    pub index: Option<IndexConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    pub name: String,
    /// Defaults to the build's target collection.
    #[serde(default)]
    pub edge_collection: Option<String>,
    pub node_collection: String,
    #[serde(default = "default_index_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub mapping: IndexMapping,
    #[serde(default)]
    pub mode: IndexMode,
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: PipelineConfig = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&text)?,
            _ => serde_yaml::from_str(&text)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.build_name.is_empty() {
            return Err(PipelineError::Config("build_name is empty".into()));
        }
        if self.sources.is_empty() {
            return Err(PipelineError::Config("at least one source is required".into()));
        }
        if self.target_collection.is_empty() {
            return Err(PipelineError::Config("target_collection is empty".into()));
        }
        if self.batch_size == 0 {
            return Err(PipelineError::Config("batch_size must be > 0".into()));
        }
        if self.concurrency == Some(0) {
            return Err(PipelineError::Config("concurrency must be > 0".into()));
        }
        for root in &self.root_sources {
            if !self.sources.contains(root) {
                return Err(PipelineError::Config(format!(
                    "root source '{}' is not listed in sources",
                    root
                )));
            }
        }
        strategy_for(&self.merge_strategy)?;
        match self.mapper.as_str() {
            "identity" => {}
            "biolink" if self.ontology_path.is_some() => {}
            "biolink" => {
                return Err(PipelineError::Config(
                    "mapper 'biolink' requires ontology_path".into(),
                ))
            }
            other => return Err(PipelineError::Config(format!("unknown mapper '{}'", other))),
        }
        if let Some(index) = &self.index {
            if index.batch_size == 0 {
                return Err(PipelineError::Config("index.batch_size must be > 0".into()));
            }
            if index.name.is_empty() || index.node_collection.is_empty() {
                return Err(PipelineError::Config(
                    "index.name and index.node_collection are required".into(),
                ));
            }
        }
        Ok(())
    }

    pub fn datasource_name(&self) -> &str {
        self.sources.first().map(String::as_str).unwrap_or_default()
    }

    /// Upsert unless root sources are configured and `source` is not one.
    pub fn is_upsert(&self, source: &str) -> bool {
        self.root_sources.is_empty() || self.root_sources.iter().any(|r| r == source)
    }

    /// Sources in merge order: root sources first, then the rest, each group
    /// in configured order.
    pub fn merge_order(&self) -> Vec<String> {
        let (roots, rest): (Vec<&String>, Vec<&String>) = self
            .sources
            .iter()
            .partition(|s| !self.root_sources.is_empty() && self.is_upsert(s));
        roots.into_iter().chain(rest).cloned().collect()
    }

    pub fn filter_for(&self, source: &str) -> Option<&DocQuery> {
        self.source_filters.get(source).filter(|q| !q.is_empty())
    }

    pub fn cleaner_for(&self, source: &str) -> Option<DocumentCleaner> {
        self.drop_fields
            .get(source)
            .filter(|fields| !fields.is_empty())
            .map(|fields| drop_fields(fields.clone()))
    }

    pub fn mapper_factory(&self) -> Result<Arc<dyn MapperFactory>> {
        match (self.mapper.as_str(), &self.ontology_path) {
            ("identity", _) => Ok(Arc::new(IdentityMapperFactory)),
            ("biolink", Some(path)) => {
                let ontology = HierarchyOntology::load(path)?;
                let enricher = BiolinkEnricher::new(Arc::new(ontology));
                Ok(Arc::new(BiolinkMapperFactory::new(Arc::new(enricher))))
            }
            ("biolink", None) => Err(PipelineError::Config(
                "mapper 'biolink' requires ontology_path".into(),
            )),
            (other, _) => Err(PipelineError::Config(format!("unknown mapper '{}'", other))),
        }
    }

    pub fn job_pool(&self) -> Arc<dyn JobPool> {
        match self.concurrency {
            Some(n) => Arc::new(TaskPool::new(n)),
            None => Arc::new(TaskPool::auto_tuned()),
        }
    }
}

impl IndexConfig {
    pub fn edge_collection<'a>(&'a self, config: &'a PipelineConfig) -> &'a str {
        self.edge_collection
            .as_deref()
            .unwrap_or(&config.target_collection)
    }
}
