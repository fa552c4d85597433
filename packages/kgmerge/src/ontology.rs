//! Ontology ancestor resolution and biolink enrichment
//!
//! `AncestorResolver` memoizes ancestor lookups against an `Ontology`. It is
//! constructed once per process and handed to whoever needs it; there is no
//! global toolkit instance.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, RwLock};

use serde_json::Value;

use crate::error::Result;
use crate::record::{Record, PREDICATE_FIELD};

/// Namespace prefix removed from resolved ancestors.
pub const BIOLINK_PREFIX: &str = "biolink:";

/// Source of ancestor closures for categories and predicates.
pub trait Ontology: Send + Sync {
    /// Reflexive ancestor closure of `phrase`, formatted as `biolink:` CURIEs.
    /// Unknown phrases have no ancestors.
    fn ancestors(&self, phrase: &str) -> Vec<String>;
}

/// Strip a leading `biolink:` (case-sensitive, exact prefix only).
pub fn strip_prefix(text: &str) -> &str {
    text.strip_prefix(BIOLINK_PREFIX).unwrap_or(text)
}

/// Strip the prefix from a string or from every string in a list.
/// Other values are returned unchanged.
pub fn strip_value(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(strip_prefix(s).to_string()),
        Value::Array(items) => Value::Array(items.iter().map(strip_value).collect()),
        other => other.clone(),
    }
}

/// In-memory class hierarchy: element name -> direct parents.
///
/// Names are stored without the `biolink:` prefix; lookups accept either
/// form, and snake_case predicates as well as CamelCase classes.
#[derive(Debug, Clone, Default)]
pub struct HierarchyOntology {
    parents: HashMap<String, Vec<String>>,
}

impl HierarchyOntology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_parents(parents: HashMap<String, Vec<String>>) -> Self {
        let parents = parents
            .into_iter()
            .map(|(k, v)| {
                (
                    strip_prefix(&k).to_string(),
                    v.iter().map(|p| strip_prefix(p).to_string()).collect(),
                )
            })
            .collect();
        Self { parents }
    }

    /// Load a YAML mapping of `element: [parent, ...]`.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let parents: HashMap<String, Vec<String>> = serde_yaml::from_str(&text)?;
        Ok(Self::from_parents(parents))
    }

    pub fn with_parent(mut self, element: &str, parent: &str) -> Self {
        self.parents
            .entry(strip_prefix(element).to_string())
            .or_default()
            .push(strip_prefix(parent).to_string());
        self
    }

    fn knows(&self, name: &str) -> bool {
        self.parents.contains_key(name) || self.parents.values().any(|ps| ps.iter().any(|p| p == name))
    }
}

impl Ontology for HierarchyOntology {
    fn ancestors(&self, phrase: &str) -> Vec<String> {
        let start = strip_prefix(phrase);
        if !self.knows(start) {
            return Vec::new();
        }

        let mut seen = BTreeSet::new();
        let mut order = Vec::new();
        let mut queue = VecDeque::from([start.to_string()]);
        while let Some(name) = queue.pop_front() {
            if !seen.insert(name.clone()) {
                continue;
            }
            if let Some(parents) = self.parents.get(&name) {
                queue.extend(parents.iter().cloned());
            }
            order.push(format!("{}{}", BIOLINK_PREFIX, name));
        }
        order
    }
}

/// Memoizing ancestor lookup.
///
/// The cache only grows; identical phrases hit the ontology once.
pub struct AncestorResolver {
    ontology: Arc<dyn Ontology>,
    cache: RwLock<HashMap<String, Vec<String>>>,
}

impl AncestorResolver {
    pub fn new(ontology: Arc<dyn Ontology>) -> Self {
        Self {
            ontology,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Ancestors of `phrase` with the `biolink:` prefix removed.
    pub fn resolve(&self, phrase: &str) -> Vec<String> {
        if let Ok(cache) = self.cache.read() {
            if let Some(hit) = cache.get(phrase) {
                return hit.clone();
            }
        }

        let ancestors: Vec<String> = self
            .ontology
            .ancestors(phrase)
            .iter()
            .map(|a| strip_prefix(a).to_string())
            .collect();

        // A poisoned lock only loses memoization, never correctness.
        if let Ok(mut cache) = self.cache.write() {
            cache.entry(phrase.to_string()).or_insert_with(|| ancestors.clone());
        }
        ancestors
    }

    pub fn cached_len(&self) -> usize {
        self.cache.read().map(|c| c.len()).unwrap_or(0)
    }
}

/// Category and predicate enrichment for biolink-shaped records.
///
/// Categories and predicates keep separate caches.
pub struct BiolinkEnricher {
    categories: AncestorResolver,
    predicates: AncestorResolver,
}

impl BiolinkEnricher {
    pub fn new(ontology: Arc<dyn Ontology>) -> Self {
        Self {
            categories: AncestorResolver::new(Arc::clone(&ontology)),
            predicates: AncestorResolver::new(ontology),
        }
    }

    /// Expand a node's categories into `all_categories` and strip `category`.
    ///
    /// `all_categories`, when already present, is the reference set;
    /// otherwise `category` (a string or a list) is.
    pub fn process_category(&self, node: &mut Record) {
        let category = node.get("category").cloned();
        let reference = match node.get("all_categories") {
            Some(v) if is_truthy(v) => Some(v.clone()),
            _ => category.clone(),
        };

        let ancestors: Vec<Value> = match reference {
            Some(Value::Array(items)) => {
                let mut set = BTreeSet::new();
                for item in items.iter().filter_map(Value::as_str) {
                    set.extend(self.categories.resolve(item));
                }
                set.into_iter().map(Value::String).collect()
            }
            Some(Value::String(s)) => self
                .categories
                .resolve(&s)
                .into_iter()
                .map(Value::String)
                .collect(),
            _ => Vec::new(),
        };
        node.insert("all_categories".to_string(), Value::Array(ancestors));

        if let Some(category) = category.filter(is_truthy) {
            node.insert("category".to_string(), strip_value(&category));
        }
    }

    /// Expand an edge's predicate into `all_predicates` and strip `predicate`.
    pub fn process_predicate(&self, edge: &mut Record) {
        let predicate = match edge.get(PREDICATE_FIELD).and_then(Value::as_str) {
            Some(p) if !p.is_empty() => p.to_string(),
            _ => return,
        };

        let ancestors = self.predicates.resolve(&predicate);
        if !ancestors.is_empty() {
            edge.insert(
                "all_predicates".to_string(),
                Value::Array(ancestors.into_iter().map(Value::String).collect()),
            );
        }
        edge.insert(
            PREDICATE_FIELD.to_string(),
            Value::String(strip_prefix(&predicate).to_string()),
        );
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
        Value::Bool(b) => *b,
        Value::Number(_) => true,
    }
}
