//! Streaming merge of node and edge JSONL files
//!
//! Reads `nodes.jsonl` and `edges.jsonl` (or their `.gz` siblings) from a
//! directory and yields merged edge documents, with `subject` and `object`
//! replaced by the node records they reference.
//!
//! Memory profile:
//! - nodes are fully materialized into an id -> node map (edges may reference
//!   any node, in any order)
//! - edges are streamed, `EDGE_BUFFER_SIZE` at a time
//! - input lines are read and parsed `NODE_BUFFER_SIZE` at a time, with the
//!   JSON parsing of a chunk spread over the rayon pool

use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use flate2::read::MultiGzDecoder;
use rayon::prelude::*;
use serde_json::Value;

use crate::error::{PipelineError, Result};
use crate::record::{describe, Record, RecordExt, NODE_ID_FIELD, OBJECT_FIELD, SUBJECT_FIELD};

/// Records read ahead per chunk.
pub const NODE_BUFFER_SIZE: usize = 4096;

/// Merged edges produced per output chunk.
pub const EDGE_BUFFER_SIZE: usize = 2048;

pub const NODES_FILE: &str = "nodes.jsonl";
pub const EDGES_FILE: &str = "edges.jsonl";

/// What to do with an edge whose subject/object id matches no node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DanglingReferencePolicy {
    /// Surface `MissingReference` and end the stream.
    #[default]
    Fail,
    /// Log, count and drop the edge.
    Skip,
}

/// Path actually read for `path`: a `<path>.gz` sibling wins when present.
pub fn resolve_input(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".gz");
    let gz = path.with_file_name(name);
    if gz.exists() {
        gz
    } else {
        path.to_path_buf()
    }
}

fn open_reader(path: &Path) -> Result<Box<dyn BufRead + Send>> {
    let file = File::open(path)?;
    if path.extension().map_or(false, |ext| ext == "gz") {
        Ok(Box::new(BufReader::new(MultiGzDecoder::new(file))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

/// Join key for a node id or an edge reference: strings as is, numbers in
/// their JSON form.
fn reference_key(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Lazy reader over one JSONL file.
///
/// Every record gets an `_id`: its own `id` when present, otherwise its
/// zero-based ordinal among the records of the file. The iterator ends after
/// the first error it yields.
pub struct JsonlRecords {
    path: PathBuf,
    reader: Box<dyn BufRead + Send>,
    buffer: VecDeque<Result<Record>>,
    line_no: usize,
    ordinal: usize,
    finished: bool,
}

impl JsonlRecords {
    /// Open `path`, preferring its gzip sibling.
    pub fn open(path: &Path) -> Result<Self> {
        let path = resolve_input(path);
        let reader = open_reader(&path)?;
        Ok(Self {
            path,
            reader,
            buffer: VecDeque::with_capacity(NODE_BUFFER_SIZE),
            line_no: 0,
            ordinal: 0,
            finished: false,
        })
    }

    /// File being read (after `.gz` resolution).
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn fill(&mut self) {
        let mut lines: Vec<(usize, String)> = Vec::with_capacity(NODE_BUFFER_SIZE);
        let mut read_error = None;

        while lines.len() < NODE_BUFFER_SIZE {
            let mut line = String::new();
            match self.reader.read_line(&mut line) {
                Ok(0) => {
                    self.finished = true;
                    break;
                }
                Ok(_) => {
                    self.line_no += 1;
                    if !line.trim().is_empty() {
                        lines.push((self.line_no, line));
                    }
                }
                Err(e) => {
                    read_error = Some(PipelineError::Io(e));
                    self.finished = true;
                    break;
                }
            }
        }

        let path = &self.path;
        let parsed: Vec<Result<Record>> = lines
            .par_iter()
            .map(|(line, text)| {
                serde_json::from_str::<Record>(text).map_err(|cause| PipelineError::InvalidRecord {
                    path: path.clone(),
                    line: *line,
                    cause,
                })
            })
            .collect();

        for item in parsed {
            match item {
                Ok(mut record) => {
                    let id = record
                        .get(NODE_ID_FIELD)
                        .and_then(reference_key)
                        .unwrap_or_else(|| self.ordinal.to_string());
                    record.set_doc_id(id);
                    self.ordinal += 1;
                    self.buffer.push_back(Ok(record));
                }
                Err(e) => {
                    self.buffer.push_back(Err(e));
                    self.finished = true;
                    return;
                }
            }
        }

        if let Some(e) = read_error {
            self.buffer.push_back(Err(e));
        }
    }
}

impl Iterator for JsonlRecords {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.finished {
            self.fill();
        }
        self.buffer.pop_front()
    }
}

/// Stream records from any JSONL file (or its `.gz` sibling).
pub fn read_jsonl(path: &Path) -> Result<JsonlRecords> {
    JsonlRecords::open(path)
}

fn entity_file(data_folder: &Path, file: &str) -> PathBuf {
    data_folder.join(file)
}

/// Stream node records from `<data_folder>/nodes.jsonl[.gz]`.
pub fn load_nodes(data_folder: &Path) -> Result<JsonlRecords> {
    JsonlRecords::open(&entity_file(data_folder, NODES_FILE))
}

/// Stream edge records from `<data_folder>/edges.jsonl[.gz]`.
pub fn load_edges(data_folder: &Path) -> Result<JsonlRecords> {
    JsonlRecords::open(&entity_file(data_folder, EDGES_FILE))
}

/// Merged edges with the default (fail-fast) dangling reference policy.
///
/// Each call re-reads the files from the start.
pub fn load_merged_edges(data_folder: &Path) -> Result<MergedEdges> {
    MergedEdges::open(data_folder, DanglingReferencePolicy::Fail)
}

/// Lazy sequence of edges joined with their subject and object nodes.
pub struct MergedEdges {
    nodes: HashMap<String, Record>,
    edges: JsonlRecords,
    buffer: VecDeque<Record>,
    pending_error: Option<PipelineError>,
    policy: DanglingReferencePolicy,
    skipped: usize,
    exhausted: bool,
}

impl MergedEdges {
    /// Materialize the node map, then open the edge stream.
    pub fn open(data_folder: &Path, policy: DanglingReferencePolicy) -> Result<Self> {
        let mut nodes = HashMap::new();
        for node in load_nodes(data_folder)? {
            let node = node?;
            let id = node
                .doc_id()
                .map(str::to_string)
                .ok_or_else(|| PipelineError::MissingField {
                    field: NODE_ID_FIELD.to_string(),
                    record: describe(&node),
                })?;
            nodes.insert(id, node);
        }
        tracing::debug!("loaded {} nodes from {}", nodes.len(), data_folder.display());

        Ok(Self {
            nodes,
            edges: load_edges(data_folder)?,
            buffer: VecDeque::with_capacity(EDGE_BUFFER_SIZE),
            pending_error: None,
            policy,
            skipped: 0,
            exhausted: false,
        })
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Edges dropped under `DanglingReferencePolicy::Skip`.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    fn merge_edge(&self, mut edge: Record) -> Result<Record> {
        for field in [SUBJECT_FIELD, OBJECT_FIELD] {
            let id = match edge.get(field) {
                Some(Value::Object(_)) => continue,
                value => value.and_then(reference_key).ok_or_else(|| PipelineError::MissingField {
                    field: field.to_string(),
                    record: describe(&edge),
                })?,
            };
            let node = self
                .nodes
                .get(&id)
                .cloned()
                .ok_or_else(|| PipelineError::MissingReference {
                    field: field.to_string(),
                    id,
                })?;
            edge.insert(field.to_string(), Value::Object(node));
        }
        Ok(edge)
    }

    fn fill(&mut self) {
        while self.buffer.len() < EDGE_BUFFER_SIZE {
            let edge = match self.edges.next() {
                None => {
                    self.exhausted = true;
                    return;
                }
                Some(Err(e)) => {
                    self.pending_error = Some(e);
                    self.exhausted = true;
                    return;
                }
                Some(Ok(edge)) => edge,
            };

            match self.merge_edge(edge) {
                Ok(merged) => self.buffer.push_back(merged),
                Err(PipelineError::MissingReference { field, id })
                    if self.policy == DanglingReferencePolicy::Skip =>
                {
                    self.skipped += 1;
                    tracing::warn!("skipping edge: {} '{}' does not match any node", field, id);
                }
                Err(e) => {
                    self.pending_error = Some(e);
                    self.exhausted = true;
                    return;
                }
            }
        }
    }
}

impl Iterator for MergedEdges {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            self.fill();
        }
        match self.buffer.pop_front() {
            Some(edge) => Some(Ok(edge)),
            None => self.pending_error.take().map(Err),
        }
    }
}
