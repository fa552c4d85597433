//! Post-mortem dumps for failed merge batches
//!
//! A failing batch leaves three files in the log folder, all sharing one
//! per-batch name:
//!
//! - `<name>.exc.json`: error code, message and worker context
//! - `<name>.ids.json`: the id list the batch was given
//! - `<name>.docs.json`: the document batch as far as it was computed
//!
//! Every file is a versioned envelope. `ids_digest` (blake3 over the id list)
//! ties the three files of one failure together and lets a rerun be matched
//! against the dump that triggered it.

use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{PipelineError, Result};
use crate::record::Record;

pub const DUMP_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DumpKind {
    Exc,
    Ids,
    Docs,
}

impl DumpKind {
    pub fn suffix(self) -> &'static str {
        match self {
            DumpKind::Exc => "exc.json",
            DumpKind::Ids => "ids.json",
            DumpKind::Docs => "docs.json",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DumpEnvelope {
    pub format_version: u32,
    pub kind: DumpKind,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub ids_digest: String,
    pub payload: Value,
}

/// Hex blake3 digest of an id list. Ids are NUL-separated so that
/// `["ab", "c"]` and `["a", "bc"]` differ.
pub fn ids_digest(ids: &[String]) -> String {
    let mut hasher = blake3::Hasher::new();
    for id in ids {
        hasher.update(id.as_bytes());
        hasher.update(&[0]);
    }
    hasher.finalize().to_hex().to_string()
}

/// Writer for failure dumps rooted at one log folder.
#[derive(Debug, Clone)]
pub struct FailureDump {
    folder: PathBuf,
}

impl FailureDump {
    pub fn new(folder: impl Into<PathBuf>) -> Self {
        Self { folder: folder.into() }
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    /// Per-batch dump name for a merge worker.
    pub fn batch_name(dest: &str, src: &str, batch: usize) -> String {
        format!("build_{}_{}_batch_{}", dest, src, batch)
    }

    pub fn path_for(&self, name: &str, kind: DumpKind) -> PathBuf {
        self.folder.join(format!("{}.{}", name, kind.suffix()))
    }

    /// Write all three artifacts, returning their paths in exc/ids/docs order.
    pub fn write(
        &self,
        name: &str,
        error: &PipelineError,
        context: Value,
        ids: &[String],
        docs: &[Record],
    ) -> Result<Vec<PathBuf>> {
        fs::create_dir_all(&self.folder)?;

        let created_at = Utc::now();
        let digest = ids_digest(ids);
        let payloads = [
            (
                DumpKind::Exc,
                json!({
                    "code": error.code(),
                    "message": error.to_string(),
                    "context": context,
                }),
            ),
            (DumpKind::Ids, serde_json::to_value(ids)?),
            (DumpKind::Docs, serde_json::to_value(docs)?),
        ];

        let mut written = Vec::with_capacity(payloads.len());
        for (kind, payload) in payloads {
            let envelope = DumpEnvelope {
                format_version: DUMP_FORMAT_VERSION,
                kind,
                name: name.to_string(),
                created_at,
                ids_digest: digest.clone(),
                payload,
            };
            let path = self.path_for(name, kind);
            let mut writer = BufWriter::new(fs::File::create(&path)?);
            serde_json::to_writer_pretty(&mut writer, &envelope)?;
            writer.flush()?;
            tracing::info!("{:?} dump written to '{}'", kind, path.display());
            written.push(path);
        }
        Ok(written)
    }

    /// Like `write`, but a failure to dump is only logged.
    pub fn record(&self, name: &str, error: &PipelineError, context: Value, ids: &[String], docs: &[Record]) {
        if let Err(dump_err) = self.write(name, error, context, ids, docs) {
            tracing::error!(
                "could not write failure dump '{}' to '{}': {}",
                name,
                self.folder.display(),
                dump_err
            );
        }
    }

    pub fn read(path: &Path) -> Result<DumpEnvelope> {
        let text = fs::read_to_string(path)?;
        let envelope: DumpEnvelope = serde_json::from_str(&text)?;
        if envelope.format_version > DUMP_FORMAT_VERSION {
            return Err(PipelineError::Config(format!(
                "dump '{}' has format version {}, newest supported is {}",
                path.display(),
                envelope.format_version,
                DUMP_FORMAT_VERSION
            )));
        }
        Ok(envelope)
    }
}
