//! Shared record schema for the PatchVec retrieval engine.
//!
//! Everything that crosses a crate boundary lives here: tenant/collection
//! slugs, document and chunk identifiers, the chunk record produced by the
//! preprocessors, the metadata containers persisted by the stores, and the
//! search result shapes returned by the facade.

pub mod filter;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// On-disk schema generation. Bumped on breaking layout changes.
pub const SCHEMA_VERSION: u32 = 2;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("invalid slug `{0}`: only ASCII letters, digits, `-` and `_` are allowed")]
    InvalidSlug(String),
    #[error("invalid rid `{0}`: expected `{{docid}}::{{ordinal}}`")]
    InvalidRid(String),
}

/// Validates a tenant or collection name. Slugs are URL-safe by construction
/// so they can appear verbatim in paths and directory names.
pub fn validate_slug(s: &str) -> Result<(), ModelError> {
    let ok = !s.is_empty()
        && s.len() <= 128
        && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(ModelError::InvalidSlug(s.to_string()))
    }
}

/// Caller-visible document identifier, unique within a collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocId(pub String);

impl fmt::Display for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Record identifier: one chunk, formatted `{docid}::{ordinal}`.
///
/// Ordinals are 1-based and stable for a given source, which makes
/// re-ingesting identical bytes idempotent at the rid level.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Rid(pub String);

impl Rid {
    pub fn new(docid: &DocId, ordinal: u32) -> Self {
        Rid(format!("{}::{}", docid.0, ordinal))
    }

    /// Splits into `(docid, ordinal)`. The docid itself may contain `::`;
    /// only the last separator is structural.
    pub fn split(&self) -> Result<(DocId, u32), ModelError> {
        match self.0.rsplit_once("::") {
            Some((d, o)) if !d.is_empty() => o
                .parse::<u32>()
                .map(|n| (DocId(d.to_string()), n))
                .map_err(|_| ModelError::InvalidRid(self.0.clone())),
            _ => Err(ModelError::InvalidRid(self.0.clone())),
        }
    }

    pub fn docid(&self) -> Option<DocId> {
        self.split().ok().map(|(d, _)| d)
    }

    pub fn ordinal(&self) -> Option<u32> {
        self.split().ok().map(|(_, n)| n)
    }
}

impl fmt::Display for Rid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-chunk metadata: a closed set of well-known fields plus an open
/// `extra` map of JSON scalars.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkMeta {
    /// 1-based page number (PDF sources).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    /// Byte offset of the chunk within the decoded source (TXT sources).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
    /// 1-based data-row number (CSV sources).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, Value>,
}

/// Document-level metadata, stored once per docid and joined at read time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, Value>,
}

/// One chunk as emitted by a preprocessor, before embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub rid: Rid,
    pub docid: DocId,
    /// 1-based position within the document.
    pub ordinal: u32,
    pub text: String,
    pub meta: ChunkMeta,
}

/// Document row as persisted in the metadata store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocRecord {
    pub docid: DocId,
    /// Monotonic re-ingest counter, starting at 1.
    pub version: u32,
    /// ISO-8601 UTC timestamp of the latest ingest.
    pub ingested_at: String,
    pub meta: DocMeta,
}

/// Flattens document- and chunk-level metadata into the single field map
/// exposed to filters and search hits. Chunk fields win on key collisions.
pub fn merged_fields(doc: &DocRecord, chunk: &ChunkMeta) -> BTreeMap<String, Value> {
    let mut out = BTreeMap::new();
    out.insert("docid".to_string(), Value::String(doc.docid.0.clone()));
    out.insert("version".to_string(), Value::from(doc.version));
    if let Some(f) = &doc.meta.filename {
        out.insert("filename".to_string(), Value::String(f.clone()));
    }
    if let Some(ct) = &doc.meta.content_type {
        out.insert("content_type".to_string(), Value::String(ct.clone()));
    }
    for (k, v) in &doc.meta.extra {
        out.insert(k.clone(), v.clone());
    }
    if let Some(p) = chunk.page {
        out.insert("page".to_string(), Value::from(p));
    }
    if let Some(o) = chunk.offset {
        out.insert("offset".to_string(), Value::from(o));
    }
    if let Some(r) = chunk.row {
        out.insert("row".to_string(), Value::from(r));
    }
    if let Some(s) = &chunk.section {
        out.insert("section".to_string(), Value::String(s.clone()));
    }
    for (k, v) in &chunk.extra {
        out.insert(k.clone(), v.clone());
    }
    out
}

/// One search hit with provenance attached.
#[derive(Debug, Clone, Serialize)]
pub struct SearchMatch {
    pub id: Rid,
    pub score: f32,
    pub text: String,
    pub meta: BTreeMap<String, Value>,
    pub match_reason: String,
    pub docid: DocId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
}

/// Search response payload.
#[derive(Debug, Clone, Serialize)]
pub struct SearchOutcome {
    pub matches: Vec<SearchMatch>,
    pub latency_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub truncated: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestReceipt {
    pub docid: DocId,
    pub chunks: usize,
    pub latency_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeleteReceipt {
    pub chunks_deleted: usize,
}
