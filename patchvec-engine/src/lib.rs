//! # PatchVec engine
//!
//! Multi-tenant vector-search core: documents are preprocessed into chunks,
//! embedded, indexed in an embedded ANN backend, and retrieved by semantic
//! similarity with hybrid pre/post metadata filtering.
//!
//! ```text
//! ┌────────────┐   ┌──────────┐   ┌───────────────────────────────┐
//! │ Preprocess │──▶│ Embedder │──▶│ Collection                    │
//! │ TXT/PDF/CSV│   │ (trait)  │   │  vector index + meta + sidecar│
//! └────────────┘   └──────────┘   └──────────────┬────────────────┘
//!                                                │
//!                              ┌─────────────────┴────────┐
//!                              ▼                          ▼
//!                        service facade             ops event stream
//!                        (HTTP / CLI hold a ref)    (JSON lines)
//! ```
//!
//! The HTTP transport, CLI, authentication and the Prometheus exporter are
//! collaborators: they consume [`Engine`] and render its single structured
//! [`EngineError`]. Build one with [`Engine::build`] from a [`Config`];
//! there is no global state.
//!
//! Concurrency model: per-collection mutexes in a guarded registry
//! serialise writes; searches hold the lock only across the k-NN call and
//! hydrate metadata through WAL reads afterwards. A process-wide admission
//! controller sheds load beyond the configured concurrency caps.

pub mod admission;
pub mod archive;
pub mod catalog;
pub mod collection;
pub mod config;
pub mod counters;
pub mod engine;
pub mod error;
pub mod opslog;
pub mod registry;

pub use config::Config;
pub use engine::{Engine, IngestOptions, IngestSource, Readiness, SearchRequest};
pub use error::{EngineError, ErrorCode, Result};

pub use patchvec_embedder::{Embedder, EmbedderInfo};
pub use patchvec_model::{
    DeleteReceipt, DocId, IngestReceipt, Rid, SearchMatch, SearchOutcome,
};
pub use patchvec_preprocess::csv::{CsvOptions, HeaderMode};
