//! Per-collection storage for PatchVec: the SQLite metadata store, the
//! chunk sidecar, the filter planner, and the HNSW vector backend adapter.
//!
//! All three substores of a collection agree on the rid set at rest; the
//! engine enforces that by driving them under one collection lock. This
//! crate only provides the building blocks and their local invariants.

pub mod backend;
pub mod hnsw;
pub mod meta;
pub mod planner;
pub mod sidecar;

pub use backend::{BackendHit, IndexedRecord, VectorBackend};
pub use hnsw::HnswBackend;
pub use meta::MetaRepo;
pub use planner::{plan_filters, post_filter_matches, BackendCaps, FilterPlan};
pub use sidecar::SidecarStore;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("backend error: {0}")]
    Backend(String),
    #[error("invalid filter: {0}")]
    InvalidFilter(String),
    #[error("embedding model mismatch: index built with `{stored}`, configured with `{configured}`")]
    ModelMismatch { stored: String, configured: String },
    #[error("legacy metadata layout detected: {0}")]
    LegacyMetadata(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}
