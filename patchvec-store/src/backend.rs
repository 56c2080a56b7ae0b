//! Vector backend adapter interface.
//!
//! The engine treats the backend as opaque: any embedded ANN index that can
//! filter candidates with a SQL-like attribute clause satisfies this trait.

use std::collections::BTreeMap;

use patchvec_model::Rid;
use serde_json::Value;

use crate::StoreError;

/// One row handed to the backend on upsert: the vector plus the
/// denormalised fields the pre-filter may reference, plus the chunk text as
/// payload.
#[derive(Debug, Clone)]
pub struct IndexedRecord {
    pub rid: Rid,
    pub vector: Vec<f32>,
    pub fields: BTreeMap<String, Value>,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct BackendHit {
    pub rid: Rid,
    /// Similarity, higher is better.
    pub score: f32,
    /// Payload text when the backend stores it; `None` sends the caller to
    /// the sidecar.
    pub text: Option<String>,
}

pub trait VectorBackend: Send {
    /// Creates or opens the on-disk index. Fails with
    /// [`StoreError::ModelMismatch`] when the stored fingerprint differs.
    fn configure(&mut self, dim: usize, model_fingerprint: &str) -> Result<(), StoreError>;

    /// Atomic within the call: vectors and field rows land together.
    fn upsert(&mut self, batch: &[IndexedRecord]) -> Result<(), StoreError>;

    /// Removes vectors and field rows; returns how many rids were present.
    fn delete(&mut self, rids: &[Rid]) -> Result<usize, StoreError>;

    /// Top-`k` candidates satisfying `pre_filter` (a planner-rendered
    /// `[field] = 'value'` clause), ranked by similarity. Ties break on
    /// ascending rid.
    fn search(
        &self,
        query: &[f32],
        k: usize,
        pre_filter: Option<&str>,
    ) -> Result<Vec<BackendHit>, StoreError>;

    /// Durable snapshot of the index state.
    fn save(&mut self) -> Result<(), StoreError>;
}
