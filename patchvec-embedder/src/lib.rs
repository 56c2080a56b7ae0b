//! Embedding provider seam for PatchVec.
//!
//! The engine consumes embeddings through the narrow [`Embedder`] trait:
//! batch text in, dense vectors out, plus static [`EmbedderInfo`] metadata.
//! The built-in [`HashEmbedder`] is a deterministic feature-hash provider
//! used for development and tests; real model providers (ONNX, HTTP) plug in
//! through the same trait from outside this workspace.

use std::sync::Arc;

use thiserror::Error;

/// Identifies the backing implementation that powers an embedder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    FeatureHash,
}

/// Static metadata describing a particular embedder instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbedderInfo {
    pub provider: ProviderKind,
    pub model_id: String,
    pub dimension: usize,
}

impl EmbedderInfo {
    /// Stable fingerprint recorded in collection manifests. A collection
    /// built under one fingerprint refuses to open under another.
    pub fn fingerprint(&self) -> String {
        format!("{}@{}d", self.model_id, self.dimension)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EmbedderError {
    #[error("invalid embedder configuration: {message}")]
    InvalidConfiguration { message: String },
    #[error("provider failure: {message}")]
    ProviderFailure { message: String },
}

/// Core interface for all embedder implementations.
pub trait Embedder: Send + Sync {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedderError>;
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbedderError>;
    fn info(&self) -> &EmbedderInfo;
}

/// Deterministic feature-hash embedder.
///
/// Tokenizes on non-alphanumeric boundaries, buckets each lowercased token
/// by FNV-1a into the vector, and L2-normalizes. Two texts sharing tokens
/// get correlated vectors, which is all the engine needs for ranking in
/// tests and local development. FNV is computed inline so vectors stay
/// byte-stable across Rust releases (persisted indexes depend on that).
#[derive(Debug)]
pub struct HashEmbedder {
    info: EmbedderInfo,
}

impl HashEmbedder {
    pub fn new(model_id: &str, dimension: usize) -> Result<Self, EmbedderError> {
        if dimension == 0 {
            return Err(EmbedderError::InvalidConfiguration {
                message: "dimension must be greater than zero".into(),
            });
        }
        if model_id.trim().is_empty() {
            return Err(EmbedderError::InvalidConfiguration {
                message: "model id must not be empty".into(),
            });
        }
        Ok(Self {
            info: EmbedderInfo {
                provider: ProviderKind::FeatureHash,
                model_id: model_id.trim().to_string(),
                dimension,
            },
        })
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let dim = self.info.dimension;
        let mut v = vec![0.0f32; dim];
        for token in text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let h = fnv1a64(token.as_bytes());
            v[(h % dim as u64) as usize] += 1.0;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        }
        v
    }
}

impl Embedder for HashEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedderError> {
        Ok(self.embed_one(text))
    }

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbedderError> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }

    fn info(&self) -> &EmbedderInfo {
        &self.info
    }
}

fn fnv1a64(bytes: &[u8]) -> u64 {
    let mut hash = 0xcbf2_9ce4_8422_2325u64;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

/// Builds an embedder from configuration. `kind` comes from
/// `embedder.type`; unknown kinds are a configuration error rather than a
/// silent fallback.
pub fn build_embedder(
    kind: &str,
    model_id: &str,
    dimension: usize,
) -> Result<Arc<dyn Embedder>, EmbedderError> {
    match kind.trim().to_ascii_lowercase().as_str() {
        "hash" | "default" | "" => Ok(Arc::new(HashEmbedder::new(model_id, dimension)?)),
        other => Err(EmbedderError::InvalidConfiguration {
            message: format!("unknown embedder type `{other}`"),
        }),
    }
}
