//! One loaded collection: manifest plus the three substores.
//!
//! A `Collection` value is only ever touched while its registry slot lock
//! is held; the engine is responsible for that discipline. The manifest
//! pins the embedding-model fingerprint so an index is never served with
//! vectors from a different model.

use std::fs;
use std::path::{Path, PathBuf};

use patchvec_store::{meta, HnswBackend, MetaRepo, SidecarStore, StoreError, VectorBackend};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, ErrorCode, Result};

pub const MANIFEST_FILE: &str = "collection.json";
pub const INDEX_DIR: &str = "index";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub schema_version: u32,
    pub tenant: String,
    pub collection: String,
    pub model_fingerprint: String,
    pub dimension: usize,
    /// ISO-8601 UTC creation timestamp.
    pub created_at: String,
}

impl Manifest {
    pub fn save(&self, dir: &Path) -> Result<()> {
        let raw = serde_json::to_vec_pretty(self)
            .map_err(|e| EngineError::internal(format!("manifest serialize: {e}")))?;
        fs::write(dir.join(MANIFEST_FILE), raw)?;
        Ok(())
    }

    pub fn load(dir: &Path) -> Result<Manifest> {
        let raw = fs::read(dir.join(MANIFEST_FILE)).map_err(|e| {
            EngineError::internal(format!("collection manifest unreadable: {e}"))
        })?;
        serde_json::from_slice(&raw)
            .map_err(|e| EngineError::internal(format!("collection manifest corrupt: {e}")))
    }
}

pub struct Collection {
    pub dir: PathBuf,
    pub manifest: Manifest,
    pub backend: HnswBackend,
    pub meta: MetaRepo,
    pub sidecar: SidecarStore,
}

impl std::fmt::Debug for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection")
            .field("dir", &self.dir)
            .field("manifest", &self.manifest)
            .finish_non_exhaustive()
    }
}

impl Collection {
    /// Initialises a brand-new collection directory. The caller removes
    /// partial state if this fails.
    pub fn create(dir: &Path, manifest: Manifest) -> Result<Collection> {
        fs::create_dir_all(dir)?;
        manifest.save(dir)?;
        let meta = MetaRepo::create_or_open(dir)?;
        let sidecar = SidecarStore::new(dir);
        let mut backend = HnswBackend::new(&dir.join(INDEX_DIR));
        backend.configure(manifest.dimension, &manifest.model_fingerprint)?;
        Ok(Collection { dir: dir.to_path_buf(), manifest, backend, meta, sidecar })
    }

    /// Opens an existing collection, verifying the embedder fingerprint.
    pub fn open(dir: &Path, expected_fingerprint: &str) -> Result<Collection> {
        if let Some(reason) = meta::detect_legacy_layout(dir) {
            return Err(StoreError::LegacyMetadata(reason).into());
        }
        let manifest = Manifest::load(dir)?;
        if manifest.model_fingerprint != expected_fingerprint {
            return Err(EngineError::new(
                ErrorCode::ModelMismatch,
                format!(
                    "collection was built with embedder `{}`, engine is configured with `{}`",
                    manifest.model_fingerprint, expected_fingerprint
                ),
            ));
        }
        let meta = MetaRepo::create_or_open(dir)?;
        let sidecar = SidecarStore::new(dir);
        let mut backend = HnswBackend::new(&dir.join(INDEX_DIR));
        backend.configure(manifest.dimension, &manifest.model_fingerprint)?;
        Ok(Collection { dir: dir.to_path_buf(), manifest, backend, meta, sidecar })
    }
}
