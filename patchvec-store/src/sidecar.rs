//! Chunk sidecar store: one text file per rid.
//!
//! The sidecar is the authoritative text source when the vector backend
//! returns a hit without payload. Writes happen inside the ingest lock;
//! reads are plain filesystem reads and take no lock at all.

use std::fs;
use std::path::{Path, PathBuf};

use patchvec_model::Rid;

use crate::StoreError;

pub const SIDECAR_DIR: &str = "chunks";

pub struct SidecarStore {
    dir: PathBuf,
}

impl SidecarStore {
    pub fn new(collection_dir: &Path) -> Self {
        Self { dir: collection_dir.join(SIDECAR_DIR) }
    }

    fn path_for(&self, rid: &Rid) -> PathBuf {
        self.dir.join(file_name(rid))
    }

    /// Write-through: tmp file then rename, so readers never observe a
    /// half-written chunk.
    pub fn write(&self, rid: &Rid, text: &str) -> Result<(), StoreError> {
        fs::create_dir_all(&self.dir)?;
        let target = self.path_for(rid);
        let tmp = target.with_extension("txt.tmp");
        fs::write(&tmp, text)?;
        fs::rename(&tmp, &target)?;
        Ok(())
    }

    pub fn read(&self, rid: &Rid) -> Option<String> {
        fs::read_to_string(self.path_for(rid)).ok()
    }

    /// Removes the file if present. Missing files are not an error.
    pub fn delete(&self, rid: &Rid) -> Result<(), StoreError> {
        match fs::remove_file(self.path_for(rid)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn file_name(rid: &Rid) -> String {
    let mut name = rid.0.replace(['/', '\\', ':'], "_");
    name.push_str(".txt");
    name
}
