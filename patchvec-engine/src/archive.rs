//! Collection snapshot packing.
//!
//! Archives are opaque to callers: an uncompressed tar of the collection
//! directory, produced and consumed under the collection lock.

use std::fs;
use std::path::Path;

pub fn pack_dir(dir: &Path) -> std::io::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.append_dir_all(".", dir)?;
    builder.into_inner()
}

/// Unpacks into `dir`, which must not already exist: restore replaces the
/// collection wholesale, so the caller removes the old tree first.
pub fn unpack_into(bytes: &[u8], dir: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dir)?;
    let mut archive = tar::Archive::new(bytes);
    archive.unpack(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn pack_unpack_round_trip_preserves_tree() {
        let src = TempDir::new().expect("tempdir");
        fs::create_dir_all(src.path().join("chunks")).unwrap();
        fs::write(src.path().join("collection.json"), b"{\"v\":1}").unwrap();
        fs::write(src.path().join("chunks/doc__1.txt"), b"hello").unwrap();

        let bytes = pack_dir(src.path()).expect("pack");
        assert!(!bytes.is_empty());

        let dst = TempDir::new().expect("tempdir");
        let target = dst.path().join("restored");
        unpack_into(&bytes, &target).expect("unpack");
        assert_eq!(fs::read(target.join("collection.json")).unwrap(), b"{\"v\":1}");
        assert_eq!(fs::read(target.join("chunks/doc__1.txt")).unwrap(), b"hello");
    }
}
