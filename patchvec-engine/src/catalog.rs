//! Filesystem-backed catalog of tenants and collections.
//!
//! Layout: `{data_dir}/t_{tenant}/c_{collection}/…`. Tenants exist while at
//! least one of their collections does; both names are derivable from the
//! path and re-checked against the collection manifest on open.

use std::fs;
use std::path::{Path, PathBuf};

pub fn tenant_dir(data_dir: &Path, tenant: &str) -> PathBuf {
    data_dir.join(format!("t_{tenant}"))
}

pub fn collection_dir(data_dir: &Path, tenant: &str, name: &str) -> PathBuf {
    tenant_dir(data_dir, tenant).join(format!("c_{name}"))
}

pub fn collection_exists(data_dir: &Path, tenant: &str, name: &str) -> bool {
    collection_dir(data_dir, tenant, name).is_dir()
}

pub fn list_tenants(data_dir: &Path) -> std::io::Result<Vec<String>> {
    let mut out = Vec::new();
    let entries = match fs::read_dir(data_dir) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(e),
    };
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if let Some(tenant) = name.strip_prefix("t_") {
                out.push(tenant.to_string());
            }
        }
    }
    out.sort();
    Ok(out)
}

pub fn list_collections(data_dir: &Path, tenant: &str) -> std::io::Result<Vec<String>> {
    let mut out = Vec::new();
    let entries = match fs::read_dir(tenant_dir(data_dir, tenant)) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(e),
    };
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if let Some(coll) = name.strip_prefix("c_") {
                out.push(coll.to_string());
            }
        }
    }
    out.sort();
    Ok(out)
}
