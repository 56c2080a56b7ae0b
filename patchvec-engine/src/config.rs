//! Engine configuration.
//!
//! Precedence: built-in defaults < YAML config file < environment.
//! Environment variables use the `PATCHVEC_` prefix with `__` as the
//! nesting separator, e.g. `PATCHVEC_LIMITS__SEARCH__TIMEOUT_MS=2500`
//! overrides `limits.search.timeout_ms`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

pub const ENV_PREFIX: &str = "PATCHVEC_";
pub const ENV_CONFIG_PATH: &str = "PATCHVEC_CONFIG";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerCfg,
    pub auth: AuthCfg,
    pub vector_store: VectorStoreCfg,
    pub embedder: EmbedderCfg,
    pub chunk: ChunkCfg,
    pub limits: LimitsCfg,
    pub log: LogCfg,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerCfg {
    pub host: String,
    pub port: u16,
    pub workers: usize,
    pub log_level: String,
}

impl Default for ServerCfg {
    fn default() -> Self {
        Self { host: "127.0.0.1".into(), port: 8086, workers: 1, log_level: "info".into() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthCfg {
    /// `none` (dev) or `static`; credential lookup itself happens in the
    /// transport collaborator.
    pub mode: String,
    pub global_key: Option<String>,
    pub tenants_file: Option<String>,
}

impl Default for AuthCfg {
    fn default() -> Self {
        Self { mode: "none".into(), global_key: None, tenants_file: None }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VectorStoreCfg {
    #[serde(rename = "type")]
    pub kind: String,
    pub backend: String,
    pub data_dir: PathBuf,
}

impl Default for VectorStoreCfg {
    fn default() -> Self {
        Self { kind: "hnsw".into(), backend: "hnsw".into(), data_dir: PathBuf::from("./data") }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbedderCfg {
    #[serde(rename = "type")]
    pub kind: String,
    pub model: String,
    pub dimension: usize,
}

impl Default for EmbedderCfg {
    fn default() -> Self {
        Self { kind: "hash".into(), model: "feature-hash-v1".into(), dimension: 256 }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkCfg {
    pub txt: TxtChunkCfg,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TxtChunkCfg {
    pub size: usize,
    pub overlap: usize,
}

impl Default for TxtChunkCfg {
    fn default() -> Self {
        Self { size: 800, overlap: 120 }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsCfg {
    pub search: SearchLimitsCfg,
    pub ingest: IngestLimitsCfg,
    pub tenant: TenantLimitsCfg,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchLimitsCfg {
    pub max_concurrent: usize,
    pub timeout_ms: u64,
    /// Candidate multiplier applied when a post-filter is present.
    pub overfetch: usize,
}

impl Default for SearchLimitsCfg {
    fn default() -> Self {
        Self { max_concurrent: 64, timeout_ms: 5000, overfetch: 5 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestLimitsCfg {
    pub max_concurrent: usize,
    pub max_bytes: u64,
}

impl Default for IngestLimitsCfg {
    fn default() -> Self {
        Self { max_concurrent: 4, max_bytes: 32 * 1024 * 1024 }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TenantLimitsCfg {
    /// Per-tenant cap across searches and ingests; `None` disables it.
    pub max_concurrent: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LogCfg {
    /// `null`/absent, `stdout`, or a file path.
    pub ops_log: Option<String>,
    pub access_log: Option<String>,
}

impl Config {
    /// Loads defaults overlaid with the YAML file (if any) and the
    /// environment.
    pub fn load(path: Option<&Path>) -> Result<Config> {
        let mut value = serde_yaml_ng::to_value(Config::default())
            .map_err(|e| EngineError::internal(format!("default config: {e}")))?;

        let file = match path {
            Some(p) => Some(p.to_path_buf()),
            None => {
                let p = std::env::var(ENV_CONFIG_PATH)
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| PathBuf::from("./config.yml"));
                p.is_file().then_some(p)
            }
        };
        if let Some(p) = file {
            let raw = std::fs::read_to_string(&p).map_err(|e| {
                EngineError::invalid_request(format!("cannot read config `{}`: {e}", p.display()))
            })?;
            let parsed: serde_yaml_ng::Value = serde_yaml_ng::from_str(&raw).map_err(|e| {
                EngineError::invalid_request(format!("cannot parse config `{}`: {e}", p.display()))
            })?;
            deep_merge(&mut value, parsed);
        }

        deep_merge(&mut value, env_overlay(ENV_PREFIX));

        serde_yaml_ng::from_value(value)
            .map_err(|e| EngineError::invalid_request(format!("invalid configuration: {e}")))
    }
}

/// Recursively overlays `top` onto `base`; mappings merge key-wise,
/// everything else replaces.
fn deep_merge(base: &mut serde_yaml_ng::Value, top: serde_yaml_ng::Value) {
    use serde_yaml_ng::Value;
    match (base, top) {
        (Value::Mapping(base_map), Value::Mapping(top_map)) => {
            for (k, v) in top_map {
                match base_map.get_mut(&k) {
                    Some(slot) => deep_merge(slot, v),
                    None => {
                        base_map.insert(k, v);
                    }
                }
            }
        }
        (slot, v) => *slot = v,
    }
}

/// Builds a nested mapping from `PREFIX_A__B=value` environment variables.
fn env_overlay(prefix: &str) -> serde_yaml_ng::Value {
    use serde_yaml_ng::{Mapping, Value};
    let mut root = Mapping::new();
    for (key, raw) in std::env::vars() {
        let Some(rest) = key.strip_prefix(prefix) else { continue };
        if rest.eq_ignore_ascii_case("CONFIG") {
            continue;
        }
        let path: Vec<String> = rest.to_lowercase().split("__").map(str::to_string).collect();
        if path.iter().any(String::is_empty) {
            continue;
        }
        let mut cursor = &mut root;
        for part in &path[..path.len() - 1] {
            let key = Value::String(part.clone());
            if !matches!(cursor.get(&key), Some(Value::Mapping(_))) {
                cursor.insert(key.clone(), Value::Mapping(Mapping::new()));
            }
            cursor = match cursor.get_mut(&key) {
                Some(Value::Mapping(m)) => m,
                _ => unreachable!("just inserted a mapping"),
            };
        }
        let leaf = path.last().expect("non-empty path").clone();
        cursor.insert(Value::String(leaf), coerce_scalar(&raw));
    }
    Value::Mapping(root)
}

fn coerce_scalar(raw: &str) -> serde_yaml_ng::Value {
    use serde_yaml_ng::Value;
    match raw.trim() {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        "null" | "~" => return Value::Null,
        _ => {}
    }
    if let Ok(n) = raw.trim().parse::<i64>() {
        return Value::Number(n.into());
    }
    if let Ok(f) = raw.trim().parse::<f64>() {
        return Value::Number(serde_yaml_ng::Number::from(f));
    }
    Value::String(raw.to_string())
}
