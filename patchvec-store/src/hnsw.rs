//! HNSW-backed implementation of the vector backend adapter.
//!
//! Vectors live in an `hnsw_rs` cosine index snapshotted to
//! `vectors.bin` + `map.tsv`; the denormalised pre-filter fields and chunk
//! payload live in a small SQLite database (`fields.db`) next to it. The
//! planner's `[field] op 'value'` clause is translated onto
//! `json_extract(fields_json, …)` — field names and literals are sanitised
//! upstream, so the translation is purely mechanical.
//!
//! Below [`FLAT_SCAN_LIMIT`] candidates the backend scores by exhaustive
//! scan, which is both faster than graph traversal at that scale and exact;
//! the HNSW graph takes over beyond it.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use hnsw_rs::prelude::*;
use patchvec_model::filter::scalar_to_string;
use patchvec_model::Rid;
use rusqlite::{params, Connection};

use crate::backend::{BackendHit, IndexedRecord, VectorBackend};
use crate::StoreError;

pub const FIELDS_DB: &str = "fields.db";
pub const MAP_FILE: &str = "map.tsv";
pub const VECTORS_FILE: &str = "vectors.bin";

/// Candidate sets at or below this size are scored exhaustively.
const FLAT_SCAN_LIMIT: usize = 4096;

const MAX_NB_CONN: usize = 16;
const NUM_LAYERS: usize = 16;
const EF_CONSTRUCTION: usize = 200;

pub struct HnswBackend {
    dir: PathBuf,
    dim: usize,
    hnsw: Hnsw<'static, f32, DistCosine>,
    /// rid -> internal label
    id_map: HashMap<String, usize>,
    /// internal label -> rid
    rev_map: Vec<String>,
    /// Stored vectors for persistence, rebuild and flat scans
    vectors: Vec<Vec<f32>>,
    tombstones: HashSet<usize>,
    fields: Option<Connection>,
}

impl HnswBackend {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            dim: 0,
            hnsw: new_index(10_000),
            id_map: HashMap::new(),
            rev_map: Vec::new(),
            vectors: Vec::new(),
            tombstones: HashSet::new(),
            fields: None,
        }
    }

    fn db(&self) -> Result<&Connection, StoreError> {
        self.fields
            .as_ref()
            .ok_or_else(|| StoreError::Backend("backend not configured".to_string()))
    }

    fn live_count(&self) -> usize {
        self.rev_map.len() - self.tombstones.len()
    }

    fn load_snapshot(&mut self) -> Result<(), StoreError> {
        let map_txt = fs::read_to_string(self.dir.join(MAP_FILE))?;
        let mut rev_map: Vec<String> = Vec::new();
        for line in map_txt.lines() {
            let mut it = line.splitn(2, '\t');
            let _idx = it.next();
            if let Some(rid) = it.next() {
                rev_map.push(rid.to_string());
            }
        }
        let mut vectors: Vec<Vec<f32>> = Vec::with_capacity(rev_map.len());
        let mut r = std::io::BufReader::new(fs::File::open(self.dir.join(VECTORS_FILE))?);
        use std::io::Read;
        loop {
            let mut len_buf = [0u8; 4];
            if r.read_exact(&mut len_buf).is_err() {
                break;
            }
            let l = u32::from_le_bytes(len_buf) as usize;
            let mut vbytes = vec![0u8; 4 * l];
            r.read_exact(&mut vbytes)?;
            let v: Vec<f32> = bytemuck::cast_slice(&vbytes).to_vec();
            vectors.push(v);
        }
        if vectors.len() != rev_map.len() {
            return Err(StoreError::Backend(format!(
                "index snapshot corrupt: {} ids but {} vectors",
                rev_map.len(),
                vectors.len()
            )));
        }
        let hnsw = new_index(vectors.len().max(1000));
        let mut id_map = HashMap::with_capacity(rev_map.len());
        for (label, v) in vectors.iter().enumerate() {
            id_map.insert(rev_map[label].clone(), label);
            hnsw.insert((&v[..], label));
        }
        self.hnsw = hnsw;
        self.id_map = id_map;
        self.rev_map = rev_map;
        self.vectors = vectors;
        self.tombstones.clear();
        Ok(())
    }

    fn payload_text(&self, rid: &str) -> Result<Option<String>, StoreError> {
        let db = self.db()?;
        let mut stmt = db.prepare("SELECT text FROM records WHERE rid = ?1")?;
        let mut rows = stmt.query(params![rid])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    fn allowed_rids(&self, clause: &str) -> Result<HashSet<String>, StoreError> {
        let db = self.db()?;
        let sql = format!("SELECT rid FROM records WHERE {}", translate_clause(clause));
        let mut stmt = db.prepare(&sql).map_err(|e| {
            StoreError::InvalidFilter(format!("pre-filter rejected by backend: {e}"))
        })?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut out = HashSet::new();
        for r in rows {
            out.insert(r?);
        }
        Ok(out)
    }

    /// Exhaustive scoring of an explicit candidate set.
    fn flat_scan(&self, query: &[f32], k: usize, allowed: Option<&HashSet<String>>) -> Vec<(String, f32)> {
        let mut hits: Vec<(String, f32)> = Vec::new();
        for (rid, &label) in &self.id_map {
            if self.tombstones.contains(&label) {
                continue;
            }
            if let Some(allowed) = allowed {
                if !allowed.contains(rid) {
                    continue;
                }
            }
            hits.push((rid.clone(), cosine(&self.vectors[label], query)));
        }
        rank(&mut hits, k);
        hits
    }

    fn graph_scan(&self, query: &[f32], k: usize, allowed: Option<&HashSet<String>>) -> Vec<(String, f32)> {
        let fetch = k
            .saturating_mul(5)
            .saturating_add(self.tombstones.len())
            .min(self.rev_map.len());
        let ef = fetch.max(EF_CONSTRUCTION);
        let mut hits: Vec<(String, f32)> = Vec::new();
        let mut seen: HashSet<usize> = HashSet::new();
        for n in self.hnsw.search(query, fetch, ef) {
            let label = n.d_id;
            if !seen.insert(label) || self.tombstones.contains(&label) {
                continue;
            }
            let rid = &self.rev_map[label];
            if let Some(allowed) = allowed {
                if !allowed.contains(rid) {
                    continue;
                }
            }
            hits.push((rid.clone(), 1.0 - n.distance));
        }
        rank(&mut hits, k);
        hits
    }
}

impl VectorBackend for HnswBackend {
    fn configure(&mut self, dim: usize, model_fingerprint: &str) -> Result<(), StoreError> {
        if dim == 0 {
            return Err(StoreError::Backend("vector dimension must be non-zero".into()));
        }
        fs::create_dir_all(&self.dir)?;
        let conn = Connection::open(self.dir.join(FIELDS_DB))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS records (
                rid TEXT PRIMARY KEY,
                fields_json TEXT NOT NULL,
                text TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS backend_meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            "#,
        )?;
        let stored: Option<String> = {
            let mut stmt = conn.prepare("SELECT value FROM backend_meta WHERE key = 'fingerprint'")?;
            let mut rows = stmt.query([])?;
            match rows.next()? {
                Some(row) => Some(row.get(0)?),
                None => None,
            }
        };
        match stored {
            Some(s) if s != model_fingerprint => {
                return Err(StoreError::ModelMismatch {
                    stored: s,
                    configured: model_fingerprint.to_string(),
                });
            }
            Some(_) => {}
            None => {
                conn.execute(
                    "INSERT INTO backend_meta (key, value) VALUES ('fingerprint', ?1), ('dim', ?2)",
                    params![model_fingerprint, dim.to_string()],
                )?;
            }
        }
        self.fields = Some(conn);
        self.dim = dim;
        if self.dir.join(MAP_FILE).is_file() {
            self.load_snapshot()?;
        }
        Ok(())
    }

    fn upsert(&mut self, batch: &[IndexedRecord]) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }
        for rec in batch {
            if rec.vector.len() != self.dim {
                return Err(StoreError::Backend(format!(
                    "vector for `{}` has dimension {}, index expects {}",
                    rec.rid.0,
                    rec.vector.len(),
                    self.dim
                )));
            }
        }
        {
            let db = self
                .fields
                .as_mut()
                .ok_or_else(|| StoreError::Backend("backend not configured".to_string()))?;
            // One transaction: field rows land atomically with the call.
            let tx = db.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO records (rid, fields_json, text) VALUES (?1, ?2, ?3)
                     ON CONFLICT(rid) DO UPDATE SET fields_json=excluded.fields_json, text=excluded.text",
                )?;
                for rec in batch {
                    // Field values are denormalised as strings so the translated
                    // clause compares TEXT to TEXT regardless of the JSON type.
                    let flat: std::collections::BTreeMap<String, String> = rec
                        .fields
                        .iter()
                        .filter_map(|(k, v)| scalar_to_string(v).map(|s| (k.clone(), s)))
                        .collect();
                    let fields_json = serde_json::to_string(&flat)
                        .map_err(|e| StoreError::Backend(e.to_string()))?;
                    stmt.execute(params![rec.rid.0, fields_json, rec.text])?;
                }
            }
            tx.commit()?;
        }
        for rec in batch {
            let label = match self.id_map.get(&rec.rid.0) {
                Some(&lbl) => {
                    self.vectors[lbl] = rec.vector.clone();
                    lbl
                }
                None => {
                    let lbl = self.rev_map.len();
                    self.id_map.insert(rec.rid.0.clone(), lbl);
                    self.rev_map.push(rec.rid.0.clone());
                    self.vectors.push(rec.vector.clone());
                    lbl
                }
            };
            self.tombstones.remove(&label);
            self.hnsw.insert((&rec.vector[..], label));
        }
        Ok(())
    }

    fn delete(&mut self, rids: &[Rid]) -> Result<usize, StoreError> {
        if rids.is_empty() {
            return Ok(0);
        }
        {
            let db = self.db()?;
            let mut placeholders = String::from("(");
            for i in 0..rids.len() {
                if i > 0 {
                    placeholders.push(',');
                }
                placeholders.push('?');
            }
            placeholders.push(')');
            let sql = format!("DELETE FROM records WHERE rid IN {placeholders}");
            let params_vec: Vec<&str> = rids.iter().map(|r| r.0.as_str()).collect();
            db.execute(&sql, rusqlite::params_from_iter(params_vec.iter()))?;
        }
        let mut removed = 0usize;
        for rid in rids {
            if let Some(label) = self.id_map.remove(&rid.0) {
                // HNSW has no true delete; tombstoned labels are filtered at
                // search time and dropped from the next snapshot.
                self.tombstones.insert(label);
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn search(
        &self,
        query: &[f32],
        k: usize,
        pre_filter: Option<&str>,
    ) -> Result<Vec<BackendHit>, StoreError> {
        if query.len() != self.dim {
            return Err(StoreError::Backend(format!(
                "query vector has dimension {}, index expects {}",
                query.len(),
                self.dim
            )));
        }
        if k == 0 || self.live_count() == 0 {
            return Ok(Vec::new());
        }
        let allowed = match pre_filter {
            Some(clause) => Some(self.allowed_rids(clause)?),
            None => None,
        };
        let scan_size = allowed.as_ref().map_or(self.live_count(), HashSet::len);
        let ranked = if scan_size <= FLAT_SCAN_LIMIT {
            self.flat_scan(query, k, allowed.as_ref())
        } else {
            self.graph_scan(query, k, allowed.as_ref())
        };
        let mut out = Vec::with_capacity(ranked.len());
        for (rid, score) in ranked {
            let text = self.payload_text(&rid)?;
            out.push(BackendHit { rid: Rid(rid), score, text });
        }
        Ok(out)
    }

    fn save(&mut self) -> Result<(), StoreError> {
        fs::create_dir_all(&self.dir)?;
        // Compact: tombstoned labels do not survive the snapshot.
        let live: Vec<(&String, &Vec<f32>)> = self
            .rev_map
            .iter()
            .enumerate()
            .filter(|(label, _)| !self.tombstones.contains(label))
            .map(|(label, rid)| (rid, &self.vectors[label]))
            .collect();

        let map_tmp = self.dir.join(format!("{MAP_FILE}.tmp"));
        let vec_tmp = self.dir.join(format!("{VECTORS_FILE}.tmp"));
        {
            use std::io::Write;
            let mut w = fs::File::create(&map_tmp)?;
            for (i, (rid, _)) in live.iter().enumerate() {
                writeln!(w, "{i}\t{rid}")?;
            }
        }
        {
            use std::io::Write;
            let mut w = fs::File::create(&vec_tmp)?;
            // binary: [u32 dim][f32..] repeated
            for (_, v) in &live {
                let dim = v.len() as u32;
                w.write_all(&dim.to_le_bytes())?;
                w.write_all(bytemuck::cast_slice(&v[..]))?;
            }
        }
        fs::rename(map_tmp, self.dir.join(MAP_FILE))?;
        fs::rename(vec_tmp, self.dir.join(VECTORS_FILE))?;
        Ok(())
    }
}

fn new_index(expected: usize) -> Hnsw<'static, f32, DistCosine> {
    Hnsw::<f32, DistCosine>::new(MAX_NB_CONN, expected, NUM_LAYERS, EF_CONSTRUCTION, DistCosine {})
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut na = 0.0f32;
    let mut nb = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na.sqrt() * nb.sqrt())
    }
}

/// Descending score, ascending rid on ties, truncated to `k`.
fn rank(hits: &mut Vec<(String, f32)>, k: usize) {
    hits.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    hits.truncate(k);
}

/// Rewrites planner field references onto the fields table. Only bracketed
/// names survive planner sanitisation, so a plain textual scan suffices.
fn translate_clause(clause: &str) -> String {
    let mut out = String::with_capacity(clause.len() + 16);
    let mut rest = clause;
    while let Some(open) = rest.find('[') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find(']') {
            Some(close) => {
                let field = &after[..close];
                out.push_str(&format!("json_extract(fields_json, '$.\"{field}\"')"));
                rest = &after[close + 1..];
            }
            None => {
                out.push_str(&rest[open..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn record(rid: &str, vector: Vec<f32>, lang: &str, text: &str) -> IndexedRecord {
        IndexedRecord {
            rid: Rid(rid.into()),
            vector,
            fields: BTreeMap::from([("lang".to_string(), json!(lang))]),
            text: text.into(),
        }
    }

    fn configured(dir: &Path) -> HnswBackend {
        let mut b = HnswBackend::new(dir);
        b.configure(4, "test@4d").expect("configure");
        b
    }

    #[test]
    fn upsert_search_round_trip_with_payload() {
        let dir = TempDir::new().expect("tempdir");
        let mut b = configured(dir.path());
        b.upsert(&[
            record("a::1", vec![1.0, 0.0, 0.0, 0.0], "en", "alpha"),
            record("a::2", vec![0.0, 1.0, 0.0, 0.0], "en", "beta"),
            record("b::1", vec![0.9, 0.1, 0.0, 0.0], "pt", "gamma"),
        ])
        .expect("upsert");

        let hits = b.search(&[1.0, 0.0, 0.0, 0.0], 2, None).expect("search");
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].rid.0, "a::1");
        assert_eq!(hits[0].text.as_deref(), Some("alpha"));
        assert!(hits[0].score > hits[1].score);
    }

    #[test]
    fn pre_filter_restricts_candidates() {
        let dir = TempDir::new().expect("tempdir");
        let mut b = configured(dir.path());
        b.upsert(&[
            record("a::1", vec![1.0, 0.0, 0.0, 0.0], "en", "alpha"),
            record("b::1", vec![0.99, 0.1, 0.0, 0.0], "pt", "bravo"),
        ])
        .expect("upsert");

        let hits = b
            .search(&[1.0, 0.0, 0.0, 0.0], 10, Some("[lang] = 'pt'"))
            .expect("filtered search");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].rid.0, "b::1");

        let hits = b
            .search(&[1.0, 0.0, 0.0, 0.0], 10, Some("[lang] <> 'pt'"))
            .expect("negated search");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].rid.0, "a::1");
    }

    #[test]
    fn equal_scores_tie_break_on_ascending_rid() {
        let dir = TempDir::new().expect("tempdir");
        let mut b = configured(dir.path());
        b.upsert(&[
            record("z::1", vec![1.0, 0.0, 0.0, 0.0], "en", "z"),
            record("a::1", vec![1.0, 0.0, 0.0, 0.0], "en", "a"),
        ])
        .expect("upsert");
        let hits = b.search(&[1.0, 0.0, 0.0, 0.0], 2, None).expect("search");
        assert_eq!(hits[0].rid.0, "a::1");
        assert_eq!(hits[1].rid.0, "z::1");
    }

    #[test]
    fn delete_tombstones_and_reports_count() {
        let dir = TempDir::new().expect("tempdir");
        let mut b = configured(dir.path());
        b.upsert(&[
            record("a::1", vec![1.0, 0.0, 0.0, 0.0], "en", "alpha"),
            record("a::2", vec![0.0, 1.0, 0.0, 0.0], "en", "beta"),
        ])
        .expect("upsert");
        assert_eq!(b.delete(&[Rid("a::1".into()), Rid("missing::1".into())]).unwrap(), 1);

        let hits = b.search(&[1.0, 0.0, 0.0, 0.0], 10, None).expect("search");
        assert!(hits.iter().all(|h| h.rid.0 != "a::1"));
        assert_eq!(b.delete(&[Rid("a::1".into())]).unwrap(), 0);
    }

    #[test]
    fn snapshot_survives_reopen_and_drops_tombstones() {
        let dir = TempDir::new().expect("tempdir");
        {
            let mut b = configured(dir.path());
            b.upsert(&[
                record("a::1", vec![1.0, 0.0, 0.0, 0.0], "en", "alpha"),
                record("a::2", vec![0.0, 1.0, 0.0, 0.0], "en", "beta"),
            ])
            .expect("upsert");
            b.delete(&[Rid("a::2".into())]).expect("delete");
            b.save().expect("save");
        }
        let b = configured(dir.path());
        let hits = b.search(&[0.0, 1.0, 0.0, 0.0], 10, None).expect("search");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].rid.0, "a::1");
    }

    #[test]
    fn fingerprint_mismatch_refuses_to_open() {
        let dir = TempDir::new().expect("tempdir");
        {
            let _ = configured(dir.path());
        }
        let mut b = HnswBackend::new(dir.path());
        let err = b.configure(4, "other@4d").unwrap_err();
        assert!(matches!(err, StoreError::ModelMismatch { .. }));
    }

    #[test]
    fn clause_translation_rewrites_bracketed_fields() {
        assert_eq!(
            translate_clause("[lang] = 'en' AND [kind] <> 'x'"),
            "json_extract(fields_json, '$.\"lang\"') = 'en' AND \
             json_extract(fields_json, '$.\"kind\"') <> 'x'"
        );
    }
}
