//! Per-collection metadata store.
//!
//! One SQLite database per collection (`meta.db`), WAL mode. Writes happen
//! under the owning collection's lock through a read-write handle; readers
//! open short-lived read-only handles and never block the writer.

use std::collections::HashMap;
use std::path::Path;

use patchvec_model::{merged_fields, ChunkMeta, ChunkRecord, DocId, DocMeta, DocRecord, Rid};
use rusqlite::{params, Connection, OpenFlags, TransactionBehavior};
use serde_json::Value;

use crate::StoreError;

pub const META_DB: &str = "meta.db";

/// Upper bound on one `IN (...)` list; larger batches are split.
const IN_BATCH: usize = 500;

pub struct MetaRepo {
    conn: Connection,
}

impl std::fmt::Debug for MetaRepo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetaRepo").finish_non_exhaustive()
    }
}

impl MetaRepo {
    /// Opens (creating if needed) the read-write handle for a collection
    /// directory. Call sites must hold the collection lock for writes.
    pub fn create_or_open(dir: &Path) -> Result<Self, StoreError> {
        if let Some(reason) = detect_legacy_layout(dir) {
            return Err(StoreError::LegacyMetadata(reason));
        }
        let conn = Connection::open(dir.join(META_DB))?;
        let repo = Self { conn };
        repo.init()?;
        Ok(repo)
    }

    /// Opens a read-only handle for lock-free hydration.
    pub fn open_read(dir: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open_with_flags(
            dir.join(META_DB),
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Ok(Self { conn })
    }

    fn init(&self) -> Result<(), StoreError> {
        // Pragmas for durability and concurrency
        self.conn.pragma_update(None, "journal_mode", "WAL")?;
        self.conn.pragma_update(None, "synchronous", "FULL")?;
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                docid TEXT PRIMARY KEY,
                version INTEGER NOT NULL,
                ingested_at TEXT NOT NULL,
                filename TEXT,
                content_type TEXT,
                meta_json TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS chunks (
                rid TEXT PRIMARY KEY,
                docid TEXT NOT NULL,
                ordinal INTEGER NOT NULL,
                page INTEGER,
                byte_offset INTEGER,
                row_no INTEGER,
                section TEXT,
                meta_json TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_chunks_docid ON chunks(docid);
            "#,
        )?;
        Ok(())
    }

    pub fn has_doc(&self, docid: &DocId) -> Result<bool, StoreError> {
        let n: i64 = self.conn.query_row(
            "SELECT count(*) FROM documents WHERE docid = ?1",
            params![docid.0],
            |r| r.get(0),
        )?;
        Ok(n > 0)
    }

    pub fn doc_version(&self, docid: &DocId) -> Result<Option<u32>, StoreError> {
        let mut stmt = self.conn.prepare("SELECT version FROM documents WHERE docid = ?1")?;
        let mut rows = stmt.query(params![docid.0])?;
        match rows.next()? {
            Some(row) => {
                let v: i64 = row.get(0)?;
                Ok(Some(v as u32))
            }
            None => Ok(None),
        }
    }

    /// Rids of a document in ordinal order.
    pub fn rids_for_doc(&self, docid: &DocId) -> Result<Vec<Rid>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT rid FROM chunks WHERE docid = ?1 ORDER BY ordinal")?;
        let rows = stmt.query_map(params![docid.0], |row| {
            let rid: String = row.get(0)?;
            Ok(Rid(rid))
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// Writes the document row and all of its chunk rows in one IMMEDIATE
    /// transaction: readers observe either none or all of them.
    pub fn upsert_doc(&mut self, doc: &DocRecord, chunks: &[ChunkRecord]) -> Result<(), StoreError> {
        let doc_meta_json = serde_json::to_string(&doc.meta.extra)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            r#"
            INSERT INTO documents (docid, version, ingested_at, filename, content_type, meta_json)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(docid) DO UPDATE SET
                version=excluded.version,
                ingested_at=excluded.ingested_at,
                filename=excluded.filename,
                content_type=excluded.content_type,
                meta_json=excluded.meta_json
            "#,
            params![
                doc.docid.0,
                doc.version as i64,
                doc.ingested_at,
                doc.meta.filename,
                doc.meta.content_type,
                doc_meta_json,
            ],
        )?;
        // Replace semantics: a re-ingest never leaves stale chunk rows behind.
        tx.execute("DELETE FROM chunks WHERE docid = ?1", params![doc.docid.0])?;
        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO chunks (rid, docid, ordinal, page, byte_offset, row_no, section, meta_json)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
            )?;
            for c in chunks {
                let meta_json = serde_json::to_string(&c.meta.extra)
                    .map_err(|e| StoreError::Backend(e.to_string()))?;
                stmt.execute(params![
                    c.rid.0,
                    c.docid.0,
                    c.ordinal as i64,
                    c.meta.page.map(|v| v as i64),
                    c.meta.offset.map(|v| v as i64),
                    c.meta.row.map(|v| v as i64),
                    c.meta.section,
                    meta_json,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Removes a document and its chunks, returning the removed rids in
    /// ordinal order. Missing docid returns an empty vec.
    pub fn delete_doc(&mut self, docid: &DocId) -> Result<Vec<Rid>, StoreError> {
        let tx = self.conn.transaction()?;
        let rids = {
            let mut stmt =
                tx.prepare("SELECT rid FROM chunks WHERE docid = ?1 ORDER BY ordinal")?;
            let rows = stmt.query_map(params![docid.0], |row| {
                let rid: String = row.get(0)?;
                Ok(Rid(rid))
            })?;
            let mut out = Vec::new();
            for r in rows {
                out.push(r?);
            }
            out
        };
        tx.execute("DELETE FROM chunks WHERE docid = ?1", params![docid.0])?;
        tx.execute("DELETE FROM documents WHERE docid = ?1", params![docid.0])?;
        tx.commit()?;
        Ok(rids)
    }

    /// Batch hydration: merged document + chunk metadata per rid. Rids with
    /// no row are simply absent from the result map.
    pub fn meta_batch(
        &self,
        rids: &[Rid],
    ) -> Result<HashMap<Rid, std::collections::BTreeMap<String, Value>>, StoreError> {
        let mut out = HashMap::with_capacity(rids.len());
        for batch in rids.chunks(IN_BATCH) {
            let placeholders: Vec<String> =
                (1..=batch.len()).map(|i| format!("?{i}")).collect();
            let sql = format!(
                r#"
                SELECT c.rid, c.ordinal, c.page, c.byte_offset, c.row_no, c.section, c.meta_json,
                       d.docid, d.version, d.ingested_at, d.filename, d.content_type, d.meta_json
                FROM chunks c JOIN documents d ON d.docid = c.docid
                WHERE c.rid IN ({})
                "#,
                placeholders.join(",")
            );
            let mut stmt = self.conn.prepare(&sql)?;
            let params_vec: Vec<&str> = batch.iter().map(|r| r.0.as_str()).collect();
            let rows = stmt.query_map(rusqlite::params_from_iter(params_vec.iter()), |row| {
                let rid: String = row.get(0)?;
                let page: Option<i64> = row.get(2)?;
                let offset: Option<i64> = row.get(3)?;
                let row_no: Option<i64> = row.get(4)?;
                let section: Option<String> = row.get(5)?;
                let chunk_meta_json: String = row.get(6)?;
                let docid: String = row.get(7)?;
                let version: i64 = row.get(8)?;
                let ingested_at: String = row.get(9)?;
                let filename: Option<String> = row.get(10)?;
                let content_type: Option<String> = row.get(11)?;
                let doc_meta_json: String = row.get(12)?;
                Ok((
                    rid, page, offset, row_no, section, chunk_meta_json, docid, version,
                    ingested_at, filename, content_type, doc_meta_json,
                ))
            })?;
            for r in rows {
                let (
                    rid,
                    page,
                    offset,
                    row_no,
                    section,
                    chunk_meta_json,
                    docid,
                    version,
                    ingested_at,
                    filename,
                    content_type,
                    doc_meta_json,
                ) = r?;
                let doc = DocRecord {
                    docid: DocId(docid),
                    version: version as u32,
                    ingested_at,
                    meta: DocMeta {
                        filename,
                        content_type,
                        extra: serde_json::from_str(&doc_meta_json).unwrap_or_default(),
                    },
                };
                let chunk = ChunkMeta {
                    page: page.map(|v| v as u32),
                    offset: offset.map(|v| v as u64),
                    row: row_no.map(|v| v as u64),
                    section,
                    extra: serde_json::from_str(&chunk_meta_json).unwrap_or_default(),
                };
                out.insert(Rid(rid), merged_fields(&doc, &chunk));
            }
        }
        Ok(out)
    }

    pub fn chunk_count(&self) -> Result<u64, StoreError> {
        let n: i64 = self.conn.query_row("SELECT count(*) FROM chunks", [], |r| r.get(0))?;
        Ok(n as u64)
    }
}

/// Detects the pre-SQLite on-disk generation. Migration is deliberately not
/// attempted; the caller surfaces the guidance verbatim.
pub fn detect_legacy_layout(dir: &Path) -> Option<String> {
    for marker in ["meta.json", "catalog.json"] {
        if dir.join(marker).is_file() {
            return Some(format!(
                "found `{marker}` from a previous on-disk generation; export the collection \
                 with the release that wrote it and re-ingest into a fresh collection"
            ));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn doc_record(docid: &str, version: u32) -> DocRecord {
        DocRecord {
            docid: DocId(docid.into()),
            version,
            ingested_at: "2026-03-01T10:00:00.000Z".into(),
            meta: DocMeta {
                filename: Some(format!("{docid}.txt")),
                content_type: Some("text/plain".into()),
                extra: BTreeMap::from([("lang".to_string(), json!("en"))]),
            },
        }
    }

    fn chunk(docid: &str, ordinal: u32) -> ChunkRecord {
        let d = DocId(docid.into());
        ChunkRecord {
            rid: Rid::new(&d, ordinal),
            docid: d,
            ordinal,
            text: format!("chunk {ordinal}"),
            meta: ChunkMeta { offset: Some(ordinal as u64 * 100), ..Default::default() },
        }
    }

    #[test]
    fn upsert_then_hydrate_merges_doc_and_chunk_meta() {
        let dir = TempDir::new().expect("tempdir");
        let mut repo = MetaRepo::create_or_open(dir.path()).expect("open repo");
        let chunks: Vec<_> = (1..=3).map(|i| chunk("D", i)).collect();
        repo.upsert_doc(&doc_record("D", 1), &chunks).expect("upsert");

        assert!(repo.has_doc(&DocId("D".into())).unwrap());
        assert_eq!(repo.doc_version(&DocId("D".into())).unwrap(), Some(1));
        assert_eq!(repo.chunk_count().unwrap(), 3);

        let rids = repo.rids_for_doc(&DocId("D".into())).unwrap();
        assert_eq!(rids.len(), 3);
        assert_eq!(rids[0].0, "D::1");

        let hydrated = repo.meta_batch(&rids).unwrap();
        let m = &hydrated[&Rid("D::2".into())];
        assert_eq!(m["docid"], json!("D"));
        assert_eq!(m["lang"], json!("en"));
        assert_eq!(m["filename"], json!("D.txt"));
        assert_eq!(m["offset"], json!(200));
    }

    #[test]
    fn reupsert_replaces_chunk_rows() {
        let dir = TempDir::new().expect("tempdir");
        let mut repo = MetaRepo::create_or_open(dir.path()).expect("open repo");
        repo.upsert_doc(&doc_record("D", 1), &(1..=5).map(|i| chunk("D", i)).collect::<Vec<_>>())
            .unwrap();
        repo.upsert_doc(&doc_record("D", 2), &(1..=2).map(|i| chunk("D", i)).collect::<Vec<_>>())
            .unwrap();

        assert_eq!(repo.doc_version(&DocId("D".into())).unwrap(), Some(2));
        assert_eq!(repo.rids_for_doc(&DocId("D".into())).unwrap().len(), 2);
        assert!(repo.meta_batch(&[Rid("D::5".into())]).unwrap().is_empty());
    }

    #[test]
    fn delete_doc_returns_rids_and_is_idempotent() {
        let dir = TempDir::new().expect("tempdir");
        let mut repo = MetaRepo::create_or_open(dir.path()).expect("open repo");
        repo.upsert_doc(&doc_record("D", 1), &(1..=4).map(|i| chunk("D", i)).collect::<Vec<_>>())
            .unwrap();

        let removed = repo.delete_doc(&DocId("D".into())).unwrap();
        assert_eq!(removed.len(), 4);
        assert!(!repo.has_doc(&DocId("D".into())).unwrap());
        assert!(repo.delete_doc(&DocId("D".into())).unwrap().is_empty());
    }

    #[test]
    fn concurrent_reader_sees_committed_state_only() {
        let dir = TempDir::new().expect("tempdir");
        let mut repo = MetaRepo::create_or_open(dir.path()).expect("open repo");
        repo.upsert_doc(&doc_record("D", 1), &[chunk("D", 1)]).unwrap();

        let reader = MetaRepo::open_read(dir.path()).expect("read handle");
        assert_eq!(reader.doc_version(&DocId("D".into())).unwrap(), Some(1));
    }

    #[test]
    fn legacy_json_layout_is_refused() {
        let dir = TempDir::new().expect("tempdir");
        std::fs::write(dir.path().join("catalog.json"), b"{}").unwrap();
        let err = MetaRepo::create_or_open(dir.path()).unwrap_err();
        assert!(matches!(err, StoreError::LegacyMetadata(_)));
    }
}
