//! The collection engine and service facade.
//!
//! `Engine` owns the data directory, the lock registry, admission control,
//! the counters and the ops event stream. Transports (HTTP, CLI) hold a
//! reference and call the operations below; every failure surfaces as one
//! structured [`EngineError`].

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use patchvec_embedder::{build_embedder, Embedder};
use patchvec_model::filter::{Atom, FilterSpec};
use patchvec_model::{
    validate_slug, ChunkRecord, DeleteReceipt, DocId, DocMeta, DocRecord, IngestReceipt,
    merged_fields, Rid, SearchMatch, SearchOutcome, SCHEMA_VERSION,
};
use patchvec_preprocess::csv::CsvOptions;
use patchvec_preprocess::{preprocess, Source, TxtParams};
use patchvec_store::{
    plan_filters, post_filter_matches, BackendCaps, FilterPlan, IndexedRecord, MetaRepo,
    VectorBackend,
};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::admission::{Admission, OpKind, Permit};
use crate::archive::{pack_dir, unpack_into};
use crate::catalog;
use crate::collection::{Collection, Manifest};
use crate::config::Config;
use crate::counters::{Counters, CountersSnapshot};
use crate::error::{EngineError, ErrorCode, Result};
use crate::opslog::{OpsEvent, OpsLog};
use crate::registry::{CollState, CollectionKey, Registry, SlotCell};

/// Floor on the candidate count fetched from the backend whenever a
/// post-filter will thin the results afterwards.
const OVERFETCH_FLOOR: usize = 50;

/// Rids hydrated per metadata read, with a deadline check in between.
const HYDRATE_BATCH: usize = 256;

pub struct IngestSource<'a> {
    pub filename: &'a str,
    pub content_type: Option<&'a str>,
    pub bytes: &'a [u8],
}

#[derive(Default)]
pub struct IngestOptions {
    /// Explicit docid; wins over the filename-derived one.
    pub docid: Option<String>,
    /// Caller-supplied document-level metadata.
    pub metadata: Option<serde_json::Map<String, Value>>,
    pub csv: Option<CsvOptions>,
}

#[derive(Debug, Clone, Default)]
pub struct SearchRequest {
    pub q: String,
    pub k: usize,
    pub filters: Option<serde_json::Map<String, Value>>,
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct Readiness {
    pub ok: bool,
    pub writable: bool,
    pub backend_init: bool,
    pub data_dir: PathBuf,
}

pub struct Engine {
    config: Config,
    data_dir: PathBuf,
    registry: Registry,
    admission: Arc<Admission>,
    counters: Counters,
    opslog: OpsLog,
    embedder: Arc<dyn Embedder>,
}

impl Engine {
    /// Builds an engine from configuration. No global state: transports own
    /// the returned value and share it behind an `Arc`.
    pub fn build(config: Config) -> Result<Engine> {
        let data_dir = config.vector_store.data_dir.clone();
        fs::create_dir_all(&data_dir)?;
        let embedder = build_embedder(
            &config.embedder.kind,
            &config.embedder.model,
            config.embedder.dimension,
        )?;
        let admission = Admission::new(
            config.limits.search.max_concurrent,
            config.limits.ingest.max_concurrent,
            config.limits.tenant.max_concurrent,
        );
        let opslog = OpsLog::new(config.log.ops_log.as_deref())?;
        info!(data_dir = %data_dir.display(), model = %embedder.info().fingerprint(), "engine built");
        Ok(Engine {
            config,
            data_dir,
            registry: Registry::new(),
            admission,
            counters: Counters::default(),
            opslog,
            embedder,
        })
    }

    /// Embedder seam, per collection so models can diverge later without a
    /// structural change. Today every collection shares the configured one.
    pub fn embedder_for(&self, _tenant: &str, _name: &str) -> Arc<dyn Embedder> {
        Arc::clone(&self.embedder)
    }

    pub fn counters(&self) -> CountersSnapshot {
        self.counters.snapshot()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // ---------------- collection lifecycle ----------------

    pub fn create_collection(&self, tenant: &str, name: &str) -> Result<()> {
        let t0 = Instant::now();
        let result = self.create_collection_inner(tenant, name);
        self.finish(
            OpsEvent {
                op: "create_collection",
                tenant: tenant.to_string(),
                collection: Some(name.to_string()),
                ..Default::default()
            },
            t0,
            &result,
        );
        result
    }

    fn create_collection_inner(&self, tenant: &str, name: &str) -> Result<()> {
        validate_slug(tenant)?;
        validate_slug(name)?;
        let key = CollectionKey::new(tenant, name);
        let dir = catalog::collection_dir(&self.data_dir, tenant, name);
        let slot = self.registry.slot(&key);
        let mut cell = slot.lock();
        if cell.coll.is_some() || dir.is_dir() {
            return Err(EngineError::already_exists(format!(
                "collection `{tenant}/{name}` already exists"
            )));
        }
        cell.state = CollState::Initializing;
        let manifest = Manifest {
            schema_version: SCHEMA_VERSION,
            tenant: tenant.to_string(),
            collection: name.to_string(),
            model_fingerprint: self.embedder.info().fingerprint(),
            dimension: self.embedder.info().dimension,
            created_at: now_iso(),
        };
        match Collection::create(&dir, manifest) {
            Ok(coll) => {
                cell.coll = Some(coll);
                cell.state = CollState::Ready;
                self.counters
                    .collections_created_total
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                info!(%tenant, %name, "collection created");
                Ok(())
            }
            Err(e) => {
                // Atomicity: no partial directory survives a failed create.
                let _ = fs::remove_dir_all(&dir);
                cell.state = CollState::Vacant;
                warn!(%tenant, %name, error = %e, "collection create rolled back");
                Err(e)
            }
        }
    }

    pub fn delete_collection(&self, tenant: &str, name: &str) -> Result<()> {
        let t0 = Instant::now();
        let result = self.delete_collection_inner(tenant, name);
        self.finish(
            OpsEvent {
                op: "delete_collection",
                tenant: tenant.to_string(),
                collection: Some(name.to_string()),
                ..Default::default()
            },
            t0,
            &result,
        );
        result
    }

    fn delete_collection_inner(&self, tenant: &str, name: &str) -> Result<()> {
        validate_slug(tenant)?;
        validate_slug(name)?;
        let key = CollectionKey::new(tenant, name);
        let dir = catalog::collection_dir(&self.data_dir, tenant, name);
        let slot = self.registry.slot(&key);
        {
            let mut cell = slot.lock();
            if cell.coll.is_none() && !dir.is_dir() {
                return Err(EngineError::not_found(format!(
                    "collection `{tenant}/{name}` does not exist"
                )));
            }
            cell.state = CollState::Deleting;
            // Close substore handles before removing their files.
            cell.coll = None;
            fs::remove_dir_all(&dir)?;
            cell.state = CollState::Vacant;
        }
        self.registry.remove(&key);
        self.counters
            .collections_deleted_total
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        info!(%tenant, %name, "collection deleted");
        Ok(())
    }

    pub fn rename_collection(&self, tenant: &str, old: &str, new: &str) -> Result<()> {
        let t0 = Instant::now();
        let result = self.rename_collection_inner(tenant, old, new);
        self.finish(
            OpsEvent {
                op: "rename_collection",
                tenant: tenant.to_string(),
                collection: Some(old.to_string()),
                new_name: Some(new.to_string()),
                ..Default::default()
            },
            t0,
            &result,
        );
        result
    }

    /// Deadlock-safe rename: the old collection lock is released before any
    /// interaction with the new name's slot.
    fn rename_collection_inner(&self, tenant: &str, old: &str, new: &str) -> Result<()> {
        validate_slug(tenant)?;
        validate_slug(old)?;
        validate_slug(new)?;
        let old_key = CollectionKey::new(tenant, old);
        let old_dir = catalog::collection_dir(&self.data_dir, tenant, old);
        let new_dir = catalog::collection_dir(&self.data_dir, tenant, new);

        {
            let slot = self.registry.slot(&old_key);
            let mut cell = slot.lock();
            if cell.coll.is_none() && !old_dir.is_dir() {
                return Err(EngineError::not_found(format!(
                    "collection `{tenant}/{old}` does not exist"
                )));
            }
            if new_dir.exists() {
                return Err(EngineError::already_exists(format!(
                    "rename target `{tenant}/{new}` already exists"
                )));
            }
            // Close handles so the directory can move out from under them.
            cell.coll = None;
            cell.state = CollState::Vacant;
            fs::rename(&old_dir, &new_dir)?;
        }
        self.registry.remove(&old_key);

        // Re-register under the new key and fix the manifest to match the
        // path-derived name.
        let new_key = CollectionKey::new(tenant, new);
        let slot = self.registry.slot(&new_key);
        let _cell = slot.lock();
        let mut manifest = Manifest::load(&new_dir)?;
        manifest.collection = new.to_string();
        manifest.save(&new_dir)?;
        info!(%tenant, %old, %new, "collection renamed");
        Ok(())
    }

    pub fn list_tenants(&self) -> Result<Vec<String>> {
        Ok(catalog::list_tenants(&self.data_dir)?)
    }

    pub fn list_collections(&self, tenant: &str) -> Result<Vec<String>> {
        let t0 = Instant::now();
        let result: Result<Vec<String>> = (|| {
            validate_slug(tenant)?;
            Ok(catalog::list_collections(&self.data_dir, tenant)?)
        })();
        self.finish(
            OpsEvent { op: "list_collections", tenant: tenant.to_string(), ..Default::default() },
            t0,
            &result,
        );
        result
    }

    // ---------------- documents ----------------

    pub fn ingest_document(
        &self,
        tenant: &str,
        name: &str,
        source: IngestSource<'_>,
        opts: IngestOptions,
    ) -> Result<IngestReceipt> {
        let t0 = Instant::now();
        let result = self.ingest_document_inner(tenant, name, &source, &opts, t0);
        let mut event = OpsEvent {
            op: "ingest",
            tenant: tenant.to_string(),
            collection: Some(name.to_string()),
            ..Default::default()
        };
        if let Ok(receipt) = &result {
            event.docid = Some(receipt.docid.0.clone());
            event.chunks = Some(receipt.chunks);
        }
        self.finish(event, t0, &result);
        result
    }

    fn ingest_document_inner(
        &self,
        tenant: &str,
        name: &str,
        source: &IngestSource<'_>,
        opts: &IngestOptions,
        t0: Instant,
    ) -> Result<IngestReceipt> {
        validate_slug(tenant)?;
        validate_slug(name)?;
        let max_bytes = self.config.limits.ingest.max_bytes;
        if source.bytes.len() as u64 > max_bytes {
            return Err(EngineError::new(
                ErrorCode::TooLarge,
                format!("payload of {} bytes exceeds limits.ingest.max_bytes={max_bytes}", source.bytes.len()),
            ));
        }
        let _permit = self.admit(OpKind::Ingest, tenant)?;

        let docid = resolve_docid(opts.docid.as_deref(), source.filename);
        let doc_meta = DocMeta {
            filename: Some(source.filename.to_string()),
            content_type: source.content_type.map(str::to_string),
            extra: opts
                .metadata
                .as_ref()
                .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                .unwrap_or_default(),
        };

        // Chunk sizes resolve at call time, not process start.
        let txt = TxtParams {
            size: self.config.chunk.txt.size,
            overlap: self.config.chunk.txt.overlap,
        };
        let chunks = preprocess(
            &docid,
            &Source {
                filename: source.filename,
                content_type: source.content_type,
                bytes: source.bytes,
            },
            &txt,
            opts.csv.as_ref(),
        )?;
        if chunks.is_empty() {
            return Err(EngineError::invalid_request("no text extracted from source"));
        }

        let key = CollectionKey::new(tenant, name);
        let slot = self.registry.slot(&key);
        let mut cell = slot.lock();
        self.ensure_loaded(&mut cell, tenant, name)?;
        cell.state = CollState::Writing;
        let outcome = self.ingest_locked(&mut cell, &docid, doc_meta, &chunks);
        cell.state = CollState::Ready;
        drop(cell);

        let chunk_count = outcome?;
        self.counters
            .documents_indexed_total
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.counters
            .chunks_indexed_total
            .fetch_add(chunk_count as u64, std::sync::atomic::Ordering::Relaxed);
        debug!(%tenant, %name, docid = %docid, chunks = chunk_count, "document ingested");
        Ok(IngestReceipt { docid, chunks: chunk_count, latency_ms: elapsed_ms(t0) })
    }

    /// Body of the ingest critical section. The collection lock is held by
    /// the caller for the whole call.
    fn ingest_locked(
        &self,
        cell: &mut SlotCell,
        docid: &DocId,
        doc_meta: DocMeta,
        chunks: &[ChunkRecord],
    ) -> Result<usize> {
        let coll = cell.coll.as_mut().ok_or_else(|| EngineError::internal("collection not loaded"))?;

        let version = coll.meta.doc_version(docid)?.map_or(1, |v| v + 1);

        // Purge any prior generation of this docid from all three substores.
        let old_rids = coll.meta.delete_doc(docid)?;
        if !old_rids.is_empty() {
            coll.backend.delete(&old_rids)?;
            for rid in &old_rids {
                coll.sidecar.delete(rid)?;
            }
            self.counters.purge_total.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }

        // Embedding failures surface as-is; there is no retry on this path.
        let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
        let vectors = self.embedder.embed_batch(&texts)?;

        let doc = DocRecord {
            docid: docid.clone(),
            version,
            ingested_at: now_iso(),
            meta: doc_meta,
        };
        let records: Vec<IndexedRecord> = chunks
            .iter()
            .zip(vectors)
            .map(|(c, vector)| IndexedRecord {
                rid: c.rid.clone(),
                vector,
                fields: merged_fields(&doc, &c.meta),
                text: c.text.clone(),
            })
            .collect();

        coll.backend.upsert(&records)?;

        let new_rids: Vec<Rid> = chunks.iter().map(|c| c.rid.clone()).collect();
        if let Err(e) = coll.meta.upsert_doc(&doc, chunks) {
            // Backend upsert landed but metadata did not: roll the backend
            // back before the lock is released.
            let _ = coll.backend.delete(&new_rids);
            warn!(docid = %docid, error = %e, "metadata write failed, backend upsert rolled back");
            return Err(e.into());
        }

        for c in chunks {
            if let Err(e) = coll.sidecar.write(&c.rid, &c.text) {
                let _ = coll.backend.delete(&new_rids);
                let _ = coll.meta.delete_doc(docid);
                warn!(docid = %docid, error = %e, "sidecar write failed, ingest rolled back");
                return Err(e.into());
            }
        }

        coll.backend.save()?;
        Ok(chunks.len())
    }

    pub fn delete_document(&self, tenant: &str, name: &str, docid: &str) -> Result<DeleteReceipt> {
        let t0 = Instant::now();
        let result = self.delete_document_inner(tenant, name, docid);
        let mut event = OpsEvent {
            op: "delete_doc",
            tenant: tenant.to_string(),
            collection: Some(name.to_string()),
            docid: Some(docid.to_string()),
            ..Default::default()
        };
        if let Ok(receipt) = &result {
            event.chunks = Some(receipt.chunks_deleted);
        }
        self.finish(event, t0, &result);
        result
    }

    fn delete_document_inner(&self, tenant: &str, name: &str, docid: &str) -> Result<DeleteReceipt> {
        validate_slug(tenant)?;
        validate_slug(name)?;
        let docid = DocId(docid.to_string());
        let key = CollectionKey::new(tenant, name);
        let slot = self.registry.slot(&key);
        let mut cell = slot.lock();
        self.ensure_loaded(&mut cell, tenant, name)?;
        let coll = cell.coll.as_mut().ok_or_else(|| EngineError::internal("collection not loaded"))?;

        let rids = coll.meta.delete_doc(&docid)?;
        if rids.is_empty() {
            // Idempotent: deleting a missing document is not an error.
            return Ok(DeleteReceipt { chunks_deleted: 0 });
        }
        coll.backend.delete(&rids)?;
        for rid in &rids {
            coll.sidecar.delete(rid)?;
        }
        coll.backend.save()?;
        self.counters.purge_total.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Ok(DeleteReceipt { chunks_deleted: rids.len() })
    }

    // ---------------- search ----------------

    pub fn search(&self, tenant: &str, name: &str, req: SearchRequest) -> Result<SearchOutcome> {
        let t0 = Instant::now();
        let result = self.search_inner(tenant, name, &req, t0);
        let mut event = OpsEvent {
            op: "search",
            tenant: tenant.to_string(),
            collection: Some(name.to_string()),
            k: Some(req.k),
            request_id: req.request_id.clone(),
            ..Default::default()
        };
        if let Ok(outcome) = &result {
            event.hits = Some(outcome.matches.len());
        }
        self.finish(event, t0, &result);
        result
    }

    fn search_inner(
        &self,
        tenant: &str,
        name: &str,
        req: &SearchRequest,
        t0: Instant,
    ) -> Result<SearchOutcome> {
        validate_slug(tenant)?;
        validate_slug(name)?;
        if req.q.trim().is_empty() {
            return Err(EngineError::invalid_request("query `q` must not be empty"));
        }
        let k = req.k.max(1);
        let _permit = self.admit(OpKind::Search, tenant)?;

        let spec = match &req.filters {
            Some(map) => FilterSpec::from_json(map)?,
            None => FilterSpec::default(),
        };
        let plan = plan_filters(&spec, &BackendCaps::default())?;

        // Embedding happens outside the collection lock.
        let qvec = self.embedder.embed(&req.q)?;
        let deadline = t0 + Duration::from_millis(self.config.limits.search.timeout_ms);

        let fetch_k = if plan.has_post() {
            (k * self.config.limits.search.overfetch.max(1)).max(OVERFETCH_FLOOR)
        } else {
            k
        };

        let key = CollectionKey::new(tenant, name);
        let dir = catalog::collection_dir(&self.data_dir, tenant, name);
        let raw = {
            let slot = self.registry.slot(&key);
            let mut cell = slot.lock();
            self.ensure_loaded(&mut cell, tenant, name)?;
            let coll =
                cell.coll.as_ref().ok_or_else(|| EngineError::internal("collection not loaded"))?;
            // The lock covers only the k-NN call; hydration runs unlocked.
            coll.backend.search(&qvec, fetch_k, plan.pre_sql.as_deref())?
        };

        let mut truncated = false;
        if Instant::now() > deadline {
            if raw.is_empty() {
                return Err(EngineError::timeout(format!(
                    "search exceeded {} ms with no candidates",
                    self.config.limits.search.timeout_ms
                )));
            }
            truncated = true;
        }

        // Batch hydration from the metadata store, no lock held. Reads use a
        // short-lived read-only handle so they never contend with a writer.
        let reader = MetaRepo::open_read(&dir)
            .map_err(|_| EngineError::not_found(format!("collection `{tenant}/{name}` does not exist")))?;
        let mut hydrated: BTreeMap<Rid, BTreeMap<String, Value>> = BTreeMap::new();
        let all_rids: Vec<Rid> = raw.iter().map(|h| h.rid.clone()).collect();
        for batch in all_rids.chunks(HYDRATE_BATCH) {
            if Instant::now() > deadline {
                truncated = true;
                break;
            }
            for (rid, fields) in reader.meta_batch(batch)? {
                hydrated.insert(rid, fields);
            }
        }

        let sidecar = patchvec_store::SidecarStore::new(&dir);
        let mut kept: Vec<(f32, Rid, Option<String>, BTreeMap<String, Value>)> = Vec::new();
        for hit in raw {
            let Some(fields) = hydrated.remove(&hit.rid) else {
                // Hit raced a delete between k-NN and hydration; skip it.
                continue;
            };
            if !post_filter_matches(&plan.post, &fields) {
                continue;
            }
            kept.push((hit.score, hit.rid, hit.text, fields));
        }
        kept.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1.cmp(&b.1))
        });
        kept.truncate(k);

        let mut matches = Vec::with_capacity(kept.len());
        for (score, rid, backend_text, fields) in kept {
            // Backend payload wins; the sidecar is the fallback text source.
            let text = match backend_text {
                Some(t) if !t.is_empty() => t,
                _ => sidecar.read(&rid).unwrap_or_default(),
            };
            let match_reason = match_reason(&spec, &plan, &req.q, &text);
            let docid = fields
                .get("docid")
                .and_then(Value::as_str)
                .map(|s| DocId(s.to_string()))
                .or_else(|| rid.docid())
                .unwrap_or_else(|| DocId(rid.0.clone()));
            let page = fields.get("page").and_then(Value::as_u64).map(|p| p as u32);
            let offset = fields.get("offset").and_then(Value::as_u64);
            matches.push(SearchMatch {
                id: rid,
                score,
                text,
                meta: fields,
                match_reason,
                docid,
                page,
                offset,
            });
        }

        self.counters.searches_total.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Ok(SearchOutcome {
            matches,
            latency_ms: elapsed_ms(t0),
            request_id: req.request_id.clone(),
            truncated,
        })
    }

    // ---------------- archive / restore ----------------

    pub fn archive(&self, tenant: &str, name: &str) -> Result<Vec<u8>> {
        validate_slug(tenant)?;
        validate_slug(name)?;
        let key = CollectionKey::new(tenant, name);
        let dir = catalog::collection_dir(&self.data_dir, tenant, name);
        let slot = self.registry.slot(&key);
        let mut cell = slot.lock();
        if cell.coll.is_none() && !dir.is_dir() {
            return Err(EngineError::not_found(format!(
                "collection `{tenant}/{name}` does not exist"
            )));
        }
        // Flush the in-memory index so the snapshot is current.
        if let Some(coll) = cell.coll.as_mut() {
            coll.backend.save()?;
        }
        Ok(pack_dir(&dir)?)
    }

    /// Destructive: replaces any existing collection of that name.
    pub fn restore(&self, tenant: &str, name: &str, bytes: &[u8]) -> Result<()> {
        validate_slug(tenant)?;
        validate_slug(name)?;
        let key = CollectionKey::new(tenant, name);
        let dir = catalog::collection_dir(&self.data_dir, tenant, name);
        let slot = self.registry.slot(&key);
        let mut cell = slot.lock();
        cell.state = CollState::Initializing;
        cell.coll = None;
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        let unpacked = unpack_into(bytes, &dir);
        if let Err(e) = unpacked {
            let _ = fs::remove_dir_all(&dir);
            cell.state = CollState::Vacant;
            return Err(EngineError::invalid_request(format!("archive unpack failed: {e}")));
        }
        // The archive may come from a differently-named collection; align
        // the manifest with the restore target.
        let mut manifest = Manifest::load(&dir)?;
        manifest.tenant = tenant.to_string();
        manifest.collection = name.to_string();
        manifest.save(&dir)?;
        cell.state = CollState::Vacant;
        info!(%tenant, %name, "collection restored from archive");
        Ok(())
    }

    /// Waits for in-flight operations to drain, up to `drain`. Returns
    /// `true` when the engine went idle; callers abort outstanding work
    /// after a `false`.
    pub fn shutdown(&self, drain: Duration) -> bool {
        let deadline = Instant::now() + drain;
        loop {
            if self.admission.in_flight(OpKind::Search) == 0
                && self.admission.in_flight(OpKind::Ingest) == 0
            {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    // ---------------- probes ----------------

    /// Readiness data for the health collaborator: the data dir accepts
    /// writes and a vector backend can initialise.
    pub fn readiness(&self) -> Readiness {
        let writable = (|| -> std::io::Result<()> {
            fs::create_dir_all(&self.data_dir)?;
            let probe = self.data_dir.join(".writetest");
            fs::write(&probe, b"ok")?;
            fs::remove_file(&probe)
        })()
        .is_ok();

        let health_dir = self.data_dir.join(".health");
        let backend_init = (|| -> Result<()> {
            let mut backend = patchvec_store::HnswBackend::new(&health_dir);
            backend.configure(self.embedder.info().dimension, &self.embedder.info().fingerprint())?;
            Ok(())
        })()
        .is_ok();
        let _ = fs::remove_dir_all(&health_dir);

        Readiness {
            ok: writable && backend_init,
            writable,
            backend_init,
            data_dir: self.data_dir.clone(),
        }
    }

    // ---------------- internals ----------------

    fn admit(&self, kind: OpKind, tenant: &str) -> Result<Permit> {
        match self.admission.admit(kind, tenant) {
            Ok(permit) => Ok(permit),
            Err(e) => {
                self.counters
                    .overload_shed_total
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// Loads the collection into the slot if it exists on disk. Must be
    /// called with the slot lock held.
    fn ensure_loaded(&self, cell: &mut SlotCell, tenant: &str, name: &str) -> Result<()> {
        match cell.state {
            CollState::Ready | CollState::Writing => Ok(()),
            CollState::Initializing | CollState::Deleting => Err(EngineError::unavailable(
                format!("collection `{tenant}/{name}` is in a transient state"),
            )),
            CollState::Vacant => {
                let dir = catalog::collection_dir(&self.data_dir, tenant, name);
                if !dir.is_dir() {
                    return Err(EngineError::not_found(format!(
                        "collection `{tenant}/{name}` does not exist"
                    )));
                }
                let coll = Collection::open(&dir, &self.embedder.info().fingerprint())?;
                cell.coll = Some(coll);
                cell.state = CollState::Ready;
                Ok(())
            }
        }
    }

    /// Emits the ops event for a finished operation and books errors.
    fn finish<T>(&self, mut event: OpsEvent, t0: Instant, result: &Result<T>) {
        event.latency_ms = elapsed_ms(t0);
        match result {
            Ok(_) => event.status = "ok",
            Err(e) => {
                event.status = "error";
                event.error_code = Some(e.code.as_str());
                self.counters.record_error(e.to_string());
            }
        }
        self.opslog.emit(&event);
    }
}

/// Docid precedence: explicit, then filename-derived, then generated.
/// Filename derivation uppercases and collapses every non-alphanumeric run
/// to `_`, e.g. `bncc ef-v2.csv` becomes `BNCC_EF_V2_CSV`.
fn resolve_docid(explicit: Option<&str>, filename: &str) -> DocId {
    if let Some(d) = explicit {
        let d = d.trim();
        if !d.is_empty() {
            return DocId(d.to_string());
        }
    }
    let mut derived = String::with_capacity(filename.len());
    let mut last_was_sep = true;
    for c in filename.chars() {
        if c.is_ascii_alphanumeric() {
            derived.push(c.to_ascii_uppercase());
            last_was_sep = false;
        } else if !last_was_sep {
            derived.push('_');
            last_was_sep = true;
        }
    }
    let derived = derived.trim_matches('_').to_string();
    if derived.is_empty() {
        DocId(format!("PVDOC_{}", Uuid::new_v4().simple()))
    } else {
        DocId(derived)
    }
}

/// Deterministic explanation of what drove the match: the filter fields
/// that held, plus up to three query tokens found in the hit text.
fn match_reason(spec: &FilterSpec, plan: &FilterPlan, query: &str, text: &str) -> String {
    let mut parts = Vec::new();

    let mut filters: Vec<String> = Vec::new();
    for field in &plan.pre_fields {
        if let Some(atoms) = spec.fields.get(field) {
            filters.push(render_field(field, atoms));
        }
    }
    for (field, atoms) in &plan.post.fields {
        filters.push(render_field(field, atoms));
    }
    filters.sort();
    if !filters.is_empty() {
        parts.push(format!("matched filter {}", filters.join(", ")));
    }

    let haystack = text.to_lowercase();
    let mut seen = Vec::new();
    for token in query
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() >= 3)
    {
        if seen.iter().any(|s: &String| s == token) {
            continue;
        }
        if haystack.contains(token) {
            seen.push(token.to_string());
            if seen.len() == 3 {
                break;
            }
        }
    }
    if !seen.is_empty() {
        let quoted: Vec<String> = seen.iter().map(|t| format!("\"{t}\"")).collect();
        parts.push(format!("query tokens {}", quoted.join(", ")));
    }

    if parts.is_empty() {
        "semantic similarity".to_string()
    } else {
        parts.join("; ")
    }
}

fn render_field(field: &str, atoms: &[Atom]) -> String {
    let rendered: Vec<String> = atoms
        .iter()
        .map(|a| match a {
            Atom::Eq(v) => format!("{field}={v}"),
            Atom::Ne(v) => format!("{field}!={v}"),
            Atom::Prefix(v) => format!("{field}~{v}*"),
            Atom::Suffix(v) => format!("{field}~*{v}"),
            Atom::Contains(v) => format!("{field}~*{v}*"),
            Atom::Cmp { op, value } => format!("{field}{}{value}", op.as_str()),
        })
        .collect();
    rendered.join("|")
}

fn now_iso() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// Milliseconds since `t0` with two decimal places.
fn elapsed_ms(t0: Instant) -> f64 {
    round2(t0.elapsed().as_secs_f64() * 1000.0)
}

fn round2(ms: f64) -> f64 {
    (ms * 100.0).round() / 100.0
}
