//! Per-page PDF chunker.

use lopdf::Document;
use patchvec_model::{ChunkMeta, ChunkRecord, DocId, Rid};

use crate::PreprocessError;

/// Emits one chunk per page, in page order. Pages with no extractable text
/// still produce a chunk with an empty string so page numbering survives in
/// the rid ordinals.
pub fn chunk_pdf(docid: &DocId, bytes: &[u8]) -> Result<Vec<ChunkRecord>, PreprocessError> {
    let doc = Document::load_mem(bytes)
        .map_err(|e| PreprocessError::Parse { format: "pdf", message: e.to_string() })?;

    let mut out = Vec::new();
    let mut ordinal = 1u32;
    for (&page_no, _object_id) in doc.get_pages().iter() {
        let text = doc.extract_text(&[page_no]).unwrap_or_default();
        out.push(ChunkRecord {
            rid: Rid::new(docid, ordinal),
            docid: docid.clone(),
            ordinal,
            text: text.trim_end_matches('\n').to_string(),
            meta: ChunkMeta { page: Some(page_no), ..Default::default() },
        });
        ordinal += 1;
    }
    Ok(out)
}
