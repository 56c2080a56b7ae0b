//! Sliding-window chunker for plain text.

use patchvec_model::{ChunkMeta, ChunkRecord, DocId, Rid};

use crate::TxtParams;

/// Splits lossily-decoded UTF-8 text into overlapping windows of
/// `params.size` characters, stepping by `size - overlap`. Each chunk
/// records the byte offset of its window start.
pub fn chunk_txt(docid: &DocId, bytes: &[u8], params: &TxtParams) -> Vec<ChunkRecord> {
    let mut text = String::from_utf8_lossy(bytes).to_string();
    // Normalize CRLF to LF
    text = text.replace('\r', "");

    let size = params.size.max(1);
    let step = size.saturating_sub(params.overlap).max(1);

    let starts: Vec<usize> = text.char_indices().map(|(b, _)| b).collect();
    let mut out = Vec::new();
    let mut i = 0usize;
    let mut ordinal = 1u32;
    while i < starts.len() {
        let start_byte = starts[i];
        let end_byte = if i + size < starts.len() { starts[i + size] } else { text.len() };
        out.push(ChunkRecord {
            rid: Rid::new(docid, ordinal),
            docid: docid.clone(),
            ordinal,
            text: text[start_byte..end_byte].to_string(),
            meta: ChunkMeta { offset: Some(start_byte as u64), ..Default::default() },
        });
        ordinal += 1;
        i += step;
    }
    out
}
