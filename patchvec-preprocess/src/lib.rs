//! Format-specific chunkers for PatchVec ingestion.
//!
//! Each chunker turns one uploaded source into an ordered sequence of
//! [`ChunkRecord`]s with deterministic rids (`{docid}::{ordinal}`, 1-based),
//! so re-ingesting identical bytes reproduces the identical rid set.
//!
//! | Format | Strategy |
//! |---|---|
//! | TXT | sliding character window with overlap, byte offsets recorded |
//! | PDF | one chunk per page, empty pages kept to preserve numbering |
//! | CSV | one chunk per data row, header-aware metadata projection |

pub mod csv;
pub mod pdf;
pub mod txt;

use patchvec_model::{ChunkRecord, DocId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PreprocessError {
    #[error("unsupported media type: {0}")]
    UnsupportedMedia(String),
    #[error("failed to parse {format} input: {message}")]
    Parse { format: &'static str, message: String },
    #[error("{0}")]
    InvalidOptions(String),
}

/// One uploaded source: raw bytes plus whatever the transport knows about it.
#[derive(Debug, Clone, Copy)]
pub struct Source<'a> {
    pub filename: &'a str,
    pub content_type: Option<&'a str>,
    pub bytes: &'a [u8],
}

/// Sliding-window parameters for TXT sources. Resolved per call so config
/// changes apply without a restart.
#[derive(Debug, Clone, Copy)]
pub struct TxtParams {
    pub size: usize,
    pub overlap: usize,
}

impl Default for TxtParams {
    fn default() -> Self {
        Self { size: 800, overlap: 120 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Txt,
    Pdf,
    Csv,
}

fn detect_format(source: &Source<'_>) -> Result<Format, PreprocessError> {
    if let Some(ct) = source.content_type {
        let ct = ct.split(';').next().unwrap_or(ct).trim().to_ascii_lowercase();
        match ct.as_str() {
            "text/plain" => return Ok(Format::Txt),
            "application/pdf" => return Ok(Format::Pdf),
            "text/csv" | "application/csv" => return Ok(Format::Csv),
            // octet-stream and friends fall through to the extension
            "" | "application/octet-stream" => {}
            other => return Err(PreprocessError::UnsupportedMedia(other.to_string())),
        }
    }
    let ext = source
        .filename
        .rsplit_once('.')
        .map(|(_, e)| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "txt" => Ok(Format::Txt),
        "pdf" => Ok(Format::Pdf),
        "csv" => Ok(Format::Csv),
        other => Err(PreprocessError::UnsupportedMedia(if other.is_empty() {
            "unknown".to_string()
        } else {
            other.to_string()
        })),
    }
}

/// Chunks `source` according to its detected format.
///
/// The returned records are ordered by ordinal; an empty vec means the
/// source contained no extractable text (the engine turns that into an
/// ingest error).
pub fn preprocess(
    docid: &DocId,
    source: &Source<'_>,
    txt: &TxtParams,
    csv_opts: Option<&csv::CsvOptions>,
) -> Result<Vec<ChunkRecord>, PreprocessError> {
    match detect_format(source)? {
        Format::Txt => Ok(txt::chunk_txt(docid, source.bytes, txt)),
        Format::Pdf => pdf::chunk_pdf(docid, source.bytes),
        Format::Csv => {
            let default_opts = csv::CsvOptions::default();
            csv::chunk_csv(docid, source.bytes, csv_opts.unwrap_or(&default_opts))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn src<'a>(filename: &'a str, content_type: Option<&'a str>) -> Source<'a> {
        Source { filename, content_type, bytes: b"" }
    }

    #[test]
    fn detects_format_from_content_type_first() {
        assert_eq!(detect_format(&src("x.bin", Some("text/plain"))).unwrap(), Format::Txt);
        assert_eq!(
            detect_format(&src("x.txt", Some("application/pdf"))).unwrap(),
            Format::Pdf
        );
        assert_eq!(
            detect_format(&src("x", Some("text/csv; charset=utf-8"))).unwrap(),
            Format::Csv
        );
    }

    #[test]
    fn falls_back_to_extension() {
        assert_eq!(detect_format(&src("notes.TXT", None)).unwrap(), Format::Txt);
        assert_eq!(
            detect_format(&src("report.pdf", Some("application/octet-stream"))).unwrap(),
            Format::Pdf
        );
        assert!(matches!(
            detect_format(&src("archive.docx", None)),
            Err(PreprocessError::UnsupportedMedia(_))
        ));
        assert!(matches!(
            detect_format(&src("noextension", None)),
            Err(PreprocessError::UnsupportedMedia(_))
        ));
    }
}
