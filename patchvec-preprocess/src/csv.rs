//! Row-per-chunk CSV chunker with header-aware metadata projection.

use std::collections::BTreeMap;

use csv::{ReaderBuilder, StringRecord};
use patchvec_model::{ChunkMeta, ChunkRecord, DocId, Rid};
use serde_json::Value;

use crate::PreprocessError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HeaderMode {
    /// Treat the first row as a header when every cell is non-empty and
    /// non-numeric.
    #[default]
    Auto,
    Yes,
    No,
}

impl HeaderMode {
    pub fn parse(s: &str) -> Result<Self, PreprocessError> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" | "" => Ok(HeaderMode::Auto),
            "yes" => Ok(HeaderMode::Yes),
            "no" => Ok(HeaderMode::No),
            other => Err(PreprocessError::InvalidOptions(format!(
                "csv has_header must be auto|yes|no, got `{other}`"
            ))),
        }
    }
}

/// Column selection knobs for CSV ingestion.
///
/// Columns are addressed by header name, or 1-based index when there is no
/// header (indices also work with a header). `meta_cols` become chunk
/// metadata; the remaining columns — optionally narrowed by `include_cols` —
/// are rendered into the chunk text as `key: value` pairs.
#[derive(Debug, Clone, Default)]
pub struct CsvOptions {
    pub has_header: HeaderMode,
    pub meta_cols: Vec<String>,
    pub include_cols: Vec<String>,
}

impl CsvOptions {
    /// Builds options from the raw transport knobs (comma-separated lists).
    pub fn from_knobs(
        has_header: Option<&str>,
        meta_cols: Option<&str>,
        include_cols: Option<&str>,
    ) -> Result<Self, PreprocessError> {
        let split = |s: Option<&str>| -> Vec<String> {
            s.unwrap_or("")
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect()
        };
        Ok(CsvOptions {
            has_header: HeaderMode::parse(has_header.unwrap_or("auto"))?,
            meta_cols: split(meta_cols),
            include_cols: split(include_cols),
        })
    }
}

pub fn chunk_csv(
    docid: &DocId,
    bytes: &[u8],
    opts: &CsvOptions,
) -> Result<Vec<ChunkRecord>, PreprocessError> {
    let mut rdr = ReaderBuilder::new().has_headers(false).flexible(true).from_reader(bytes);
    let mut rows: Vec<StringRecord> = Vec::new();
    for rec in rdr.records() {
        rows.push(rec.map_err(|e| PreprocessError::Parse { format: "csv", message: e.to_string() })?);
    }
    if rows.is_empty() {
        return Ok(Vec::new());
    }

    let has_header = match opts.has_header {
        HeaderMode::Yes => true,
        HeaderMode::No => false,
        HeaderMode::Auto => looks_like_header(&rows[0]),
    };
    let header: Vec<String> = if has_header {
        rows[0].iter().map(str::to_string).collect()
    } else {
        (0..rows[0].len()).map(|i| format!("col_{i}")).collect()
    };
    let data = if has_header { &rows[1..] } else { &rows[..] };

    let meta_idx = resolve_columns(&opts.meta_cols, &header, has_header)?;
    let include_idx = if opts.include_cols.is_empty() {
        None
    } else {
        Some(resolve_columns(&opts.include_cols, &header, has_header)?)
    };

    let mut out = Vec::new();
    let mut ordinal = 1u32;
    for (row_no, row) in data.iter().enumerate() {
        let mut parts: Vec<String> = Vec::new();
        let mut extra: BTreeMap<String, Value> = BTreeMap::new();
        for (j, cell) in row.iter().enumerate() {
            let key = header.get(j).cloned().unwrap_or_else(|| format!("col_{j}"));
            if meta_idx.contains(&j) {
                extra.insert(key, Value::String(cell.to_string()));
                continue;
            }
            if let Some(include) = &include_idx {
                if !include.contains(&j) {
                    continue;
                }
            }
            parts.push(format!("{key}: {cell}"));
        }
        out.push(ChunkRecord {
            rid: Rid::new(docid, ordinal),
            docid: docid.clone(),
            ordinal,
            text: parts.join("; "),
            meta: ChunkMeta { row: Some(row_no as u64 + 1), extra, ..Default::default() },
        });
        ordinal += 1;
    }
    Ok(out)
}

fn looks_like_header(first: &StringRecord) -> bool {
    first.len() > 0
        && first
            .iter()
            .all(|c| !c.trim().is_empty() && c.trim().parse::<f64>().is_err())
}

/// Maps column specifiers to 0-based indices. A numeric token is a 1-based
/// index; anything else is a header name and requires a header row.
fn resolve_columns(
    spec: &[String],
    header: &[String],
    has_header: bool,
) -> Result<Vec<usize>, PreprocessError> {
    let mut out = Vec::new();
    for tok in spec {
        if let Ok(n) = tok.parse::<usize>() {
            if n == 0 {
                return Err(PreprocessError::InvalidOptions(
                    "csv column indices are 1-based".to_string(),
                ));
            }
            out.push(n - 1);
            continue;
        }
        if !has_header {
            return Err(PreprocessError::InvalidOptions(format!(
                "csv column `{tok}` is addressed by name but the file has no header row"
            )));
        }
        match header.iter().position(|h| h == tok) {
            Some(j) => out.push(j),
            None => {
                return Err(PreprocessError::InvalidOptions(format!(
                    "csv column `{tok}` not found in header"
                )))
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc() -> DocId {
        DocId("D".into())
    }

    #[test]
    fn header_columns_become_keys_and_meta_cols_leave_the_text() {
        let opts = CsvOptions {
            has_header: HeaderMode::Yes,
            meta_cols: vec!["b".into()],
            include_cols: vec![],
        };
        let chunks = chunk_csv(&doc(), b"a,b,c\nx,metaY,z\n", &opts).expect("valid csv");
        assert_eq!(chunks.len(), 1);
        let c = &chunks[0];
        assert_eq!(c.rid.0, "D::1");
        assert!(c.text.contains("a: x"));
        assert!(c.text.contains("c: z"));
        assert!(!c.text.contains("b:"));
        assert_eq!(c.meta.extra["b"], Value::String("metaY".into()));
        assert_eq!(c.meta.row, Some(1));
    }

    #[test]
    fn indices_work_without_a_header_and_keys_are_synthesised() {
        let opts = CsvOptions {
            has_header: HeaderMode::No,
            meta_cols: vec!["2".into()],
            include_cols: vec!["1".into(), "3".into()],
        };
        let chunks = chunk_csv(&doc(), b"x,metaY,z\n", &opts).expect("valid csv");
        assert_eq!(chunks.len(), 1);
        let c = &chunks[0];
        assert!(c.text.contains("col_0: x"));
        assert!(c.text.contains("col_2: z"));
        assert!(!c.text.contains("col_1"));
        assert_eq!(c.meta.extra["col_1"], Value::String("metaY".into()));
    }

    #[test]
    fn names_without_a_header_are_refused() {
        let opts = CsvOptions {
            has_header: HeaderMode::No,
            meta_cols: vec!["b".into()],
            include_cols: vec![],
        };
        let err = chunk_csv(&doc(), b"x,metaY,z\n", &opts).unwrap_err();
        assert!(matches!(err, PreprocessError::InvalidOptions(_)));
    }

    #[test]
    fn auto_header_detection() {
        // all-text first row -> header
        let chunks =
            chunk_csv(&doc(), b"name,size\nwidget,10\n", &CsvOptions::default()).unwrap();
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].text.contains("name: widget"));

        // numeric first row -> data
        let chunks = chunk_csv(&doc(), b"1,2\n3,4\n", &CsvOptions::default()).unwrap();
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].text.contains("col_0: 1"));
    }

    #[test]
    fn row_numbers_count_data_rows() {
        let chunks = chunk_csv(
            &doc(),
            b"h1,h2\na,b\nc,d\n",
            &CsvOptions { has_header: HeaderMode::Yes, ..Default::default() },
        )
        .unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].meta.row, Some(1));
        assert_eq!(chunks[1].meta.row, Some(2));
        assert_eq!(chunks[1].rid.0, "D::2");
    }

    #[test]
    fn from_knobs_splits_lists_and_validates_mode() {
        let opts = CsvOptions::from_knobs(Some("yes"), Some("a, b"), Some("")).unwrap();
        assert_eq!(opts.has_header, HeaderMode::Yes);
        assert_eq!(opts.meta_cols, vec!["a".to_string(), "b".to_string()]);
        assert!(opts.include_cols.is_empty());
        assert!(CsvOptions::from_knobs(Some("maybe"), None, None).is_err());
    }
}
