//! Hybrid filter behavior end-to-end: pre-filter routing, post-filter
//! routing with overfetch, and the pre/post subset contract.

use std::collections::BTreeSet;
use std::path::Path;

use patchvec_engine::{
    Config, CsvOptions, Engine, ErrorCode, HeaderMode, IngestOptions, IngestSource, SearchRequest,
};
use serde_json::json;
use tempfile::TempDir;

fn engine(dir: &Path) -> Engine {
    let mut cfg = Config::default();
    cfg.vector_store.data_dir = dir.to_path_buf();
    cfg.embedder.dimension = 64;
    Engine::build(cfg).expect("engine builds")
}

fn req(q: &str, k: usize, filters: Option<serde_json::Value>) -> SearchRequest {
    SearchRequest {
        q: q.to_string(),
        k,
        filters: filters.and_then(|f| f.as_object().cloned()),
        request_id: None,
    }
}

fn rid_set(outcome: &patchvec_engine::SearchOutcome) -> BTreeSet<String> {
    outcome.matches.iter().map(|m| m.id.0.clone()).collect()
}

/// Two TXT documents with shared vocabulary and distinct `lang` metadata.
fn seed_lang_docs(eng: &Engine) {
    eng.create_collection("t", "c").expect("create");
    for (docid, lang, text) in [
        ("A", "en", "water flows over the stones in the northern river"),
        ("B", "pt", "water runs through the canal near the southern river"),
    ] {
        eng.ingest_document(
            "t",
            "c",
            IngestSource { filename: "d.txt", content_type: Some("text/plain"), bytes: text.as_bytes() },
            IngestOptions {
                docid: Some(docid.into()),
                metadata: json!({"lang": lang}).as_object().cloned(),
                ..Default::default()
            },
        )
        .expect("ingest");
    }
}

#[test]
fn equality_filter_routes_to_the_backend() {
    let dir = TempDir::new().expect("tempdir");
    let eng = engine(dir.path());
    seed_lang_docs(&eng);

    let outcome = eng
        .search("t", "c", req("water", 10, Some(json!({"lang": "en"}))))
        .expect("search");
    assert_eq!(rid_set(&outcome), BTreeSet::from(["A::1".to_string()]));
    assert!(outcome.matches[0].match_reason.contains("lang=en"));
}

#[test]
fn negated_filter_routes_to_the_backend() {
    let dir = TempDir::new().expect("tempdir");
    let eng = engine(dir.path());
    seed_lang_docs(&eng);

    let outcome = eng
        .search("t", "c", req("water", 10, Some(json!({"lang": "!en"}))))
        .expect("search");
    assert_eq!(rid_set(&outcome), BTreeSet::from(["B::1".to_string()]));
}

#[test]
fn numeric_comparison_routes_to_the_post_filter() {
    let dir = TempDir::new().expect("tempdir");
    let eng = engine(dir.path());
    eng.create_collection("t", "rows").expect("create");

    let csv = "body\nrow one about water\nrow two about water\nrow three about water\nrow four about water\n";
    eng.ingest_document(
        "t",
        "rows",
        IngestSource { filename: "r.csv", content_type: Some("text/csv"), bytes: csv.as_bytes() },
        IngestOptions {
            docid: Some("R".into()),
            csv: Some(CsvOptions { has_header: HeaderMode::Yes, ..Default::default() }),
            ..Default::default()
        },
    )
    .expect("ingest");

    let outcome = eng
        .search("t", "rows", req("water", 10, Some(json!({"row": ">2"}))))
        .expect("search");
    assert_eq!(
        rid_set(&outcome),
        BTreeSet::from(["R::3".to_string(), "R::4".to_string()])
    );
    for m in &outcome.matches {
        assert!(m.meta["row"].as_u64().expect("row meta") > 2);
        assert!(m.match_reason.contains("row>2"));
    }
}

#[test]
fn wildcard_or_list_is_an_or_within_the_field() {
    let dir = TempDir::new().expect("tempdir");
    let eng = engine(dir.path());
    eng.create_collection("t", "c").expect("create");
    for (docid, name) in [("1", "foobar"), ("2", "fooqux"), ("3", "bazbar"), ("4", "zulu")] {
        eng.ingest_document(
            "t",
            "c",
            IngestSource {
                filename: "d.txt",
                content_type: Some("text/plain"),
                bytes: b"shared searchable words",
            },
            IngestOptions {
                docid: Some(docid.into()),
                metadata: json!({"name": name}).as_object().cloned(),
                ..Default::default()
            },
        )
        .expect("ingest");
    }

    let outcome = eng
        .search("t", "c", req("shared words", 10, Some(json!({"name": ["foo*", "*bar"]}))))
        .expect("search");
    assert_eq!(
        rid_set(&outcome),
        BTreeSet::from(["1::1".to_string(), "2::1".to_string(), "3::1".to_string()])
    );
}

#[test]
fn post_filter_results_are_a_subset_of_pre_filter_results() {
    let dir = TempDir::new().expect("tempdir");
    let eng = engine(dir.path());
    eng.create_collection("t", "rows").expect("create");

    for (docid, lang) in [("T", "en"), ("U", "pt")] {
        let csv = "body\nwater one\nwater two\nwater three\nwater four\nwater five\n";
        eng.ingest_document(
            "t",
            "rows",
            IngestSource { filename: "r.csv", content_type: Some("text/csv"), bytes: csv.as_bytes() },
            IngestOptions {
                docid: Some(docid.into()),
                metadata: json!({"lang": lang}).as_object().cloned(),
                csv: Some(CsvOptions { has_header: HeaderMode::Yes, ..Default::default() }),
                ..Default::default()
            },
        )
        .expect("ingest");
    }

    let unfiltered = eng.search("t", "rows", req("water", 20, None)).expect("unfiltered");
    let pre = eng
        .search("t", "rows", req("water", 20, Some(json!({"lang": "en"}))))
        .expect("pre-filtered");
    let both = eng
        .search("t", "rows", req("water", 20, Some(json!({"lang": "en", "row": ">3"}))))
        .expect("pre+post filtered");

    let all = rid_set(&unfiltered);
    let pre_set = rid_set(&pre);
    let both_set = rid_set(&both);

    assert_eq!(all.len(), 10);
    assert_eq!(pre_set.len(), 5);
    assert_eq!(both_set, BTreeSet::from(["T::4".to_string(), "T::5".to_string()]));
    assert!(pre_set.is_subset(&all));
    assert!(both_set.is_subset(&pre_set));
}

#[test]
fn malformed_filters_fail_with_invalid_filter() {
    let dir = TempDir::new().expect("tempdir");
    let eng = engine(dir.path());
    seed_lang_docs(&eng);

    let err = eng
        .search("t", "c", req("water", 5, Some(json!({"bad field": "x"}))))
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidFilter);

    let err = eng
        .search("t", "c", req("water", 5, Some(json!({"size": ">"}))))
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidFilter);
}

#[test]
fn filter_on_an_unknown_field_matches_nothing() {
    let dir = TempDir::new().expect("tempdir");
    let eng = engine(dir.path());
    seed_lang_docs(&eng);

    let outcome = eng
        .search("t", "c", req("water", 10, Some(json!({"nonexistent": "*x*"}))))
        .expect("search");
    assert!(outcome.matches.is_empty());
}

#[test]
fn quoted_literals_cannot_escape_the_pre_filter() {
    let dir = TempDir::new().expect("tempdir");
    let eng = engine(dir.path());
    seed_lang_docs(&eng);

    // a literal full of SQL noise simply matches nothing
    let outcome = eng
        .search(
            "t",
            "c",
            req("water", 10, Some(json!({"lang": "en'; DELETE FROM records; --"}))),
        )
        .expect("search survives hostile literal");
    assert!(outcome.matches.is_empty());

    // and the data is still there afterwards
    let outcome = eng
        .search("t", "c", req("water", 10, Some(json!({"lang": "en"}))))
        .expect("search");
    assert_eq!(outcome.matches.len(), 1);
}

#[test]
fn zero_timeout_degrades_gracefully() {
    let dir = TempDir::new().expect("tempdir");
    let mut cfg = Config::default();
    cfg.vector_store.data_dir = dir.path().to_path_buf();
    cfg.embedder.dimension = 64;
    cfg.limits.search.timeout_ms = 0;
    let eng = Engine::build(cfg).expect("engine builds");
    eng.create_collection("t", "c").expect("create");

    // no candidates at all -> timeout
    let err = eng.search("t", "c", req("anything", 5, None)).unwrap_err();
    assert_eq!(err.code, ErrorCode::Timeout);

    // with candidates -> partial result flagged truncated, not an error
    eng.ingest_document(
        "t",
        "c",
        IngestSource { filename: "d.txt", content_type: Some("text/plain"), bytes: b"water water" },
        IngestOptions { docid: Some("D".into()), ..Default::default() },
    )
    .expect("ingest");
    let outcome = eng.search("t", "c", req("water", 5, None)).expect("truncated search");
    assert!(outcome.truncated);
}
