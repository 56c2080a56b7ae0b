//! Hybrid filter planner.
//!
//! Splits a parsed [`FilterSpec`] into a backend *pre-filter* (rendered as a
//! sanitised `[field] = 'value'` clause the vector backend can push into its
//! SQL-like query) and an in-process *post-filter* evaluated against
//! hydrated metadata. The pre-filter is always a necessary condition of the
//! full expression: anything the backend cannot express natively is routed
//! to the post-filter, never dropped.

use std::collections::BTreeMap;

use patchvec_model::filter::{field_name_ok, scalar_to_string, Atom, CmpOp, FilterSpec};
use serde_json::Value;

use crate::StoreError;

/// Which operators the backend evaluates natively. Anything outside the
/// enabled set routes to the post-filter.
#[derive(Debug, Clone, Copy)]
pub struct BackendCaps {
    pub eq: bool,
    pub ne: bool,
}

impl Default for BackendCaps {
    fn default() -> Self {
        Self { eq: true, ne: true }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FilterPlan {
    /// Rendered pre-filter clause, e.g. `[lang] = 'en' AND [kind] <> 'draft'`.
    pub pre_sql: Option<String>,
    /// Fields satisfied by the pre-filter (used for match_reason).
    pub pre_fields: Vec<String>,
    /// Residual expression evaluated in-process after hydration.
    pub post: FilterSpec,
}

impl FilterPlan {
    pub fn has_post(&self) -> bool {
        !self.post.is_empty()
    }
}

/// Classifies every field of `spec` as pre or post.
///
/// Routing rules: an OR-list made solely of non-negated literals goes pre
/// (rendered with `=`/`OR`); a single negated literal goes pre with `<>`;
/// wildcards, comparisons, and mixed lists go post.
pub fn plan_filters(spec: &FilterSpec, caps: &BackendCaps) -> Result<FilterPlan, StoreError> {
    let mut clauses: Vec<String> = Vec::new();
    let mut pre_fields: Vec<String> = Vec::new();
    let mut post = FilterSpec::default();

    for (field, atoms) in &spec.fields {
        sanitize_field(field)?;
        let all_literal = atoms.iter().all(Atom::is_literal);
        if all_literal && caps.eq {
            let rendered: Vec<String> = atoms
                .iter()
                .map(|a| match a {
                    Atom::Eq(v) => format!("[{field}] = {}", quote_literal(v)),
                    _ => unreachable!("all_literal guarantees Eq"),
                })
                .collect();
            clauses.push(if rendered.len() == 1 {
                rendered.into_iter().next().expect("one rendered clause")
            } else {
                format!("({})", rendered.join(" OR "))
            });
            pre_fields.push(field.clone());
            continue;
        }
        if let [Atom::Ne(v)] = atoms.as_slice() {
            if caps.ne {
                clauses.push(format!("[{field}] <> {}", quote_literal(v)));
                pre_fields.push(field.clone());
                continue;
            }
        }
        post.fields.insert(field.clone(), atoms.clone());
    }

    let pre_sql = if clauses.is_empty() { None } else { Some(clauses.join(" AND ")) };
    Ok(FilterPlan { pre_sql, pre_fields, post })
}

/// Rejects any field name that could not appear verbatim in a backend query.
pub fn sanitize_field(field: &str) -> Result<(), StoreError> {
    if field_name_ok(field) {
        Ok(())
    } else {
        Err(StoreError::InvalidFilter(format!(
            "field `{field}` must match [A-Za-z0-9_]+"
        )))
    }
}

/// Single-quotes a literal for the backend query, doubling embedded quotes.
pub fn quote_literal(v: &str) -> String {
    format!("'{}'", v.replace('\'', "''"))
}

/// Evaluates the post-filter against one hit's merged metadata.
///
/// OR within a field, AND across fields. A field absent from the metadata
/// fails the filter: an expression is never silently dropped.
pub fn post_filter_matches(post: &FilterSpec, meta: &BTreeMap<String, Value>) -> bool {
    for (field, atoms) in &post.fields {
        let Some(value) = meta.get(field) else {
            return false;
        };
        let Some(have) = scalar_to_string(value) else {
            return false;
        };
        if !atoms.iter().any(|a| atom_matches(a, &have)) {
            return false;
        }
    }
    true
}

fn atom_matches(atom: &Atom, have: &str) -> bool {
    match atom {
        Atom::Eq(want) => have == want,
        Atom::Ne(want) => have != want,
        Atom::Prefix(want) => have.starts_with(want.as_str()),
        Atom::Suffix(want) => have.ends_with(want.as_str()),
        Atom::Contains(want) => have.contains(want.as_str()),
        Atom::Cmp { op, value } => compare(have, value, *op),
    }
}

/// Ordered comparison: numeric when both sides parse as numbers, otherwise
/// lexicographic for ISO-8601 date/datetime strings (which sort correctly
/// as text). Incomparable pairs never match.
fn compare(have: &str, want: &str, op: CmpOp) -> bool {
    if let (Ok(a), Ok(b)) = (have.trim().parse::<f64>(), want.trim().parse::<f64>()) {
        return match a.partial_cmp(&b) {
            Some(ord) => cmp_holds(op, ord),
            None => false,
        };
    }
    if looks_like_iso_date(have) && looks_like_iso_date(want) {
        return cmp_holds(op, have.cmp(want));
    }
    false
}

fn cmp_holds(op: CmpOp, ord: std::cmp::Ordering) -> bool {
    use std::cmp::Ordering::*;
    match op {
        CmpOp::Lt => ord == Less,
        CmpOp::Le => ord != Greater,
        CmpOp::Gt => ord == Greater,
        CmpOp::Ge => ord != Less,
    }
}

fn looks_like_iso_date(s: &str) -> bool {
    let b = s.as_bytes();
    b.len() >= 10
        && b[0..4].iter().all(u8::is_ascii_digit)
        && b[4] == b'-'
        && b[5..7].iter().all(u8::is_ascii_digit)
        && b[7] == b'-'
        && b[8..10].iter().all(u8::is_ascii_digit)
}
