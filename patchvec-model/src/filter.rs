//! Filter expression model.
//!
//! A filter is a mapping from field name to one or more value specifiers.
//! Specifiers are parsed into a closed [`Atom`] enum and evaluated by
//! dispatching on the tag; no expression strings are ever interpreted.
//!
//! Specifier grammar (per value string):
//! - `value` — literal equality
//! - `!value` / `!=value` — negated literal
//! - `value*`, `*value`, `*value*` — prefix / suffix / substring wildcard
//! - `>n`, `>=n`, `<n`, `<=n` — numeric or ISO-8601 comparison
//!
//! A JSON array of specifiers is an OR within the field; distinct fields
//! combine with AND.

use std::collections::BTreeMap;

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("filter field `{0}` must match [A-Za-z0-9_]+")]
    BadField(String),
    #[error("filter value for `{field}` must be a scalar or a list of scalars")]
    BadValue { field: String },
    #[error("empty comparison value in filter for `{0}`")]
    EmptyComparison(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    pub fn as_str(self) -> &'static str {
        match self {
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
        }
    }
}

/// One value specifier, tagged by operator.
#[derive(Debug, Clone, PartialEq)]
pub enum Atom {
    Eq(String),
    Ne(String),
    Prefix(String),
    Suffix(String),
    Contains(String),
    Cmp { op: CmpOp, value: String },
}

impl Atom {
    /// Non-negated literal equality; the only shape eligible for backend
    /// pre-filtering alongside single negations.
    pub fn is_literal(&self) -> bool {
        matches!(self, Atom::Eq(_))
    }

    pub fn parse(raw: &str) -> Atom {
        if let Some(rest) = raw.strip_prefix(">=") {
            return Atom::Cmp { op: CmpOp::Ge, value: rest.trim().to_string() };
        }
        if let Some(rest) = raw.strip_prefix("<=") {
            return Atom::Cmp { op: CmpOp::Le, value: rest.trim().to_string() };
        }
        if let Some(rest) = raw.strip_prefix('>') {
            return Atom::Cmp { op: CmpOp::Gt, value: rest.trim().to_string() };
        }
        if let Some(rest) = raw.strip_prefix('<') {
            return Atom::Cmp { op: CmpOp::Lt, value: rest.trim().to_string() };
        }
        if let Some(rest) = raw.strip_prefix("!=") {
            return Atom::Ne(rest.to_string());
        }
        if let Some(rest) = raw.strip_prefix('!') {
            return Atom::Ne(rest.to_string());
        }
        let starts = raw.starts_with('*');
        let ends = raw.ends_with('*') && raw.len() > 1;
        match (starts, ends) {
            (true, true) => Atom::Contains(raw[1..raw.len() - 1].to_string()),
            (true, false) => Atom::Suffix(raw[1..].to_string()),
            (false, true) => Atom::Prefix(raw[..raw.len() - 1].to_string()),
            (false, false) => Atom::Eq(raw.to_string()),
        }
    }
}

/// Parsed filter expression: field → OR-list of atoms.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterSpec {
    pub fields: BTreeMap<String, Vec<Atom>>,
}

impl FilterSpec {
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Parses the wire-level filter object. Field names are restricted to
    /// `[A-Za-z0-9_]+` up front so that everything reaching the planner is
    /// already safe to name in a backend query.
    pub fn from_json(filters: &serde_json::Map<String, Value>) -> Result<Self, FilterError> {
        let mut fields = BTreeMap::new();
        for (field, value) in filters {
            if !field_name_ok(field) {
                return Err(FilterError::BadField(field.clone()));
            }
            let mut atoms = Vec::new();
            match value {
                Value::Array(items) => {
                    for item in items {
                        atoms.push(atom_from_scalar(field, item)?);
                    }
                }
                other => atoms.push(atom_from_scalar(field, other)?),
            }
            for atom in &atoms {
                if let Atom::Cmp { value, .. } = atom {
                    if value.is_empty() {
                        return Err(FilterError::EmptyComparison(field.clone()));
                    }
                }
            }
            if !atoms.is_empty() {
                fields.insert(field.clone(), atoms);
            }
        }
        Ok(FilterSpec { fields })
    }
}

pub fn field_name_ok(field: &str) -> bool {
    !field.is_empty() && field.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Stringifies a JSON scalar the way filters and indexed fields see it.
pub fn scalar_to_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn atom_from_scalar(field: &str, v: &Value) -> Result<Atom, FilterError> {
    match scalar_to_string(v) {
        Some(s) => Ok(Atom::parse(&s)),
        None => Err(FilterError::BadValue { field: field.to_string() }),
    }
}
