//! Process-wide admission control.
//!
//! Atomic counters gate concurrent searches and ingests; an optional
//! per-tenant cap covers both kinds combined. Rejection is immediate
//! (`overloaded`), never queued.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Search,
    Ingest,
}

#[derive(Debug)]
pub struct Admission {
    max_searches: usize,
    max_ingests: usize,
    tenant_cap: Option<usize>,
    searches: AtomicUsize,
    ingests: AtomicUsize,
    per_tenant: Mutex<HashMap<String, usize>>,
}

impl Admission {
    pub fn new(max_searches: usize, max_ingests: usize, tenant_cap: Option<usize>) -> Arc<Self> {
        Arc::new(Self {
            max_searches: max_searches.max(1),
            max_ingests: max_ingests.max(1),
            tenant_cap,
            searches: AtomicUsize::new(0),
            ingests: AtomicUsize::new(0),
            per_tenant: Mutex::new(HashMap::new()),
        })
    }

    pub fn admit(self: &Arc<Self>, kind: OpKind, tenant: &str) -> Result<Permit> {
        let (counter, cap, what) = match kind {
            OpKind::Search => (&self.searches, self.max_searches, "searches"),
            OpKind::Ingest => (&self.ingests, self.max_ingests, "ingests"),
        };
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < cap).then_some(n + 1))
            .map_err(|_| {
                EngineError::overloaded(format!("too many concurrent {what} (limit {cap})"))
            })?;

        if let Some(tcap) = self.tenant_cap {
            let mut map = self.per_tenant.lock().expect("tenant map poisoned");
            let n = map.entry(tenant.to_string()).or_insert(0);
            if *n >= tcap {
                drop(map);
                counter.fetch_sub(1, Ordering::SeqCst);
                return Err(EngineError::overloaded(format!(
                    "tenant `{tenant}` exceeded its concurrency cap ({tcap})"
                )));
            }
            *n += 1;
        }

        Ok(Permit { admission: Arc::clone(self), kind, tenant: tenant.to_string() })
    }

    pub fn in_flight(&self, kind: OpKind) -> usize {
        match kind {
            OpKind::Search => self.searches.load(Ordering::SeqCst),
            OpKind::Ingest => self.ingests.load(Ordering::SeqCst),
        }
    }

    fn release(&self, kind: OpKind, tenant: &str) {
        match kind {
            OpKind::Search => self.searches.fetch_sub(1, Ordering::SeqCst),
            OpKind::Ingest => self.ingests.fetch_sub(1, Ordering::SeqCst),
        };
        if self.tenant_cap.is_some() {
            let mut map = self.per_tenant.lock().expect("tenant map poisoned");
            if let Some(n) = map.get_mut(tenant) {
                *n -= 1;
                if *n == 0 {
                    map.remove(tenant);
                }
            }
        }
    }
}

/// RAII admission slot; dropping it frees the slot.
#[derive(Debug)]
pub struct Permit {
    admission: Arc<Admission>,
    kind: OpKind,
    tenant: String,
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.admission.release(self.kind, &self.tenant);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn rejects_beyond_the_cap_and_recovers_on_drop() {
        let adm = Admission::new(2, 1, None);
        let p1 = adm.admit(OpKind::Search, "t").expect("first");
        let _p2 = adm.admit(OpKind::Search, "t").expect("second");
        let err = adm.admit(OpKind::Search, "t").unwrap_err();
        assert_eq!(err.code, ErrorCode::Overloaded);
        assert_eq!(adm.in_flight(OpKind::Search), 2);

        drop(p1);
        assert_eq!(adm.in_flight(OpKind::Search), 1);
        let _p3 = adm.admit(OpKind::Search, "t").expect("slot freed");
    }

    #[test]
    fn searches_and_ingests_are_gated_separately() {
        let adm = Admission::new(1, 1, None);
        let _s = adm.admit(OpKind::Search, "t").expect("search");
        let _i = adm.admit(OpKind::Ingest, "t").expect("ingest unaffected");
        assert!(adm.admit(OpKind::Ingest, "t").is_err());
    }

    #[test]
    fn tenant_cap_spans_both_kinds() {
        let adm = Admission::new(10, 10, Some(2));
        let _a = adm.admit(OpKind::Search, "alpha").expect("one");
        let _b = adm.admit(OpKind::Ingest, "alpha").expect("two");
        let err = adm.admit(OpKind::Search, "alpha").unwrap_err();
        assert_eq!(err.code, ErrorCode::Overloaded);
        // other tenants are unaffected
        let _c = adm.admit(OpKind::Search, "beta").expect("other tenant");
        // global counter was rolled back on the tenant rejection
        assert_eq!(adm.in_flight(OpKind::Search), 2);
    }
}
