//! Process-wide operation counters.
//!
//! The Prometheus exporter is a collaborator; the engine only maintains the
//! numbers and hands out a snapshot.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

#[derive(Debug)]
pub struct Counters {
    started: Instant,
    pub searches_total: AtomicU64,
    pub documents_indexed_total: AtomicU64,
    pub chunks_indexed_total: AtomicU64,
    pub collections_created_total: AtomicU64,
    pub collections_deleted_total: AtomicU64,
    pub purge_total: AtomicU64,
    pub errors_total: AtomicU64,
    pub overload_shed_total: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl Default for Counters {
    fn default() -> Self {
        Self {
            started: Instant::now(),
            searches_total: AtomicU64::new(0),
            documents_indexed_total: AtomicU64::new(0),
            chunks_indexed_total: AtomicU64::new(0),
            collections_created_total: AtomicU64::new(0),
            collections_deleted_total: AtomicU64::new(0),
            purge_total: AtomicU64::new(0),
            errors_total: AtomicU64::new(0),
            overload_shed_total: AtomicU64::new(0),
            last_error: Mutex::new(None),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CountersSnapshot {
    pub counters: BTreeMap<&'static str, u64>,
    pub uptime_seconds: f64,
    pub last_error: Option<String>,
}

impl Counters {
    pub fn record_error(&self, message: impl Into<String>) {
        self.errors_total.fetch_add(1, Ordering::Relaxed);
        *self.last_error.lock().expect("last_error poisoned") = Some(message.into());
    }

    pub fn snapshot(&self) -> CountersSnapshot {
        let mut counters = BTreeMap::new();
        counters.insert("searches_total", self.searches_total.load(Ordering::Relaxed));
        counters.insert(
            "documents_indexed_total",
            self.documents_indexed_total.load(Ordering::Relaxed),
        );
        counters.insert("chunks_indexed_total", self.chunks_indexed_total.load(Ordering::Relaxed));
        counters.insert(
            "collections_created_total",
            self.collections_created_total.load(Ordering::Relaxed),
        );
        counters.insert(
            "collections_deleted_total",
            self.collections_deleted_total.load(Ordering::Relaxed),
        );
        counters.insert("purge_total", self.purge_total.load(Ordering::Relaxed));
        counters.insert("errors_total", self.errors_total.load(Ordering::Relaxed));
        counters.insert("overload_shed_total", self.overload_shed_total.load(Ordering::Relaxed));
        CountersSnapshot {
            counters,
            uptime_seconds: self.started.elapsed().as_secs_f64(),
            last_error: self.last_error.lock().expect("last_error poisoned").clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_increments_and_last_error() {
        let c = Counters::default();
        c.searches_total.fetch_add(3, Ordering::Relaxed);
        c.record_error("boom");
        let snap = c.snapshot();
        assert_eq!(snap.counters["searches_total"], 3);
        assert_eq!(snap.counters["errors_total"], 1);
        assert_eq!(snap.last_error.as_deref(), Some("boom"));
    }
}
