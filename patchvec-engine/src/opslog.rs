//! Operational event stream: one JSON line per business operation.
//!
//! Emission is best-effort and lossy under contention or oversized lines;
//! the drop counter records what was shed. The developer log (`tracing`)
//! is a separate channel.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::Serialize;

/// Hard cap per line; anything larger is dropped, not truncated.
const MAX_LINE_BYTES: usize = 8 * 1024;

#[derive(Debug, Default, Serialize)]
pub struct OpsEvent {
    pub op: &'static str,
    pub tenant: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
    pub latency_ms: f64,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub k: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hits: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunks: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

#[derive(Serialize)]
struct Stamped<'a> {
    ts: String,
    #[serde(flatten)]
    event: &'a OpsEvent,
}

enum Sink {
    Disabled,
    Stdout,
    File(Mutex<File>),
}

pub struct OpsLog {
    sink: Sink,
    dropped: AtomicU64,
}

impl OpsLog {
    /// `dest` is `None`/`"null"` (disabled), `"stdout"`, or a file path
    /// opened in append mode.
    pub fn new(dest: Option<&str>) -> std::io::Result<Self> {
        let sink = match dest.map(str::trim) {
            None | Some("") | Some("null") | Some("none") => Sink::Disabled,
            Some("stdout") => Sink::Stdout,
            Some(path) => {
                let file = OpenOptions::new().create(true).append(true).open(path)?;
                Sink::File(Mutex::new(file))
            }
        };
        Ok(Self { sink, dropped: AtomicU64::new(0) })
    }

    pub fn enabled(&self) -> bool {
        !matches!(self.sink, Sink::Disabled)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn emit(&self, event: &OpsEvent) {
        if let Sink::Disabled = self.sink {
            return;
        }
        let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string();
        let line = match serde_json::to_string(&Stamped { ts, event }) {
            Ok(l) => l,
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        if line.len() + 1 > MAX_LINE_BYTES {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        match &self.sink {
            Sink::Disabled => {}
            Sink::Stdout => {
                let mut out = std::io::stdout().lock();
                let _ = writeln!(out, "{line}");
            }
            Sink::File(handle) => match handle.try_lock() {
                Ok(mut f) => {
                    if writeln!(f, "{line}").is_err() {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                }
                // Lossy under backpressure: never block an operation on the
                // log stream.
                Err(_) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
            },
        }
    }
}
