//! Nested performance ranges.
//!
//! ```text
//!   push_range("run")                       ─┐
//!     push_range("pipeline")                 │ stack grows
//!       push_range("batch", batch_idx=0)     │
//!         push_range("preprocess") / pop     │
//!       pop_range(token, items=4)            │
//!     pop_range(token, items=N)              │
//!   pop_range(token, 0)                     ─┘
//!   finalize() ─▶ PerfReport (one entry per range path, e.g. run.pipeline.batch)
//! ```
//!
//! Ranges are strictly LIFO.  [`PerfRecorder::push_range`] returns a
//! [`RangeToken`] that must be handed back to [`PerfRecorder::pop_range`];
//! popping anything but the innermost open range is an instrumentation
//! error, and so is finalizing with ranges still open.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info};

use crate::error::{EngineError, Result};

/// Proof that a range was opened.  Consumed by [`PerfRecorder::pop_range`].
#[must_use = "a pushed range must be popped"]
#[derive(Debug)]
pub struct RangeToken {
    id: u64,
    depth: usize,
}

struct OpenRange {
    id: u64,
    path: String,
    started: Instant,
}

#[derive(Default)]
struct RangeStats {
    depth: usize,
    count: u64,
    total: Duration,
    min: Option<Duration>,
    max: Duration,
    items: u64,
}

/// Stack of open ranges plus per-path aggregates.
pub struct PerfRecorder {
    name: String,
    created: Instant,
    next_id: u64,
    stack: Vec<OpenRange>,
    entries: BTreeMap<String, RangeStats>,
    finalized: bool,
}

impl PerfRecorder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            created: Instant::now(),
            next_id: 0,
            stack: Vec::new(),
            entries: BTreeMap::new(),
            finalized: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Currently open ranges.
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Open a range nested inside the innermost open one.
    ///
    /// `tags` are attached to the range's trace event (e.g. `batch_idx`).
    pub fn push_range(&mut self, name: &str, tags: &[(&str, serde_json::Value)]) -> RangeToken {
        let path = match self.stack.last() {
            Some(parent) => format!("{}.{name}", parent.path),
            None => name.to_string(),
        };
        if !tags.is_empty() {
            let tags: serde_json::Map<String, serde_json::Value> = tags
                .iter()
                .map(|(k, v)| ((*k).to_string(), v.clone()))
                .collect();
            debug!(range = %path, tags = %serde_json::Value::Object(tags), "push_range");
        } else {
            debug!(range = %path, "push_range");
        }

        let id = self.next_id;
        self.next_id += 1;
        self.stack.push(OpenRange {
            id,
            path,
            started: Instant::now(),
        });
        RangeToken {
            id,
            depth: self.stack.len(),
        }
    }

    /// Close the innermost range, attributing `total_items` processed items
    /// to it.  Returns the range's elapsed time.
    pub fn pop_range(&mut self, token: RangeToken, total_items: u64) -> Result<Duration> {
        let top = match self.stack.last() {
            Some(top) => top,
            None => {
                return Err(EngineError::Instrumentation(
                    "pop_range called with no open range".into(),
                ));
            }
        };
        if top.id != token.id || self.stack.len() != token.depth {
            return Err(EngineError::Instrumentation(format!(
                "pop_range out of LIFO order: innermost open range is '{}' (depth {}), \
token belongs to depth {}",
                top.path,
                self.stack.len(),
                token.depth
            )));
        }

        let Some(open) = self.stack.pop() else {
            return Err(EngineError::Instrumentation("range stack underflow".into()));
        };
        let elapsed = open.started.elapsed();
        let depth = self.stack.len();
        let stats = self.entries.entry(open.path).or_default();
        stats.depth = depth;
        stats.count += 1;
        stats.total += elapsed;
        stats.min = Some(stats.min.map_or(elapsed, |m| m.min(elapsed)));
        stats.max = stats.max.max(elapsed);
        stats.items += total_items;
        Ok(elapsed)
    }

    /// Aggregate all closed ranges into a report.
    ///
    /// Callable exactly once.  A recorder with no ranges yields an empty
    /// report; a recorder with open ranges yields an instrumentation error.
    pub fn finalize(&mut self) -> Result<PerfReport> {
        if self.finalized {
            return Err(EngineError::Instrumentation(format!(
                "perf recorder '{}' finalized twice",
                self.name
            )));
        }
        self.finalized = true;

        if !self.stack.is_empty() {
            let open: Vec<&str> = self.stack.iter().map(|r| r.path.as_str()).collect();
            return Err(EngineError::Instrumentation(format!(
                "{} range(s) still open at finalize: {}",
                open.len(),
                open.join(", ")
            )));
        }

        let entries = std::mem::take(&mut self.entries)
            .into_iter()
            .map(|(path, s)| {
                let total_ms = s.total.as_secs_f64() * 1e3;
                let secs = s.total.as_secs_f64();
                PerfEntry {
                    path,
                    depth: s.depth,
                    count: s.count,
                    total_ms,
                    mean_ms: if s.count > 0 {
                        total_ms / s.count as f64
                    } else {
                        0.0
                    },
                    min_ms: s.min.unwrap_or_default().as_secs_f64() * 1e3,
                    max_ms: s.max.as_secs_f64() * 1e3,
                    total_items: s.items,
                    items_per_sec: if secs > 0.0 {
                        s.items as f64 / secs
                    } else {
                        0.0
                    },
                }
            })
            .collect();

        Ok(PerfReport {
            name: self.name.clone(),
            wall_ms: self.created.elapsed().as_secs_f64() * 1e3,
            entries,
        })
    }
}

/// Aggregated statistics of one range path.
#[derive(Clone, Debug, Serialize)]
pub struct PerfEntry {
    /// Dot-joined range names from the outermost range, e.g.
    /// `run.pipeline.batch.inference`.
    pub path: String,
    pub depth: usize,
    pub count: u64,
    pub total_ms: f64,
    pub mean_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub total_items: u64,
    pub items_per_sec: f64,
}

/// Output of [`PerfRecorder::finalize`].
#[derive(Clone, Debug, Serialize)]
pub struct PerfReport {
    pub name: String,
    pub wall_ms: f64,
    /// One entry per distinct range *path*, not per range name: a name
    /// pushed under two different parents yields two entries.  Sorted by
    /// path.
    pub entries: Vec<PerfEntry>,
}

impl PerfReport {
    pub fn entry(&self, path: &str) -> Option<&PerfEntry> {
        self.entries.iter().find(|e| e.path == path)
    }

    /// Log one line per range path.
    pub fn emit(&self) {
        for e in &self.entries {
            info!(
                range = %e.path,
                count = e.count,
                mean_ms = format!("{:.3}", e.mean_ms),
                total_ms = format!("{:.3}", e.total_ms),
                items = e.total_items,
                items_per_sec = format!("{:.1}", e.items_per_sec),
                "Perf"
            );
        }
        info!(recorder = %self.name, wall_ms = format!("{:.1}", self.wall_ms), "Perf summary");
    }

    /// Default report location inside `dir`.
    pub fn default_path(&self, dir: &Path) -> PathBuf {
        dir.join(format!("perf_{}.json", self.name))
    }

    /// Write the report as pretty JSON.
    pub fn write_json(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).map_err(|e| {
            EngineError::Instrumentation(format!("perf report serialization failed: {e}"))
        })?;
        std::fs::write(path, json)?;
        Ok(())
    }
}
