use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use nodereaper_core::{PolicyConfig, Reason, SkipCause, Verdict};
use serde::Serialize;

/// Node-level mutation kinds.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    Delete,
    FinalizerCleanup,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Delete => "delete",
            Action::FinalizerCleanup => "finalizer-cleanup",
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct NodeError {
    pub node: String,
    pub action: Action,
    pub message: String,
}

/// What was decided (and, outside dry-run, done) for one node.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct NodeDecision {
    pub node: String,
    pub verdict: Verdict,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub finalizers_removed: Vec<String>,
}

/// Per-node result handed to the collector.
#[derive(Debug)]
pub(crate) struct NodeReport {
    pub node: String,
    pub verdict: Verdict,
    pub deleted: bool,
    pub finalizers_removed: Vec<String>,
    pub errors: Vec<NodeError>,
}

/// Aggregated outcome of one run. In dry-run the counters describe what would
/// have been done.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub cluster: String,
    pub dry_run: bool,
    pub nodes_total: usize,
    pub evaluated: usize,
    /// Nodes never started because the run was cancelled.
    pub not_started: usize,
    pub deleted: BTreeMap<Reason, usize>,
    pub skipped: BTreeMap<SkipCause, usize>,
    pub finalizer_cleanups: usize,
    pub finalizers_removed: usize,
    pub decisions: Vec<NodeDecision>,
    pub errors: Vec<NodeError>,
    pub duration_ms: u64,
}

impl RunSummary {
    pub(crate) fn new(config: &PolicyConfig, nodes_total: usize) -> Self {
        Self { cluster: config.cluster_name.clone(), dry_run: config.dry_run, nodes_total, ..Default::default() }
    }

    pub(crate) fn record(&mut self, report: NodeReport) {
        self.evaluated += 1;
        match report.verdict {
            Verdict::Skip(cause) => *self.skipped.entry(cause).or_default() += 1,
            Verdict::Delete(reason) | Verdict::TakeoverDelete(reason) => {
                if report.deleted {
                    *self.deleted.entry(reason).or_default() += 1;
                }
            }
        }
        if !report.finalizers_removed.is_empty() {
            self.finalizer_cleanups += 1;
            self.finalizers_removed += report.finalizers_removed.len();
        }
        self.errors.extend(report.errors);
        self.decisions.push(NodeDecision {
            node: report.node,
            verdict: report.verdict,
            finalizers_removed: report.finalizers_removed,
        });
    }

    pub(crate) fn finish(&mut self, elapsed: Duration) {
        self.decisions.sort_by(|a, b| a.node.cmp(&b.node));
        self.errors.sort_by(|a, b| a.node.cmp(&b.node));
        self.duration_ms = elapsed.as_millis() as u64;
    }

    pub fn deletions(&self) -> usize { self.deleted.values().sum() }

    pub fn has_failures(&self) -> bool { !self.errors.is_empty() }

    pub fn is_complete(&self) -> bool { self.not_started == 0 }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = if self.dry_run { " (dry run)" } else { "" };
        writeln!(f, "cluster {}{}: {}/{} nodes evaluated in {}ms", self.cluster, mode, self.evaluated, self.nodes_total, self.duration_ms)?;
        for d in &self.decisions {
            write!(f, "  {:<40} {}", d.node, d.verdict)?;
            if !d.finalizers_removed.is_empty() {
                write!(f, "  finalizers: {}", d.finalizers_removed.join(","))?;
            }
            writeln!(f)?;
        }
        writeln!(
            f,
            "deleted: {}  skipped: {}  finalizer cleanups: {}  errors: {}",
            self.deletions(),
            self.skipped.values().sum::<usize>(),
            self.finalizer_cleanups,
            self.errors.len()
        )?;
        for e in &self.errors {
            writeln!(f, "  error {} {}: {}", e.action.as_str(), e.node, e.message)?;
        }
        if self.not_started > 0 {
            writeln!(f, "not started: {}", self.not_started)?;
        }
        Ok(())
    }
}
