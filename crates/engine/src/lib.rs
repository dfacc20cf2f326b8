//! NodeReaper engine: one reaping pass.
//!
//! A run takes a single snapshot of the cluster, evaluates every node
//! concurrently (bounded by the worker count) and funnels per-node reports into one
//! collector. Snapshot failures abort the run before anything is mutated;
//! per-node failures are recorded and the run moves on.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use metrics::{counter, histogram};
use nodereaper_core::{analyzer, finalizer, ConfigError, FinalizerAction, NodeRecord, PodRecord, PolicyConfig, Reason, SkipCause, Verdict};
use nodereaper_kubehub::{partition_by_node, ClusterSnapshot, SnapshotError};
use nodereaper_notify::{EventKind, NotificationDispatcher, NotificationEvent};
use nodereaper_ops::{DeleteOutcome, FinalizerOutcome, NodeOps};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

mod summary;

pub use summary::{Action, NodeDecision, NodeError, RunSummary};
use summary::NodeReport;

/// Reason attached to finalizer-cleanup notifications.
const STUCK_TERMINATING: &str = "stuck-terminating";

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

pub struct Reaper {
    snapshot: Arc<dyn ClusterSnapshot>,
    ops: Arc<dyn NodeOps>,
    notifier: NotificationDispatcher,
    workers: usize,
}

impl Reaper {
    pub fn new(
        snapshot: Arc<dyn ClusterSnapshot>,
        ops: Arc<dyn NodeOps>,
        notifier: NotificationDispatcher,
        workers: usize,
    ) -> Result<Self, ConfigError> {
        if workers == 0 {
            return Err(ConfigError::Invalid { field: "max_concurrency", reason: "must be at least 1".into() });
        }
        Ok(Self { snapshot, ops, notifier, workers })
    }

    pub async fn run(&self, config: &PolicyConfig, cancel: CancellationToken) -> Result<RunSummary, RunError> {
        self.run_at(config, Utc::now(), cancel).await
    }

    /// Same as [`Reaper::run`] with an explicit evaluation time.
    pub async fn run_at(
        &self,
        config: &PolicyConfig,
        now: DateTime<Utc>,
        cancel: CancellationToken,
    ) -> Result<RunSummary, RunError> {
        let started = Instant::now();
        for f in config.overlapping_finalizers() {
            warn!(finalizer = %f, "finalizer is both whitelisted and blacklisted; it will never be removed");
        }

        let version = self.snapshot.ping().await?;
        info!(cluster = %config.cluster_name, version = %version, dry_run = config.dry_run, "connected to cluster");
        let selector = config.selector_string();
        let nodes = self.snapshot.list_nodes(selector.as_deref()).await?;
        let by_node = partition_by_node(self.snapshot.list_pods().await?);
        info!(nodes = nodes.len(), workers = self.workers, "evaluating nodes");

        let mut summary = RunSummary::new(config, nodes.len());
        let cancel = &cancel;
        let by_node = &by_node;
        let mut reports = stream::iter(nodes.iter())
            .map(|node| async move {
                // In-flight nodes finish; nothing new starts after cancellation.
                if cancel.is_cancelled() {
                    return None;
                }
                let pods = by_node.get(&node.name).map(Vec::as_slice).unwrap_or(&[]);
                Some(self.process_node(node, pods, config, now).await)
            })
            .buffer_unordered(self.workers);
        while let Some(report) = reports.next().await {
            match report {
                Some(r) => summary.record(r),
                None => summary.not_started += 1,
            }
        }

        summary.finish(started.elapsed());
        histogram!("nodereaper_run_duration_ms", summary.duration_ms as f64);
        if !summary.is_complete() {
            warn!(not_started = summary.not_started, evaluated = summary.evaluated, "run cancelled before all nodes were evaluated");
        }
        info!(
            evaluated = summary.evaluated,
            deleted = summary.deletions(),
            finalizer_cleanups = summary.finalizer_cleanups,
            errors = summary.errors.len(),
            took_ms = summary.duration_ms,
            "run complete"
        );
        Ok(summary)
    }

    async fn process_node(&self, node: &NodeRecord, pods: &[PodRecord], config: &PolicyConfig, now: DateTime<Utc>) -> NodeReport {
        let verdict = analyzer::evaluate(node, pods, config, now);
        let mut report = NodeReport {
            node: node.name.clone(),
            verdict,
            deleted: false,
            finalizers_removed: Vec::new(),
            errors: Vec::new(),
        };
        // Finalizers go first: a failed delete still leaves the node unstuck for the next pass.
        if let Some(action) = finalizer::plan(node, config, now) {
            self.clean_finalizers(node, action, config, now, &mut report).await;
        }
        match verdict {
            Verdict::Skip(cause) => log_skip(node, cause, config, now),
            Verdict::Delete(reason) | Verdict::TakeoverDelete(reason) => {
                self.delete(node, reason, config, now, &mut report).await
            }
        }
        report
    }

    async fn clean_finalizers(
        &self,
        node: &NodeRecord,
        action: FinalizerAction,
        config: &PolicyConfig,
        now: DateTime<Utc>,
        report: &mut NodeReport,
    ) {
        if config.dry_run {
            info!(node = %node.name, finalizers = ?action.remove, "DRY RUN: would remove stuck finalizers");
            report.finalizers_removed = action.remove;
            return;
        }
        match self.ops.remove_finalizers(&node.name, &action.remove).await {
            Ok(FinalizerOutcome::Removed(removed)) => {
                counter!("nodereaper_finalizers_removed_total", removed.len() as u64);
                let event = self.event(EventKind::FinalizersRemoved, node, STUCK_TERMINATING, config, now)
                    .with_finalizers(removed.clone());
                self.notifier.dispatch(&event).await;
                report.finalizers_removed = removed;
            }
            Ok(FinalizerOutcome::NothingToRemove) => debug!(node = %node.name, "finalizers already gone"),
            Ok(FinalizerOutcome::NodeGone) => debug!(node = %node.name, "node gone before finalizer cleanup"),
            Err(e) => {
                warn!(node = %node.name, error = %e, "failed to remove finalizers");
                counter!("nodereaper_action_failures_total", 1u64, "action" => Action::FinalizerCleanup.as_str());
                let event = self.event(EventKind::FinalizerCleanupFailed, node, STUCK_TERMINATING, config, now)
                    .with_finalizers(action.remove)
                    .with_error(e.to_string());
                self.notifier.dispatch(&event).await;
                report.errors.push(NodeError { node: node.name.clone(), action: Action::FinalizerCleanup, message: e.to_string() });
            }
        }
    }

    async fn delete(&self, node: &NodeRecord, reason: Reason, config: &PolicyConfig, now: DateTime<Utc>, report: &mut NodeReport) {
        let details = node.details(now);
        if config.dry_run {
            info!(node = %node.name, reason = %reason, age = %details.age, zone = %details.zone, "DRY RUN: would delete node");
            report.deleted = true;
            return;
        }
        match self.ops.delete_node(&node.name).await {
            Ok(DeleteOutcome::Deleted) => {
                info!(
                    node = %node.name,
                    reason = %reason,
                    age = %details.age,
                    zone = %details.zone,
                    terminating = node.is_terminating(),
                    "reaped node"
                );
                counter!("nodereaper_nodes_deleted_total", 1u64, "reason" => reason.as_str());
                report.deleted = true;
                let event = self.event(EventKind::NodeDeleted, node, reason.as_str(), config, now);
                self.notifier.dispatch(&event).await;
            }
            Ok(DeleteOutcome::AlreadyGone) => {
                debug!(node = %node.name, reason = %reason, "node vanished before delete");
                report.deleted = true;
            }
            Err(e) => {
                warn!(node = %node.name, reason = %reason, error = %e, "failed to delete node");
                counter!("nodereaper_action_failures_total", 1u64, "action" => Action::Delete.as_str());
                let event = self.event(EventKind::DeleteFailed, node, reason.as_str(), config, now).with_error(e.to_string());
                self.notifier.dispatch(&event).await;
                report.errors.push(NodeError { node: node.name.clone(), action: Action::Delete, message: e.to_string() });
            }
        }
    }

    fn event(&self, kind: EventKind, node: &NodeRecord, reason: &str, config: &PolicyConfig, now: DateTime<Utc>) -> NotificationEvent {
        NotificationEvent {
            kind,
            cluster: config.cluster_name.clone(),
            node: node.details(now),
            reason: reason.to_string(),
            dry_run: config.dry_run,
            timestamp: now,
            finalizers: Vec::new(),
            error: None,
        }
    }
}

fn log_skip(node: &NodeRecord, cause: SkipCause, config: &PolicyConfig, now: DateTime<Utc>) {
    counter!("nodereaper_skips_total", 1u64, "cause" => cause.as_str());
    match cause {
        SkipCause::Protected => info!(node = %node.name, reason = %cause, "skipping node"),
        SkipCause::Deferred => {
            let wait_secs = analyzer::takeover_in(node, config, now).map(|d| d.num_seconds());
            info!(node = %node.name, reason = %cause, takeover_in_secs = ?wait_secs, "skipping node")
        }
        _ => debug!(node = %node.name, reason = %cause, "skipping node"),
    }
}
