//! NodeReaper notifications.
//!
//! Notifiers are registered explicitly at process start against the event kinds
//! they care about; the engine hands every event to [`NotificationDispatcher::dispatch`].
//! Delivery failures are logged and never propagate.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use nodereaper_core::NodeDetails;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

mod slack;

pub use slack::SlackNotifier;

#[derive(Debug, thiserror::Error)]
pub enum NotificationError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("webhook rejected notification: {status} - {body}")]
    Rejected { status: u16, body: String },
    #[error("notifier misconfigured: {0}")]
    Config(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    NodeDeleted,
    FinalizersRemoved,
    DeleteFailed,
    FinalizerCleanupFailed,
}

impl EventKind {
    pub const ALL: [EventKind; 4] =
        [EventKind::NodeDeleted, EventKind::FinalizersRemoved, EventKind::DeleteFailed, EventKind::FinalizerCleanupFailed];
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NotificationEvent {
    pub kind: EventKind,
    pub cluster: String,
    pub node: NodeDetails,
    /// Reason code for deletions, or why finalizers were stripped.
    pub reason: String,
    pub dry_run: bool,
    pub timestamp: DateTime<Utc>,
    /// Finalizers removed (or meant to be removed) from the node.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl NotificationEvent {
    pub fn with_finalizers(mut self, finalizers: Vec<String>) -> Self {
        self.finalizers = finalizers;
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Chat-friendly rendering of the event.
    pub fn message(&self) -> String {
        let name = &self.node.name;
        let headline = match (self.kind, self.dry_run) {
            (EventKind::NodeDeleted, false) => format!(":skull_and_crossbones: NodeReaper deleted Node `{}`", name),
            (EventKind::NodeDeleted, true) => format!(":information_source: NodeReaper would delete Node `{}`", name),
            (EventKind::FinalizersRemoved, false) => format!(":broom: NodeReaper cleaned up finalizers on Node `{}`", name),
            (EventKind::FinalizersRemoved, true) => {
                format!(":information_source: NodeReaper would clean up finalizers on Node `{}`", name)
            }
            (EventKind::DeleteFailed, _) => format!(
                ":warning: NodeReaper failed to delete Node `{}`: {}",
                name,
                self.error.as_deref().unwrap_or("unknown error")
            ),
            (EventKind::FinalizerCleanupFailed, _) => format!(
                ":warning: NodeReaper failed to clean up finalizers on Node `{}`: {}",
                name,
                self.error.as_deref().unwrap_or("unknown error")
            ),
        };
        let mut msg = format!(
            "{}\nCluster: {}\nAge: {}\nInstance Type: {}\nZone: {}\nReason: {}",
            headline, self.cluster, self.node.age, self.node.instance_type, self.node.zone, self.reason
        );
        if !self.finalizers.is_empty() {
            msg.push_str(&format!("\nFinalizers: {}", self.finalizers.join(", ")));
        }
        msg
    }
}

/// A delivery channel (chat webhook, ...).
#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &str;

    async fn notify(&self, event: &NotificationEvent) -> Result<(), NotificationError>;
}

/// Registry mapping event kinds to the notifiers subscribed to them.
#[derive(Default, Clone)]
pub struct NotificationDispatcher {
    routes: HashMap<EventKind, Vec<Arc<dyn Notifier>>>,
}

impl NotificationDispatcher {
    pub fn new() -> Self { Self::default() }

    pub fn register(&mut self, kind: EventKind, notifier: Arc<dyn Notifier>) {
        self.routes.entry(kind).or_default().push(notifier);
    }

    /// Subscribe `notifier` to every event kind.
    pub fn register_all(&mut self, notifier: Arc<dyn Notifier>) {
        for kind in EventKind::ALL {
            self.register(kind, Arc::clone(&notifier));
        }
    }

    pub fn notifiers_for(&self, kind: EventKind) -> usize {
        self.routes.get(&kind).map(Vec::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool { self.routes.values().all(Vec::is_empty) }

    /// Deliver to every notifier registered for the event's kind.
    /// Returns the number of successful deliveries.
    pub async fn dispatch(&self, event: &NotificationEvent) -> usize {
        let Some(targets) = self.routes.get(&event.kind) else {
            debug!(kind = ?event.kind, node = %event.node.name, "no notifiers registered");
            return 0;
        };
        let mut delivered = 0;
        for n in targets {
            match n.notify(event).await {
                Ok(()) => delivered += 1,
                Err(e) => warn!(notifier = %n.name(), node = %event.node.name, error = %e, "notification failed"),
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recording {
        name: &'static str,
        fail: bool,
        seen: Mutex<Vec<EventKind>>,
    }

    impl Recording {
        fn new(name: &'static str, fail: bool) -> Arc<Self> {
            Arc::new(Self { name, fail, seen: Mutex::new(Vec::new()) })
        }
    }

    #[async_trait::async_trait]
    impl Notifier for Recording {
        fn name(&self) -> &str { self.name }

        async fn notify(&self, event: &NotificationEvent) -> Result<(), NotificationError> {
            self.seen.lock().unwrap().push(event.kind);
            if self.fail { Err(NotificationError::Config("boom".into())) } else { Ok(()) }
        }
    }

    fn event(kind: EventKind) -> NotificationEvent {
        NotificationEvent {
            kind,
            cluster: "test-cluster".into(),
            node: NodeDetails {
                name: "test-node".into(),
                age: "1h".into(),
                instance_type: "m5.large".into(),
                zone: "us-west-2a".into(),
                creation_time: None,
            },
            reason: "empty".into(),
            dry_run: false,
            timestamp: Utc::now(),
            finalizers: vec![],
            error: None,
        }
    }

    #[test]
    fn formats_deletion_message() {
        let msg = event(EventKind::NodeDeleted).message();
        assert!(msg.starts_with(":skull_and_crossbones: NodeReaper deleted Node `test-node`"), "{}", msg);
        assert!(msg.contains("Cluster: test-cluster"));
        assert!(msg.contains("Instance Type: m5.large"));
        assert!(msg.contains("Zone: us-west-2a"));
        assert!(msg.contains("Reason: empty"));
    }

    #[test]
    fn formats_cleanup_dry_run_and_failure_messages() {
        let mut cleanup = event(EventKind::FinalizersRemoved);
        cleanup.finalizers = vec!["karpenter.sh/termination".into()];
        let msg = cleanup.message();
        assert!(msg.starts_with(":broom:"));
        assert!(msg.contains("Finalizers: karpenter.sh/termination"));

        let mut dry = event(EventKind::NodeDeleted);
        dry.dry_run = true;
        assert!(dry.message().contains("would delete Node `test-node`"));

        let mut failed = event(EventKind::DeleteFailed);
        failed.error = Some("Permission denied".into());
        let msg = failed.message();
        assert!(msg.starts_with(":warning: NodeReaper failed to delete Node `test-node`: Permission denied"), "{}", msg);
    }

    #[tokio::test]
    async fn dispatch_routes_by_kind() {
        let deletes = Recording::new("deletes", false);
        let everything = Recording::new("everything", false);
        let mut d = NotificationDispatcher::new();
        d.register(EventKind::NodeDeleted, deletes.clone());
        d.register_all(everything.clone());
        assert_eq!(d.notifiers_for(EventKind::NodeDeleted), 2);
        assert_eq!(d.notifiers_for(EventKind::DeleteFailed), 1);

        assert_eq!(d.dispatch(&event(EventKind::NodeDeleted)).await, 2);
        assert_eq!(d.dispatch(&event(EventKind::FinalizersRemoved)).await, 1);
        assert_eq!(*deletes.seen.lock().unwrap(), vec![EventKind::NodeDeleted]);
        assert_eq!(everything.seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn failing_notifier_does_not_block_others() {
        let bad = Recording::new("bad", true);
        let good = Recording::new("good", false);
        let mut d = NotificationDispatcher::new();
        d.register(EventKind::NodeDeleted, bad.clone());
        d.register(EventKind::NodeDeleted, good.clone());
        assert_eq!(d.dispatch(&event(EventKind::NodeDeleted)).await, 1);
        assert_eq!(good.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn empty_registry_delivers_nothing() {
        let d = NotificationDispatcher::new();
        assert!(d.is_empty());
        assert_eq!(d.dispatch(&event(EventKind::NodeDeleted)).await, 0);
    }
}
