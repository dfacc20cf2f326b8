//! Read-only snapshot records for nodes and pods.
//!
//! These are the shapes the decision engine works on. They are built by the
//! kube adapter from `k8s_openapi` objects once per run and never mutated.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

pub const INSTANCE_TYPE_LABEL: &str = "node.kubernetes.io/instance-type";
pub const ZONE_LABEL: &str = "topology.kubernetes.io/zone";
pub const UNSCHEDULABLE_TAINT: &str = "node.kubernetes.io/unschedulable";

/// Status of the node `Ready` condition.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    Unknown,
    False,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Taint {
    pub key: String,
    pub effect: String,
    /// When the taint was applied, if the API server recorded it.
    pub time_added: Option<DateTime<Utc>>,
}

impl Taint {
    pub fn new(key: impl Into<String>, effect: impl Into<String>, time_added: Option<DateTime<Utc>>) -> Self {
        Self { key: key.into(), effect: effect.into(), time_added }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeRecord {
    pub name: String,
    pub uid: String,
    pub creation_ts: Option<DateTime<Utc>>,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub taints: SmallVec<[Taint; 4]>,
    pub finalizers: SmallVec<[String; 4]>,
    /// `None` when the node reports no `Ready` condition at all.
    pub readiness: Option<Readiness>,
    pub schedulable: bool,
    /// Present iff the platform has begun terminating the node.
    pub deletion_ts: Option<DateTime<Utc>>,
}

impl NodeRecord {
    /// A ready, schedulable node with no metadata beyond its name.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            uid: String::new(),
            name,
            creation_ts: None,
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            taints: SmallVec::new(),
            finalizers: SmallVec::new(),
            readiness: Some(Readiness::Ready),
            schedulable: true,
            deletion_ts: None,
        }
    }

    pub fn age(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.creation_ts.map(|ts| now - ts)
    }

    pub fn is_terminating(&self) -> bool { self.deletion_ts.is_some() }

    pub fn label(&self, key: &str) -> Option<&str> { self.labels.get(key).map(String::as_str) }

    pub fn annotation(&self, key: &str) -> Option<&str> { self.annotations.get(key).map(String::as_str) }

    /// Human-facing description used by logs and notifications.
    pub fn details(&self, now: DateTime<Utc>) -> NodeDetails {
        NodeDetails {
            name: self.name.clone(),
            age: self.age(now).map(format_age).unwrap_or_else(|| "unknown".to_string()),
            instance_type: self.label(INSTANCE_TYPE_LABEL).unwrap_or("unknown").to_string(),
            zone: self.label(ZONE_LABEL).unwrap_or("unknown").to_string(),
            creation_time: self.creation_ts.map(|ts| ts.to_rfc3339()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeDetails {
    pub name: String,
    pub age: String,
    pub instance_type: String,
    pub zone: String,
    pub creation_time: Option<String>,
}

/// Kind of the controller owning a pod, reduced to what occupancy needs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OwnerKind {
    DaemonSet,
    /// Static/mirror pod, owned by the node itself.
    Node,
    Other,
    Unowned,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl PodPhase {
    pub fn parse(s: Option<&str>) -> Self {
        match s {
            Some("Pending") => PodPhase::Pending,
            Some("Running") => PodPhase::Running,
            Some("Succeeded") => PodPhase::Succeeded,
            Some("Failed") => PodPhase::Failed,
            _ => PodPhase::Unknown,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PodRecord {
    pub namespace: String,
    pub name: String,
    pub node_name: Option<String>,
    pub owner: OwnerKind,
    pub phase: PodPhase,
}

impl PodRecord {
    pub fn new(name: impl Into<String>, node_name: impl Into<String>, owner: OwnerKind) -> Self {
        Self {
            namespace: "default".to_string(),
            name: name.into(),
            node_name: Some(node_name.into()),
            owner,
            phase: PodPhase::Running,
        }
    }

    /// DaemonSet pods follow the node and never count as workload. Static pods do.
    pub fn is_daemonset(&self) -> bool { self.owner == OwnerKind::DaemonSet }

    pub fn is_finished(&self) -> bool {
        matches!(self.phase, PodPhase::Succeeded | PodPhase::Failed)
    }

    /// Whether this pod keeps its node from being considered empty.
    pub fn occupies_node(&self) -> bool { !self.is_finished() && !self.is_daemonset() }
}

/// Render a duration as `Ns`, `Nm`, `Nh` or `Nd` using the largest unit that fits.
pub fn format_age(age: Duration) -> String {
    let secs = age.num_seconds().max(0);
    if secs < 60 { format!("{}s", secs) }
    else if secs < 3_600 { format!("{}m", secs / 60) }
    else if secs < 86_400 { format!("{}h", secs / 3_600) }
    else { format!("{}d", secs / 86_400) }
}
