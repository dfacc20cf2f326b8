//! NodeReaper kubehub – kube client wiring and the cluster snapshot adapter.
//!
//! The reaper reads the cluster exactly once per run: one paginated node list
//! (filtered server-side by the configured label selector) and one cluster-wide
//! pod list that the engine partitions by node.

#![forbid(unsafe_code)]

use std::collections::HashMap;

use k8s_openapi::api::core::v1::{Node, Pod};
use kube::{api::{Api, ListParams}, Client};
use nodereaper_core::{NodeRecord, OwnerKind, PodPhase, PodRecord, Readiness, Taint};
use tracing::{debug, info};

const PAGE_SIZE: u32 = 500;
const MIRROR_POD_ANNOTATION: &str = "kubernetes.io/config.mirror";

/// Failure to obtain a snapshot. Always fatal for a run.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("unauthorized when {op}: {message} (check RBAC permissions)")]
    Unauthorized { op: &'static str, message: String },
    #[error("cannot reach cluster when {op}: {message}")]
    Unreachable { op: &'static str, message: String },
    #[error("API error when {op}: HTTP {code} - {message}")]
    Api { op: &'static str, code: u16, message: String },
}

impl SnapshotError {
    pub fn from_kube(op: &'static str, e: kube::Error) -> Self {
        match e {
            kube::Error::Api(ae) if ae.code == 401 || ae.code == 403 => SnapshotError::Unauthorized { op, message: ae.message },
            kube::Error::Api(ae) => SnapshotError::Api { op, code: ae.code, message: ae.message },
            kube::Error::Auth(err) => SnapshotError::Unauthorized { op, message: err.to_string() },
            other => SnapshotError::Unreachable { op, message: other.to_string() },
        }
    }
}

/// HTTP status carried by a kube API error, if any.
pub fn status_code(e: &kube::Error) -> Option<u16> {
    match e {
        kube::Error::Api(ae) => Some(ae.code),
        _ => None,
    }
}

/// Build a client from the in-cluster service account, falling back to the local kubeconfig.
pub async fn get_kube_client() -> Result<Client, SnapshotError> {
    let client = Client::try_default()
        .await
        .map_err(|e| SnapshotError::from_kube("loading kube config", e))?;
    info!(namespace = %client.default_namespace(), "kube client initialized");
    Ok(client)
}

/// Read side of the cluster, as consumed by the reaper.
#[async_trait::async_trait]
pub trait ClusterSnapshot: Send + Sync {
    /// Probe the API server; returns its version string.
    async fn ping(&self) -> Result<String, SnapshotError>;

    /// Nodes matching `selector` (`k=v,k2=v2`), or all nodes when `None`.
    async fn list_nodes(&self, selector: Option<&str>) -> Result<Vec<NodeRecord>, SnapshotError>;

    /// Every pod bound to a node, cluster-wide.
    async fn list_pods(&self) -> Result<Vec<PodRecord>, SnapshotError>;
}

pub struct KubeSnapshot {
    client: Client,
}

impl KubeSnapshot {
    pub fn new(client: Client) -> Self { Self { client } }
}

#[async_trait::async_trait]
impl ClusterSnapshot for KubeSnapshot {
    async fn ping(&self) -> Result<String, SnapshotError> {
        let info = self
            .client
            .apiserver_version()
            .await
            .map_err(|e| SnapshotError::from_kube("probing API server", e))?;
        debug!(version = %info.git_version, "API server reachable");
        Ok(info.git_version)
    }

    async fn list_nodes(&self, selector: Option<&str>) -> Result<Vec<NodeRecord>, SnapshotError> {
        let api: Api<Node> = Api::all(self.client.clone());
        let mut lp = ListParams::default().limit(PAGE_SIZE);
        if let Some(sel) = selector {
            lp = lp.labels(sel);
        }
        let mut out = Vec::new();
        loop {
            let page = api.list(&lp).await.map_err(|e| SnapshotError::from_kube("listing nodes", e))?;
            out.extend(page.items.iter().map(node_record));
            match page.metadata.continue_.filter(|c| !c.is_empty()) {
                Some(token) => lp = lp.continue_token(&token),
                None => break,
            }
        }
        match selector {
            Some(sel) => info!(count = out.len(), selector = %sel, "found nodes"),
            None => info!(count = out.len(), "found nodes"),
        }
        Ok(out)
    }

    async fn list_pods(&self) -> Result<Vec<PodRecord>, SnapshotError> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let mut lp = ListParams::default().fields("spec.nodeName!=").limit(PAGE_SIZE);
        let mut out = Vec::new();
        loop {
            let page = api.list(&lp).await.map_err(|e| SnapshotError::from_kube("listing pods", e))?;
            out.extend(page.items.iter().map(pod_record));
            match page.metadata.continue_.filter(|c| !c.is_empty()) {
                Some(token) => lp = lp.continue_token(&token),
                None => break,
            }
        }
        debug!(count = out.len(), "listed scheduled pods");
        Ok(out)
    }
}

/// Project a `Node` into the record the decision engine works on.
pub fn node_record(node: &Node) -> NodeRecord {
    let meta = &node.metadata;
    let spec = node.spec.as_ref();
    let taints = spec
        .and_then(|s| s.taints.as_ref())
        .map(|ts| ts.iter().map(|t| Taint::new(t.key.clone(), t.effect.clone(), t.time_added.as_ref().map(|tm| tm.0))).collect())
        .unwrap_or_default();
    let readiness = node
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|cs| cs.iter().find(|c| c.type_ == "Ready"))
        .map(|c| match c.status.as_str() {
            "True" => Readiness::Ready,
            "False" => Readiness::False,
            _ => Readiness::Unknown,
        });
    NodeRecord {
        name: meta.name.clone().unwrap_or_default(),
        uid: meta.uid.clone().unwrap_or_default(),
        creation_ts: meta.creation_timestamp.as_ref().map(|t| t.0),
        labels: meta.labels.clone().unwrap_or_default().into_iter().collect(),
        annotations: meta.annotations.clone().unwrap_or_default().into_iter().collect(),
        taints,
        finalizers: meta.finalizers.clone().unwrap_or_default().into_iter().collect(),
        readiness,
        schedulable: !spec.and_then(|s| s.unschedulable).unwrap_or(false),
        deletion_ts: meta.deletion_timestamp.as_ref().map(|t| t.0),
    }
}

pub fn pod_record(pod: &Pod) -> PodRecord {
    let meta = &pod.metadata;
    let owners = meta.owner_references.as_deref().unwrap_or_default();
    let is_mirror = meta.annotations.as_ref().map(|a| a.contains_key(MIRROR_POD_ANNOTATION)).unwrap_or(false);
    let owner = if owners.iter().any(|o| o.kind == "DaemonSet") {
        OwnerKind::DaemonSet
    } else if is_mirror || owners.iter().any(|o| o.kind == "Node") {
        OwnerKind::Node
    } else if !owners.is_empty() {
        OwnerKind::Other
    } else {
        OwnerKind::Unowned
    };
    PodRecord {
        namespace: meta.namespace.clone().unwrap_or_default(),
        name: meta.name.clone().unwrap_or_default(),
        node_name: pod.spec.as_ref().and_then(|s| s.node_name.clone()).filter(|n| !n.is_empty()),
        owner,
        phase: PodPhase::parse(pod.status.as_ref().and_then(|s| s.phase.as_deref())),
    }
}

/// Group pods by the node they are bound to. Unbound pods are dropped.
pub fn partition_by_node(pods: Vec<PodRecord>) -> HashMap<String, Vec<PodRecord>> {
    let mut out: HashMap<String, Vec<PodRecord>> = HashMap::new();
    for pod in pods {
        if let Some(node) = pod.node_name.clone() {
            out.entry(node).or_default().push(pod);
        }
    }
    out
}
