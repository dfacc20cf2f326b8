//! NodeReaper ops: the mutations the reaper performs on nodes.
//!
//! Both operations are one-shot per run. A failed call is reported to the caller,
//! which records it and moves on; the next scheduled run is the retry. The only
//! in-process retry is the optimistic-concurrency loop of the finalizer patch.

#![forbid(unsafe_code)]

use k8s_openapi::api::core::v1::Node;
use kube::{api::{Api, DeleteParams, Patch, PatchParams}, Client};
use nodereaper_core::finalizer;
use serde_json::Value as Json;
use tracing::{debug, info, warn};

/// Attempts at the read-modify-write finalizer patch before giving up on conflicts.
pub const MAX_PATCH_ATTEMPTS: u32 = 3;

#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error("forbidden: {0} (check RBAC permissions)")]
    Forbidden(String),
    #[error("conflicting concurrent updates after {attempts} attempts")]
    Conflict { attempts: u32 },
    #[error("HTTP {code} - {message}")]
    Api { code: u16, message: String },
    #[error("request failed: {0}")]
    Transport(String),
}

impl From<kube::Error> for ActionError {
    fn from(e: kube::Error) -> Self {
        match e {
            kube::Error::Api(ae) if ae.code == 401 || ae.code == 403 => ActionError::Forbidden(ae.message),
            kube::Error::Api(ae) => ActionError::Api { code: ae.code, message: ae.message },
            other => ActionError::Transport(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    AlreadyGone,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalizerOutcome {
    /// Finalizers that were present and have been stripped.
    Removed(Vec<String>),
    /// None of the requested finalizers was still on the node.
    NothingToRemove,
    NodeGone,
}

/// Node mutations. Implementations must be safe against concurrent external edits.
#[async_trait::async_trait]
pub trait NodeOps: Send + Sync {
    /// Force-delete a node (grace period 0). A missing node is not an error.
    async fn delete_node(&self, name: &str) -> Result<DeleteOutcome, ActionError>;

    /// Strip `remove` from the node's current finalizers, keeping all others.
    async fn remove_finalizers(&self, name: &str, remove: &[String]) -> Result<FinalizerOutcome, ActionError>;
}

/// Default implementation using kube-rs client APIs.
pub struct KubeNodeOps {
    client: Client,
}

impl KubeNodeOps {
    pub fn new(client: Client) -> Self { Self { client } }

    fn api(&self) -> Api<Node> { Api::all(self.client.clone()) }
}

#[async_trait::async_trait]
impl NodeOps for KubeNodeOps {
    async fn delete_node(&self, name: &str) -> Result<DeleteOutcome, ActionError> {
        let dp = DeleteParams { grace_period_seconds: Some(0), ..Default::default() };
        match self.api().delete(name, &dp).await {
            Ok(_) => {
                info!(node = %name, "deleted node");
                Ok(DeleteOutcome::Deleted)
            }
            Err(e) if nodereaper_kubehub::status_code(&e) == Some(404) => {
                info!(node = %name, "node already deleted");
                Ok(DeleteOutcome::AlreadyGone)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn remove_finalizers(&self, name: &str, remove: &[String]) -> Result<FinalizerOutcome, ActionError> {
        let api = self.api();
        for attempt in 1..=MAX_PATCH_ATTEMPTS {
            let Some(node) = api.get_opt(name).await? else {
                info!(node = %name, "node already deleted");
                return Ok(FinalizerOutcome::NodeGone);
            };
            let current = node.metadata.finalizers.clone().unwrap_or_default();
            let present: Vec<String> = current.iter().filter(|f| remove.contains(f)).cloned().collect();
            if present.is_empty() {
                debug!(node = %name, "no finalizers left to remove");
                return Ok(FinalizerOutcome::NothingToRemove);
            }
            let keep = finalizer::remaining(&current, remove);
            let patch = finalizer_patch(node.metadata.resource_version.as_deref(), &keep);
            match api.patch(name, &PatchParams::default(), &Patch::Merge(&patch)).await {
                Ok(_) => {
                    info!(node = %name, removed = ?present, kept = ?keep, "removed stuck finalizers");
                    return Ok(FinalizerOutcome::Removed(present));
                }
                Err(e) => match nodereaper_kubehub::status_code(&e) {
                    Some(404) => return Ok(FinalizerOutcome::NodeGone),
                    Some(409) => warn!(node = %name, attempt, "finalizer patch conflicted; re-reading node"),
                    _ => return Err(e.into()),
                },
            }
        }
        Err(ActionError::Conflict { attempts: MAX_PATCH_ATTEMPTS })
    }
}

/// Merge patch replacing the finalizer list, guarded by the observed resourceVersion
/// so the API server rejects it with 409 if the node changed in between.
pub fn finalizer_patch(resource_version: Option<&str>, keep: &[&str]) -> Json {
    let mut meta = serde_json::json!({ "finalizers": keep });
    if let Some(rv) = resource_version {
        meta["resourceVersion"] = Json::String(rv.to_string());
    }
    serde_json::json!({ "metadata": meta })
}
