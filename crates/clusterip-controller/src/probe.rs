//! Probe agent lifecycle
//!
//! One probe agent runs per unconfirmed node group: a single-replica
//! Deployment of the operator image in `probe` mode, pinned to the group with
//! a node selector. Agents are named and labelled by a stable hash of the
//! group value, so lookups and re-applies never create duplicates.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, EnvVarSource, ObjectFieldSelector, PodSpec, PodTemplateSpec,
    ResourceRequirements, SecurityContext,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::{Api, DeleteParams, ListParams, ObjectMeta, Patch, PatchParams};
use kube::Client;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use clusterip_common::kube_utils::{deterministic_hash, is_not_found};
use clusterip_common::metrics::record_probe_operation;
use clusterip_common::{
    Error, FIELD_MANAGER, MANAGED_BY_LABEL, MANAGER_NAME, PROBE_GROUP_LABEL,
    PROBE_NODE_LABEL_ANNOTATION, PROBE_OWNER_EPOCH_ANNOTATION,
};

/// Prefix of probe agent names
pub const PROBE_NAME_PREFIX: &str = "cluster-ip-probe-";

/// Container name inside a probe agent
const PROBE_CONTAINER: &str = "probe";

/// A probe agent as seen by the lifecycle manager
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProbeAgentHandle {
    /// Object name, `cluster-ip-probe-<hash>`
    pub name: String,
    /// Hash of the group value, used as selector label
    pub group_hash: String,
    /// Raw group value
    pub group_label: String,
    /// Container image
    pub image: String,
    /// Container arguments
    pub args: Vec<String>,
    /// Epoch stamp of the controller instance that applied the agent
    pub owner_epoch: Option<String>,
}

impl ProbeAgentHandle {
    /// The handle a probe for `(label_key, group)` should have
    pub fn desired(label_key: &str, group: &str, image: &str) -> Self {
        let group_hash = deterministic_hash(group);
        Self {
            name: format!("{PROBE_NAME_PREFIX}{group_hash}"),
            group_hash,
            group_label: group.to_string(),
            image: image.to_string(),
            args: probe_args(label_key, group),
            owner_epoch: None,
        }
    }

    /// Whether image and args match `other`
    pub fn matches(&self, other: &ProbeAgentHandle) -> bool {
        self.name == other.name && self.image == other.image && self.args == other.args
    }

    /// The spread label key the agent was started with
    pub fn label_key(&self) -> Option<&str> {
        self.args
            .iter()
            .position(|a| a == "--node-spread-label")
            .and_then(|i| self.args.get(i + 1))
            .map(String::as_str)
    }
}

/// Stable text form of a controller epoch, kept at full precision
pub fn epoch_stamp(epoch: DateTime<Utc>) -> String {
    epoch.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Command line a probe agent runs with
pub fn probe_args(label_key: &str, group: &str) -> Vec<String> {
    vec![
        "probe".to_string(),
        "--node-spread-label".to_string(),
        label_key.to_string(),
        "--node-label".to_string(),
        group.to_string(),
    ]
}

/// Where probe agents are materialised
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ProbeRuntime: Send + Sync {
    /// Find the agent carrying the given group hash
    async fn find(&self, group_hash: &str) -> Result<Option<ProbeAgentHandle>, Error>;

    /// Create or update an agent in place
    async fn apply(&self, handle: &ProbeAgentHandle, label_key: &str) -> Result<(), Error>;

    /// Delete an agent by name; `false` if it did not exist
    async fn delete(&self, name: &str) -> Result<bool, Error>;
}

/// What [`ProbeManager::ensure_agent`] did
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProbeAction {
    /// No agent existed; one was created
    Created,
    /// The agent's image or args drifted and were updated
    Updated,
    /// The existing agent was deleted and created again
    Replaced,
    /// The agent was already as desired
    Unchanged,
}

/// Probe agent lookups and changes for the convergence reconciler.
///
/// Every agent it applies is stamped with the controller's epoch, which tells
/// agents started by an earlier controller apart from this one's. Runtime
/// failures come back as [`Error::Probe`] carrying the group so the caller
/// can keep them local to that group.
pub struct ProbeManager {
    runtime: Arc<dyn ProbeRuntime>,
    owner_epoch: String,
}

impl ProbeManager {
    /// Create a manager over `runtime` for the controller started at `epoch`
    pub fn new(runtime: Arc<dyn ProbeRuntime>, epoch: DateTime<Utc>) -> Self {
        Self {
            runtime,
            owner_epoch: epoch_stamp(epoch),
        }
    }

    /// Whether `handle` was applied by this controller instance
    pub fn is_owned(&self, handle: &ProbeAgentHandle) -> bool {
        handle.owner_epoch.as_deref() == Some(self.owner_epoch.as_str())
    }

    fn desired(&self, label_key: &str, group: &str, image: &str) -> ProbeAgentHandle {
        ProbeAgentHandle {
            owner_epoch: Some(self.owner_epoch.clone()),
            ..ProbeAgentHandle::desired(label_key, group, image)
        }
    }

    /// Look up the agent of `group`
    pub async fn find_agent(&self, group: &str) -> Result<Option<ProbeAgentHandle>, Error> {
        self.runtime
            .find(&deterministic_hash(group))
            .await
            .map_err(|e| Error::probe(group, format!("lookup failed: {e}")))
    }

    /// Apply the desired agent for `group`. Idempotent.
    pub async fn create_or_update_agent(
        &self,
        label_key: &str,
        group: &str,
        image: &str,
    ) -> Result<ProbeAgentHandle, Error> {
        let handle = self.desired(label_key, group, image);
        let result = self.runtime.apply(&handle, label_key).await;
        record_probe_operation("apply", result.is_ok());
        result.map_err(|e| Error::probe(group, format!("apply failed: {e}")))?;
        debug!(probe = %handle.name, group, "applied probe agent");
        Ok(handle)
    }

    /// Delete an agent. An agent that is already gone is not an error.
    pub async fn delete_agent(&self, handle: &ProbeAgentHandle) -> Result<bool, Error> {
        let result = self.runtime.delete(&handle.name).await;
        record_probe_operation("delete", result.is_ok());
        result.map_err(|e| Error::probe(&handle.group_label, format!("delete failed: {e}")))
    }

    /// Make sure an agent for `group` exists with the desired image and args
    pub async fn ensure_agent(
        &self,
        label_key: &str,
        group: &str,
        image: &str,
    ) -> Result<ProbeAction, Error> {
        let desired = self.desired(label_key, group, image);
        match self.find_agent(group).await? {
            Some(existing) if existing.matches(&desired) => Ok(ProbeAction::Unchanged),
            Some(existing) if existing.label_key().is_some_and(|k| k != label_key) => {
                // Re-applying would flip the agent between label keys every pass.
                Err(Error::probe(
                    group,
                    format!(
                        "probe agent {} already serves label {}",
                        existing.name,
                        existing.label_key().unwrap_or_default()
                    ),
                ))
            }
            Some(existing) => {
                info!(probe = %existing.name, group, "probe agent drifted, updating");
                self.create_or_update_agent(label_key, group, image).await?;
                Ok(ProbeAction::Updated)
            }
            None => {
                self.create_or_update_agent(label_key, group, image).await?;
                Ok(ProbeAction::Created)
            }
        }
    }

    /// Delete `existing` and create it again, forcing a fresh probe process
    pub async fn replace_agent(
        &self,
        existing: &ProbeAgentHandle,
        label_key: &str,
        group: &str,
        image: &str,
    ) -> Result<ProbeAction, Error> {
        self.delete_agent(existing).await?;
        self.create_or_update_agent(label_key, group, image).await?;
        Ok(ProbeAction::Replaced)
    }
}

/// [`ProbeRuntime`] that runs each agent as a Deployment
pub struct DeploymentProbeRuntime {
    client: Client,
    namespace: String,
    service_account: String,
}

impl DeploymentProbeRuntime {
    /// Agents live in `namespace` and run as `service_account`
    pub fn new(
        client: Client,
        namespace: impl Into<String>,
        service_account: impl Into<String>,
    ) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            service_account: service_account.into(),
        }
    }

    fn api(&self) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }
}

#[async_trait]
impl ProbeRuntime for DeploymentProbeRuntime {
    async fn find(&self, group_hash: &str) -> Result<Option<ProbeAgentHandle>, Error> {
        let params = ListParams::default().labels(&format!("{PROBE_GROUP_LABEL}={group_hash}"));
        let list = self.api().list(&params).await?;
        Ok(list.items.iter().find_map(handle_from_deployment))
    }

    async fn apply(&self, handle: &ProbeAgentHandle, label_key: &str) -> Result<(), Error> {
        let deployment =
            build_probe_deployment(handle, label_key, &self.namespace, &self.service_account);
        self.api()
            .patch(
                &handle.name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&deployment),
            )
            .await?;
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<bool, Error> {
        match self.api().delete(name, &DeleteParams::background()).await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// Read a handle back from a Deployment created by [`build_probe_deployment`]
pub fn handle_from_deployment(deployment: &Deployment) -> Option<ProbeAgentHandle> {
    let meta = &deployment.metadata;
    let group_hash = meta.labels.as_ref()?.get(PROBE_GROUP_LABEL)?.clone();
    let group_label = meta
        .annotations
        .as_ref()?
        .get(PROBE_NODE_LABEL_ANNOTATION)?
        .clone();
    let container = deployment
        .spec
        .as_ref()?
        .template
        .spec
        .as_ref()?
        .containers
        .iter()
        .find(|c| c.name == PROBE_CONTAINER)?;

    Some(ProbeAgentHandle {
        name: meta.name.clone()?,
        group_hash,
        group_label,
        image: container.image.clone().unwrap_or_default(),
        args: container.args.clone().unwrap_or_default(),
        owner_epoch: meta
            .annotations
            .as_ref()
            .and_then(|a| a.get(PROBE_OWNER_EPOCH_ANNOTATION))
            .cloned(),
    })
}

fn downward_env(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: field_path.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Deployment manifest for a probe agent
pub fn build_probe_deployment(
    handle: &ProbeAgentHandle,
    label_key: &str,
    namespace: &str,
    service_account: &str,
) -> Deployment {
    let labels = BTreeMap::from([
        (PROBE_GROUP_LABEL.to_string(), handle.group_hash.clone()),
        (MANAGED_BY_LABEL.to_string(), MANAGER_NAME.to_string()),
        (
            "app.kubernetes.io/name".to_string(),
            "cluster-ip-probe".to_string(),
        ),
    ]);
    let annotations = BTreeMap::from([(
        PROBE_NODE_LABEL_ANNOTATION.to_string(),
        handle.group_label.clone(),
    )]);
    // Ownership stays off the pod template so restamping never rolls pods.
    let mut deployment_annotations = annotations.clone();
    if let Some(owner) = &handle.owner_epoch {
        deployment_annotations.insert(PROBE_OWNER_EPOCH_ANNOTATION.to_string(), owner.clone());
    }

    Deployment {
        metadata: ObjectMeta {
            name: Some(handle.name.clone()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.clone()),
            annotations: Some(deployment_annotations),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(BTreeMap::from([(
                    PROBE_GROUP_LABEL.to_string(),
                    handle.group_hash.clone(),
                )])),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    annotations: Some(annotations),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some(service_account.to_string()),
                    node_selector: Some(BTreeMap::from([(
                        label_key.to_string(),
                        handle.group_label.clone(),
                    )])),
                    containers: vec![Container {
                        name: PROBE_CONTAINER.to_string(),
                        image: Some(handle.image.clone()),
                        args: Some(handle.args.clone()),
                        env: Some(vec![
                            downward_env("POD_NAME", "metadata.name"),
                            downward_env("POD_NAMESPACE", "metadata.namespace"),
                            downward_env("NODE_NAME", "spec.nodeName"),
                        ]),
                        resources: Some(ResourceRequirements {
                            requests: Some(BTreeMap::from([
                                ("cpu".to_string(), Quantity("10m".to_string())),
                                ("memory".to_string(), Quantity("32Mi".to_string())),
                            ])),
                            limits: Some(BTreeMap::from([(
                                "memory".to_string(),
                                Quantity("128Mi".to_string()),
                            )])),
                            ..Default::default()
                        }),
                        security_context: Some(SecurityContext {
                            allow_privilege_escalation: Some(false),
                            read_only_root_filesystem: Some(true),
                            run_as_non_root: Some(true),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}
