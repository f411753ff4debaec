//! Kubernetes API access shared by both reconcilers
//!
//! The trait keeps reconcilers testable: unit tests use the generated
//! `MockKubeClient`, integration tests an in-memory cluster.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};

#[cfg(test)]
use mockall::automock;

use clusterip_common::crd::ClusterIP;
use clusterip_common::{Error, FIELD_MANAGER};

/// Kubernetes operations needed by the reconcilers
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Read a ClusterIP, `None` if it no longer exists
    async fn get_cluster_ip(&self, namespace: &str, name: &str)
        -> Result<Option<ClusterIP>, Error>;

    /// Replace the status of `cluster_ip`, guarded by its resourceVersion.
    ///
    /// A stale resourceVersion yields [`Error::Conflict`].
    async fn replace_status(&self, cluster_ip: &ClusterIP) -> Result<ClusterIP, Error>;

    /// Add a finalizer if missing
    async fn add_finalizer(&self, namespace: &str, name: &str, finalizer: &str)
        -> Result<(), Error>;

    /// Remove a finalizer if present
    async fn remove_finalizer(
        &self,
        namespace: &str,
        name: &str,
        finalizer: &str,
    ) -> Result<(), Error>;

    /// List every node in the cluster
    async fn list_nodes(&self) -> Result<Vec<Node>, Error>;
}

/// [`KubeClient`] backed by a kube-rs client
pub struct KubeClientImpl {
    client: Client,
}

impl KubeClientImpl {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn cluster_ips(&self, namespace: &str) -> Api<ClusterIP> {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn patch_finalizers(
        &self,
        namespace: &str,
        name: &str,
        finalizers: Vec<String>,
    ) -> Result<(), Error> {
        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers
            }
        });
        self.cluster_ips(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| Error::from_write(format!("{namespace}/{name}"), e))?;
        Ok(())
    }
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn get_cluster_ip(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ClusterIP>, Error> {
        Ok(self.cluster_ips(namespace).get_opt(name).await?)
    }

    async fn replace_status(&self, cluster_ip: &ClusterIP) -> Result<ClusterIP, Error> {
        let name = cluster_ip.name_any();
        let namespace = cluster_ip.namespace().ok_or_else(|| {
            Error::validation_for_field(&name, "metadata.namespace", "ClusterIP has no namespace")
        })?;
        let data = serde_json::to_vec(cluster_ip)
            .map_err(|e| Error::serialization_for_kind("ClusterIP", e.to_string()))?;
        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        self.cluster_ips(&namespace)
            .replace_status(&name, &params, data)
            .await
            .map_err(|e| Error::from_write(format!("{namespace}/{name}"), e))
    }

    async fn add_finalizer(
        &self,
        namespace: &str,
        name: &str,
        finalizer: &str,
    ) -> Result<(), Error> {
        let current = self.cluster_ips(namespace).get(name).await?;
        let mut finalizers = current.metadata.finalizers.unwrap_or_default();
        if finalizers.iter().any(|f| f == finalizer) {
            return Ok(());
        }
        finalizers.push(finalizer.to_string());
        self.patch_finalizers(namespace, name, finalizers).await
    }

    async fn remove_finalizer(
        &self,
        namespace: &str,
        name: &str,
        finalizer: &str,
    ) -> Result<(), Error> {
        let Some(current) = self.cluster_ips(namespace).get_opt(name).await? else {
            return Ok(());
        };
        let finalizers = current.metadata.finalizers.unwrap_or_default();
        if !finalizers.iter().any(|f| f == finalizer) {
            return Ok(());
        }
        let remaining = finalizers.into_iter().filter(|f| f != finalizer).collect();
        self.patch_finalizers(namespace, name, remaining).await
    }

    async fn list_nodes(&self) -> Result<Vec<Node>, Error> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        Ok(nodes.list(&ListParams::default()).await?.items)
    }
}
