//! ClusterIP CRD installation via server-side apply

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, CustomResourceExt};

use clusterip_common::backoff::{retry_with_backoff, RetryConfig};
use clusterip_common::crd::ClusterIP;
use clusterip_common::FIELD_MANAGER;

use super::is_transient;

/// Install or update the ClusterIP CRD, retrying transient API failures
pub async fn ensure_crd_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();
    let crd = ClusterIP::crd();
    let name = ClusterIP::crd_name();

    tracing::info!("Installing {} CRD...", name);
    retry_with_backoff(
        &RetryConfig::default(),
        "install ClusterIP CRD",
        is_transient,
        || {
            let crds = crds.clone();
            let params = params.clone();
            let crd = crd.clone();
            async move { crds.patch(name, &params, &Patch::Apply(&crd)).await }
        },
    )
    .await
    .map_err(|e| anyhow::anyhow!("failed to install {} CRD: {}", name, e))?;
    tracing::info!("{} CRD installed/updated", name);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crd_is_namespaced_with_status_subresource() {
        let crd = ClusterIP::crd();
        assert_eq!(ClusterIP::crd_name(), "clusterips.operator.kyma-project.io");
        assert_eq!(crd.spec.scope, "Namespaced");
        let version = &crd.spec.versions[0];
        assert_eq!(version.name, "v1alpha1");
        assert!(version
            .subresources
            .as_ref()
            .and_then(|s| s.status.as_ref())
            .is_some());
    }
}
