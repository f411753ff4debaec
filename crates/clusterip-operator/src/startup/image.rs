//! Probe image discovery
//!
//! Probe agents run the operator's own binary in `probe` mode, so unless an
//! image is configured explicitly the controller reads it from its own pod.

use k8s_openapi::api::core::v1::Pod;
use kube::{Api, Client};

use clusterip_common::backoff::{retry_with_backoff, RetryConfig};

use super::is_transient;

/// Image of the named container, or of the first container when the name is
/// absent or not found
pub fn container_image(pod: &Pod, container: Option<&str>) -> Option<String> {
    let containers = &pod.spec.as_ref()?.containers;
    let named = container.and_then(|name| containers.iter().find(|c| c.name == name));
    named
        .or_else(|| containers.first())
        .and_then(|c| c.image.clone())
        .filter(|image| !image.is_empty())
}

/// Resolve the image probe agents should run
///
/// `explicit` wins. Otherwise the pod named by `POD_NAME` in `POD_NAMESPACE`
/// is read and its container image is used.
pub async fn discover_probe_image(
    client: &Client,
    explicit: Option<String>,
) -> anyhow::Result<String> {
    if let Some(image) = explicit.filter(|i| !i.is_empty()) {
        return Ok(image);
    }

    let (Ok(pod_name), Ok(namespace)) = (std::env::var("POD_NAME"), std::env::var("POD_NAMESPACE"))
    else {
        anyhow::bail!("no probe image configured: set --probe-image or run in-cluster with POD_NAME and POD_NAMESPACE");
    };
    let container = std::env::var("CONTAINER_NAME").ok();

    let pods: Api<Pod> = Api::namespaced(client.clone(), &namespace);
    let pod = retry_with_backoff(
        &RetryConfig::default(),
        "read own pod",
        is_transient,
        || {
            let pods = pods.clone();
            let pod_name = pod_name.clone();
            async move { pods.get(&pod_name).await }
        },
    )
    .await
    .map_err(|e| anyhow::anyhow!("failed to read pod {}/{}: {}", namespace, pod_name, e))?;

    let image = container_image(&pod, container.as_deref())
        .ok_or_else(|| anyhow::anyhow!("pod {}/{} has no container image", namespace, pod_name))?;
    tracing::info!(%image, "Discovered probe image from own pod");
    Ok(image)
}
