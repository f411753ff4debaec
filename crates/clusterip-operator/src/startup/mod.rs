//! Startup utilities for the cluster-ip operator

mod crds;
mod image;

pub use crds::ensure_crd_installed;
pub use image::{container_image, discover_probe_image};

/// Whether a kube error is worth retrying during startup
///
/// Client errors other than throttling will not change on retry.
fn is_transient(err: &kube::Error) -> bool {
    match err {
        kube::Error::Api(ae) => ae.code == 429 || ae.code >= 500,
        _ => true,
    }
}
