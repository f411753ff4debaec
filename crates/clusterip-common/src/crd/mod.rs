//! Custom Resource Definitions for the cluster-ip operator

mod cluster_ip;

pub use cluster_ip::{ClusterIP, ClusterIPSpec, ClusterIPState, ClusterIPStatus, NodeIP};
