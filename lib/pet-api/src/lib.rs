//! kube-pet API types and wire formats
//!
//! This library defines what the controllers and node agents agree on:
//! - Well-known names, labels and annotation keys
//! - NetworkingConfig: the cluster-wide networking settings and routers
//! - AllocationTable: the append-only NodeKey -> address ledger
//! - Resource paths used as node annotation values

pub mod constants;
pub mod networking;
pub mod allocation;
pub mod error;

pub use networking::{NetworkingConfig, Router, WireguardMode};
pub use allocation::{AllocationTable, NodeAllocation};
pub use error::{ApiError, Result};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

/// Path of a namespaced resource as written into node annotations (`namespace/name`)
pub fn resource_path(meta: &ObjectMeta) -> String {
    format!(
        "{}/{}",
        meta.namespace.as_deref().unwrap_or_default(),
        meta.name.as_deref().unwrap_or_default()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_path() {
        let meta = ObjectMeta {
            name: Some("kube-pet-config".to_string()),
            namespace: Some("kube-pets".to_string()),
            ..Default::default()
        };
        assert_eq!(resource_path(&meta), "kube-pets/kube-pet-config");
    }
}
