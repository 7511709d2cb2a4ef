//! The cluster-facing seam of the reconciler
//!
//! Reads arrive as full snapshots of the watched collections; writes go
//! through [`ClusterApi`] so the reconciler can be driven against a real
//! API server or an in-memory stand-in.

use crate::Result;
use async_trait::async_trait;
use k8s_openapi::api::certificates::v1::CertificateSigningRequest;
use k8s_openapi::api::core::v1::{ConfigMap, Node};
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use kube::Client;
use pet_api::constants::{LABEL_SELECTOR, PET_NAMESPACE};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// One consistent-enough view of everything the node reconciler looks at
#[derive(Clone, Debug, Default)]
pub struct ClusterSnapshot {
    pub nodes: Vec<Arc<Node>>,
    pub config_maps: Vec<Arc<ConfigMap>>,
    pub csrs: Vec<Arc<CertificateSigningRequest>>,
}

/// Writes the node reconciler performs against the cluster
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Create a ConfigMap in the pet namespace, returning the stored object
    async fn create_config_map(&self, config_map: &ConfigMap) -> Result<ConfigMap>;

    /// Replace a ConfigMap; the carried resourceVersion guards against concurrent writers
    async fn replace_config_map(&self, config_map: &ConfigMap) -> Result<ConfigMap>;

    /// Strategic-merge the given annotations onto a Node
    async fn patch_node_annotations(
        &self,
        node_name: &str,
        annotations: &BTreeMap<String, String>,
    ) -> Result<()>;

    /// Submit a CSR carrying an Approved condition to the approval subresource
    async fn approve_csr(&self, csr: &CertificateSigningRequest) -> Result<()>;
}

/// [`ClusterApi`] backed by a live API server
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn config_maps(&self) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), PET_NAMESPACE)
    }

    /// List every labelled resource once, without watching
    pub async fn list_snapshot(&self) -> Result<ClusterSnapshot> {
        let lp = ListParams::default().labels(LABEL_SELECTOR);
        let nodes: Api<Node> = Api::all(self.client.clone());
        let csrs: Api<CertificateSigningRequest> = Api::all(self.client.clone());
        let config_maps = self.config_maps();

        let (nodes, config_maps, csrs) = tokio::try_join!(
            nodes.list(&lp),
            config_maps.list(&lp),
            csrs.list(&lp),
        )?;

        debug!(
            "Listed {} nodes, {} configmaps, {} csrs",
            nodes.items.len(),
            config_maps.items.len(),
            csrs.items.len()
        );

        Ok(ClusterSnapshot {
            nodes: nodes.items.into_iter().map(Arc::new).collect(),
            config_maps: config_maps.items.into_iter().map(Arc::new).collect(),
            csrs: csrs.items.into_iter().map(Arc::new).collect(),
        })
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn create_config_map(&self, config_map: &ConfigMap) -> Result<ConfigMap> {
        Ok(self
            .config_maps()
            .create(&PostParams::default(), config_map)
            .await?)
    }

    async fn replace_config_map(&self, config_map: &ConfigMap) -> Result<ConfigMap> {
        let name = config_map.metadata.name.as_deref().unwrap_or_default();
        Ok(self
            .config_maps()
            .replace(name, &PostParams::default(), config_map)
            .await?)
    }

    async fn patch_node_annotations(
        &self,
        node_name: &str,
        annotations: &BTreeMap<String, String>,
    ) -> Result<()> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let patch = json!({ "metadata": { "annotations": annotations } });
        nodes
            .patch(node_name, &PatchParams::default(), &Patch::Strategic(&patch))
            .await?;
        Ok(())
    }

    async fn approve_csr(&self, csr: &CertificateSigningRequest) -> Result<()> {
        let csrs: Api<CertificateSigningRequest> = Api::all(self.client.clone());
        let name = csr.metadata.name.as_deref().unwrap_or_default();
        csrs.replace_subresource("approval", name, &PostParams::default(), serde_json::to_vec(csr)?)
            .await?;
        Ok(())
    }
}
