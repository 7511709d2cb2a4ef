//! Per-tick node reconciliation
//!
//! Node state is never stored explicitly. It is recovered each tick by
//! comparing a node's annotations against the current resource paths, so
//! nodes whose annotations get wiped are simply announced again.

use crate::allocator::find_next_allocation;
use crate::cluster::{ClusterApi, ClusterSnapshot};
use crate::{CoreError, Result};
use chrono::Utc;
use k8s_openapi::api::certificates::v1::{CertificateSigningRequest, CertificateSigningRequestCondition, CertificateSigningRequestStatus};
use k8s_openapi::api::core::v1::{ConfigMap, Node};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference, Time};
use pet_api::constants::*;
use pet_api::{resource_path, AllocationTable, NetworkingConfig, NodeAllocation, Router};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const APPROVAL_REASON: &str = "PetAutoApproved";
const APPROVAL_MESSAGE: &str = "Auto approved by kube-pet-node's cluster node-controller";

/// What a single node needs this tick
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NodeDecision {
    /// Hand the node the current config paths
    Announce(BTreeMap<String, String>),
    /// Allocate (or reuse) addresses for this public key and publish its node config
    Provision { wg_pubkey: String },
    Converged,
}

/// Decide what a node needs, purely from its annotations and the current paths.
///
/// `can_provision` is whether both an allocation table and a networking
/// config are available this tick.
pub fn decide(
    node: &Node,
    cluster_path: &str,
    node_cfg_path: Option<&str>,
    can_provision: bool,
) -> NodeDecision {
    let announced_cluster = annotation(node, CLUSTER_CFG_ANNOTATION);
    let announced_node = annotation(node, NODE_CFG_ANNOTATION);

    let stale = announced_cluster != Some(cluster_path)
        || node_cfg_path.is_some_and(|path| announced_node != Some(path));
    if stale {
        let mut wanted = BTreeMap::new();
        wanted.insert(CLUSTER_CFG_ANNOTATION.to_string(), cluster_path.to_string());
        if let Some(path) = node_cfg_path {
            wanted.insert(NODE_CFG_ANNOTATION.to_string(), path.to_string());
        }
        return NodeDecision::Announce(wanted);
    }

    match annotation(node, WG_PUBKEY_ANNOTATION) {
        Some(key) if node_cfg_path.is_none() && !key.is_empty() && can_provision => {
            NodeDecision::Provision {
                wg_pubkey: key.to_string(),
            }
        }
        _ => NodeDecision::Converged,
    }
}

/// Writes performed during one tick
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TickReport {
    pub nodes_seen: usize,
    pub tables_bootstrapped: usize,
    pub annotations_patched: usize,
    pub allocations_written: usize,
    pub node_configs_created: usize,
    pub csrs_approved: usize,
    /// Nodes left unprovisioned because every router is full
    pub nodes_exhausted: usize,
}

impl TickReport {
    /// Total number of writes sent to the cluster
    pub fn writes(&self) -> usize {
        self.tables_bootstrapped
            + self.annotations_patched
            + self.allocations_written
            + self.node_configs_created
            + self.csrs_approved
    }
}

#[derive(Serialize)]
struct IpamConfig<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    subnet: &'a str,
    routes: Vec<IpamRoute<'a>>,
}

#[derive(Serialize)]
struct IpamRoute<'a> {
    dst: &'a str,
}

/// Drives every observed node toward its provisioned state
pub struct NodeReconciler {
    cluster: Arc<dyn ClusterApi>,
}

impl NodeReconciler {
    pub fn new(cluster: Arc<dyn ClusterApi>) -> Self {
        Self { cluster }
    }

    /// Run one reconciliation pass over a snapshot
    pub async fn reconcile(&self, snapshot: &ClusterSnapshot) -> Result<TickReport> {
        let mut report = TickReport {
            nodes_seen: snapshot.nodes.len(),
            ..Default::default()
        };

        let cluster_cm = snapshot
            .config_maps
            .iter()
            .find(|cm| cm.metadata.name.as_deref() == Some(CLUSTER_CONFIGMAP_NAME))
            .ok_or_else(|| CoreError::MissingClusterConfig(CLUSTER_CONFIGMAP_NAME.to_string()))?;
        let cluster_path = resource_path(&cluster_cm.metadata);

        let net_conf = match data_value(cluster_cm, NETWORKING_KEY) {
            Some(raw) => Some(NetworkingConfig::parse(raw)?),
            None => None,
        };
        info!(
            "Found {} routers in cluster config",
            net_conf.as_ref().map(|c| c.routers.len()).unwrap_or_default()
        );

        let mut allocation_cm = snapshot
            .config_maps
            .iter()
            .find(|cm| cm.metadata.name.as_deref() == Some(ALLOCATION_CONFIGMAP_NAME))
            .map(|cm| (**cm).clone());
        if allocation_cm.is_none() && net_conf.as_ref().is_some_and(|c| c.is_self_provision()) {
            info!("Bootstrapping empty allocation table...");
            let created = self.cluster.create_config_map(&empty_allocation_config_map()).await?;
            report.tables_bootstrapped += 1;
            allocation_cm = Some(created);
        }

        let node_cfgs = node_config_maps(&snapshot.config_maps);
        let pending_csrs: Vec<&CertificateSigningRequest> = snapshot
            .csrs
            .iter()
            .map(|csr| csr.as_ref())
            .filter(|csr| is_pending_node_csr(csr))
            .collect();

        for node in &snapshot.nodes {
            let (Some(node_name), Some(node_uid)) =
                (node.metadata.name.clone(), node.metadata.uid.clone())
            else {
                warn!("Skipping node without name or uid");
                continue;
            };

            let node_cfg_path = node_cfgs.get(&node_name).cloned();
            let can_provision = net_conf.is_some()
                && allocation_cm
                    .as_ref()
                    .and_then(|cm| data_value(cm, TABLE_KEY))
                    .is_some_and(|table| !table.is_empty());

            match decide(node, &cluster_path, node_cfg_path.as_deref(), can_provision) {
                NodeDecision::Announce(annotations) => {
                    info!(
                        "Giving node {} launch annotations... {:?}",
                        node_name,
                        annotations.keys().collect::<Vec<_>>()
                    );
                    self.cluster.patch_node_annotations(&node_name, &annotations).await?;
                    report.annotations_patched += 1;
                }
                NodeDecision::Provision { wg_pubkey } => {
                    info!("Node {} published pubkey {}", node_name, wg_pubkey);
                    let (Some(net_conf), Some(table_cm)) = (net_conf.as_ref(), allocation_cm.as_mut())
                    else {
                        continue;
                    };

                    let provisioned = self
                        .provision(
                            &node_name,
                            &node_uid,
                            &wg_pubkey,
                            &cluster_path,
                            net_conf,
                            table_cm,
                            &mut report,
                        )
                        .await;
                    match provisioned {
                        Ok(path) => debug!("Node {} now points at {}", node_name, path),
                        Err(CoreError::AllocationExhausted) => {
                            error!(
                                "Cannot provision node {}: {}",
                                node_name,
                                CoreError::AllocationExhausted
                            );
                            report.nodes_exhausted += 1;
                        }
                        Err(e) => return Err(e),
                    }
                }
                NodeDecision::Converged => {
                    debug!("Node {} is converged", node_name);
                }
            }

            // Loosely follows the upstream node serving-cert approver, trusting
            // the owner binding and service account name only.
            for csr in &pending_csrs {
                if !csr_belongs_to(csr, &node_name, &node_uid) {
                    continue;
                }
                let approved = approve(csr);
                self.cluster.approve_csr(&approved).await?;
                report.csrs_approved += 1;
                info!(
                    "Approved CSR {}",
                    csr.metadata.name.as_deref().unwrap_or_default()
                );
            }
        }

        Ok(report)
    }

    /// Allocate addresses for a node and publish its config. Returns the node config path.
    #[allow(clippy::too_many_arguments)]
    async fn provision(
        &self,
        node_name: &str,
        node_uid: &str,
        wg_pubkey: &str,
        cluster_path: &str,
        net_conf: &NetworkingConfig,
        table_cm: &mut ConfigMap,
        report: &mut TickReport,
    ) -> Result<String> {
        let mut table = AllocationTable::parse(data_value(table_cm, TABLE_KEY).unwrap_or_default())?;

        let allocation = match table.find_by_node_key(wg_pubkey) {
            Some(existing) => existing.clone(),
            None => {
                let allocation = NodeAllocation {
                    node_key: wg_pubkey.to_string(),
                    node_name: node_name.to_string(),
                    ..find_next_allocation(net_conf, &table)?
                };
                table.push(allocation.clone());
                info!("Storing new allocation: {:?}", allocation);

                table_cm
                    .data
                    .get_or_insert_with(BTreeMap::new)
                    .insert(TABLE_KEY.to_string(), table.encode()?);
                *table_cm = self.cluster.replace_config_map(table_cm).await?;
                report.allocations_written += 1;
                allocation
            }
        };

        let router = net_conf
            .router(&allocation.router_key)
            .ok_or_else(|| CoreError::UnknownRouter(allocation.router_key.clone()))?;

        let node_cm = render_node_config_map(node_name, node_uid, &allocation, net_conf, router)?;
        let created = self.cluster.create_config_map(&node_cm).await?;
        report.node_configs_created += 1;
        info!("Wrote new configuration {}", node_configmap_name(node_name));

        let node_cfg_path = resource_path(&created.metadata);
        let mut annotations = BTreeMap::new();
        annotations.insert(CLUSTER_CFG_ANNOTATION.to_string(), cluster_path.to_string());
        annotations.insert(NODE_CFG_ANNOTATION.to_string(), node_cfg_path.clone());
        info!(
            "Giving node {} launch annotations... {:?}",
            node_name,
            annotations.keys().collect::<Vec<_>>()
        );
        self.cluster.patch_node_annotations(node_name, &annotations).await?;
        report.annotations_patched += 1;

        Ok(node_cfg_path)
    }
}

fn annotation<'a>(node: &'a Node, key: &str) -> Option<&'a str> {
    node.metadata.annotations.as_ref()?.get(key).map(String::as_str)
}

fn data_value<'a>(cm: &'a ConfigMap, key: &str) -> Option<&'a str> {
    cm.data.as_ref()?.get(key).map(String::as_str)
}

fn pet_labels() -> BTreeMap<String, String> {
    BTreeMap::from([(ROLE_LABEL_KEY.to_string(), ROLE_LABEL_VALUE.to_string())])
}

fn empty_allocation_config_map() -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(ALLOCATION_CONFIGMAP_NAME.to_string()),
            namespace: Some(PET_NAMESPACE.to_string()),
            labels: Some(pet_labels()),
            annotations: Some(BTreeMap::from([(
                PURPOSE_ANNOTATION.to_string(),
                PURPOSE_ALLOCATIONS.to_string(),
            )])),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(TABLE_KEY.to_string(), AllocationTable::empty_text())])),
        ..Default::default()
    }
}

/// Per-node ConfigMaps keyed by the name of their owning Node, mapped to their resource path
fn node_config_maps(config_maps: &[Arc<ConfigMap>]) -> HashMap<String, String> {
    config_maps
        .iter()
        .filter(|cm| {
            cm.metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get(PURPOSE_ANNOTATION))
                .is_some_and(|purpose| purpose == PURPOSE_NODE)
        })
        .filter_map(|cm| match cm.metadata.owner_references.as_deref() {
            Some([owner]) if owner.kind == "Node" => {
                Some((owner.name.clone(), resource_path(&cm.metadata)))
            }
            _ => None,
        })
        .collect()
}

/// Render the ConfigMap a node agent reads to bring up its tunnel
pub fn render_node_config_map(
    node_name: &str,
    node_uid: &str,
    allocation: &NodeAllocation,
    net_conf: &NetworkingConfig,
    router: &Router,
) -> Result<ConfigMap> {
    let wireguard = format!(
        "[Interface] # Our own node IP\n\
         Address = {}/32\n\
         [Peer] # The cluster node/pod IP ranges\n\
         PublicKey = {}\n\
         AllowedIPs = {}\n\
         AllowedIPs = {}\n\
         Endpoint = {}\n\
         PersistentKeepalive = 25\n",
        allocation.node_ip,
        allocation.router_key,
        net_conf.node_range,
        net_conf.pod_range,
        router.endpoint,
    );
    let ipam = serde_json::to_string(&IpamConfig {
        kind: "host-local",
        subnet: &allocation.pod_net,
        routes: vec![IpamRoute { dst: "0.0.0.0/0" }],
    })?;

    Ok(ConfigMap {
        metadata: ObjectMeta {
            name: Some(node_configmap_name(node_name)),
            namespace: Some(PET_NAMESPACE.to_string()),
            labels: Some(pet_labels()),
            annotations: Some(BTreeMap::from([
                (PURPOSE_ANNOTATION.to_string(), PURPOSE_NODE.to_string()),
                (WG_PUBKEY_ANNOTATION.to_string(), allocation.node_key.clone()),
            ])),
            owner_references: Some(vec![OwnerReference {
                api_version: "v1".to_string(),
                kind: "Node".to_string(),
                name: node_name.to_string(),
                uid: node_uid.to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        },
        data: Some(BTreeMap::from([
            (WIREGUARD_CONFIG_KEY.to_string(), wireguard),
            (IPAM_JSON_KEY.to_string(), ipam),
        ])),
        ..Default::default()
    })
}

/// Unanswered CSR owned by exactly one Node
fn is_pending_node_csr(csr: &CertificateSigningRequest) -> bool {
    let owned_by_node = matches!(
        csr.metadata.owner_references.as_deref(),
        Some([owner]) if owner.kind == "Node"
    );
    let answered = csr.status.as_ref().is_some_and(|status| {
        status.conditions.as_ref().is_some_and(|c| !c.is_empty()) || status.certificate.is_some()
    });
    owned_by_node && !answered
}

fn csr_belongs_to(csr: &CertificateSigningRequest, node_name: &str, node_uid: &str) -> bool {
    let owner_matches = csr
        .metadata
        .owner_references
        .as_deref()
        .and_then(|owners| owners.first())
        .is_some_and(|owner| owner.uid == node_uid);
    let username_matches =
        csr.spec.username.as_deref() == Some(node_serviceaccount_username(node_name).as_str());
    let serving = csr
        .spec
        .usages
        .as_ref()
        .is_some_and(|usages| usages.iter().any(|u| u == "server auth"));
    owner_matches && username_matches && serving
}

fn approve(csr: &CertificateSigningRequest) -> CertificateSigningRequest {
    let now = Time(Utc::now());
    let mut approved = csr.clone();
    approved.status = Some(CertificateSigningRequestStatus {
        conditions: Some(vec![CertificateSigningRequestCondition {
            type_: "Approved".to_string(),
            status: "True".to_string(),
            reason: Some(APPROVAL_REASON.to_string()),
            message: Some(APPROVAL_MESSAGE.to_string()),
            last_transition_time: Some(now.clone()),
            last_update_time: Some(now),
        }]),
        certificate: None,
    });
    approved
}
