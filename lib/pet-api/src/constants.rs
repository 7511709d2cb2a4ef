/// Well-known names and keys shared by the controllers and the node agent

/// Namespace holding every ConfigMap this system owns
pub const PET_NAMESPACE: &str = "kube-pets";

/// Label applied to pet Nodes and to every object this system creates
pub const ROLE_LABEL_KEY: &str = "kubernetes.io/role";
pub const ROLE_LABEL_VALUE: &str = "pet";
/// Selector form of the role label, used for every list and watch
pub const LABEL_SELECTOR: &str = "kubernetes.io/role=pet";

pub const CLUSTER_CONFIGMAP_NAME: &str = "kube-pet-config";
pub const ALLOCATION_CONFIGMAP_NAME: &str = "kube-pet-allocations";

/// Node annotation: path of the cluster config the node was handed
pub const CLUSTER_CFG_ANNOTATION: &str = "pet.wg69.net/cluster-configmap";
/// Node annotation: path of the node's own configuration
pub const NODE_CFG_ANNOTATION: &str = "pet.wg69.net/node-configmap";
/// Node annotation written by the node agent: its WireGuard public key
pub const WG_PUBKEY_ANNOTATION: &str = "pet.wg69.net/wg-pubkey";

/// Node annotations under this prefix churn constantly and never affect reconciliation
pub const NOISY_ANNOTATION_PREFIX: &str = "virtual-kubelet.io/";

pub const PURPOSE_ANNOTATION: &str = "pet.wg69.net/purpose";
pub const PURPOSE_CLUSTER: &str = "cluster configuration";
pub const PURPOSE_NODE: &str = "node configuration";
pub const PURPOSE_ALLOCATIONS: &str = "address allocation table";

/// ConfigMap data keys
pub const NETWORKING_KEY: &str = "Networking";
pub const TABLE_KEY: &str = "table";
pub const WIREGUARD_CONFIG_KEY: &str = "WireguardConfig";
pub const IPAM_JSON_KEY: &str = "IpamJson";

/// Prefix of per-node ConfigMap names (`node-<nodeName>`)
pub const NODE_CONFIGMAP_PREFIX: &str = "node-";

/// Service account username a node's serving certificate request must carry
pub fn node_serviceaccount_username(node_name: &str) -> String {
    format!("system:serviceaccount:kube-system:node.{}", node_name)
}

/// Name of the per-node ConfigMap for a node
pub fn node_configmap_name(node_name: &str) -> String {
    format!("{}{}", NODE_CONFIGMAP_PREFIX, node_name)
}
