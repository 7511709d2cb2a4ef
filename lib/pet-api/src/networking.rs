//! Cluster networking configuration carried in the cluster ConfigMap
//!
//! The text is INI-shaped: top-level keys first, then any number of
//! `[Router]` sections. Router order is the allocation search order and
//! is kept exactly as written.

use crate::{ApiError, Result};
use ini::{Ini, Properties};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

const ROUTER_SECTION: &str = "Router";

/// How node WireGuard identities get their configuration
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireguardMode {
    SelfProvision,
    Manual,
}

impl FromStr for WireguardMode {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "SelfProvision" => Ok(WireguardMode::SelfProvision),
            "Manual" => Ok(WireguardMode::Manual),
            other => Err(ApiError::InvalidNetworkingConfig(format!(
                "unknown WireguardMode {:?}",
                other
            ))),
        }
    }
}

/// A router endpoint and the pools it hands out
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Router {
    /// WireGuard public key, referenced by allocations as RouterKey
    pub public_key: String,
    /// host:port peers dial
    pub endpoint: String,
    /// CIDR carved into single node addresses
    pub node_pool: String,
    /// CIDR carved into per-node pod subnets
    pub pod_pool: String,
    /// Prefix length of each pod subnet
    pub pod_prefix_len: u8,
}

/// Cluster-wide networking settings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NetworkingConfig {
    pub node_range: String,
    pub pod_range: String,
    pub service_range: String,
    pub wireguard_mode: Option<WireguardMode>,
    pub cni_number: Option<u32>,
    pub cni_mtu: Option<u32>,
    pub routers: Vec<Router>,
}

impl NetworkingConfig {
    /// Parse the `Networking` text of the cluster ConfigMap
    pub fn parse(raw: &str) -> Result<Self> {
        let doc = Ini::load_from_str(raw)?;
        let top = doc.general_section();

        let node_range = match top.get("NodeRange") {
            Some(range) if !range.is_empty() => range.to_string(),
            _ => {
                return Err(ApiError::InvalidNetworkingConfig(
                    "NodeRange is required".to_string(),
                ))
            }
        };

        let routers = doc
            .section_all(Some(ROUTER_SECTION))
            .map(parse_router)
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            node_range,
            pod_range: top.get("PodRange").unwrap_or_default().to_string(),
            service_range: top.get("ServiceRange").unwrap_or_default().to_string(),
            wireguard_mode: top.get("WireguardMode").map(str::parse).transpose()?,
            cni_number: optional_number(top, "CniNumber")?,
            cni_mtu: optional_number(top, "CniMtu")?,
            routers,
        })
    }

    /// Whether the controller is expected to allocate addresses itself
    pub fn is_self_provision(&self) -> bool {
        self.wireguard_mode == Some(WireguardMode::SelfProvision)
    }

    /// Look up a router by its public key
    pub fn router(&self, public_key: &str) -> Option<&Router> {
        self.routers.iter().find(|r| r.public_key == public_key)
    }
}

fn parse_router(section: &Properties) -> Result<Router> {
    let pod_prefix_len = required(section, "PodPrefixLen")?;
    let pod_prefix_len = pod_prefix_len.parse::<u8>().ok().filter(|len| *len <= 32).ok_or_else(|| {
        ApiError::InvalidNetworkingConfig(format!("bad PodPrefixLen {:?}", pod_prefix_len))
    })?;

    Ok(Router {
        public_key: required(section, "PublicKey")?.to_string(),
        endpoint: required(section, "Endpoint")?.to_string(),
        node_pool: required(section, "NodePool")?.to_string(),
        pod_pool: required(section, "PodPool")?.to_string(),
        pod_prefix_len,
    })
}

fn required<'a>(section: &'a Properties, key: &str) -> Result<&'a str> {
    section.get(key).ok_or_else(|| {
        ApiError::InvalidNetworkingConfig(format!("[Router] section is missing {}", key))
    })
}

fn optional_number(section: &Properties, key: &str) -> Result<Option<u32>> {
    section
        .get(key)
        .map(|raw| {
            raw.parse::<u32>().map_err(|_| {
                ApiError::InvalidNetworkingConfig(format!("{} is not a number: {:?}", key, raw))
            })
        })
        .transpose()
}
