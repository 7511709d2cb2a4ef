//! First-fit allocation of node addresses and pod subnets
//!
//! Routers are searched in configured order. Within a router the first
//! free /32 in the node pool is paired with the first free pod block in
//! the pod pool. A router whose pod pool is full is abandoned even when
//! node addresses remain; existing tables were written under that rule.

use crate::{CoreError, Result};
use ipnetwork::Ipv4Network;
use pet_api::{AllocationTable, NetworkingConfig, NodeAllocation};
use std::net::Ipv4Addr;
use tracing::debug;

/// Walks aligned blocks of one prefix length through a pool.
///
/// The walk begins one step past the pool's base address and stops at the
/// first block that leaves the pool or contains the pool's last address.
#[derive(Clone, Debug)]
pub struct BlockWalker {
    pool: Ipv4Network,
    prefix: u8,
    step: u64,
    cursor: u64,
    done: bool,
}

impl BlockWalker {
    pub fn new(pool: Ipv4Network, prefix: u8) -> Self {
        let prefix = prefix.min(32);
        Self {
            pool,
            prefix,
            step: 1u64 << (32 - prefix as u32),
            cursor: u64::from(u32::from(pool.ip())),
            done: false,
        }
    }

    fn in_bounds(&self, candidate: &Ipv4Network) -> bool {
        candidate.prefix() >= self.pool.prefix()
            && self.pool.contains(candidate.ip())
            && !candidate.contains(self.pool.broadcast())
    }
}

impl Iterator for BlockWalker {
    type Item = Ipv4Network;

    fn next(&mut self) -> Option<Ipv4Network> {
        if self.done {
            return None;
        }

        let next = self.cursor + self.step;
        let candidate = u32::try_from(next)
            .ok()
            .and_then(|raw| Ipv4Network::new(Ipv4Addr::from(raw), self.prefix).ok());

        match candidate {
            Some(candidate) if self.in_bounds(&candidate) => {
                self.cursor = next;
                Some(candidate)
            }
            _ => {
                self.done = true;
                None
            }
        }
    }
}

/// Whether two blocks intersect (one contains the other, as both are CIDR aligned)
fn overlaps(a: &Ipv4Network, b: &Ipv4Network) -> bool {
    a.contains(b.network()) || b.contains(a.network())
}

fn parse_net(raw: &str, what: &str) -> Result<Ipv4Network> {
    raw.parse::<Ipv4Network>()
        .map_err(|e| CoreError::InvalidConfig(format!("bad {} {:?}: {}", what, raw, e)))
}

/// Pick the next free (node address, pod subnet) pair.
///
/// The returned allocation carries the router key, node IP and pod net;
/// `node_key` and `node_name` are left empty for the caller to fill.
pub fn find_next_allocation(
    config: &NetworkingConfig,
    existing: &AllocationTable,
) -> Result<NodeAllocation> {
    let node_ips = existing
        .rows()
        .iter()
        .map(|row| parse_net(&row.node_ip, "allocated NodeIP"))
        .collect::<Result<Vec<_>>>()?;
    let pod_nets = existing
        .rows()
        .iter()
        .map(|row| parse_net(&row.pod_net, "allocated PodNet"))
        .collect::<Result<Vec<_>>>()?;

    for router in &config.routers {
        let node_pool = parse_net(&router.node_pool, "NodePool")?;
        let pod_pool = parse_net(&router.pod_pool, "PodPool")?;

        let free_node = BlockWalker::new(node_pool, 32)
            .find(|candidate| !node_ips.iter().any(|taken| overlaps(taken, candidate)));
        let Some(node_ip) = free_node else {
            debug!("Router {} has no free node addresses", router.public_key);
            continue;
        };

        let free_pods = BlockWalker::new(pod_pool, router.pod_prefix_len)
            .find(|candidate| !pod_nets.iter().any(|taken| overlaps(taken, candidate)));
        let Some(pod_net) = free_pods else {
            debug!("Router {} has no free pod subnets, trying the next router", router.public_key);
            continue;
        };

        return Ok(NodeAllocation {
            node_key: String::new(),
            router_key: router.public_key.clone(),
            node_name: String::new(),
            node_ip: node_ip.ip().to_string(),
            pod_net: format!("{}/{}", pod_net.ip(), pod_net.prefix()),
        });
    }

    Err(CoreError::AllocationExhausted)
}
