//! Reconciliation core for the kube-pet WireGuard mesh
//!
//! This library provides:
//! - Address allocation out of router node/pod pools
//! - The per-tick node reconciler and CSR auto-approval
//! - Coalescing of watched resource snapshots into settled ticks
//! - Router-side peer list derivation
//! - WireGuard key derivation and controller metrics

pub mod allocator;
pub mod cluster;
pub mod coalesce;
pub mod error;
pub mod metrics;
pub mod peers;
pub mod reconciler;
pub mod wgkey;

pub use allocator::find_next_allocation;
pub use cluster::{ClusterApi, ClusterSnapshot, KubeCluster};
pub use error::{CoreError, Result};
pub use metrics::ControllerMetrics;
pub use peers::{PeerSnapshot, PeerInstaller};
pub use reconciler::{NodeReconciler, TickReport};
