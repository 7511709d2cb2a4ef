//! Prometheus metrics for the node controller

use crate::reconciler::TickReport;
use crate::Result;
use prometheus::{Encoder, IntCounter, Registry, TextEncoder};
use std::sync::Arc;

/// Counters describing reconciliation activity
#[derive(Clone)]
pub struct ControllerMetrics {
    /// Reconciliation passes started
    pub ticks_total: IntCounter,
    /// Passes aborted by an error
    pub tick_errors_total: IntCounter,
    pub node_patches_total: IntCounter,
    pub allocations_total: IntCounter,
    pub node_configs_total: IntCounter,
    pub csr_approvals_total: IntCounter,
    /// Nodes left waiting because no router had room
    pub exhausted_nodes_total: IntCounter,
    pub registry: Arc<Registry>,
}

impl ControllerMetrics {
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());

        let counter = |name: &str, help: &str| -> Result<IntCounter> {
            let counter = IntCounter::new(name, help)?;
            registry.register(Box::new(counter.clone()))?;
            Ok(counter)
        };

        Ok(Self {
            ticks_total: counter("kube_pet_reconcile_ticks_total", "Reconciliation passes started")?,
            tick_errors_total: counter("kube_pet_reconcile_errors_total", "Reconciliation passes aborted by an error")?,
            node_patches_total: counter("kube_pet_node_patches_total", "Node annotation patches sent")?,
            allocations_total: counter("kube_pet_allocations_total", "Address allocations written")?,
            node_configs_total: counter("kube_pet_node_configmaps_total", "Per-node ConfigMaps created")?,
            csr_approvals_total: counter("kube_pet_csr_approvals_total", "Certificate signing requests approved")?,
            exhausted_nodes_total: counter("kube_pet_exhausted_nodes_total", "Nodes skipped because the address pools are full")?,
            registry,
        })
    }

    /// Fold a finished pass into the counters
    pub fn record(&self, report: &TickReport) {
        self.node_patches_total.inc_by(report.annotations_patched as u64);
        self.allocations_total.inc_by(report.allocations_written as u64);
        self.node_configs_total.inc_by(report.node_configs_created as u64);
        self.csr_approvals_total.inc_by(report.csrs_approved as u64);
        self.exhausted_nodes_total.inc_by(report.nodes_exhausted as u64);
    }

    /// Gather all metrics in Prometheus text format
    pub fn gather(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = vec![];
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}
