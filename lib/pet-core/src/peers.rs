//! Router-side peer list derived from the shared allocation table
//!
//! A router only lists the nodes allocated against its own public key.
//! The installed wg-quick file keeps everything above its first `[Peer]`
//! section; the rest is regenerated.

use crate::Result;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, ObjectReference};
use kube::Resource;
use pet_api::constants::{PURPOSE_ALLOCATIONS, PURPOSE_ANNOTATION, TABLE_KEY};
use pet_api::{AllocationTable, NodeAllocation};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Peers a router should carry, plus where they came from
#[derive(Clone, Debug, PartialEq)]
pub struct PeerSnapshot {
    /// Reference to the allocation table the peers were read from
    pub config_map_ref: ObjectReference,
    pub peer_blocks: Vec<String>,
}

/// Result of installing a changed peer list
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub peers: usize,
    pub exit_code: i32,
}

/// Render one `[Peer]` stanza for a node allocation
pub fn render_peer_block(row: &NodeAllocation) -> String {
    format!(
        "[Peer] # {}\nPublicKey = {}\nAllowedIPs = {}/32 # node\nAllowedIPs = {} # pods\n",
        row.node_name, row.node_key, row.node_ip, row.pod_net
    )
}

/// Derive this router's peers from the watched ConfigMaps.
///
/// Returns `None` when no allocation table is present.
pub fn build_peer_snapshot(
    config_maps: &[Arc<ConfigMap>],
    router_key: &str,
) -> Result<Option<PeerSnapshot>> {
    let table_cm = config_maps.iter().find(|cm| {
        cm.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(PURPOSE_ANNOTATION))
            .is_some_and(|purpose| purpose == PURPOSE_ALLOCATIONS)
    });
    let Some((table_cm, raw)) = table_cm.and_then(|cm| {
        let raw = cm.data.as_ref()?.get(TABLE_KEY)?;
        Some((cm, raw))
    }) else {
        return Ok(None);
    };

    let table = AllocationTable::parse(raw)?;
    let mut config_map_ref = table_cm.object_ref(&());
    config_map_ref.resource_version = table_cm.metadata.resource_version.clone();
    config_map_ref.field_path = Some(format!("data.{}", TABLE_KEY));

    Ok(Some(PeerSnapshot {
        config_map_ref,
        peer_blocks: table.for_router(router_key).map(render_peer_block).collect(),
    }))
}

/// Assemble the new file: the installed header followed by the peer blocks
pub fn assemble_config(installed: &str, peer_blocks: &[String]) -> String {
    let header = installed.split("\n[Peer]").next().unwrap_or_default();
    std::iter::once(header)
        .chain(peer_blocks.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Remembers the last snapshot that was fully handled
#[derive(Debug, Default)]
pub struct PeerDedupe {
    last: Option<Option<PeerSnapshot>>,
}

impl PeerDedupe {
    /// Whether `next` differs from the last recorded snapshot
    pub fn is_new(&self, next: &Option<PeerSnapshot>) -> bool {
        self.last.as_ref() != Some(next)
    }

    /// Record `next` once it has been handled without error
    pub fn record(&mut self, next: Option<PeerSnapshot>) {
        self.last = Some(next);
    }
}

/// Side effects on the router host after the config file changes
#[async_trait]
pub trait HostActions: Send + Sync {
    /// Restart the WireGuard interface, returning the service manager's exit code
    async fn restart_interface(&self) -> Result<i32>;

    /// Record an audit event about the reconfiguration
    async fn record_restart(&self, snapshot: &PeerSnapshot, exit_code: i32) -> Result<()>;
}

/// Keeps a router's wg-quick file in sync with the allocation table
pub struct PeerInstaller<H> {
    config_path: PathBuf,
    router_key: String,
    host: H,
    dedupe: PeerDedupe,
}

impl<H: HostActions> PeerInstaller<H> {
    pub fn new(config_path: impl Into<PathBuf>, router_key: impl Into<String>, host: H) -> Self {
        Self {
            config_path: config_path.into(),
            router_key: router_key.into(),
            host,
            dedupe: PeerDedupe::default(),
        }
    }

    /// Handle one settled ConfigMap snapshot.
    ///
    /// A snapshot only counts as seen once it installed cleanly, so a failed
    /// attempt is retried by the next identical snapshot.
    pub async fn handle(&mut self, config_maps: &[Arc<ConfigMap>]) -> Result<Option<ApplyOutcome>> {
        let snapshot = build_peer_snapshot(config_maps, &self.router_key)?;
        if !self.dedupe.is_new(&snapshot) {
            debug!("Peer list unchanged, nothing to install");
            return Ok(None);
        }
        let Some(snapshot) = snapshot else {
            debug!("No allocation table, nothing to install");
            self.dedupe.record(None);
            return Ok(None);
        };

        let outcome = self.install(&snapshot).await?;
        self.dedupe.record(Some(snapshot));
        Ok(outcome)
    }

    async fn install(&self, snapshot: &PeerSnapshot) -> Result<Option<ApplyOutcome>> {
        let installed = tokio::fs::read_to_string(&self.config_path).await?;
        let new_file = assemble_config(&installed, &snapshot.peer_blocks);
        if new_file == installed {
            debug!("{} already up to date", self.config_path.display());
            return Ok(None);
        }

        tokio::fs::write(&self.config_path, &new_file).await?;
        info!(
            "Wrote {} peers to {}",
            snapshot.peer_blocks.len(),
            self.config_path.display()
        );

        let exit_code = self.host.restart_interface().await?;
        if exit_code != 0 {
            warn!("Interface restart exited with code {}", exit_code);
        }
        self.host.record_restart(snapshot, exit_code).await?;

        Ok(Some(ApplyOutcome {
            peers: snapshot.peer_blocks.len(),
            exit_code,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use pet_api::constants::{ALLOCATION_CONFIGMAP_NAME, PET_NAMESPACE};
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    const HEADER: &str = "[Interface]\nPrivateKey = secret\nListenPort = 51820\n";

    #[derive(Default)]
    struct RecordingHost {
        restarts: Mutex<usize>,
        events: Mutex<Vec<(usize, i32)>>,
        exit_code: i32,
    }

    #[async_trait]
    impl HostActions for Arc<RecordingHost> {
        async fn restart_interface(&self) -> Result<i32> {
            *self.restarts.lock().unwrap() += 1;
            Ok(self.exit_code)
        }

        async fn record_restart(&self, snapshot: &PeerSnapshot, exit_code: i32) -> Result<()> {
            self.events
                .lock()
                .unwrap()
                .push((snapshot.peer_blocks.len(), exit_code));
            Ok(())
        }
    }

    fn row(key: &str, router: &str, name: &str, ip: &str, net: &str) -> NodeAllocation {
        NodeAllocation {
            node_key: key.to_string(),
            router_key: router.to_string(),
            node_name: name.to_string(),
            node_ip: ip.to_string(),
            pod_net: net.to_string(),
        }
    }

    fn table_cm(rows: Vec<NodeAllocation>, version: &str) -> Arc<ConfigMap> {
        Arc::new(ConfigMap {
            metadata: ObjectMeta {
                name: Some(ALLOCATION_CONFIGMAP_NAME.to_string()),
                namespace: Some(PET_NAMESPACE.to_string()),
                resource_version: Some(version.to_string()),
                annotations: Some(BTreeMap::from([(
                    PURPOSE_ANNOTATION.to_string(),
                    PURPOSE_ALLOCATIONS.to_string(),
                )])),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(
                TABLE_KEY.to_string(),
                AllocationTable::new(rows).encode().unwrap(),
            )])),
            ..Default::default()
        })
    }

    fn rows() -> Vec<NodeAllocation> {
        vec![
            row("N1=", "ME=", "pet-1", "10.1.0.1", "10.2.1.0/24"),
            row("N2=", "OTHER=", "pet-2", "10.1.1.1", "10.2.129.0/24"),
            row("N3=", "ME=", "pet-3", "10.1.0.2", "10.2.2.0/24"),
        ]
    }

    #[test]
    fn test_render_peer_block() {
        assert_eq!(
            render_peer_block(&rows()[0]),
            "[Peer] # pet-1\nPublicKey = N1=\nAllowedIPs = 10.1.0.1/32 # node\nAllowedIPs = 10.2.1.0/24 # pods\n"
        );
    }

    #[test]
    fn test_snapshot_filters_by_router() {
        let snapshot = build_peer_snapshot(&[table_cm(rows(), "5")], "ME=").unwrap().unwrap();
        assert_eq!(snapshot.peer_blocks.len(), 2);
        assert!(snapshot.peer_blocks[1].starts_with("[Peer] # pet-3\n"));
        assert_eq!(snapshot.config_map_ref.name.as_deref(), Some(ALLOCATION_CONFIGMAP_NAME));
        assert_eq!(snapshot.config_map_ref.kind.as_deref(), Some("ConfigMap"));
        assert_eq!(snapshot.config_map_ref.field_path.as_deref(), Some("data.table"));
        assert_eq!(snapshot.config_map_ref.resource_version.as_deref(), Some("5"));
    }

    #[test]
    fn test_snapshot_without_table() {
        let unrelated = Arc::new(ConfigMap::default());
        assert_eq!(build_peer_snapshot(&[unrelated], "ME=").unwrap(), None);
    }

    #[test]
    fn test_assemble_keeps_header() {
        let installed = format!("{}\n[Peer] # stale\nPublicKey = OLD=\n", HEADER);
        let blocks = vec!["[Peer] # a\n".to_string(), "[Peer] # b\n".to_string()];
        assert_eq!(
            assemble_config(&installed, &blocks),
            format!("{}\n[Peer] # a\n\n[Peer] # b\n", HEADER)
        );
        assert_eq!(assemble_config(HEADER, &[]), HEADER);
    }

    #[test]
    fn test_dedupe() {
        let snapshot = build_peer_snapshot(&[table_cm(rows(), "5")], "ME=").unwrap();
        let mut dedupe = PeerDedupe::default();
        assert!(dedupe.is_new(&snapshot));
        assert!(dedupe.is_new(&None));

        dedupe.record(snapshot.clone());
        assert!(!dedupe.is_new(&snapshot));
        assert!(dedupe.is_new(&None));

        dedupe.record(None);
        assert!(!dedupe.is_new(&None));
        assert!(dedupe.is_new(&snapshot));
    }

    #[tokio::test]
    async fn test_installer_applies_once_for_identical_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wg-gke.conf");
        std::fs::write(&path, HEADER).unwrap();

        let host = Arc::new(RecordingHost::default());
        let mut installer = PeerInstaller::new(&path, "ME=", host.clone());

        let outcome = installer.handle(&[table_cm(rows(), "5")]).await.unwrap();
        assert_eq!(outcome, Some(ApplyOutcome { peers: 2, exit_code: 0 }));

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.starts_with(HEADER));
        assert!(written.contains("PublicKey = N3="));
        assert!(!written.contains("N2="));

        let again = installer.handle(&[table_cm(rows(), "5")]).await.unwrap();
        assert_eq!(again, None);
        assert_eq!(*host.restarts.lock().unwrap(), 1);
        assert_eq!(*host.events.lock().unwrap(), vec![(2, 0)]);
    }

    #[tokio::test]
    async fn test_installer_skips_when_file_already_matches() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wg-gke.conf");
        std::fs::write(&path, HEADER).unwrap();

        let host = Arc::new(RecordingHost::default());
        let mut installer = PeerInstaller::new(&path, "ME=", host.clone());
        installer.handle(&[table_cm(rows(), "5")]).await.unwrap();

        // New resourceVersion, same rows for this router: passes dedupe but the file is unchanged
        let mut changed = rows();
        changed.push(row("N4=", "OTHER=", "pet-4", "10.1.1.2", "10.2.130.0/24"));
        let outcome = installer.handle(&[table_cm(changed, "6")]).await.unwrap();
        assert_eq!(outcome, None);
        assert_eq!(*host.restarts.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_installer_reports_failed_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wg-gke.conf");
        std::fs::write(&path, HEADER).unwrap();

        let host = Arc::new(RecordingHost {
            exit_code: 3,
            ..Default::default()
        });
        let mut installer = PeerInstaller::new(&path, "ME=", host.clone());
        let outcome = installer.handle(&[table_cm(rows(), "5")]).await.unwrap();
        assert_eq!(outcome, Some(ApplyOutcome { peers: 2, exit_code: 3 }));
        assert_eq!(*host.events.lock().unwrap(), vec![(2, 3)]);
    }

    #[tokio::test]
    async fn test_failed_install_is_retried_by_same_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wg-gke.conf");

        let host = Arc::new(RecordingHost::default());
        let mut installer = PeerInstaller::new(&path, "ME=", host.clone());

        let err = installer.handle(&[table_cm(rows(), "5")]).await.unwrap_err();
        assert!(matches!(err, crate::CoreError::IoError(_)));
        assert_eq!(*host.restarts.lock().unwrap(), 0);

        std::fs::write(&path, HEADER).unwrap();
        let outcome = installer.handle(&[table_cm(rows(), "5")]).await.unwrap();
        assert_eq!(outcome, Some(ApplyOutcome { peers: 2, exit_code: 0 }));
        assert!(std::fs::read_to_string(&path).unwrap().contains("PublicKey = N1="));
        assert_eq!(*host.restarts.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_installer_ignores_missing_table() {
        let host = Arc::new(RecordingHost::default());
        let mut installer = PeerInstaller::new("/nonexistent/wg.conf", "ME=", host.clone());
        assert_eq!(installer.handle(&[]).await.unwrap(), None);
        assert_eq!(*host.restarts.lock().unwrap(), 0);
    }
}
