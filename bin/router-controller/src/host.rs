//! Host side effects for the router: restarting wg-quick and reporting it

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Event, EventSource};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::api::PostParams;
use kube::{Api, Client};
use pet_api::constants::PET_NAMESPACE;
use pet_core::peers::{HostActions, PeerSnapshot};
use tokio::process::Command;
use tracing::info;

pub const EVENT_COMPONENT: &str = "kube-pet-router-controller";

/// systemd unit wg-quick installs for an interface
pub fn unit_name(interface: &str) -> String {
    format!("wg-quick@{}.service", interface)
}

/// Build the audit event for a reconfiguration
pub fn restart_event(
    snapshot: &PeerSnapshot,
    exit_code: i32,
    host: Option<&str>,
    now: DateTime<Utc>,
    name_suffix: &str,
) -> Event {
    Event {
        metadata: ObjectMeta {
            name: Some(format!("{}.{}", EVENT_COMPONENT, name_suffix)),
            namespace: Some(PET_NAMESPACE.to_string()),
            ..Default::default()
        },
        involved_object: snapshot.config_map_ref.clone(),
        reason: Some("Restarted".to_string()),
        message: Some(format!(
            "Reconfigured WireGuard interface with {} peers. Exit code {}",
            snapshot.peer_blocks.len(),
            exit_code
        )),
        type_: Some(if exit_code == 0 { "Normal" } else { "Warning" }.to_string()),
        source: Some(EventSource {
            component: Some(EVENT_COMPONENT.to_string()),
            host: host.map(str::to_string),
        }),
        first_timestamp: Some(Time(now)),
        last_timestamp: Some(Time(now)),
        count: Some(1),
        ..Default::default()
    }
}

/// Restarts the interface through systemd and records events in the cluster
pub struct SystemHost {
    unit: String,
    host: Option<String>,
    events: Api<Event>,
}

impl SystemHost {
    pub fn new(client: Client, interface: &str, host: Option<String>) -> Self {
        Self {
            unit: unit_name(interface),
            host,
            events: Api::namespaced(client, PET_NAMESPACE),
        }
    }
}

#[async_trait]
impl HostActions for SystemHost {
    async fn restart_interface(&self) -> pet_core::Result<i32> {
        info!("Restarting {}", self.unit);
        let status = Command::new("systemctl")
            .args(["restart", "--", self.unit.as_str()])
            .status()
            .await?;
        // Killed by a signal
        Ok(status.code().unwrap_or(-1))
    }

    async fn record_restart(&self, snapshot: &PeerSnapshot, exit_code: i32) -> pet_core::Result<()> {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let event = restart_event(snapshot, exit_code, self.host.as_deref(), Utc::now(), &suffix);
        let created = self.events.create(&PostParams::default(), &event).await?;
        info!(
            "Created event {}",
            created.metadata.name.unwrap_or_default()
        );
        Ok(())
    }
}
