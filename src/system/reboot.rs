//! Reboot command handling.
//!
//! Polls the cloud command table every 10 s. A graceful reboot stops
//! services in reverse order, emits a final heartbeat, writes a
//! `reboot_pending` document, and issues the OS reboot; on the next
//! start the pending document is consulted and the command is marked
//! completed.

use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::cloud::CloudClient;
use crate::config::ControllerIdentity;
use crate::state::{SharedState, KEY_REBOOT_PENDING};

pub const POLL_INTERVAL: Duration = Duration::from_secs(10);

pub struct RebootHandler {
    identity: ControllerIdentity,
    client: CloudClient,
    state: SharedState,
    /// Requests the supervisor to stop services in reverse order.
    stop_request: watch::Sender<bool>,
}

impl RebootHandler {
    pub fn new(
        identity: ControllerIdentity,
        client: CloudClient,
        state: SharedState,
        stop_request: watch::Sender<bool>,
    ) -> Self {
        Self {
            identity,
            client,
            state,
            stop_request,
        }
    }

    /// On startup: if we came back from a commanded reboot, close the
    /// loop with the cloud.
    pub async fn check_post_reboot(&self) {
        let pending = self.state.read_fresh(KEY_REBOOT_PENDING);
        let Some(command_id) = pending.get("command_id").and_then(Value::as_str) else {
            return;
        };
        info!(command_id, "completing reboot command after restart");
        self.update_command_status(command_id, "completed").await;
        self.state.delete(KEY_REBOOT_PENDING);
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        self.check_post_reboot().await;

        loop {
            if *shutdown.borrow() {
                break;
            }

            if let Err(e) = self.check_commands().await {
                warn!(error = %e, "reboot command poll failed");
            }

            tokio::select! {
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
                _ = shutdown.changed() => break,
            }
        }
    }

    async fn check_commands(&self) -> crate::errors::Result<()> {
        let rows = self
            .client
            .get_rows(
                "control_commands",
                &[
                    ("controller_id", format!("eq.{}", self.identity.controller_id)),
                    ("command", "eq.reboot".to_string()),
                    ("status", "eq.pending".to_string()),
                    ("select", "id,payload".to_string()),
                ],
            )
            .await?;

        let Some(command) = rows.first() else {
            return Ok(());
        };
        let command_id = command
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let graceful = command
            .get("payload")
            .and_then(|p| p.get("graceful"))
            .and_then(Value::as_bool)
            .unwrap_or(true);

        info!(command_id = %command_id, graceful, "reboot command received");
        self.update_command_status(&command_id, "in_progress").await;
        self.execute_reboot(&command_id, graceful).await;
        Ok(())
    }

    async fn execute_reboot(&self, command_id: &str, graceful: bool) {
        self.state.write(
            KEY_REBOOT_PENDING,
            json!({
                "command_id": command_id,
                "requested_at": Utc::now().to_rfc3339(),
                "graceful": graceful,
            }),
        );

        if graceful {
            // Services stop in reverse order; the final heartbeat goes
            // out as the heartbeat task drains.
            let _ = self.stop_request.send(true);
            tokio::time::sleep(Duration::from_secs(5)).await;
        }

        info!("issuing OS reboot");
        match tokio::process::Command::new("systemctl")
            .arg("reboot")
            .status()
            .await
        {
            Ok(status) if status.success() => {}
            Ok(status) => {
                error!(code = status.code(), "reboot command exited nonzero");
                self.update_command_status(command_id, "failed").await;
                self.state.delete(KEY_REBOOT_PENDING);
            }
            Err(e) => {
                error!(error = %e, "failed to invoke reboot");
                self.update_command_status(command_id, "failed").await;
                self.state.delete(KEY_REBOOT_PENDING);
            }
        }
    }

    async fn update_command_status(&self, command_id: &str, status: &str) {
        let result = self
            .client
            .patch_rows(
                "control_commands",
                &[("id", format!("eq.{command_id}"))],
                &json!({ "status": status, "updated_at": Utc::now().to_rfc3339() }),
            )
            .await;
        if let Err(e) = result {
            warn!(command_id, status, error = %e, "command status update failed");
        }
    }
}
