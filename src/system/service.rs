//! System service (port 8081).
//!
//! First service up: heartbeats, fleet health monitoring, OTA, and
//! reboot handling all live here. It carries no control authority —
//! losing it degrades observability, not safety — but it is the only
//! path by which the cloud learns the site exists.

use std::sync::Arc;

use serde_json::json;
use tokio::sync::watch;
use tracing::info;

use crate::cloud::CloudClient;
use crate::config::ControllerIdentity;
use crate::health::{self, HealthStatus, PORT_SYSTEM};
use crate::state::SharedState;
use crate::system::health_monitor::HealthMonitor;
use crate::system::heartbeat::HeartbeatSender;
use crate::system::ota::OtaUpdater;
use crate::system::reboot::RebootHandler;

pub struct SystemService;

impl SystemService {
    /// Service entry point; returns on shutdown. `stop_request` lets the
    /// reboot handler ask the supervisor for a reverse-order stop.
    pub async fn run(
        state: SharedState,
        shutdown: watch::Receiver<bool>,
        stop_request: watch::Sender<bool>,
    ) {
        let identity = ControllerIdentity::from_env();
        let client = CloudClient::from_env();

        let state_for_health = state.clone();
        let health = health::spawn_health_server(
            "system",
            PORT_SYSTEM,
            Arc::new(move || {
                json!({
                    "ota": state_for_health.read(crate::state::KEY_OTA_STATUS),
                })
            }),
        );

        let mut tasks = Vec::new();

        let heartbeat = HeartbeatSender::new(identity.clone(), client.clone(), state.clone());
        tasks.push(tokio::spawn(heartbeat.run(shutdown.clone())));

        let monitor = HealthMonitor::new(state.clone());
        tasks.push(tokio::spawn(monitor.run(shutdown.clone())));

        if let Some(client) = client {
            let ota = OtaUpdater::new(identity.clone(), client.clone(), state.clone());
            tasks.push(tokio::spawn(ota.run(shutdown.clone())));

            let reboot = RebootHandler::new(identity, client, state.clone(), stop_request);
            tasks.push(tokio::spawn(reboot.run(shutdown.clone())));
        } else {
            info!("no cloud credentials, OTA and reboot polling disabled");
        }

        health.set(HealthStatus::Healthy);
        state.set_service_health("system", json!({"status": "running", "is_healthy": true}));
        info!("system service started");

        let _ = futures_util::future::join_all(tasks).await;

        health.set(HealthStatus::Stopped);
        health.stop_server();
        state.set_service_health("system", json!({"status": "stopped", "is_healthy": false}));
        info!("system service stopped");
    }
}
