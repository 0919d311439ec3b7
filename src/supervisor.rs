//! Process supervisor.
//!
//! Starts the five services in dependency order (system → config →
//! device → control → logging), probes each `/health` endpoint until it
//! reports healthy, and monitors the fleet. A failed service is
//! restarted up to three times with a cool-down; a critical service that
//! stays dead trips the safe-mode override and the rest of the fleet
//! keeps running — the site must fail toward zero solar, not toward an
//! uncontrolled one.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::health::{PORT_CONFIG, PORT_CONTROL, PORT_DEVICE, PORT_LOGGING, PORT_SYSTEM};
use crate::state::{SharedState, KEY_SAFE_MODE_OVERRIDE, KEY_SAFE_MODE_TRIGGER};

const MAX_RESTART_ATTEMPTS: u32 = 3;
const RESTART_COOLDOWN: Duration = Duration::from_secs(10);
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(10);
const STARTUP_TIMEOUT: Duration = Duration::from_secs(30);
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceKind {
    System,
    Config,
    Device,
    Control,
    Logging,
}

impl ServiceKind {
    pub const START_ORDER: [ServiceKind; 5] = [
        ServiceKind::System,
        ServiceKind::Config,
        ServiceKind::Device,
        ServiceKind::Control,
        ServiceKind::Logging,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Config => "config",
            Self::Device => "device",
            Self::Control => "control",
            Self::Logging => "logging",
        }
    }

    pub fn port(self) -> u16 {
        match self {
            Self::System => PORT_SYSTEM,
            Self::Config => PORT_CONFIG,
            Self::Device => PORT_DEVICE,
            Self::Control => PORT_CONTROL,
            Self::Logging => PORT_LOGGING,
        }
    }

    /// Logging is the only non-critical service: losing history must
    /// not force the site to zero solar.
    pub fn critical(self) -> bool {
        !matches!(self, Self::Logging)
    }
}

struct ManagedService {
    kind: ServiceKind,
    handle: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
    restart_count: u32,
}

pub struct Supervisor {
    state: SharedState,
    http: reqwest::Client,
    services: HashMap<ServiceKind, ManagedService>,
    /// Set by the reboot handler to request a fleet-wide stop.
    stop_request: watch::Sender<bool>,
    safe_mode_triggered: bool,
}

impl Supervisor {
    pub fn new(state: SharedState) -> Self {
        let (stop_request, _) = watch::channel(false);
        Self {
            state,
            http: reqwest::Client::new(),
            services: HashMap::new(),
            stop_request,
            safe_mode_triggered: false,
        }
    }

    fn spawn_service(&self, kind: ServiceKind) -> ManagedService {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let state = self.state.clone();

        let handle = match kind {
            ServiceKind::System => {
                let stop_request = self.stop_request.clone();
                tokio::spawn(crate::system::SystemService::run(
                    state,
                    shutdown_rx,
                    stop_request,
                ))
            }
            ServiceKind::Config => {
                tokio::spawn(crate::config_service::ConfigService::run(state, shutdown_rx))
            }
            ServiceKind::Device => {
                tokio::spawn(crate::device::DeviceService::run(state, shutdown_rx))
            }
            ServiceKind::Control => {
                tokio::spawn(crate::control::ControlService::run(state, shutdown_rx))
            }
            ServiceKind::Logging => {
                tokio::spawn(crate::logging::LoggingService::run(state, shutdown_rx))
            }
        };

        ManagedService {
            kind,
            handle,
            shutdown: shutdown_tx,
            restart_count: 0,
        }
    }

    /// Start everything in order and monitor until `shutdown` fires or a
    /// reboot handler requests a stop.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("starting controller supervisor");

        for kind in ServiceKind::START_ORDER {
            info!(service = kind.name(), "starting service");
            let service = self.spawn_service(kind);
            self.services.insert(kind, service);

            let healthy = self.wait_for_health(kind, STARTUP_TIMEOUT).await;
            if !healthy {
                warn!(service = kind.name(), "service not healthy after startup");
                if kind.critical() {
                    self.trigger_safe_mode(format!(
                        "Critical service {} not healthy at startup",
                        kind.name()
                    ));
                }
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        info!("supervisor monitoring fleet");
        let mut stop_request = self.stop_request.subscribe();

        loop {
            tokio::select! {
                _ = tokio::time::sleep(HEALTH_CHECK_INTERVAL) => {}
                _ = shutdown.changed() => break,
                _ = stop_request.changed() => {
                    info!("stop requested (reboot)");
                    break;
                }
            }
            if *shutdown.borrow() {
                break;
            }

            self.monitor_pass().await;
            self.publish_status();
        }

        self.stop_all().await;
        info!("supervisor stopped");
    }

    async fn monitor_pass(&mut self) {
        for kind in ServiceKind::START_ORDER {
            let (finished, restart_count) = match self.services.get(&kind) {
                Some(service) => (service.handle.is_finished(), service.restart_count),
                None => continue,
            };

            let healthy = if finished {
                warn!(service = kind.name(), "service task exited");
                false
            } else {
                self.probe_health(kind.port()).await
            };

            if healthy {
                if let Some(service) = self.services.get_mut(&kind) {
                    service.restart_count = 0;
                }
                continue;
            }

            warn!(service = kind.name(), "service unhealthy");
            self.handle_failure(kind, restart_count).await;
        }
    }

    async fn handle_failure(&mut self, kind: ServiceKind, restart_count: u32) {
        if restart_count >= MAX_RESTART_ATTEMPTS {
            error!(
                service = kind.name(),
                attempts = restart_count,
                "service unrecoverable"
            );
            if kind.critical() {
                self.trigger_safe_mode(format!(
                    "Critical service {} unrecoverable after {} restarts",
                    kind.name(),
                    restart_count
                ));
            }
            return;
        }

        info!(
            service = kind.name(),
            attempt = restart_count + 1,
            max = MAX_RESTART_ATTEMPTS,
            "restarting service"
        );

        // Stop the old instance, cooperatively then hard.
        if let Some(service) = self.services.remove(&kind) {
            let _ = service.shutdown.send(true);
            let stop = tokio::time::timeout(Duration::from_secs(10), service.handle).await;
            if stop.is_err() {
                warn!(service = kind.name(), "service did not stop in time");
            }
        }

        tokio::time::sleep(RESTART_COOLDOWN).await;

        let mut service = self.spawn_service(kind);
        service.restart_count = restart_count + 1;
        self.services.insert(kind, service);

        self.wait_for_health(kind, STARTUP_TIMEOUT).await;
    }

    async fn wait_for_health(&self, kind: ServiceKind, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.probe_health(kind.port()).await {
                return true;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        false
    }

    async fn probe_health(&self, port: u16) -> bool {
        let url = format!("http://127.0.0.1:{port}/health");
        match self.http.get(&url).timeout(PROBE_TIMEOUT).send().await {
            Ok(response) if response.status().is_success() => response
                .json::<serde_json::Value>()
                .await
                .ok()
                .and_then(|body| {
                    body.get("status")
                        .and_then(serde_json::Value::as_str)
                        .map(|s| s == "healthy")
                })
                .unwrap_or(false),
            _ => false,
        }
    }

    fn trigger_safe_mode(&mut self, reason: String) {
        if self.safe_mode_triggered {
            return;
        }
        self.safe_mode_triggered = true;
        error!(reason = %reason, "SAFE MODE TRIGGERED by supervisor");

        self.state.write(
            KEY_SAFE_MODE_OVERRIDE,
            json!({
                "active": true,
                "reason": reason,
                "triggered_at": Utc::now().to_rfc3339(),
                "triggered_by": "supervisor",
            }),
        );
        self.state.write(
            KEY_SAFE_MODE_TRIGGER,
            json!({
                "triggered": true,
                "reason": "Supervisor safe-mode override",
                "service": "supervisor",
            }),
        );
    }

    fn publish_status(&self) {
        let mut services = serde_json::Map::new();
        for (kind, service) in &self.services {
            services.insert(
                kind.name().to_string(),
                json!({
                    "running": !service.handle.is_finished(),
                    "restart_count": service.restart_count,
                    "critical": kind.critical(),
                }),
            );
        }
        self.state.set_service_health(
            "supervisor",
            json!({
                "status": if self.safe_mode_triggered { "degraded" } else { "healthy" },
                "safe_mode_active": self.safe_mode_triggered,
                "services": services,
            }),
        );
    }

    /// Reverse-order cooperative stop.
    async fn stop_all(&mut self) {
        for kind in ServiceKind::START_ORDER.iter().rev() {
            if let Some(service) = self.services.remove(kind) {
                info!(service = kind.name(), "stopping service");
                let _ = service.shutdown.send(true);
                let stop = tokio::time::timeout(Duration::from_secs(15), service.handle).await;
                if stop.is_err() {
                    warn!(service = kind.name(), "service did not stop cleanly");
                }
            }
        }
    }
}
