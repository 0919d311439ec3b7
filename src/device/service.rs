//! Device service (port 8083).
//!
//! Owns all Modbus traffic: polls every configured register at its own
//! cadence off a fixed 100 ms tick, tracks device status, publishes the
//! readings snapshot, and consumes write commands that the control
//! service enqueues on shared state — decoupling device I/O from the
//! control cadence.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::{DeviceConfig, DeviceType, SiteConfig};
use crate::device::manager::DeviceManager;
use crate::health::{self, HealthStatus, PORT_DEVICE};
use crate::modbus::{ConnectionPool, RegisterReader, RegisterWriter};
use crate::state::{SharedState, KEY_CONFIG, KEY_WRITE_COMMANDS};

const POLL_TICK: Duration = Duration::from_millis(100);

// Sungrow-style defaults when the config does not name the limit
// registers explicitly.
const DEFAULT_ENABLE_REGISTER: u16 = 5007;
const DEFAULT_LIMIT_REGISTER: u16 = 5008;
const DEFAULT_ENABLE_VALUE: u16 = 0x00AA;

pub struct DeviceService {
    state: SharedState,
    manager: DeviceManager,
    reader: Arc<RegisterReader>,
    writer: Arc<RegisterWriter>,
    pool: ConnectionPool,
}

impl DeviceService {
    pub fn new(state: SharedState) -> Self {
        let pool = ConnectionPool::with_defaults();
        let manager = DeviceManager::new();
        let reader = Arc::new(RegisterReader::new(pool.clone(), manager.clone()));
        let writer = Arc::new(RegisterWriter::new(pool.clone()));
        Self {
            state,
            manager,
            reader,
            writer,
            pool,
        }
    }

    /// Service entry point; returns on shutdown.
    pub async fn run(state: SharedState, mut shutdown: watch::Receiver<bool>) {
        let service = Self::new(state);

        let manager = service.manager.clone();
        let pool = service.pool.clone();
        let health = health::spawn_health_server(
            "device",
            PORT_DEVICE,
            Arc::new(move || {
                let (total, online) = manager.device_counts();
                json!({
                    "devices": { "total": total, "online": online, "offline": total - online },
                })
            }),
        );

        let mut config = match service.wait_for_config(&mut shutdown).await {
            Some(c) => c,
            None => return,
        };
        let mut devices = config.devices.clone();
        service.manager.register_devices(&devices);
        service.reader.start_polling(&devices);

        let reaper = service.pool.spawn_reaper();
        health.set(HealthStatus::Healthy);
        service.state.set_service_health(
            "device",
            json!({"status": "running", "is_healthy": true}),
        );
        info!(devices = devices.len(), "device service started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            // Config reloads reconstruct the device set; nothing is
            // mutated in place.
            if service.state.is_config_changed() {
                if let Some(new_config) = service.load_config() {
                    config = new_config;
                    devices = config.devices.clone();
                    service.manager.register_devices(&devices);
                    service.reader.start_polling(&devices);
                    info!(devices = devices.len(), "device config reloaded");
                }
                service.state.acknowledge_config_change("device");
            }

            for device in &devices {
                if *shutdown.borrow() {
                    break;
                }
                service.reader.poll_device(device, &service.state).await;
            }

            service.manager.publish_snapshot(&service.state, &config);
            service.consume_write_commands(&devices).await;

            tokio::time::sleep(POLL_TICK).await;
        }

        reaper.abort();
        service.pool.close_all().await;
        health.set(HealthStatus::Stopped);
        health.stop_server();
        service.state.set_service_health(
            "device",
            json!({"status": "stopped", "is_healthy": false}),
        );
        info!("device service stopped");
    }

    async fn wait_for_config(&self, shutdown: &mut watch::Receiver<bool>) -> Option<SiteConfig> {
        for _ in 0..30 {
            if *shutdown.borrow() {
                return None;
            }
            if let Some(config) = self.load_config() {
                return Some(config);
            }
            debug!("waiting for configuration");
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        warn!("no configuration after 30s, device service idle");
        // Keep waiting rather than dying; the supervisor reads /health.
        loop {
            if *shutdown.borrow() {
                return None;
            }
            if let Some(config) = self.load_config() {
                return Some(config);
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    fn load_config(&self) -> Option<SiteConfig> {
        let doc = self.state.read_fresh(KEY_CONFIG);
        if doc.get("id").and_then(Value::as_str).is_none() {
            return None;
        }
        match serde_json::from_value::<SiteConfig>(doc) {
            Ok(config) => Some(config),
            Err(e) => {
                error!(error = %e, "invalid config document");
                None
            }
        }
    }

    /// Drain and execute queued write commands. The queue is cleared
    /// up-front so commands enqueued while we execute are kept for the
    /// next tick.
    async fn consume_write_commands(&self, devices: &[DeviceConfig]) {
        let doc = self.state.read_fresh(KEY_WRITE_COMMANDS);
        let Some(commands) = doc.get("commands").and_then(Value::as_array) else {
            return;
        };
        if commands.is_empty() {
            return;
        }
        let commands = commands.clone();
        self.state
            .write(KEY_WRITE_COMMANDS, json!({ "commands": [] }));

        let mut results = Vec::new();
        for command in &commands {
            let device_id = command.get("device_id").and_then(Value::as_str).unwrap_or("");
            let kind = command.get("command").and_then(Value::as_str).unwrap_or("");
            let Some(device) = devices.iter().find(|d| d.id == device_id) else {
                warn!(device_id, "write command for unknown device");
                continue;
            };

            let success = match kind {
                "write_solar_limit" => {
                    let limit_pct = command.get("value").and_then(Value::as_f64).unwrap_or(0.0);
                    self.write_solar_limit(device, limit_pct).await
                }
                "write_register" => {
                    let address = command.get("address").and_then(Value::as_u64).unwrap_or(0) as u16;
                    let value = command.get("value").and_then(Value::as_u64).unwrap_or(0) as u16;
                    self.writer
                        .write_register(device, address, value, true)
                        .await
                        .success
                }
                other => {
                    warn!(command = other, "unknown write command");
                    false
                }
            };

            results.push(json!({
                "device_id": device_id,
                "command": kind,
                "success": success,
                "completed_at": chrono::Utc::now().to_rfc3339(),
            }));
        }

        if !results.is_empty() {
            self.state
                .update(KEY_WRITE_COMMANDS, json!({ "results": results }));
        }
    }

    async fn write_solar_limit(&self, device: &DeviceConfig, limit_pct: f64) -> bool {
        if device.device_type != DeviceType::Inverter {
            warn!(device = %device.name, "solar limit write on non-inverter");
            return false;
        }

        // Prefer explicitly configured limit registers; fall back to the
        // Sungrow layout.
        let enable_register = device
            .register("power_limit_enable")
            .map(|r| r.address)
            .unwrap_or(DEFAULT_ENABLE_REGISTER);
        let limit_register = device
            .register("power_limit_pct")
            .map(|r| r.address)
            .unwrap_or(DEFAULT_LIMIT_REGISTER);

        let result = self
            .writer
            .write_solar_limit(
                device,
                limit_pct,
                enable_register,
                limit_register,
                DEFAULT_ENABLE_VALUE,
            )
            .await;

        if !result.success {
            error!(
                device = %device.name,
                error = result.error.as_deref().unwrap_or("unknown"),
                "solar limit write failed"
            );
        }
        result.success
    }
}
