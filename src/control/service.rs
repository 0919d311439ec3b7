//! Control service (port 8084).
//!
//! Each cycle: snapshot readings and device status from shared state,
//! compute the standard totals, consult the safe-mode supervisor, run
//! the configured operation mode, enqueue the resulting writes for the
//! device service, and publish the complete control state. Cycles fire
//! on wall-clock boundaries via the interval scheduler.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::{DeviceType, ModeSettings, SiteConfig};
use crate::control::modes::{self, LoadSource, ModeInputs};
use crate::control::safe_mode::SafeModeSupervisor;
use crate::device::manager::CONTROLLER_DEVICE_ID;
use crate::health::{self, HealthStatus, PORT_CONTROL};
use crate::scheduler::ScheduledLoop;
use crate::state::{SharedState, KEY_CONFIG, KEY_CONTROL_STATE, KEY_WRITE_COMMANDS};

/// One document, overwritten every cycle.
#[derive(Debug, Clone)]
pub struct ControlState {
    pub total_load_kw: f64,
    pub solar_output_kw: f64,
    pub dg_power_kw: f64,
    pub dg_reserve_kw: f64,
    pub solar_capacity_kw: f64,
    pub solar_limit_pct: f64,
    pub solar_limit_kw: f64,
    pub load_source: LoadSource,
    pub safe_mode_active: bool,
    pub safe_mode_reason: Option<String>,
    pub operation_mode: String,
    pub load_meters_online: usize,
    pub inverters_online: usize,
    pub generators_online: usize,
    pub execution_time_ms: f64,
    pub write_success: bool,
    pub write_error: Option<String>,
}

impl Default for ControlState {
    fn default() -> Self {
        Self {
            total_load_kw: 0.0,
            solar_output_kw: 0.0,
            dg_power_kw: 0.0,
            dg_reserve_kw: 0.0,
            solar_capacity_kw: 0.0,
            solar_limit_pct: 100.0,
            solar_limit_kw: 0.0,
            load_source: LoadSource::None,
            safe_mode_active: false,
            safe_mode_reason: None,
            operation_mode: "zero_generator_feed".into(),
            load_meters_online: 0,
            inverters_online: 0,
            generators_online: 0,
            execution_time_ms: 0.0,
            write_success: true,
            write_error: None,
        }
    }
}

impl ControlState {
    pub fn to_value(&self) -> Value {
        json!({
            "timestamp": Utc::now().to_rfc3339(),
            "total_load_kw": self.total_load_kw,
            "solar_output_kw": self.solar_output_kw,
            "dg_power_kw": self.dg_power_kw,
            "dg_reserve_kw": self.dg_reserve_kw,
            "solar_capacity_kw": self.solar_capacity_kw,
            "solar_limit_pct": self.solar_limit_pct,
            "solar_limit_kw": self.solar_limit_kw,
            "load_source": self.load_source,
            "safe_mode_active": self.safe_mode_active,
            "safe_mode_reason": self.safe_mode_reason,
            "operation_mode": self.operation_mode,
            "load_meters_online": self.load_meters_online,
            "inverters_online": self.inverters_online,
            "generators_online": self.generators_online,
            "execution_time_ms": self.execution_time_ms,
            "write_success": self.write_success,
            "write_error": self.write_error,
        })
    }
}

pub struct ControlService {
    state: SharedState,
    safe_mode: SafeModeSupervisor,
    current: ControlState,
    config: SiteConfig,
    mode_settings: ModeSettings,
    /// Missing required mode settings hold the service at the safe-mode
    /// limit until a config reload resolves them.
    config_hold: bool,
    inverter_ids: Vec<String>,
}

impl ControlService {
    fn configure(state: &SharedState, config: SiteConfig) -> Self {
        let (mode_settings, warnings) = config.resolve_mode_settings();
        for warning in &warnings {
            warn!(warning = %warning, "config validation");
        }
        let config_hold = warnings
            .iter()
            .any(|w| w.starts_with("missing required setting"));
        if config_hold {
            warn!("required mode settings missing, holding at safe-mode limit");
        }

        let inverter_ids = config
            .devices_by_type(DeviceType::Inverter)
            .map(|d| d.id.clone())
            .collect();

        Self {
            state: state.clone(),
            safe_mode: SafeModeSupervisor::new(config.safe_mode.clone()),
            current: ControlState {
                operation_mode: config.operation_mode().as_str().to_string(),
                solar_capacity_kw: config.solar_capacity_kw(),
                ..Default::default()
            },
            config,
            mode_settings,
            config_hold,
            inverter_ids,
        }
    }

    /// Service entry point; returns on shutdown.
    pub async fn run(state: SharedState, mut shutdown: watch::Receiver<bool>) {
        // Shared with the health endpoint.
        let published: Arc<Mutex<ControlState>> = Arc::new(Mutex::new(ControlState::default()));

        let health_view = published.clone();
        let health = health::spawn_health_server(
            "control",
            PORT_CONTROL,
            Arc::new(move || {
                let current = health_view.lock().unwrap_or_else(|e| e.into_inner());
                json!({
                    "operation_mode": current.operation_mode,
                    "safe_mode_active": current.safe_mode_active,
                    "solar_limit_pct": current.solar_limit_pct,
                })
            }),
        );

        let Some(config) = wait_for_config(&state, &mut shutdown).await else {
            return;
        };
        let service = Self::configure(&state, config);

        health.set(HealthStatus::Healthy);
        state.set_service_health("control", json!({"status": "running", "is_healthy": true}));
        info!(
            mode = %service.current.operation_mode,
            interval_ms = service.config.control_interval_ms_clamped(),
            capacity_kw = service.current.solar_capacity_kw,
            "control service started"
        );

        let interval = Duration::from_millis(service.config.control_interval_ms_clamped());
        let looper = Arc::new(ScheduledLoop::new("control", interval));

        let loop_ref = looper.clone();
        let shutdown_for_loop = shutdown.clone();
        let service_cell = Arc::new(tokio::sync::Mutex::new(service));
        let service_for_loop = service_cell.clone();
        let published_for_loop = published.clone();

        let run = tokio::spawn(async move {
            loop_ref
                .run(move || {
                    let service = service_for_loop.clone();
                    let published = published_for_loop.clone();
                    let shutdown = shutdown_for_loop.clone();
                    async move {
                        if *shutdown.borrow() {
                            return;
                        }
                        let mut service = service.lock().await;
                        service.execute_cycle().await;
                        if let Ok(mut p) = published.lock() {
                            *p = service.current.clone();
                        }
                    }
                })
                .await;
        });

        if !*shutdown.borrow() {
            let _ = shutdown.changed().await;
        }
        looper.stop();
        let _ = run.await;

        health.set(HealthStatus::Stopped);
        health.stop_server();
        state.set_service_health("control", json!({"status": "stopped", "is_healthy": false}));
        info!("control service stopped");
    }

    async fn execute_cycle(&mut self) {
        let started = Instant::now();

        // Config reloads re-resolve the mode settings and device set.
        if self.state.is_config_changed() {
            let doc = self.state.read_fresh(KEY_CONFIG);
            match serde_json::from_value::<SiteConfig>(doc) {
                Ok(config) => {
                    let state = self.state.clone();
                    let reconfigured = Self::configure(&state, config);
                    let previous = std::mem::replace(self, reconfigured);
                    // The safe-mode window survives a reload.
                    self.safe_mode = previous.safe_mode;
                    self.safe_mode.update_settings(self.config.safe_mode.clone());
                    info!("control config reloaded");
                }
                Err(e) => error!(error = %e, "config reload failed"),
            }
            self.state.acknowledge_config_change("control");
        }

        // 1–2. Snapshot readings and compute totals.
        let readings = self.state.read(crate::state::KEY_READINGS);
        let inputs = self.build_inputs(&readings);
        let device_online = self.device_online_map(&readings);

        self.current.total_load_kw = inputs.total_load_kw;
        self.current.solar_output_kw = inputs.total_solar_kw;
        self.current.dg_power_kw = inputs.total_dg_kw;
        self.current.solar_capacity_kw = inputs.solar_capacity_kw;
        self.current.load_meters_online = inputs.load_meters_online;
        self.current.generators_online = inputs.generators_online;
        self.current.inverters_online = readings
            .get("inverters_online")
            .and_then(Value::as_u64)
            .unwrap_or(0) as usize;
        if let ModeSettings::ZeroGeneratorFeed { dg_reserve_kw }
        | ModeSettings::ZeroDgPf { dg_reserve_kw, .. } = &self.mode_settings
        {
            self.current.dg_reserve_kw = *dg_reserve_kw;
        }

        // 4. Safe mode.
        let safe_mode_active = self.safe_mode.check_and_trigger(
            &self.state,
            inputs.total_load_kw,
            inputs.total_solar_kw,
            &device_online,
            Utc::now(),
        );
        self.current.safe_mode_active = safe_mode_active;
        self.current.safe_mode_reason = self.safe_mode.state().reason.clone();

        // 5–6. Limit: safe-mode override, config hold, or the mode.
        if safe_mode_active {
            self.current.solar_limit_pct = self.safe_mode.safe_limit_pct(inputs.solar_capacity_kw);
            self.current.solar_limit_kw = self.safe_mode.safe_limit_kw();
        } else if self.config_hold {
            self.current.solar_limit_pct = 0.0;
            self.current.solar_limit_kw = 0.0;
            self.current.safe_mode_reason =
                Some("configuration incomplete for operation mode".into());
        } else {
            let output = modes::calculate(&self.mode_settings, &inputs);

            if output.load_source == LoadSource::None
                && matches!(
                    self.mode_settings,
                    ModeSettings::ZeroGeneratorFeed { .. } | ModeSettings::ZeroDgPf { .. }
                )
            {
                // No fresh load estimate: hold the previous limit rather
                // than swinging to zero on a transient gap.
                debug!(
                    held_pct = self.current.solar_limit_pct,
                    "no load estimate, holding previous limit"
                );
                self.current.load_source = LoadSource::None;
            } else {
                self.current.solar_limit_pct = output.solar_limit_pct;
                self.current.solar_limit_kw = output.solar_limit_kw;
                self.current.load_source = output.load_source;
            }

            if output.actions.write_reactive_power {
                debug!(
                    reactive_kvar = output.reactive_power_kvar,
                    "reactive setpoint requested"
                );
            }
        }

        // 7. Enqueue inverter writes.
        if !self.inverter_ids.is_empty() {
            self.enqueue_solar_limit(self.current.solar_limit_pct);
            // The device service reports asynchronous results; reflect
            // last cycle's outcome.
            let (success, error) = self.last_write_outcome();
            self.current.write_success = success;
            self.current.write_error = error;
        } else {
            self.current.write_success = true;
            self.current.write_error = None;
        }

        // 8. Publish.
        self.current.execution_time_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.state
            .write(KEY_CONTROL_STATE, self.current.to_value());

        debug!(
            limit_pct = self.current.solar_limit_pct,
            load_kw = self.current.total_load_kw,
            solar_kw = self.current.solar_output_kw,
            safe_mode = self.current.safe_mode_active,
            execution_ms = self.current.execution_time_ms,
            "control cycle"
        );
    }

    fn build_inputs(&self, readings: &Value) -> ModeInputs {
        let get = |key: &str| readings.get(key).and_then(Value::as_f64).unwrap_or(0.0);
        let count = |key: &str| readings.get(key).and_then(Value::as_u64).unwrap_or(0) as usize;

        // Battery figures ride on the virtual controller device when a
        // BESS is configured.
        let controller = &readings["devices"][CONTROLLER_DEVICE_ID]["readings"];
        let battery_soc = controller["battery_soc_pct"]["value"]
            .as_f64()
            .unwrap_or(0.0);
        let battery_capacity = self
            .config
            .devices_by_type(DeviceType::Battery)
            .filter_map(|d| d.rated_power_kw)
            .sum();

        ModeInputs {
            total_load_kw: get("total_load_kw"),
            total_solar_kw: get("total_solar_kw"),
            total_dg_kw: get("total_dg_kw"),
            total_reactive_kvar: get("total_reactive_kvar"),
            solar_capacity_kw: self.config.solar_capacity_kw(),
            load_meters_online: count("load_meters_online"),
            generators_online: count("generators_online"),
            battery_soc_pct: battery_soc,
            battery_capacity_kw: battery_capacity,
        }
    }

    fn device_online_map(&self, readings: &Value) -> HashMap<String, bool> {
        let mut map = HashMap::new();
        if let Some(status) = readings.get("status").and_then(Value::as_object) {
            for (id, s) in status {
                if id == CONTROLLER_DEVICE_ID {
                    continue;
                }
                map.insert(
                    id.clone(),
                    s.get("is_online").and_then(Value::as_bool).unwrap_or(false),
                );
            }
        }
        map
    }

    /// Append one solar-limit command per inverter onto the shared write
    /// queue; the device service drains it on its own tick.
    fn enqueue_solar_limit(&self, limit_pct: f64) {
        let mut doc = self.state.read_fresh(KEY_WRITE_COMMANDS);
        if !doc.is_object() {
            doc = json!({});
        }
        if let Some(map) = doc.as_object_mut() {
            let commands = map
                .entry("commands")
                .or_insert_with(|| Value::Array(vec![]));
            if let Value::Array(list) = commands {
                for inverter_id in &self.inverter_ids {
                    list.push(json!({
                        "device_id": inverter_id,
                        "command": "write_solar_limit",
                        "value": limit_pct,
                        "timestamp": Utc::now().to_rfc3339(),
                    }));
                }
            }
        }
        self.state.write(KEY_WRITE_COMMANDS, doc);
    }

    /// Inspect the device service's reported command results for the most
    /// recent solar-limit outcome.
    fn last_write_outcome(&self) -> (bool, Option<String>) {
        let doc = self.state.read_fresh(KEY_WRITE_COMMANDS);
        let Some(results) = doc.get("results").and_then(Value::as_array) else {
            return (true, None);
        };
        let last_failure = results
            .iter()
            .rev()
            .find(|r| {
                r.get("command").and_then(Value::as_str) == Some("write_solar_limit")
                    && r.get("success").and_then(Value::as_bool) == Some(false)
            })
            .map(|r| {
                r.get("device_id")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string()
            });
        match last_failure {
            Some(device) => (false, Some(format!("solar limit write failed on {device}"))),
            None => (true, None),
        }
    }
}

async fn wait_for_config(
    state: &SharedState,
    shutdown: &mut watch::Receiver<bool>,
) -> Option<SiteConfig> {
    loop {
        if *shutdown.borrow() {
            return None;
        }
        let doc = state.read_fresh(KEY_CONFIG);
        if doc.get("id").and_then(Value::as_str).is_some() {
            match serde_json::from_value::<SiteConfig>(doc) {
                Ok(config) => return Some(config),
                Err(e) => error!(error = %e, "invalid config document"),
            }
        }
        debug!("waiting for configuration");
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}
