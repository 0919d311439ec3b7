//! Device manager.
//!
//! Tracks per-device liveness and readings, applies exponential backoff
//! to unreachable devices, and publishes the per-cycle snapshot (readings
//! + status + site aggregates) to shared state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::json;
use tracing::{debug, info};

use crate::config::{DeviceConfig, DeviceType, SiteConfig};
use crate::modbus::codec::DecodedValue;
use crate::state::{SharedState, KEY_READINGS};

/// Consecutive failures before a device is declared offline.
const OFFLINE_THRESHOLD: u32 = 3;
/// Backoff window: starts at 5 s, doubles per failed cycle, capped at 60 s.
const INITIAL_BACKOFF_S: u64 = 5;
const MAX_BACKOFF_S: u64 = 60;

/// The virtual device that carries site aggregates so the logging
/// pipeline treats them like physical readings.
pub const CONTROLLER_DEVICE_ID: &str = "controller";

// Role tags recognized by the aggregation layer.
pub const ROLE_SOLAR: &str = "solar_active_power";
pub const ROLE_LOAD: &str = "load_active_power";
pub const ROLE_GENERATOR: &str = "generator_active_power";
pub const ROLE_REACTIVE: &str = "generator_reactive_power";
pub const ROLE_BATTERY_SOC: &str = "battery_soc";

#[derive(Debug, Clone)]
pub struct Reading {
    pub value: DecodedValue,
    pub unit: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct DeviceStatus {
    pub device_id: String,
    pub device_name: String,
    pub device_type: DeviceType,
    pub is_online: bool,
    pub last_seen: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    pub readings: HashMap<String, Reading>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub backoff_seconds: u64,
}

impl DeviceStatus {
    fn new(device: &DeviceConfig) -> Self {
        Self {
            device_id: device.id.clone(),
            device_name: device.name.clone(),
            device_type: device.device_type,
            is_online: false,
            last_seen: None,
            last_error: None,
            consecutive_failures: 0,
            readings: HashMap::new(),
            next_retry_at: None,
            backoff_seconds: 0,
        }
    }

    fn record_success(&mut self) {
        self.is_online = true;
        self.last_seen = Some(Utc::now());
        self.consecutive_failures = 0;
        self.last_error = None;
        self.backoff_seconds = 0;
        self.next_retry_at = None;
    }

    fn record_failure(&mut self, error: Option<&str>) -> bool {
        self.consecutive_failures += 1;
        if let Some(e) = error {
            self.last_error = Some(e.to_string());
        }

        if self.consecutive_failures < OFFLINE_THRESHOLD {
            return false;
        }

        let went_offline = self.is_online;
        self.is_online = false;
        let old_backoff = self.backoff_seconds;
        self.backoff_seconds = if self.backoff_seconds == 0 {
            INITIAL_BACKOFF_S
        } else {
            (self.backoff_seconds * 2).min(MAX_BACKOFF_S)
        };
        self.next_retry_at =
            Some(Utc::now() + ChronoDuration::seconds(self.backoff_seconds as i64));

        went_offline || self.backoff_seconds != old_backoff
    }
}

/// Immutable view of the fleet used by callers that only read.
#[derive(Debug, Clone, Default)]
pub struct DeviceSnapshot {
    pub statuses: HashMap<String, DeviceStatus>,
}

impl DeviceSnapshot {
    pub fn online_count(&self, device_type: DeviceType) -> usize {
        self.statuses
            .values()
            .filter(|s| s.device_type == device_type && s.is_online)
            .count()
    }

    pub fn online_map(&self) -> HashMap<String, bool> {
        self.statuses
            .iter()
            .map(|(id, s)| (id.clone(), s.is_online))
            .collect()
    }
}

#[derive(Clone)]
pub struct DeviceManager {
    devices: Arc<Mutex<HashMap<String, DeviceStatus>>>,
}

impl Default for DeviceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceManager {
    pub fn new() -> Self {
        Self {
            devices: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// (Re)register the device fleet. A config reload reconstructs
    /// statuses from scratch — devices are never mutated in place.
    pub fn register_devices(&self, devices: &[DeviceConfig]) {
        let mut map = self.devices.lock().unwrap_or_else(|e| e.into_inner());
        map.clear();
        for device in devices {
            map.insert(device.id.clone(), DeviceStatus::new(device));
            debug!(device = %device.name, id = %device.id, "registered device");
        }
    }

    /// False while the device sits inside its backoff window.
    pub fn should_poll(&self, device_id: &str) -> bool {
        let map = self.devices.lock().unwrap_or_else(|e| e.into_inner());
        match map.get(device_id).and_then(|s| s.next_retry_at) {
            Some(retry_at) => Utc::now() >= retry_at,
            None => true,
        }
    }

    /// Record a successful register read.
    pub fn update_reading(
        &self,
        device_id: &str,
        register_name: &str,
        value: DecodedValue,
        unit: &str,
    ) {
        let mut map = self.devices.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(status) = map.get_mut(device_id) {
            status.readings.insert(
                register_name.to_string(),
                Reading {
                    value,
                    unit: unit.to_string(),
                    timestamp: Utc::now(),
                },
            );
            status.record_success();
        }
    }

    /// Record a failed register read. The stale cached reading for that
    /// register is removed so the aggregation layer can never re-stamp an
    /// old value as "now" — the gap is the data.
    pub fn reading_failed(&self, device_id: &str, register_name: &str, error: &str) {
        let mut map = self.devices.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(status) = map.get_mut(device_id) {
            status.readings.remove(register_name);
            if status.record_failure(Some(error)) {
                info!(
                    device = %status.device_name,
                    backoff_s = status.backoff_seconds,
                    "device offline, backing off"
                );
            }
        }
    }

    /// Device-level status update without a specific register (used for
    /// connection-failure summaries). On failure all cached readings are
    /// dropped.
    pub fn update_status(&self, device_id: &str, success: bool, error: Option<&str>) {
        let mut map = self.devices.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(status) = map.get_mut(device_id) {
            if success {
                status.record_success();
            } else {
                status.readings.clear();
                if status.record_failure(error) {
                    info!(
                        device = %status.device_name,
                        backoff_s = status.backoff_seconds,
                        "device offline, backing off"
                    );
                }
            }
        }
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        let map = self.devices.lock().unwrap_or_else(|e| e.into_inner());
        DeviceSnapshot {
            statuses: map.clone(),
        }
    }

    pub fn device_counts(&self) -> (usize, usize) {
        let map = self.devices.lock().unwrap_or_else(|e| e.into_inner());
        let total = map.len();
        let online = map.values().filter(|s| s.is_online).count();
        (total, online)
    }

    /// Sum a role tag across the online fleet. Only live devices
    /// contribute — offline devices have had their readings evicted, and
    /// the online check makes the invariant explicit.
    fn sum_role(&self, config: &SiteConfig, snapshot: &DeviceSnapshot, role: &str) -> f64 {
        let mut total = 0.0;
        for device in &config.devices {
            let Some(status) = snapshot.statuses.get(&device.id) else {
                continue;
            };
            if !status.is_online {
                continue;
            }
            for register in &device.registers {
                if register.role.as_deref() != Some(role) {
                    continue;
                }
                if let Some(reading) = status.readings.get(&register.name) {
                    if let Some(n) = reading.value.as_number() {
                        total += n;
                    }
                }
            }
        }
        total
    }

    /// Publish the `readings` document: per-device readings + status,
    /// site totals by role tag, and the virtual controller device that
    /// carries the aggregates. Also stamps/clears per-device offline
    /// times used by the safe-mode timeout policies.
    pub fn publish_snapshot(&self, state: &SharedState, config: &SiteConfig) {
        let snapshot = self.snapshot();
        let now = Utc::now().to_rfc3339();

        let total_solar = self.sum_role(config, &snapshot, ROLE_SOLAR);
        let total_load = self.sum_role(config, &snapshot, ROLE_LOAD);
        let total_dg = self.sum_role(config, &snapshot, ROLE_GENERATOR);
        let total_reactive = self.sum_role(config, &snapshot, ROLE_REACTIVE);

        let mut devices = serde_json::Map::new();
        let mut status_map = serde_json::Map::new();

        for (id, status) in &snapshot.statuses {
            let mut readings = serde_json::Map::new();
            for (name, reading) in &status.readings {
                let value = match &reading.value {
                    DecodedValue::Number(n) => json!(n),
                    DecodedValue::Text(t) => json!(t),
                };
                readings.insert(
                    name.clone(),
                    json!({
                        "value": value,
                        "unit": reading.unit,
                        "timestamp": reading.timestamp.to_rfc3339(),
                    }),
                );
            }
            devices.insert(id.clone(), json!({ "readings": readings }));
            status_map.insert(
                id.clone(),
                json!({
                    "is_online": status.is_online,
                    "last_seen": status.last_seen.map(|t| t.to_rfc3339()),
                    "last_error": status.last_error,
                }),
            );

            if status.is_online {
                state.mark_device_online(id);
            } else {
                state.mark_device_offline(id);
            }
        }

        // Aggregates ride on a virtual device so downstream logging
        // treats them uniformly with physical readings.
        let controller_readings = json!({
            "total_solar_kw": { "value": total_solar, "unit": "kW", "timestamp": now },
            "total_load_kw": { "value": total_load, "unit": "kW", "timestamp": now },
            "total_dg_kw": { "value": total_dg, "unit": "kW", "timestamp": now },
            "total_reactive_kvar": { "value": total_reactive, "unit": "kvar", "timestamp": now },
        });
        devices.insert(
            CONTROLLER_DEVICE_ID.to_string(),
            json!({ "readings": controller_readings }),
        );
        status_map.insert(
            CONTROLLER_DEVICE_ID.to_string(),
            json!({ "is_online": true, "last_seen": now, "last_error": null }),
        );

        state.write(
            KEY_READINGS,
            json!({
                "timestamp": now,
                "devices": devices,
                "status": status_map,
                "total_solar_kw": total_solar,
                "total_load_kw": total_load,
                "total_dg_kw": total_dg,
                "total_reactive_kvar": total_reactive,
                "load_meters_online": snapshot.online_count(DeviceType::LoadMeter),
                "inverters_online": snapshot.online_count(DeviceType::Inverter),
                "generators_online": snapshot.online_count(DeviceType::Generator),
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SiteConfig;

    fn fleet_config() -> SiteConfig {
        serde_yaml::from_str(
            r#"
id: site-t
name: Fleet
devices:
  - id: inv-1
    name: Inverter
    device_type: inverter
    protocol: tcp
    host: 10.0.0.1
    rated_power_kw: 100
    registers:
      - address: 1
        name: active_power_kw
        datatype: float32
        role: solar_active_power
  - id: meter-1
    name: Meter
    device_type: load_meter
    protocol: tcp
    host: 10.0.0.2
    registers:
      - address: 1
        name: active_power_kw
        datatype: float32
        role: load_active_power
"#,
        )
        .unwrap()
    }

    fn manager_for(config: &SiteConfig) -> DeviceManager {
        let manager = DeviceManager::new();
        manager.register_devices(&config.devices);
        manager
    }

    #[test]
    fn offline_after_three_failures_with_doubling_backoff() {
        let config = fleet_config();
        let manager = manager_for(&config);

        manager.update_reading("inv-1", "active_power_kw", DecodedValue::Number(42.0), "kW");
        assert!(manager.snapshot().statuses["inv-1"].is_online);

        for _ in 0..3 {
            manager.reading_failed("inv-1", "active_power_kw", "timeout");
        }
        let status = manager.snapshot().statuses["inv-1"].clone();
        assert!(!status.is_online);
        assert_eq!(status.backoff_seconds, 5);
        assert!(!manager.should_poll("inv-1"));

        // Further failed cycles double the window up to the cap.
        manager.update_status("inv-1", false, Some("timeout"));
        assert_eq!(manager.snapshot().statuses["inv-1"].backoff_seconds, 10);
        for _ in 0..10 {
            manager.update_status("inv-1", false, Some("timeout"));
        }
        assert_eq!(manager.snapshot().statuses["inv-1"].backoff_seconds, 60);

        // A successful read clears everything.
        manager.update_reading("inv-1", "active_power_kw", DecodedValue::Number(1.0), "kW");
        let status = manager.snapshot().statuses["inv-1"].clone();
        assert!(status.is_online);
        assert_eq!(status.backoff_seconds, 0);
        assert!(manager.should_poll("inv-1"));
    }

    #[test]
    fn failed_read_evicts_the_cached_reading() {
        let config = fleet_config();
        let manager = manager_for(&config);

        manager.update_reading("meter-1", "active_power_kw", DecodedValue::Number(60.0), "kW");
        manager.reading_failed("meter-1", "active_power_kw", "exception");
        assert!(manager.snapshot().statuses["meter-1"]
            .readings
            .is_empty());
    }

    #[test]
    fn aggregates_only_include_online_devices() {
        let config = fleet_config();
        let manager = manager_for(&config);
        let state = SharedState::new();

        manager.update_reading("inv-1", "active_power_kw", DecodedValue::Number(20.0), "kW");
        manager.update_reading("meter-1", "active_power_kw", DecodedValue::Number(60.0), "kW");
        manager.publish_snapshot(&state, &config);

        let readings = state.read_fresh(KEY_READINGS);
        assert_eq!(readings["total_solar_kw"], 20.0);
        assert_eq!(readings["total_load_kw"], 60.0);
        assert_eq!(readings["load_meters_online"], 1);

        // Meter goes offline; its contribution must vanish even though a
        // value was cached moments ago.
        for _ in 0..3 {
            manager.update_status("meter-1", false, Some("gone"));
        }
        manager.publish_snapshot(&state, &config);
        let readings = state.read_fresh(KEY_READINGS);
        assert_eq!(readings["total_load_kw"], 0.0);
        assert_eq!(readings["load_meters_online"], 0);
        assert!(state.device_offline_seconds("meter-1").is_some());
    }

    #[test]
    fn virtual_controller_device_carries_aggregates() {
        let config = fleet_config();
        let manager = manager_for(&config);
        let state = SharedState::new();

        manager.update_reading("inv-1", "active_power_kw", DecodedValue::Number(33.0), "kW");
        manager.publish_snapshot(&state, &config);

        let readings = state.read_fresh(KEY_READINGS);
        let controller = &readings["devices"][CONTROLLER_DEVICE_ID]["readings"];
        assert_eq!(controller["total_solar_kw"]["value"], 33.0);
        assert_eq!(readings["status"][CONTROLLER_DEVICE_ID]["is_online"], true);
    }
}
