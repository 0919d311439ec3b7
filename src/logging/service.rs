//! Logging service (port 8085).
//!
//! Three tiers: an in-memory buffer fed every control cycle, the local
//! SQLite store flushed periodically, and the cloud sync engine running
//! on its own cadences (readings vs control logs + alarms). The service
//! also evaluates threshold alarms, turns persistent register failures
//! into alarms, and prunes the store hourly.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cloud::CloudClient;
use crate::config::{Severity, SiteConfig};
use crate::health::{self, HealthStatus, PORT_LOGGING};
use crate::logging::alarm_evaluator::{AlarmEvaluator, EvaluationContext, TriggeredAlarm};
use crate::logging::cloud_sync::{CloudHealthAction, CloudSync};
use crate::logging::local_db::{AlarmRow, ControlLogRow, DeviceReadingRow, LocalDatabase};
use crate::state::{
    SharedState, KEY_ACTIVE_ALARMS, KEY_CONFIG, KEY_CONTROL_STATE, KEY_READINGS,
    KEY_REGISTER_ERRORS,
};
use crate::timestamp::align_timestamp;

const BUFFER_TICK: Duration = Duration::from_secs(1);
const BUFFER_CAPACITY: usize = 1000;
const RETENTION_INTERVAL_S: u64 = 3600;

fn default_db_path() -> std::path::PathBuf {
    std::env::var("VOLTERIA_DB_PATH")
        .map(Into::into)
        .unwrap_or_else(|_| "/opt/volteria/data/controller.db".into())
}

struct LoggingContext {
    state: SharedState,
    db: Arc<LocalDatabase>,
    cloud: Option<CloudSync>,
    evaluator: AlarmEvaluator,
    config: SiteConfig,
    /// (device_id, register_name) -> cloud logging cadence.
    frequencies: HashMap<(String, String), u64>,

    load_buffer: VecDeque<f64>,
    solar_buffer: VecDeque<f64>,
    last_control_state: Option<Value>,

    /// Register-failure alarms currently raised, so recovery can
    /// resolve exactly those.
    active_register_alarms: HashSet<String>,

    tick: u64,
}

impl LoggingContext {
    fn frequencies_of(config: &SiteConfig) -> HashMap<(String, String), u64> {
        let mut map = HashMap::new();
        for device in &config.devices {
            for register in &device.registers {
                map.insert(
                    (device.id.clone(), register.name.clone()),
                    register.logging_frequency_s,
                );
            }
        }
        map
    }

    fn apply_config(&mut self, config: SiteConfig) {
        self.frequencies = Self::frequencies_of(&config);
        self.evaluator
            .retain_definitions(&config.all_alarm_definitions());
        self.config = config;
    }

    // ─── Tier 1: buffer tick ─────────────────────────────────────────────────

    async fn buffer_tick(&mut self) {
        let control_state = self.state.read(KEY_CONTROL_STATE);
        if control_state.get("timestamp").is_some() {
            let load = control_state
                .get("total_load_kw")
                .and_then(Value::as_f64)
                .unwrap_or(0.0);
            let solar = control_state
                .get("solar_output_kw")
                .and_then(Value::as_f64)
                .unwrap_or(0.0);

            push_bounded(&mut self.load_buffer, load);
            push_bounded(&mut self.solar_buffer, solar);
            self.last_control_state = Some(control_state.clone());

            self.evaluate_alarms(&control_state).await;
        }

        self.process_register_failures().await;
        self.publish_active_alarms();
    }

    /// Publish the evaluated alarm state so other services (the
    /// heartbeat in particular) report the real fleet alarm count, not
    /// just supervisor-level service alerts.
    fn publish_active_alarms(&self) {
        let threshold_active = self.evaluator.active_alarm_count();
        let register_failures = self.active_register_alarms.len();
        self.state.write(
            KEY_ACTIVE_ALARMS,
            json!({
                "count": threshold_active + register_failures,
                "threshold_active": threshold_active,
                "register_failures": register_failures,
                "updated_at": Utc::now().to_rfc3339(),
            }),
        );
    }

    async fn evaluate_alarms(&mut self, control_state: &Value) {
        let definitions = self.config.all_alarm_definitions();
        if definitions.is_empty() {
            return;
        }

        let mut scalars = HashMap::new();
        for key in [
            "total_load_kw",
            "solar_output_kw",
            "dg_power_kw",
            "solar_limit_pct",
        ] {
            if let Some(v) = control_state.get(key).and_then(Value::as_f64) {
                scalars.insert(key.to_string(), v);
            }
        }
        scalars.insert(
            "safe_mode_active".into(),
            control_state
                .get("safe_mode_active")
                .and_then(Value::as_bool)
                .map(|b| if b { 1.0 } else { 0.0 })
                .unwrap_or(0.0),
        );
        // Heartbeat metrics published by the system service.
        let heartbeat = self.state.read("heartbeat_metrics");
        for key in ["cpu_pct", "memory_pct", "disk_pct", "temperature_c"] {
            if let Some(v) = heartbeat.get(key).and_then(Value::as_f64) {
                scalars.insert(key.to_string(), v);
            }
        }

        let readings = self.state.read(KEY_READINGS);
        let context = EvaluationContext::from_readings(&readings, scalars);

        let (triggered, resolved) =
            self.evaluator
                .evaluate(&context, &definitions, Utc::now());

        for alarm in triggered {
            self.raise_alarm(alarm).await;
        }

        for resolution in resolved {
            self.resolve_threshold_alarm(&resolution.definition_id, resolution.device_id.as_deref())
                .await;
        }
    }

    /// Persist a triggered alarm, deduplicating against unresolved rows,
    /// and push critical/major severities to the cloud immediately.
    async fn raise_alarm(&mut self, alarm: TriggeredAlarm) {
        let site_id = self.config.id.clone();
        let device_id = alarm.device_id.as_deref();

        match self
            .db
            .has_unresolved_alarm(&site_id, &alarm.definition_id, device_id)
        {
            Ok(true) => {
                debug!(alarm = %alarm.definition_id, "unresolved duplicate exists, skipped");
                return;
            }
            Ok(false) => {}
            Err(e) => {
                error!(error = %e, "alarm dedup check failed");
                return;
            }
        }

        // Best-effort cloud gate for severities that upload instantly.
        if alarm.severity.instant_sync() {
            if let Some(cloud) = &self.cloud {
                if cloud
                    .has_unresolved_alarm_in_cloud(&alarm.definition_id, device_id)
                    .await
                {
                    debug!(alarm = %alarm.definition_id, "unresolved duplicate in cloud, skipped");
                    return;
                }
            }
        }

        let row = AlarmRow {
            alarm_uuid: Uuid::new_v4().to_string(),
            site_id,
            alarm_type: alarm.definition_id.clone(),
            device_id: alarm.device_id.clone(),
            device_name: alarm.device_name.clone(),
            message: alarm.message.clone(),
            condition: Some(alarm.condition_text.clone()),
            severity: alarm.severity.as_str().to_string(),
            timestamp: alarm.timestamp.to_rfc3339(),
            ..Default::default()
        };
        if let Err(e) = self.db.insert_alarm(&row) {
            error!(error = %e, "alarm insert failed");
            return;
        }

        if self.config.logging.instant_sync_alarms && alarm.severity.instant_sync() {
            if let Some(cloud) = &self.cloud {
                cloud.sync_alarm_immediately(&row).await;
            }
        }
    }

    /// Threshold condition stopped matching: resolve locally and PATCH
    /// the cloud record.
    async fn resolve_threshold_alarm(&mut self, definition_id: &str, device_id: Option<&str>) {
        match self.db.resolve_alarms_by_type(definition_id, device_id) {
            Ok(0) => {}
            Ok(count) => {
                info!(alarm = definition_id, count, "threshold alarm auto-resolved");
                if let Some(cloud) = &self.cloud {
                    cloud.resolve_alarm_in_cloud(definition_id, device_id).await;
                }
            }
            Err(e) => error!(error = %e, "alarm auto-resolution failed"),
        }
    }

    /// Turn persistent register failures reported by the device service
    /// into `reg_<device>_<register>` alarms; resolve them on recovery.
    async fn process_register_failures(&mut self) {
        let doc = self.state.read(KEY_REGISTER_ERRORS);
        let mut current: HashSet<String> = HashSet::new();

        if let Some(devices) = doc.as_object() {
            for (device_id, entry) in devices {
                let device_name = entry
                    .get("device_name")
                    .and_then(Value::as_str)
                    .unwrap_or(device_id);
                let Some(registers) = entry.get("registers").and_then(Value::as_array) else {
                    continue;
                };
                for register in registers {
                    let Some(name) = register.get("name").and_then(Value::as_str) else {
                        continue;
                    };
                    let alarm_type = format!("reg_{device_id}_{name}");
                    current.insert(alarm_type.clone());

                    if self.active_register_alarms.contains(&alarm_type) {
                        continue;
                    }
                    let failures = register
                        .get("failures")
                        .and_then(Value::as_u64)
                        .unwrap_or(0);
                    let last_error = register
                        .get("last_error")
                        .and_then(Value::as_str)
                        .unwrap_or("");

                    let row = AlarmRow {
                        alarm_uuid: Uuid::new_v4().to_string(),
                        site_id: self.config.id.clone(),
                        alarm_type: alarm_type.clone(),
                        device_id: Some(device_id.clone()),
                        device_name: Some(device_name.to_string()),
                        message: format!(
                            "Register {name} failed {failures} consecutive reads: {last_error}"
                        ),
                        condition: None,
                        severity: Severity::Major.as_str().to_string(),
                        timestamp: Utc::now().to_rfc3339(),
                        ..Default::default()
                    };

                    let duplicate = self
                        .db
                        .has_unresolved_alarm(&self.config.id, &alarm_type, Some(device_id))
                        .unwrap_or(true);
                    if !duplicate {
                        if let Err(e) = self.db.insert_alarm(&row) {
                            error!(error = %e, "register alarm insert failed");
                            continue;
                        }
                        if let Some(cloud) = &self.cloud {
                            cloud.sync_alarm_immediately(&row).await;
                        }
                    }
                    self.active_register_alarms.insert(alarm_type);
                }
            }
        }

        // Registers that recovered: resolve their alarms.
        let recovered: Vec<String> = self
            .active_register_alarms
            .difference(&current)
            .cloned()
            .collect();
        for alarm_type in recovered {
            self.active_register_alarms.remove(&alarm_type);
            if let Ok(count) = self.db.resolve_alarms_by_type(&alarm_type, None) {
                if count > 0 {
                    info!(alarm = %alarm_type, "register alarm resolved");
                    if let Some(cloud) = &self.cloud {
                        cloud.resolve_alarm_in_cloud(&alarm_type, None).await;
                    }
                }
            }
        }
    }

    // ─── Tier 2: local flush ─────────────────────────────────────────────────

    fn flush_to_local(&mut self) {
        let Some(state) = self.last_control_state.take() else {
            return;
        };

        let get = |key: &str| state.get(key).and_then(Value::as_f64).unwrap_or(0.0);
        let get_count = |key: &str| state.get(key).and_then(Value::as_u64).unwrap_or(0) as i64;
        let load = get("total_load_kw");
        let solar = get("solar_output_kw");

        let flush_period = self.config.logging.local_write_interval_s as f64;
        let row = ControlLogRow {
            timestamp: align_timestamp(Utc::now(), flush_period).to_rfc3339(),
            site_id: self.config.id.clone(),
            total_load_kw: load,
            load_min: min_of(&self.load_buffer, load),
            load_max: max_of(&self.load_buffer, load),
            solar_output_kw: solar,
            solar_min: min_of(&self.solar_buffer, solar),
            solar_max: max_of(&self.solar_buffer, solar),
            dg_power_kw: get("dg_power_kw"),
            solar_limit_pct: get("solar_limit_pct"),
            solar_limit_kw: get("solar_limit_kw"),
            safe_mode_active: state
                .get("safe_mode_active")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            config_mode: "full_system".into(),
            operation_mode: state
                .get("operation_mode")
                .and_then(Value::as_str)
                .unwrap_or("zero_generator_feed")
                .to_string(),
            load_meters_online: get_count("load_meters_online"),
            inverters_online: get_count("inverters_online"),
            generators_online: get_count("generators_online"),
            execution_time_ms: get("execution_time_ms"),
            device_readings_json: None,
        };

        if let Err(e) = self.db.insert_control_log(&row) {
            error!(error = %e, "control log flush failed");
        }
        self.load_buffer.clear();
        self.solar_buffer.clear();

        self.flush_device_readings();
    }

    /// Persist one row per (device, register) from the live snapshot,
    /// timestamp aligned down to the register's logging cadence so that
    /// rows within a bucket collide on the natural key by design.
    fn flush_device_readings(&mut self) {
        let readings = self.state.read(KEY_READINGS);
        let Some(devices) = readings.get("devices").and_then(Value::as_object) else {
            return;
        };

        let now = Utc::now();
        let mut rows = Vec::new();

        for (device_id, doc) in devices {
            let Some(registers) = doc.get("readings").and_then(Value::as_object) else {
                continue;
            };
            for (register_name, reading) in registers {
                let Some(value) = reading.get("value").and_then(Value::as_f64) else {
                    continue;
                };
                let frequency = self
                    .frequencies
                    .get(&(device_id.clone(), register_name.clone()))
                    .copied()
                    .unwrap_or(60);

                rows.push(DeviceReadingRow {
                    site_id: self.config.id.clone(),
                    device_id: device_id.clone(),
                    register_name: register_name.clone(),
                    value,
                    unit: reading
                        .get("unit")
                        .and_then(Value::as_str)
                        .map(String::from),
                    timestamp: align_timestamp(now, frequency as f64).to_rfc3339(),
                    source: "live".into(),
                    ..Default::default()
                });
            }
        }

        if rows.is_empty() {
            return;
        }
        let db = self.db.clone();
        // Chunked, retried writes happen off the async path.
        let handle = tokio::task::spawn_blocking(move || db.insert_device_readings_batch(&rows));
        tokio::spawn(async move {
            match handle.await {
                Ok(Err(e)) => error!(error = %e, "device readings flush failed"),
                Err(e) => error!(error = %e, "device readings flush panicked"),
                _ => {}
            }
        });
    }

    // ─── Tier 3: cloud ───────────────────────────────────────────────────────

    async fn sync_readings(&mut self) {
        let frequencies = self.frequencies.clone();
        if let Some(cloud) = &mut self.cloud {
            match cloud.sync_readings(&frequencies).await {
                Ok(count) if count > 0 => debug!(count, "readings synced to cloud"),
                Ok(_) => {}
                Err(e) => error!(error = %e, "readings sync failed"),
            }
        }
    }

    async fn sync_logs_and_alarms(&mut self) {
        let Some(cloud) = &mut self.cloud else { return };

        let logs = cloud.sync_control_logs().await.unwrap_or_else(|e| {
            error!(error = %e, "control log sync failed");
            0
        });
        let alarms = cloud.sync_alarms().await.unwrap_or_else(|e| {
            error!(error = %e, "alarm sync failed");
            0
        });
        if logs > 0 || alarms > 0 {
            info!(logs, alarms, "cloud sync");
        }

        if let Err(e) = cloud.sync_resolved_alarms().await {
            debug!(error = %e, "resolution reverse-sync failed");
        }

        // Cloud-health alarm transitions.
        if let Some(action) = cloud.check_cloud_health() {
            match action {
                CloudHealthAction::RaiseOfflineAlarm { offline_minutes } => {
                    let row = AlarmRow {
                        alarm_uuid: Uuid::new_v4().to_string(),
                        site_id: self.config.id.clone(),
                        alarm_type: "CLOUD_SYNC_OFFLINE".into(),
                        message: format!("Cloud sync offline for {offline_minutes} minutes"),
                        severity: Severity::Major.as_str().to_string(),
                        timestamp: Utc::now().to_rfc3339(),
                        ..Default::default()
                    };
                    let duplicate = self
                        .db
                        .has_unresolved_alarm(&self.config.id, "CLOUD_SYNC_OFFLINE", None)
                        .unwrap_or(true);
                    if !duplicate {
                        if let Err(e) = self.db.insert_alarm(&row) {
                            error!(error = %e, "cloud-offline alarm insert failed");
                        }
                    }
                }
                CloudHealthAction::ResolveOfflineAlarm => {
                    let _ = self.db.resolve_alarms_by_type("CLOUD_SYNC_OFFLINE", None);
                    if let Some(cloud) = &self.cloud {
                        cloud.resolve_alarm_in_cloud("CLOUD_SYNC_OFFLINE", None).await;
                    }
                }
            }
        }
    }

    fn run_retention(&self) {
        let db = self.db.clone();
        let retention_days = self.config.logging.local_retention_days;
        tokio::task::spawn_blocking(move || match db.cleanup_old_data(retention_days) {
            Ok(deleted) if deleted > 0 => info!(deleted, "retention cleanup"),
            Ok(_) => {}
            Err(e) => error!(error = %e, "retention cleanup failed"),
        });
    }
}

pub struct LoggingService;

impl LoggingService {
    /// Service entry point; returns on shutdown.
    pub async fn run(state: SharedState, mut shutdown: watch::Receiver<bool>) {
        let db = match LocalDatabase::open(default_db_path()) {
            Ok(db) => Arc::new(db),
            Err(e) => {
                error!(error = %e, "cannot open local store, logging service dead");
                state.set_service_health(
                    "logging",
                    json!({"status": "unhealthy", "is_healthy": false}),
                );
                return;
            }
        };

        let db_for_health = db.clone();
        let health = health::spawn_health_server(
            "logging",
            PORT_LOGGING,
            Arc::new(move || {
                let stats = db_for_health.stats().unwrap_or_default();
                json!({ "database": stats })
            }),
        );

        let Some(config) = wait_for_config(&state, &mut shutdown).await else {
            return;
        };

        let cloud = CloudClient::from_env()
            .map(|client| CloudSync::new(config.id.clone(), client, db.clone()));
        if cloud.is_none() {
            warn!("no cloud credentials, running local-only");
        }

        let mut ctx = LoggingContext {
            state: state.clone(),
            db,
            cloud,
            evaluator: AlarmEvaluator::new(),
            frequencies: LoggingContext::frequencies_of(&config),
            config,
            load_buffer: VecDeque::with_capacity(BUFFER_CAPACITY),
            solar_buffer: VecDeque::with_capacity(BUFFER_CAPACITY),
            last_control_state: None,
            active_register_alarms: HashSet::new(),
            tick: 0,
        };

        health.set(HealthStatus::Healthy);
        state.set_service_health("logging", json!({"status": "running", "is_healthy": true}));
        info!(
            local_write_s = ctx.config.logging.local_write_interval_s,
            readings_sync_s = ctx.config.logging.readings_sync_interval_s,
            logs_sync_s = ctx.config.logging.cloud_sync_interval_s,
            "logging service started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            if ctx.state.is_config_changed() {
                let doc = ctx.state.read_fresh(KEY_CONFIG);
                match serde_json::from_value::<SiteConfig>(doc) {
                    Ok(config) => {
                        ctx.apply_config(config);
                        info!("logging config reloaded");
                    }
                    Err(e) => error!(error = %e, "config reload failed"),
                }
                ctx.state.acknowledge_config_change("logging");
            }

            ctx.tick += 1;
            ctx.buffer_tick().await;

            if ctx.tick % ctx.config.logging.local_write_interval_s.max(1) == 0 {
                ctx.flush_to_local();
            }
            if ctx.tick % ctx.config.logging.readings_sync_interval_s.max(1) == 0 {
                ctx.sync_readings().await;
            }
            if ctx.tick % ctx.config.logging.cloud_sync_interval_s.max(1) == 0 {
                ctx.sync_logs_and_alarms().await;
            }
            if ctx.tick % RETENTION_INTERVAL_S == 0 {
                ctx.run_retention();
            }

            tokio::time::sleep(BUFFER_TICK).await;
        }

        // Final flush: control logs and alarms only. Readings need the
        // downsampling path and are picked up on the next start.
        ctx.flush_to_local();
        ctx.sync_logs_and_alarms().await;

        health.set(HealthStatus::Stopped);
        health.stop_server();
        state.set_service_health("logging", json!({"status": "stopped", "is_healthy": false}));
        info!("logging service stopped");
    }
}

fn push_bounded(buffer: &mut VecDeque<f64>, value: f64) {
    if buffer.len() >= BUFFER_CAPACITY {
        buffer.pop_front();
    }
    buffer.push_back(value);
}

fn min_of(buffer: &VecDeque<f64>, fallback: f64) -> f64 {
    buffer.iter().copied().fold(f64::INFINITY, f64::min).min(fallback)
}

fn max_of(buffer: &VecDeque<f64>, fallback: f64) -> f64 {
    buffer
        .iter()
        .copied()
        .fold(f64::NEG_INFINITY, f64::max)
        .max(fallback)
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AlarmCondition, AlarmDefinition, AlarmSourceType, ConditionOperator};
    use tempfile::TempDir;

    fn test_context(dir: &TempDir) -> LoggingContext {
        let config: SiteConfig = serde_yaml::from_str(
            r#"
id: site-log
name: Logging Test
mode_settings:
  dg_reserve_kw: 0
"#,
        )
        .unwrap();
        LoggingContext {
            state: SharedState::new(),
            db: Arc::new(LocalDatabase::open(dir.path().join("controller.db")).unwrap()),
            cloud: None,
            evaluator: AlarmEvaluator::new(),
            frequencies: LoggingContext::frequencies_of(&config),
            config,
            load_buffer: VecDeque::new(),
            solar_buffer: VecDeque::new(),
            last_control_state: None,
            active_register_alarms: HashSet::new(),
            tick: 0,
        }
    }

    #[test]
    fn active_alarm_count_is_published_to_shared_state() {
        let dir = TempDir::new().unwrap();
        let mut ctx = test_context(&dir);

        // Nothing active yet.
        ctx.publish_active_alarms();
        let doc = ctx.state.read_fresh(KEY_ACTIVE_ALARMS);
        assert_eq!(doc["count"], 0);

        // One threshold alarm plus one register-failure alarm.
        let definition = AlarmDefinition {
            id: "high-load".into(),
            name: "High Load".into(),
            source_type: AlarmSourceType::CalculatedField,
            source_key: "total_load_kw".into(),
            conditions: vec![AlarmCondition {
                operator: ConditionOperator::Gt,
                value: 100.0,
                severity: crate::config::Severity::Warning,
                message: "load high".into(),
            }],
            enabled: true,
            cooldown_seconds: 0,
            device_id: None,
            device_name: None,
        };
        let context = EvaluationContext {
            scalars: [("total_load_kw".to_string(), 150.0)].into(),
            device_registers: HashMap::new(),
        };
        let (triggered, _) = ctx
            .evaluator
            .evaluate(&context, &[definition], Utc::now());
        assert_eq!(triggered.len(), 1);
        ctx.active_register_alarms
            .insert("reg_inv-1_active_power_kw".into());

        ctx.publish_active_alarms();
        let doc = ctx.state.read_fresh(KEY_ACTIVE_ALARMS);
        assert_eq!(doc["count"], 2);
        assert_eq!(doc["threshold_active"], 1);
        assert_eq!(doc["register_failures"], 1);
    }
}
