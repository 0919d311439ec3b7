//! End-to-end control-logic scenarios: headroom computation through the
//! device snapshot, safe-mode triggering, write verification, backfill
//! ordering, and alarm suppression.

use std::collections::HashMap;

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;

use volteria_controller::config::{
    AlarmCondition, AlarmDefinition, AlarmSourceType, ConditionOperator, ModeSettings,
    SafeModeSettings, SafeModeType, Severity, SiteConfig,
};
use volteria_controller::control::modes::{calculate, LoadSource, ModeInputs};
use volteria_controller::control::safe_mode::SafeModeSupervisor;
use volteria_controller::device::manager::DeviceManager;
use volteria_controller::logging::alarm_evaluator::{AlarmEvaluator, EvaluationContext};
use volteria_controller::logging::local_db::{AlarmRow, DeviceReadingRow, LocalDatabase};
use volteria_controller::modbus::codec::DecodedValue;
use volteria_controller::modbus::writer::values_match;
use volteria_controller::state::{SharedState, KEY_READINGS};

fn site_config() -> SiteConfig {
    serde_yaml::from_str(
        r#"
id: site-e2e
name: Scenario Site
operation_mode: zero_generator_feed
mode_settings:
  dg_reserve_kw: 10
devices:
  - id: inv-1
    name: Inverter
    device_type: inverter
    protocol: tcp
    host: 10.0.0.1
    rated_power_kw: 100
    registers:
      - address: 5016
        name: active_power_kw
        datatype: float32
        role: solar_active_power
  - id: meter-1
    name: Load Meter
    device_type: load_meter
    protocol: tcp
    host: 10.0.0.2
    registers:
      - address: 100
        name: active_power_kw
        datatype: float32
        role: load_active_power
  - id: dg-1
    name: Generator
    device_type: generator
    protocol: tcp
    host: 10.0.0.3
    registers:
      - address: 200
        name: active_power_kw
        datatype: float32
        role: generator_active_power
"#,
    )
    .unwrap()
}

fn inputs_from_snapshot(state: &SharedState, capacity_kw: f64) -> ModeInputs {
    let readings = state.read_fresh(KEY_READINGS);
    let get = |key: &str| readings.get(key).and_then(serde_json::Value::as_f64).unwrap_or(0.0);
    let count =
        |key: &str| readings.get(key).and_then(serde_json::Value::as_u64).unwrap_or(0) as usize;
    ModeInputs {
        total_load_kw: get("total_load_kw"),
        total_solar_kw: get("total_solar_kw"),
        total_dg_kw: get("total_dg_kw"),
        total_reactive_kvar: get("total_reactive_kvar"),
        solar_capacity_kw: capacity_kw,
        load_meters_online: count("load_meters_online"),
        generators_online: count("generators_online"),
        ..Default::default()
    }
}

#[test]
fn scenario_a_basic_headroom() {
    // 1 inverter (100 kW), 1 load meter, 1 generator, reserve 10 kW.
    // load 60, solar 20, gen 40 -> limit 50 kW / 50.0 %.
    let config = site_config();
    let state = SharedState::new();
    let manager = DeviceManager::new();
    manager.register_devices(&config.devices);

    manager.update_reading("inv-1", "active_power_kw", DecodedValue::Number(20.0), "kW");
    manager.update_reading("meter-1", "active_power_kw", DecodedValue::Number(60.0), "kW");
    manager.update_reading("dg-1", "active_power_kw", DecodedValue::Number(40.0), "kW");
    manager.publish_snapshot(&state, &config);

    let (settings, warnings) = config.resolve_mode_settings();
    assert!(warnings.is_empty());
    assert_eq!(settings, ModeSettings::ZeroGeneratorFeed { dg_reserve_kw: 10.0 });

    let output = calculate(&settings, &inputs_from_snapshot(&state, config.solar_capacity_kw()));
    assert_eq!(output.solar_limit_kw, 50.0);
    assert_eq!(output.solar_limit_pct, 50.0);
    assert_eq!(output.load_source, LoadSource::LoadMeter);
}

#[test]
fn scenario_b_generator_fallback_when_meter_offline() {
    let config = site_config();
    let state = SharedState::new();
    let manager = DeviceManager::new();
    manager.register_devices(&config.devices);

    manager.update_reading("inv-1", "active_power_kw", DecodedValue::Number(20.0), "kW");
    manager.update_reading("dg-1", "active_power_kw", DecodedValue::Number(45.0), "kW");
    // The load meter drops off the bus entirely.
    for _ in 0..3 {
        manager.update_status("meter-1", false, Some("timeout"));
    }
    manager.publish_snapshot(&state, &config);

    let (settings, _) = config.resolve_mode_settings();
    let output = calculate(&settings, &inputs_from_snapshot(&state, config.solar_capacity_kw()));

    assert_eq!(output.estimated_load_kw, 45.0);
    assert_eq!(output.solar_limit_kw, 35.0);
    assert_eq!(output.solar_limit_pct, 35.0);
    assert_eq!(output.load_source, LoadSource::GeneratorFallback);
}

#[test]
fn scenario_c_rolling_average_safe_mode_trigger() {
    // Window averages: load 20, solar 18 -> 90 % >= 80 %, with the
    // inverter offline past the timeout.
    let state = SharedState::new();
    let mut supervisor = SafeModeSupervisor::new(SafeModeSettings {
        enabled: true,
        mode_type: SafeModeType::RollingAverage,
        timeout_s: 30,
        rolling_window_min: 3,
        threshold_pct: 80.0,
        power_limit_kw: 0.0,
    });

    let offline_since = (Utc::now() - ChronoDuration::seconds(45)).to_rfc3339();
    state.write(
        volteria_controller::state::KEY_DEVICE_OFFLINE_TIMES,
        json!({ "inv-1": offline_since }),
    );
    let online: HashMap<String, bool> = [("inv-1".to_string(), false)].into();

    let mut now = Utc::now() - ChronoDuration::seconds(15);
    let mut active = false;
    for _ in 0..12 {
        active = supervisor.check_and_trigger(&state, 20.0, 18.0, &online, now);
        now += ChronoDuration::seconds(1);
    }

    assert!(active);
    assert_eq!(supervisor.safe_limit_pct(100.0), 0.0);
    let reason = supervisor.state().reason.clone().unwrap();
    assert!(reason.contains("solar 90% of load"), "reason: {reason}");
}

#[test]
fn scenario_d_write_verify_mismatch() {
    // Limit register carries 0.1 % resolution: 50.0 % -> 500 raw.
    // A read-back of 48.0 % (480) is outside the 1 % tolerance.
    assert!(!values_match(500, 480));

    let error = volteria_controller::errors::ControllerError::CommandNotTaken {
        expected: 500,
        actual: 480,
    };
    assert!(error.to_string().contains("expected 500, got 480"));
    assert!(!error.is_transport());
}

#[test]
fn scenario_e_backfill_ordering() {
    // 5000 unsynced readings: phase 1 ships the newest batch, phase 2
    // drains oldest-first.
    let dir = tempfile::TempDir::new().unwrap();
    let db = LocalDatabase::open(dir.path().join("controller.db")).unwrap();

    let start = Utc::now() - ChronoDuration::seconds(5000);
    let rows: Vec<DeviceReadingRow> = (0..5000)
        .map(|i| DeviceReadingRow {
            site_id: "site-e2e".into(),
            device_id: "inv-1".into(),
            register_name: "active_power_kw".into(),
            value: i as f64,
            unit: Some("kW".into()),
            timestamp: (start + ChronoDuration::seconds(i)).to_rfc3339(),
            source: "live".into(),
            ..Default::default()
        })
        .collect();
    db.insert_device_readings_batch(&rows).unwrap();
    assert_eq!(db.unsynced_readings_count().unwrap(), 5000);

    // Phase 1: newest-first batch for the dashboard.
    let recent = db.unsynced_readings_newest(100).unwrap();
    assert_eq!(recent.len(), 100);
    assert_eq!(recent[0].value, 4999.0);
    db.mark_readings_synced(&recent.iter().map(|r| r.id).collect::<Vec<_>>())
        .unwrap();

    // Phase 2: oldest-first gap fill until pending drops below the
    // threshold.
    let mut pending = db.unsynced_readings_count().unwrap();
    assert_eq!(pending, 4900);
    let gap_batch = db.unsynced_readings_oldest(100).unwrap();
    assert_eq!(gap_batch[0].value, 0.0);
    while pending > 1000 {
        let batch = db.unsynced_readings_oldest(100).unwrap();
        db.mark_readings_synced(&batch.iter().map(|r| r.id).collect::<Vec<_>>())
            .unwrap();
        pending = db.unsynced_readings_count().unwrap();
    }
    assert!(pending <= 1000);
}

#[test]
fn scenario_f_duplicate_alarm_suppression() {
    // "High Temp" > 70, cooldown 300 s. Readings 65, 71, 72, 69, 73
    // within 60 s: exactly one trigger (at 71), 72 and 73 are
    // cooldown-skipped, and the 69 reading auto-resolves the alarm —
    // resolution fires on the first evaluation where no condition
    // matches, regardless of the cooldown left from the trigger.
    let dir = tempfile::TempDir::new().unwrap();
    let db = LocalDatabase::open(dir.path().join("controller.db")).unwrap();

    let definition = AlarmDefinition {
        id: "high-temp".into(),
        name: "High Temp".into(),
        source_type: AlarmSourceType::ModbusRegister,
        source_key: "temperature_c".into(),
        conditions: vec![AlarmCondition {
            operator: ConditionOperator::Gt,
            value: 70.0,
            severity: Severity::Major,
            message: "Temperature too high".into(),
        }],
        enabled: true,
        cooldown_seconds: 300,
        device_id: Some("inv-1".into()),
        device_name: Some("Inverter".into()),
    };

    let mut evaluator = AlarmEvaluator::new();
    let t0 = Utc::now();
    let mut rows_created = 0;
    let mut trigger_values = Vec::new();
    let mut resolution_values = Vec::new();

    for (offset, value) in [(0, 65.0), (12, 71.0), (24, 72.0), (36, 69.0), (48, 73.0)] {
        let context = EvaluationContext {
            scalars: HashMap::new(),
            device_registers: [(
                "inv-1".to_string(),
                [("temperature_c".to_string(), value)].into(),
            )]
            .into(),
        };
        let (triggered, resolved) = evaluator.evaluate(
            &context,
            std::slice::from_ref(&definition),
            t0 + ChronoDuration::seconds(offset),
        );

        for alarm in triggered {
            trigger_values.push(value);
            // The logging pipeline's dedup: one unresolved row per
            // (site, type, device).
            if !db
                .has_unresolved_alarm("site-e2e", &alarm.definition_id, Some("inv-1"))
                .unwrap()
            {
                db.insert_alarm(&AlarmRow {
                    alarm_uuid: uuid::Uuid::new_v4().to_string(),
                    site_id: "site-e2e".into(),
                    alarm_type: alarm.definition_id.clone(),
                    device_id: alarm.device_id.clone(),
                    device_name: alarm.device_name.clone(),
                    message: alarm.message.clone(),
                    condition: Some(alarm.condition_text.clone()),
                    severity: alarm.severity.as_str().into(),
                    timestamp: alarm.timestamp.to_rfc3339(),
                    ..Default::default()
                })
                .unwrap();
                rows_created += 1;
            }
        }

        for resolution in resolved {
            resolution_values.push(value);
            // What the logging pipeline does with a resolution: mark the
            // local row resolved (the cloud PATCH follows it).
            let count = db
                .resolve_alarms_by_type(
                    &resolution.definition_id,
                    resolution.device_id.as_deref(),
                )
                .unwrap();
            assert_eq!(count, 1, "exactly one row resolved at value {value}");
        }
    }

    // One trigger, at 71. 72 and 73 matched the condition but stayed
    // inside the 300 s cooldown.
    assert_eq!(trigger_values, vec![71.0]);
    assert_eq!(rows_created, 1);

    // The resolution fired at 69 — the first reading back in bounds —
    // and cleared the unresolved row.
    assert_eq!(resolution_values, vec![69.0]);
    assert!(!db
        .has_unresolved_alarm("site-e2e", "high-temp", Some("inv-1"))
        .unwrap());

    // 73 re-matched but was cooldown-suppressed, so no second row ever
    // appeared: the table holds exactly the one resolved record.
    let unsynced = db.unsynced_alarms(10).unwrap();
    assert_eq!(unsynced.len(), 1);
    assert!(unsynced[0].resolved);
}

#[test]
fn timestamp_alignment_buckets_are_shared() {
    use volteria_controller::timestamp::align_timestamp;
    let t1 = Utc::now();
    let t2 = t1 + ChronoDuration::milliseconds(400);
    assert_eq!(align_timestamp(t1, 60.0), align_timestamp(t2, 60.0));
    let aligned = align_timestamp(t1, 60.0);
    assert_eq!(align_timestamp(aligned, 60.0), aligned);
}
