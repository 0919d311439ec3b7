//! Threshold alarm evaluator.
//!
//! Runs every buffer tick over the readings snapshot. Conditions are
//! checked in declaration order — the first match fixes severity and
//! message — and a per-(device, definition) cooldown suppresses
//! re-triggers. Auto-resolution fires on the first evaluation where no
//! condition of a previously-alarming definition matches.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::{AlarmDefinition, AlarmSourceType, Severity};

#[derive(Debug, Clone)]
pub struct TriggeredAlarm {
    pub definition_id: String,
    pub name: String,
    pub severity: Severity,
    pub message: String,
    pub condition_text: String,
    pub value: f64,
    pub device_id: Option<String>,
    pub device_name: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// A definition whose last evaluation matched no condition while an
/// unresolved alarm existed: resolve it locally and in the cloud.
#[derive(Debug, Clone)]
pub struct ResolvedAlarm {
    pub definition_id: String,
    pub device_id: Option<String>,
}

#[derive(Debug, Default)]
struct AlarmState {
    last_triggered: Option<DateTime<Utc>>,
    is_active: bool,
}

/// Snapshot handed to the evaluator each tick: control-state scalars,
/// heartbeat metrics, and per-device register values.
#[derive(Debug, Default, Clone)]
pub struct EvaluationContext {
    pub scalars: HashMap<String, f64>,
    pub device_registers: HashMap<String, HashMap<String, f64>>,
}

impl EvaluationContext {
    /// Build from the shared-state `readings` document plus extra
    /// scalar fields (control state, heartbeat metrics).
    pub fn from_readings(readings: &Value, scalars: HashMap<String, f64>) -> Self {
        let mut device_registers: HashMap<String, HashMap<String, f64>> = HashMap::new();
        if let Some(devices) = readings.get("devices").and_then(Value::as_object) {
            for (device_id, doc) in devices {
                let mut registers = HashMap::new();
                if let Some(regs) = doc.get("readings").and_then(Value::as_object) {
                    for (name, reading) in regs {
                        if let Some(value) = reading.get("value").and_then(Value::as_f64) {
                            registers.insert(name.clone(), value);
                        }
                    }
                }
                device_registers.insert(device_id.clone(), registers);
            }
        }
        Self {
            scalars,
            device_registers,
        }
    }

    fn lookup(
        &self,
        source_type: AlarmSourceType,
        source_key: &str,
        device_id: Option<&str>,
    ) -> Option<f64> {
        match source_type {
            AlarmSourceType::ModbusRegister => {
                // Bound definitions prefer their device; unbound ones
                // search the whole fleet for the register name.
                if let Some(device_id) = device_id {
                    if let Some(value) = self
                        .device_registers
                        .get(device_id)
                        .and_then(|regs| regs.get(source_key))
                    {
                        return Some(*value);
                    }
                }
                self.device_registers
                    .values()
                    .find_map(|regs| regs.get(source_key).copied())
            }
            AlarmSourceType::DeviceInfo
            | AlarmSourceType::CalculatedField
            | AlarmSourceType::Heartbeat => self.scalars.get(source_key).copied(),
        }
    }
}

#[derive(Default)]
pub struct AlarmEvaluator {
    states: HashMap<String, AlarmState>,
}

impl AlarmEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluate all enabled definitions against the snapshot. Returns
    /// the alarms to raise and the definitions whose condition cleared.
    pub fn evaluate(
        &mut self,
        context: &EvaluationContext,
        definitions: &[AlarmDefinition],
        now: DateTime<Utc>,
    ) -> (Vec<TriggeredAlarm>, Vec<ResolvedAlarm>) {
        let mut triggered = Vec::new();
        let mut resolved = Vec::new();

        for definition in definitions {
            if !definition.enabled {
                continue;
            }

            let device_id = definition.device_id.as_deref();
            let Some(value) =
                context.lookup(definition.source_type, &definition.source_key, device_id)
            else {
                continue;
            };

            let state_key = format!(
                "{}:{}",
                device_id.unwrap_or("global"),
                definition.id
            );

            // First matching condition wins; authors order by severity
            // descending.
            let matched = definition
                .conditions
                .iter()
                .find(|c| c.operator.matches(value, c.value));

            match matched {
                Some(condition) => {
                    let state = self.states.entry(state_key).or_default();

                    if let Some(last) = state.last_triggered {
                        let elapsed = (now - last).num_seconds();
                        if elapsed < definition.cooldown_seconds as i64 {
                            debug!(
                                definition = %definition.id,
                                elapsed,
                                "alarm in cooldown, skipped"
                            );
                            continue;
                        }
                    }

                    state.last_triggered = Some(now);
                    state.is_active = true;

                    warn!(
                        definition = %definition.id,
                        severity = condition.severity.as_str(),
                        value,
                        threshold = condition.value,
                        "alarm triggered"
                    );

                    triggered.push(TriggeredAlarm {
                        definition_id: definition.id.clone(),
                        name: definition.name.clone(),
                        severity: condition.severity,
                        message: if condition.message.is_empty() {
                            format!("{} alarm", definition.source_key)
                        } else {
                            condition.message.clone()
                        },
                        condition_text: format!(
                            "{} {} {}",
                            definition.source_key,
                            condition.operator.as_str(),
                            condition.value
                        ),
                        value,
                        device_id: definition.device_id.clone(),
                        device_name: definition.device_name.clone(),
                        timestamp: now,
                    });
                }
                None => {
                    // Value back in bounds: auto-resolve once, if this
                    // definition was alarming.
                    if let Some(state) = self.states.get_mut(&state_key) {
                        if state.is_active {
                            state.is_active = false;
                            resolved.push(ResolvedAlarm {
                                definition_id: definition.id.clone(),
                                device_id: definition.device_id.clone(),
                            });
                        }
                    }
                }
            }
        }

        (triggered, resolved)
    }

    pub fn active_alarm_count(&self) -> usize {
        self.states.values().filter(|s| s.is_active).count()
    }

    /// Drop cooldown state for definitions that no longer exist
    /// (config reload).
    pub fn retain_definitions(&mut self, definitions: &[AlarmDefinition]) {
        let keys: Vec<String> = definitions
            .iter()
            .map(|d| {
                format!(
                    "{}:{}",
                    d.device_id.as_deref().unwrap_or("global"),
                    d.id
                )
            })
            .collect();
        self.states.retain(|key, _| keys.iter().any(|k| k == key));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AlarmCondition, ConditionOperator};
    use chrono::Duration as ChronoDuration;

    fn high_temp_definition(cooldown_seconds: u64) -> AlarmDefinition {
        AlarmDefinition {
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
            cooldown_seconds,
            device_id: Some("inv-1".into()),
            device_name: Some("Inverter 1".into()),
        }
    }

    fn context_with(value: f64) -> EvaluationContext {
        let mut device_registers = HashMap::new();
        device_registers.insert(
            "inv-1".to_string(),
            [("temperature_c".to_string(), value)].into(),
        );
        EvaluationContext {
            scalars: HashMap::new(),
            device_registers,
        }
    }

    #[test]
    fn scenario_f_cooldown_suppresses_repeat_triggers() {
        // 65 → 71 → 72 → 69 → 73 within 60 s, cooldown 300 s:
        // exactly one trigger (at 71).
        let definitions = vec![high_temp_definition(300)];
        let mut evaluator = AlarmEvaluator::new();
        let t0 = Utc::now();

        let mut all_triggered = 0;
        let mut resolutions = 0;
        for (offset, value) in [(0, 65.0), (15, 71.0), (30, 72.0), (45, 69.0), (60, 73.0)] {
            let (triggered, resolved) = evaluator.evaluate(
                &context_with(value),
                &definitions,
                t0 + ChronoDuration::seconds(offset),
            );
            all_triggered += triggered.len();
            resolutions += resolved.len();
        }

        assert_eq!(all_triggered, 1);
        // 69 cleared the condition once.
        assert_eq!(resolutions, 1);
    }

    #[test]
    fn retriggers_after_cooldown_expires() {
        let definitions = vec![high_temp_definition(10)];
        let mut evaluator = AlarmEvaluator::new();
        let t0 = Utc::now();

        let (first, _) = evaluator.evaluate(&context_with(75.0), &definitions, t0);
        assert_eq!(first.len(), 1);

        let (within, _) = evaluator.evaluate(
            &context_with(76.0),
            &definitions,
            t0 + ChronoDuration::seconds(5),
        );
        assert!(within.is_empty());

        let (after, _) = evaluator.evaluate(
            &context_with(77.0),
            &definitions,
            t0 + ChronoDuration::seconds(11),
        );
        assert_eq!(after.len(), 1);
    }

    #[test]
    fn first_matching_condition_fixes_severity() {
        let definition = AlarmDefinition {
            conditions: vec![
                AlarmCondition {
                    operator: ConditionOperator::Gt,
                    value: 90.0,
                    severity: Severity::Critical,
                    message: "critically hot".into(),
                },
                AlarmCondition {
                    operator: ConditionOperator::Gt,
                    value: 70.0,
                    severity: Severity::Warning,
                    message: "warm".into(),
                },
            ],
            ..high_temp_definition(0)
        };
        let mut evaluator = AlarmEvaluator::new();

        let (triggered, _) =
            evaluator.evaluate(&context_with(95.0), &[definition.clone()], Utc::now());
        assert_eq!(triggered[0].severity, Severity::Critical);

        let (triggered, _) = evaluator.evaluate(
            &context_with(75.0),
            &[definition],
            Utc::now() + ChronoDuration::seconds(1),
        );
        assert_eq!(triggered[0].severity, Severity::Warning);
    }

    #[test]
    fn unbound_definition_searches_all_devices() {
        let definition = AlarmDefinition {
            device_id: None,
            device_name: None,
            ..high_temp_definition(300)
        };
        let mut evaluator = AlarmEvaluator::new();
        let (triggered, _) = evaluator.evaluate(&context_with(80.0), &[definition], Utc::now());
        assert_eq!(triggered.len(), 1);
    }

    #[test]
    fn missing_source_value_is_skipped() {
        let definitions = vec![high_temp_definition(300)];
        let mut evaluator = AlarmEvaluator::new();
        let empty = EvaluationContext::default();
        let (triggered, resolved) = evaluator.evaluate(&empty, &definitions, Utc::now());
        assert!(triggered.is_empty());
        assert!(resolved.is_empty());
    }

    #[test]
    fn heartbeat_sources_read_scalars() {
        let definition = AlarmDefinition {
            id: "cpu".into(),
            name: "High CPU".into(),
            source_type: AlarmSourceType::Heartbeat,
            source_key: "cpu_pct".into(),
            conditions: vec![AlarmCondition {
                operator: ConditionOperator::Ge,
                value: 95.0,
                severity: Severity::Warning,
                message: "cpu saturated".into(),
            }],
            enabled: true,
            cooldown_seconds: 0,
            device_id: None,
            device_name: None,
        };
        let context = EvaluationContext {
            scalars: [("cpu_pct".to_string(), 97.0)].into(),
            device_registers: HashMap::new(),
        };
        let mut evaluator = AlarmEvaluator::new();
        let (triggered, _) = evaluator.evaluate(&context, &[definition], Utc::now());
        assert_eq!(triggered.len(), 1);
        assert_eq!(triggered[0].condition_text, "cpu_pct >= 95");
    }
}
