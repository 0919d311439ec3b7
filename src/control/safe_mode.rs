//! Safe-mode supervision.
//!
//! Two trigger policies, one active per configuration:
//!
//! * Time-based — any monitored device offline for `timeout_s` trips the
//!   override; recovery requires the whole fleet back online.
//! * Rolling-average — trips only when a device has been offline long
//!   enough *and* the windowed solar-to-load ratio crosses the threshold;
//!   recovers as soon as either condition clears.
//!
//! The supervisor also honors external triggers written to shared state
//! when a critical service is unrecoverable.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::config::{SafeModeSettings, SafeModeType};
use crate::state::{SharedState, KEY_SAFE_MODE_STATE, KEY_SAFE_MODE_TRIGGER};

/// Withhold the rolling-average trigger until the window has substance.
const MIN_WINDOW_SAMPLES: usize = 10;

#[derive(Debug, Clone, Default)]
pub struct SafeModeState {
    pub active: bool,
    pub triggered_at: Option<DateTime<Utc>>,
    pub reason: Option<String>,
    pub trigger_service: Option<String>,
}

impl SafeModeState {
    fn to_value(&self) -> Value {
        json!({
            "active": self.active,
            "triggered_at": self.triggered_at.map(|t| t.to_rfc3339()),
            "trigger_reason": self.reason,
            "trigger_service": self.trigger_service,
        })
    }
}

pub struct SafeModeSupervisor {
    settings: SafeModeSettings,
    state: SafeModeState,
    /// (timestamp, load_kw, solar_kw) samples for the rolling window.
    window: VecDeque<(DateTime<Utc>, f64, f64)>,
}

impl SafeModeSupervisor {
    pub fn new(settings: SafeModeSettings) -> Self {
        Self {
            settings,
            state: SafeModeState::default(),
            window: VecDeque::new(),
        }
    }

    pub fn update_settings(&mut self, settings: SafeModeSettings) {
        self.settings = settings;
    }

    pub fn is_active(&self) -> bool {
        self.state.active
    }

    pub fn state(&self) -> &SafeModeState {
        &self.state
    }

    /// Safe-mode solar limit in kW while active.
    pub fn safe_limit_kw(&self) -> f64 {
        self.settings.power_limit_kw
    }

    /// Safe-mode limit as a percentage of aggregate inverter capacity.
    pub fn safe_limit_pct(&self, solar_capacity_kw: f64) -> f64 {
        if !self.state.active {
            return 100.0;
        }
        if solar_capacity_kw <= 0.0 {
            return 0.0;
        }
        (self.settings.power_limit_kw / solar_capacity_kw * 100.0).clamp(0.0, 100.0)
    }

    /// Evaluate this cycle. Feeds the rolling window, honors external
    /// triggers, applies the configured policy, and publishes every
    /// transition to `safe_mode_state`.
    pub fn check_and_trigger(
        &mut self,
        shared: &SharedState,
        load_kw: f64,
        solar_kw: f64,
        device_online: &HashMap<String, bool>,
        now: DateTime<Utc>,
    ) -> bool {
        if !self.settings.enabled {
            return false;
        }

        // External trigger from the supervisor (unrecoverable service).
        let external = shared.read_fresh(KEY_SAFE_MODE_TRIGGER);
        if external
            .get("triggered")
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            let reason = external
                .get("reason")
                .and_then(Value::as_str)
                .unwrap_or("external trigger")
                .to_string();
            let service = external
                .get("service")
                .and_then(Value::as_str)
                .map(String::from);
            self.trigger(shared, reason, service, now);
            return true;
        }

        // Feed and trim the rolling window.
        self.window.push_back((now, load_kw, solar_kw));
        let window_s = self.settings.rolling_window_min as i64 * 60;
        let cutoff = now - ChronoDuration::seconds(window_s);
        while self.window.front().is_some_and(|(t, _, _)| *t < cutoff) {
            self.window.pop_front();
        }

        match self.settings.mode_type {
            SafeModeType::TimeBased => self.check_time_based(shared, device_online, now),
            SafeModeType::RollingAverage => self.check_rolling_average(shared, device_online, now),
        }
    }

    fn offline_long_enough(
        &self,
        shared: &SharedState,
        device_online: &HashMap<String, bool>,
    ) -> Option<(String, f64)> {
        for (device_id, online) in device_online {
            if *online {
                continue;
            }
            if let Some(offline_s) = shared.device_offline_seconds(device_id) {
                if offline_s >= self.settings.timeout_s as f64 {
                    return Some((device_id.clone(), offline_s));
                }
            }
        }
        None
    }

    fn check_time_based(
        &mut self,
        shared: &SharedState,
        device_online: &HashMap<String, bool>,
        now: DateTime<Utc>,
    ) -> bool {
        if let Some((device_id, offline_s)) = self.offline_long_enough(shared, device_online) {
            self.trigger(
                shared,
                format!("Device offline for {offline_s:.0}s"),
                Some(device_id),
                now,
            );
            return true;
        }

        if self.state.active {
            self.check_recovery(shared, device_online, None);
        }
        self.state.active
    }

    fn check_rolling_average(
        &mut self,
        shared: &SharedState,
        device_online: &HashMap<String, bool>,
        now: DateTime<Utc>,
    ) -> bool {
        let all_online = device_online.values().all(|&o| o);
        if all_online {
            if self.state.active {
                self.check_recovery(shared, device_online, None);
            }
            return self.state.active;
        }

        let Some((device_id, _)) = self.offline_long_enough(shared, device_online) else {
            return self.state.active;
        };

        if self.window.len() < MIN_WINDOW_SAMPLES {
            return self.state.active;
        }

        let n = self.window.len() as f64;
        let mean_load: f64 = self.window.iter().map(|(_, l, _)| l).sum::<f64>() / n;
        let mean_solar: f64 = self.window.iter().map(|(_, _, s)| s).sum::<f64>() / n;

        let ratio_pct = solar_to_load_ratio_pct(mean_solar, mean_load);

        if ratio_pct >= self.settings.threshold_pct {
            self.trigger(
                shared,
                format!("High reverse risk: solar {ratio_pct:.0}% of load, device offline"),
                Some(device_id),
                now,
            );
            return true;
        }

        if self.state.active {
            self.check_recovery(shared, device_online, Some(ratio_pct));
        }
        self.state.active
    }

    fn trigger(
        &mut self,
        shared: &SharedState,
        reason: String,
        service: Option<String>,
        now: DateTime<Utc>,
    ) {
        if self.state.active {
            return;
        }
        warn!(reason = %reason, service = ?service, "safe mode TRIGGERED");
        self.state = SafeModeState {
            active: true,
            triggered_at: Some(now),
            reason: Some(reason),
            trigger_service: service,
        };
        shared.write(KEY_SAFE_MODE_STATE, self.state.to_value());
    }

    fn check_recovery(
        &mut self,
        shared: &SharedState,
        device_online: &HashMap<String, bool>,
        ratio_pct: Option<f64>,
    ) {
        let all_online = device_online.values().all(|&o| o);

        let recovered = match self.settings.mode_type {
            // Time-based: the whole fleet must be back.
            SafeModeType::TimeBased => all_online,
            // Rolling-average: either condition clearing is enough.
            SafeModeType::RollingAverage => {
                all_online || ratio_pct.is_some_and(|r| r < self.settings.threshold_pct)
            }
        };

        if recovered {
            info!("safe mode recovery");
            self.state = SafeModeState::default();
            shared.write(KEY_SAFE_MODE_STATE, self.state.to_value());
            shared.delete(KEY_SAFE_MODE_TRIGGER);
        }
    }

    /// Manual reset (operator action through the system service).
    pub fn reset(&mut self, shared: &SharedState) {
        info!("safe mode manually reset");
        self.state = SafeModeState::default();
        shared.write(KEY_SAFE_MODE_STATE, self.state.to_value());
        shared.delete(KEY_SAFE_MODE_TRIGGER);
    }
}

/// Windowed solar-to-load ratio with the zero-load protection: no load
/// but positive solar is treated as 100 % (dangerous), no load and no
/// solar as 0 %.
pub fn solar_to_load_ratio_pct(mean_solar: f64, mean_load: f64) -> f64 {
    if mean_load > 0.0 {
        mean_solar / mean_load * 100.0
    } else if mean_solar > 0.0 {
        100.0
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(mode_type: SafeModeType) -> SafeModeSettings {
        SafeModeSettings {
            enabled: true,
            mode_type,
            timeout_s: 30,
            rolling_window_min: 3,
            threshold_pct: 80.0,
            power_limit_kw: 0.0,
        }
    }

    fn offline_for(shared: &SharedState, device: &str, seconds: i64) {
        // Stamp an offline transition in the past.
        let since = Utc::now() - ChronoDuration::seconds(seconds);
        shared.write(
            crate::state::KEY_DEVICE_OFFLINE_TIMES,
            json!({ device: since.to_rfc3339() }),
        );
    }

    #[test]
    fn time_based_triggers_after_timeout_and_recovers_when_all_online() {
        let shared = SharedState::new();
        let mut supervisor = SafeModeSupervisor::new(settings(SafeModeType::TimeBased));
        let mut online: HashMap<String, bool> = [("inv-1".to_string(), false)].into();

        offline_for(&shared, "inv-1", 45);
        assert!(supervisor.check_and_trigger(&shared, 20.0, 5.0, &online, Utc::now()));
        assert!(supervisor.is_active());
        let doc = shared.read_fresh(KEY_SAFE_MODE_STATE);
        assert_eq!(doc["active"], true);
        assert!(doc["trigger_reason"]
            .as_str()
            .unwrap()
            .contains("Device offline"));

        online.insert("inv-1".into(), true);
        shared.delete(crate::state::KEY_DEVICE_OFFLINE_TIMES);
        assert!(!supervisor.check_and_trigger(&shared, 20.0, 5.0, &online, Utc::now()));
        assert_eq!(shared.read_fresh(KEY_SAFE_MODE_STATE)["active"], false);
    }

    #[test]
    fn time_based_does_not_trigger_before_timeout() {
        let shared = SharedState::new();
        let mut supervisor = SafeModeSupervisor::new(settings(SafeModeType::TimeBased));
        let online: HashMap<String, bool> = [("inv-1".to_string(), false)].into();

        offline_for(&shared, "inv-1", 10);
        assert!(!supervisor.check_and_trigger(&shared, 20.0, 5.0, &online, Utc::now()));
    }

    #[test]
    fn rolling_average_needs_both_conditions() {
        let shared = SharedState::new();
        let mut supervisor = SafeModeSupervisor::new(settings(SafeModeType::RollingAverage));
        let online: HashMap<String, bool> = [("inv-1".to_string(), false)].into();
        offline_for(&shared, "inv-1", 60);

        // Scenario C: load 20, solar 18 → 90% ≥ 80%, device offline.
        let mut now = Utc::now() - ChronoDuration::seconds(20);
        for _ in 0..12 {
            supervisor.check_and_trigger(&shared, 20.0, 18.0, &online, now);
            now += ChronoDuration::seconds(1);
        }
        assert!(supervisor.is_active());
        let reason = shared.read_fresh(KEY_SAFE_MODE_STATE)["trigger_reason"]
            .as_str()
            .unwrap()
            .to_string();
        assert!(reason.contains("solar 90% of load"), "reason: {reason}");
    }

    #[test]
    fn rolling_average_withholds_below_min_samples() {
        let shared = SharedState::new();
        let mut supervisor = SafeModeSupervisor::new(settings(SafeModeType::RollingAverage));
        let online: HashMap<String, bool> = [("inv-1".to_string(), false)].into();
        offline_for(&shared, "inv-1", 60);

        for _ in 0..5 {
            supervisor.check_and_trigger(&shared, 20.0, 18.0, &online, Utc::now());
        }
        assert!(!supervisor.is_active());
    }

    #[test]
    fn rolling_average_safe_ratio_does_not_trigger() {
        let shared = SharedState::new();
        let mut supervisor = SafeModeSupervisor::new(settings(SafeModeType::RollingAverage));
        let online: HashMap<String, bool> = [("inv-1".to_string(), false)].into();
        offline_for(&shared, "inv-1", 60);

        let mut now = Utc::now() - ChronoDuration::seconds(20);
        for _ in 0..12 {
            supervisor.check_and_trigger(&shared, 100.0, 20.0, &online, now);
            now += ChronoDuration::seconds(1);
        }
        assert!(!supervisor.is_active());
    }

    #[test]
    fn zero_load_with_solar_counts_as_dangerous() {
        assert_eq!(solar_to_load_ratio_pct(5.0, 0.0), 100.0);
        assert_eq!(solar_to_load_ratio_pct(0.0, 0.0), 0.0);
        assert_eq!(solar_to_load_ratio_pct(18.0, 20.0), 90.0);
    }

    #[test]
    fn external_trigger_is_immediate() {
        let shared = SharedState::new();
        let mut supervisor = SafeModeSupervisor::new(settings(SafeModeType::TimeBased));
        shared.write(
            KEY_SAFE_MODE_TRIGGER,
            json!({"triggered": true, "reason": "Critical service control unrecoverable", "service": "control"}),
        );

        let online: HashMap<String, bool> = [("inv-1".to_string(), true)].into();
        assert!(supervisor.check_and_trigger(&shared, 10.0, 5.0, &online, Utc::now()));
        assert_eq!(
            supervisor.state().trigger_service.as_deref(),
            Some("control")
        );
    }

    #[test]
    fn safe_limit_pct_against_capacity() {
        let mut supervisor = SafeModeSupervisor::new(SafeModeSettings {
            power_limit_kw: 10.0,
            ..settings(SafeModeType::TimeBased)
        });
        assert_eq!(supervisor.safe_limit_pct(100.0), 100.0); // inactive

        supervisor.state.active = true;
        assert_eq!(supervisor.safe_limit_pct(100.0), 10.0);
        assert_eq!(supervisor.safe_limit_pct(0.0), 0.0);
    }
}
