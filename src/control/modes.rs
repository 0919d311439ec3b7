//! Operation modes.
//!
//! A small closed set of control laws expressed as a tagged variant:
//! the mode id exists only at config-parse time, and `calculate`
//! dispatches on the resolved [`ModeSettings`]. The output carries the
//! solar limit plus an action map telling the control service which
//! writes to issue.

use serde::Serialize;

use crate::config::ModeSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadSource {
    /// Direct measurement from at least one online load meter.
    LoadMeter,
    /// Off-grid assumption: generator output ≈ site load.
    GeneratorFallback,
    /// No fresh estimate this cycle; the control service falls back to
    /// its cached prior value or safe mode.
    None,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Actions {
    pub write_inverter_limit: bool,
    pub write_reactive_power: bool,
    pub discharge_battery: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ModeInputs {
    pub total_load_kw: f64,
    pub total_solar_kw: f64,
    pub total_dg_kw: f64,
    pub total_reactive_kvar: f64,
    pub solar_capacity_kw: f64,
    pub load_meters_online: usize,
    pub generators_online: usize,
    pub battery_soc_pct: f64,
    pub battery_capacity_kw: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModeOutput {
    pub solar_limit_pct: f64,
    pub solar_limit_kw: f64,
    pub reactive_power_kvar: f64,
    pub battery_discharge_kw: f64,
    pub estimated_load_kw: f64,
    pub load_source: LoadSource,
    pub actions: Actions,
}

impl Default for ModeOutput {
    fn default() -> Self {
        Self {
            solar_limit_pct: 100.0,
            solar_limit_kw: 0.0,
            reactive_power_kvar: 0.0,
            battery_discharge_kw: 0.0,
            estimated_load_kw: 0.0,
            load_source: LoadSource::None,
            actions: Actions::default(),
        }
    }
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Limit in kW → percent of aggregate capacity, clamped to [0, 100] and
/// rounded to one decimal. Zero capacity yields zero, never a division.
pub fn limit_pct(limit_kw: f64, capacity_kw: f64) -> f64 {
    if capacity_kw <= 0.0 {
        return 0.0;
    }
    round1((limit_kw / capacity_kw * 100.0).clamp(0.0, 100.0))
}

/// Load estimation fallback chain shared by the generator-protection
/// modes: load meters first, then generator output (off-grid: gen ≈
/// load), else no fresh estimate.
fn estimate_load(inputs: &ModeInputs) -> (f64, LoadSource) {
    if inputs.load_meters_online > 0 && inputs.total_load_kw > 0.0 {
        (inputs.total_load_kw, LoadSource::LoadMeter)
    } else if inputs.generators_online > 0 && inputs.total_dg_kw > 0.0 {
        (inputs.total_dg_kw, LoadSource::GeneratorFallback)
    } else {
        (0.0, LoadSource::None)
    }
}

fn zero_generator_feed(dg_reserve_kw: f64, inputs: &ModeInputs) -> ModeOutput {
    let (estimated_load, load_source) = estimate_load(inputs);

    let headroom = estimated_load - dg_reserve_kw;
    let solar_limit_kw = headroom.clamp(0.0, inputs.solar_capacity_kw.max(0.0));

    ModeOutput {
        solar_limit_pct: limit_pct(solar_limit_kw, inputs.solar_capacity_kw),
        solar_limit_kw: round2(solar_limit_kw),
        estimated_load_kw: estimated_load,
        load_source,
        actions: Actions {
            write_inverter_limit: true,
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Run the configured control law over this cycle's inputs.
pub fn calculate(settings: &ModeSettings, inputs: &ModeInputs) -> ModeOutput {
    match settings {
        ModeSettings::ZeroGeneratorFeed { dg_reserve_kw } => {
            zero_generator_feed(*dg_reserve_kw, inputs)
        }

        ModeSettings::ZeroDgPf {
            dg_reserve_kw,
            target_power_factor: _,
        } => {
            // Active-power limiting identical to zero generator feed.
            // Q for PF correction needs a generator Q measurement the
            // fleet does not reliably expose; the action map still fixes
            // the write shape.
            let mut output = zero_generator_feed(*dg_reserve_kw, inputs);
            let reactive_power_kvar = 0.0;
            output.reactive_power_kvar = reactive_power_kvar;
            output.actions.write_reactive_power = reactive_power_kvar != 0.0;
            output
        }

        ModeSettings::ZeroDgReactive { max_reactive_kvar } => {
            // Cap |Q| while preserving sign; no active-power limit.
            let current = inputs.total_reactive_kvar;
            let magnitude = current.abs().min(*max_reactive_kvar);
            let reactive = if current < 0.0 { -magnitude } else { magnitude };

            ModeOutput {
                solar_limit_pct: 100.0,
                reactive_power_kvar: round2(reactive),
                actions: Actions {
                    write_reactive_power: true,
                    ..Default::default()
                },
                ..Default::default()
            }
        }

        ModeSettings::PeakShaving {
            peak_threshold_kw,
            battery_reserve_pct,
        } => {
            let excess = inputs.total_load_kw - peak_threshold_kw;
            let discharge = if excess > 0.0 && inputs.battery_soc_pct > *battery_reserve_pct {
                excess.min(inputs.battery_capacity_kw)
            } else {
                0.0
            };

            ModeOutput {
                solar_limit_pct: 100.0,
                battery_discharge_kw: round2(discharge),
                estimated_load_kw: inputs.total_load_kw,
                load_source: LoadSource::LoadMeter,
                actions: Actions {
                    discharge_battery: discharge > 0.0,
                    ..Default::default()
                },
                ..Default::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zgf(dg_reserve_kw: f64) -> ModeSettings {
        ModeSettings::ZeroGeneratorFeed { dg_reserve_kw }
    }

    #[test]
    fn headroom_from_load_meter() {
        // Scenario A: load 60, gen 40, reserve 10, capacity 100.
        let inputs = ModeInputs {
            total_load_kw: 60.0,
            total_solar_kw: 20.0,
            total_dg_kw: 40.0,
            solar_capacity_kw: 100.0,
            load_meters_online: 1,
            generators_online: 1,
            ..Default::default()
        };
        let output = calculate(&zgf(10.0), &inputs);
        assert_eq!(output.solar_limit_kw, 50.0);
        assert_eq!(output.solar_limit_pct, 50.0);
        assert_eq!(output.load_source, LoadSource::LoadMeter);
        assert!(output.actions.write_inverter_limit);
    }

    #[test]
    fn generator_fallback_when_meter_offline() {
        // Scenario B: meter offline, gen reports 45.
        let inputs = ModeInputs {
            total_load_kw: 0.0,
            total_dg_kw: 45.0,
            solar_capacity_kw: 100.0,
            load_meters_online: 0,
            generators_online: 1,
            ..Default::default()
        };
        let output = calculate(&zgf(10.0), &inputs);
        assert_eq!(output.estimated_load_kw, 45.0);
        assert_eq!(output.solar_limit_kw, 35.0);
        assert_eq!(output.solar_limit_pct, 35.0);
        assert_eq!(output.load_source, LoadSource::GeneratorFallback);
    }

    #[test]
    fn no_source_reports_none() {
        let inputs = ModeInputs {
            solar_capacity_kw: 100.0,
            ..Default::default()
        };
        let output = calculate(&zgf(10.0), &inputs);
        assert_eq!(output.load_source, LoadSource::None);
        assert_eq!(output.solar_limit_kw, 0.0);
    }

    #[test]
    fn limit_clamped_to_capacity() {
        let inputs = ModeInputs {
            total_load_kw: 500.0,
            solar_capacity_kw: 100.0,
            load_meters_online: 1,
            ..Default::default()
        };
        let output = calculate(&zgf(10.0), &inputs);
        assert_eq!(output.solar_limit_kw, 100.0);
        assert_eq!(output.solar_limit_pct, 100.0);
    }

    #[test]
    fn zero_capacity_never_divides() {
        let inputs = ModeInputs {
            total_load_kw: 50.0,
            solar_capacity_kw: 0.0,
            load_meters_online: 1,
            ..Default::default()
        };
        let output = calculate(&zgf(10.0), &inputs);
        assert_eq!(output.solar_limit_pct, 0.0);
    }

    #[test]
    fn negative_headroom_clamps_to_zero() {
        let inputs = ModeInputs {
            total_load_kw: 5.0,
            solar_capacity_kw: 100.0,
            load_meters_online: 1,
            ..Default::default()
        };
        let output = calculate(&zgf(10.0), &inputs);
        assert_eq!(output.solar_limit_kw, 0.0);
        assert_eq!(output.solar_limit_pct, 0.0);
    }

    #[test]
    fn reactive_mode_caps_magnitude_and_keeps_sign() {
        let settings = ModeSettings::ZeroDgReactive {
            max_reactive_kvar: 50.0,
        };
        let mut inputs = ModeInputs {
            total_reactive_kvar: -80.0,
            ..Default::default()
        };
        let output = calculate(&settings, &inputs);
        assert_eq!(output.reactive_power_kvar, -50.0);
        assert_eq!(output.solar_limit_pct, 100.0);
        assert!(output.actions.write_reactive_power);

        inputs.total_reactive_kvar = 30.0;
        assert_eq!(calculate(&settings, &inputs).reactive_power_kvar, 30.0);
    }

    #[test]
    fn peak_shaving_respects_battery_reserve() {
        let settings = ModeSettings::PeakShaving {
            peak_threshold_kw: 500.0,
            battery_reserve_pct: 20.0,
        };
        let mut inputs = ModeInputs {
            total_load_kw: 620.0,
            battery_soc_pct: 60.0,
            battery_capacity_kw: 100.0,
            ..Default::default()
        };
        let output = calculate(&settings, &inputs);
        assert_eq!(output.battery_discharge_kw, 100.0);
        assert!(output.actions.discharge_battery);

        inputs.battery_soc_pct = 15.0;
        let output = calculate(&settings, &inputs);
        assert_eq!(output.battery_discharge_kw, 0.0);
        assert!(!output.actions.discharge_battery);
    }

    #[test]
    fn pf_mode_matches_zgf_active_power_and_fixes_action_shape() {
        let settings = ModeSettings::ZeroDgPf {
            dg_reserve_kw: 10.0,
            target_power_factor: 0.95,
        };
        let inputs = ModeInputs {
            total_load_kw: 60.0,
            solar_capacity_kw: 100.0,
            load_meters_online: 1,
            ..Default::default()
        };
        let output = calculate(&settings, &inputs);
        assert_eq!(output.solar_limit_kw, 50.0);
        assert!(output.actions.write_inverter_limit);
        // Q computation deferred: no reactive write while Q is zero.
        assert!(!output.actions.write_reactive_power);
    }
}
