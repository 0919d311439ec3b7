//! Site configuration.
//!
//! The YAML snapshot is parsed once, at the edge, into typed structures;
//! everything downstream consumes `SiteConfig`. Mode-specific settings are
//! a tagged variant resolved from the raw settings map when the config is
//! loaded — the mode id string does not survive past this module except
//! for display.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::{ControllerError, Result};

/// Conventional config locations, checked in order.
pub const CONFIG_PATHS: &[&str] = &[
    "/etc/volteria/config.yaml",
    "/opt/volteria/config.yaml",
    "config.yaml",
];

fn default_port() -> u16 {
    502
}
fn default_slave_id() -> u8 {
    1
}
fn default_baudrate() -> u32 {
    9600
}
fn default_stopbits() -> u8 {
    1
}
fn default_scale() -> f64 {
    1.0
}
fn default_poll_interval_ms() -> u64 {
    1000
}
fn default_logging_frequency_s() -> u64 {
    60
}
fn default_control_interval_ms() -> u64 {
    1000
}
fn default_true() -> bool {
    true
}
fn default_cooldown() -> u64 {
    300
}

// ─── Devices & registers ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    Inverter,
    #[serde(alias = "load", alias = "energy_meter")]
    LoadMeter,
    #[serde(alias = "dg", alias = "diesel_generator", alias = "gas_generator")]
    Generator,
    Battery,
    Sensor,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Parity {
    #[serde(alias = "N")]
    None,
    #[serde(alias = "E")]
    Even,
    #[serde(alias = "O")]
    Odd,
}

/// How a device is reached. RTU-direct carries the serial parameters; one
/// serial port hosts many slaves, so the connection pool hands out a bus
/// mutex alongside its client.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "protocol", rename_all = "snake_case")]
pub enum Transport {
    Tcp {
        host: String,
        #[serde(default = "default_port")]
        port: u16,
    },
    RtuGateway {
        host: String,
        #[serde(default = "default_port")]
        port: u16,
    },
    RtuDirect {
        serial_port: String,
        #[serde(default = "default_baudrate")]
        baudrate: u32,
        #[serde(default)]
        parity: Option<Parity>,
        #[serde(default = "default_stopbits")]
        stopbits: u8,
    },
}

impl Transport {
    pub fn is_serial(&self) -> bool {
        matches!(self, Transport::RtuDirect { .. })
    }

    /// Pool key: `host:port` for network transports, the port path for
    /// serial.
    pub fn endpoint_key(&self) -> String {
        match self {
            Transport::Tcp { host, port } | Transport::RtuGateway { host, port } => {
                format!("{host}:{port}")
            }
            Transport::RtuDirect { serial_port, .. } => serial_port.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterKind {
    Holding,
    Input,
    /// Computed by the controller, never read off the wire. The virtual
    /// controller device uses these to carry site aggregates.
    Virtual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterDataType {
    Uint16,
    Int16,
    Uint32,
    Int32,
    Float32,
    Float64,
    Utf8,
}

impl RegisterDataType {
    /// Number of 16-bit words this type occupies. `size` overrides the
    /// default when positive (UTF-8 strings).
    pub fn word_count(self, size: u16) -> u16 {
        if size > 0 {
            return size;
        }
        match self {
            Self::Uint16 | Self::Int16 => 1,
            Self::Uint32 | Self::Int32 | Self::Float32 => 2,
            Self::Float64 => 4,
            Self::Utf8 => 20,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterAccess {
    Read,
    Write,
    #[serde(alias = "read_write")]
    ReadWrite,
}

impl Default for RegisterAccess {
    fn default() -> Self {
        Self::Read
    }
}

/// Order in which scale and offset apply to a decoded value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleOrder {
    MultiplyThenAdd,
    AddThenMultiply,
}

impl Default for ScaleOrder {
    fn default() -> Self {
        Self::MultiplyThenAdd
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RegisterConfig {
    pub address: u16,
    pub name: String,
    #[serde(default = "RegisterConfig::default_kind", rename = "type")]
    pub kind: RegisterKind,
    #[serde(default = "RegisterConfig::default_datatype")]
    pub datatype: RegisterDataType,
    #[serde(default)]
    pub access: RegisterAccess,
    #[serde(default = "default_scale")]
    pub scale: f64,
    #[serde(default)]
    pub offset: f64,
    #[serde(default)]
    pub scale_order: ScaleOrder,
    #[serde(default)]
    pub unit: String,
    /// Word-count override for UTF-8 strings (0 = datatype default).
    #[serde(default)]
    pub size: u16,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Cloud logging cadence: one representative reading is uploaded per
    /// bucket of this width.
    #[serde(default = "default_logging_frequency_s")]
    pub logging_frequency_s: u64,
    /// Semantic tag used by site aggregation (e.g. `solar_active_power`).
    #[serde(default)]
    pub role: Option<String>,
    /// Readings outside [min, max] are discarded as implausible.
    #[serde(default)]
    pub valid_min: Option<f64>,
    #[serde(default)]
    pub valid_max: Option<f64>,
    #[serde(default = "default_true")]
    pub log_to_cloud: bool,
}

impl RegisterConfig {
    fn default_kind() -> RegisterKind {
        RegisterKind::Holding
    }
    fn default_datatype() -> RegisterDataType {
        RegisterDataType::Uint16
    }

    pub fn in_valid_range(&self, value: f64) -> bool {
        if let Some(min) = self.valid_min {
            if value < min {
                return false;
            }
        }
        if let Some(max) = self.valid_max {
            if value > max {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeviceConfig {
    pub id: String,
    pub name: String,
    pub device_type: DeviceType,
    #[serde(flatten)]
    pub transport: Transport,
    #[serde(default = "default_slave_id")]
    pub slave_id: u8,
    #[serde(default)]
    pub rated_power_kw: Option<f64>,
    #[serde(default)]
    pub registers: Vec<RegisterConfig>,
    #[serde(default)]
    pub alarm_definitions: Vec<AlarmDefinition>,
}

impl DeviceConfig {
    pub fn register(&self, name: &str) -> Option<&RegisterConfig> {
        self.registers.iter().find(|r| r.name == name)
    }
}

// ─── Operation modes ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationModeId {
    ZeroGeneratorFeed,
    ZeroDgPf,
    ZeroDgReactive,
    PeakShaving,
}

impl OperationModeId {
    /// Parse a known mode id. `zero_dg_reverse` is a legacy alias kept
    /// for older site configs. Unknown ids return `None`; the caller
    /// falls back to zero generator feed with a warning — a bad mode
    /// string must never fail the whole config load.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "zero_generator_feed" | "zero_dg_reverse" => Some(Self::ZeroGeneratorFeed),
            "zero_dg_pf" => Some(Self::ZeroDgPf),
            "zero_dg_reactive" => Some(Self::ZeroDgReactive),
            "peak_shaving" => Some(Self::PeakShaving),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ZeroGeneratorFeed => "zero_generator_feed",
            Self::ZeroDgPf => "zero_dg_pf",
            Self::ZeroDgReactive => "zero_dg_reactive",
            Self::PeakShaving => "peak_shaving",
        }
    }
}

impl Default for OperationModeId {
    fn default() -> Self {
        Self::ZeroGeneratorFeed
    }
}

fn default_operation_mode() -> String {
    OperationModeId::ZeroGeneratorFeed.as_str().to_string()
}

/// Raw per-mode settings as they appear in YAML. Resolved into
/// [`ModeSettings`] once the mode id is known.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawModeSettings {
    pub dg_reserve_kw: Option<f64>,
    pub target_power_factor: Option<f64>,
    pub max_reactive_kvar: Option<f64>,
    pub peak_threshold_kw: Option<f64>,
    pub battery_reserve_pct: Option<f64>,
}

/// Typed mode settings: one variant per operation mode.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ModeSettings {
    ZeroGeneratorFeed { dg_reserve_kw: f64 },
    ZeroDgPf { dg_reserve_kw: f64, target_power_factor: f64 },
    ZeroDgReactive { max_reactive_kvar: f64 },
    PeakShaving { peak_threshold_kw: f64, battery_reserve_pct: f64 },
}

impl ModeSettings {
    /// Resolve typed settings for a mode, collecting warnings for missing
    /// or out-of-range required settings. Missing requireds are warnings,
    /// not aborts — the control service holds in safe mode until fixed.
    pub fn resolve(mode: OperationModeId, raw: &RawModeSettings, warnings: &mut Vec<String>) -> Self {
        let mut require = |name: &str, value: Option<f64>, default: f64| -> f64 {
            match value {
                Some(v) => v,
                None => {
                    warnings.push(format!("missing required setting: {name}"));
                    default
                }
            }
        };

        match mode {
            OperationModeId::ZeroGeneratorFeed => {
                let dg_reserve_kw = require("dg_reserve_kw", raw.dg_reserve_kw, 0.0);
                if dg_reserve_kw < 0.0 {
                    warnings.push("dg_reserve_kw must be >= 0".into());
                }
                Self::ZeroGeneratorFeed {
                    dg_reserve_kw: dg_reserve_kw.max(0.0),
                }
            }
            OperationModeId::ZeroDgPf => {
                let dg_reserve_kw = require("dg_reserve_kw", raw.dg_reserve_kw, 10.0).max(0.0);
                let target_power_factor = require("target_power_factor", raw.target_power_factor, 0.95);
                if !(0.0..=1.0).contains(&target_power_factor) {
                    warnings.push("target_power_factor must be within [0, 1]".into());
                }
                Self::ZeroDgPf {
                    dg_reserve_kw,
                    target_power_factor: target_power_factor.clamp(0.0, 1.0),
                }
            }
            OperationModeId::ZeroDgReactive => Self::ZeroDgReactive {
                max_reactive_kvar: require("max_reactive_kvar", raw.max_reactive_kvar, 50.0),
            },
            OperationModeId::PeakShaving => {
                let peak_threshold_kw = require("peak_threshold_kw", raw.peak_threshold_kw, 500.0);
                let battery_reserve_pct = require("battery_reserve_pct", raw.battery_reserve_pct, 20.0);
                if !(0.0..=100.0).contains(&battery_reserve_pct) {
                    warnings.push("battery_reserve_pct must be within [0, 100]".into());
                }
                Self::PeakShaving {
                    peak_threshold_kw,
                    battery_reserve_pct: battery_reserve_pct.clamp(0.0, 100.0),
                }
            }
        }
    }
}

// ─── Alarms ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Major,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Major => "major",
            Self::Critical => "critical",
        }
    }

    /// Critical and major alarms are pushed to the cloud immediately.
    pub fn instant_sync(self) -> bool {
        matches!(self, Self::Critical | Self::Major)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum ConditionOperator {
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
}

impl ConditionOperator {
    pub fn matches(self, value: f64, threshold: f64) -> bool {
        match self {
            Self::Gt => value > threshold,
            Self::Ge => value >= threshold,
            Self::Lt => value < threshold,
            Self::Le => value <= threshold,
            Self::Eq => value == threshold,
            Self::Ne => value != threshold,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Eq => "==",
            Self::Ne => "!=",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AlarmCondition {
    pub operator: ConditionOperator,
    pub value: f64,
    pub severity: Severity,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmSourceType {
    ModbusRegister,
    DeviceInfo,
    CalculatedField,
    Heartbeat,
}

/// Threshold alarm definition. Conditions are evaluated in declaration
/// order and the first match wins, so authors order by severity
/// descending.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AlarmDefinition {
    pub id: String,
    pub name: String,
    pub source_type: AlarmSourceType,
    pub source_key: String,
    #[serde(default)]
    pub conditions: Vec<AlarmCondition>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_cooldown")]
    pub cooldown_seconds: u64,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub device_name: Option<String>,
}

// ─── Safe mode & logging settings ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SafeModeType {
    TimeBased,
    RollingAverage,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SafeModeSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "SafeModeSettings::default_type", rename = "type")]
    pub mode_type: SafeModeType,
    #[serde(default = "SafeModeSettings::default_timeout")]
    pub timeout_s: u64,
    #[serde(default = "SafeModeSettings::default_window")]
    pub rolling_window_min: u64,
    #[serde(default = "SafeModeSettings::default_threshold")]
    pub threshold_pct: f64,
    #[serde(default)]
    pub power_limit_kw: f64,
}

impl SafeModeSettings {
    fn default_type() -> SafeModeType {
        SafeModeType::TimeBased
    }
    fn default_timeout() -> u64 {
        30
    }
    fn default_window() -> u64 {
        3
    }
    fn default_threshold() -> f64 {
        80.0
    }
}

impl Default for SafeModeSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            mode_type: SafeModeType::TimeBased,
            timeout_s: 30,
            rolling_window_min: 3,
            threshold_pct: 80.0,
            power_limit_kw: 0.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingSettings {
    #[serde(default = "LoggingSettings::default_local_write")]
    pub local_write_interval_s: u64,
    #[serde(default = "LoggingSettings::default_readings_sync")]
    pub readings_sync_interval_s: u64,
    #[serde(default = "LoggingSettings::default_logs_sync")]
    pub cloud_sync_interval_s: u64,
    #[serde(default = "LoggingSettings::default_retention")]
    pub local_retention_days: u32,
    #[serde(default = "default_true")]
    pub instant_sync_alarms: bool,
}

impl LoggingSettings {
    fn default_local_write() -> u64 {
        10
    }
    fn default_readings_sync() -> u64 {
        180
    }
    fn default_logs_sync() -> u64 {
        120
    }
    fn default_retention() -> u32 {
        7
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            local_write_interval_s: 10,
            readings_sync_interval_s: 180,
            cloud_sync_interval_s: 120,
            local_retention_days: 7,
            instant_sync_alarms: true,
        }
    }
}

// ─── Site config ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SiteConfig {
    pub id: String,
    pub name: String,
    /// Kept as the raw string so an unrecognized id degrades to a
    /// runtime fallback instead of failing the whole config parse.
    #[serde(default = "default_operation_mode", rename = "operation_mode")]
    pub operation_mode_raw: String,
    #[serde(default = "default_control_interval_ms")]
    pub control_interval_ms: u64,
    #[serde(default)]
    pub mode_settings: RawModeSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
    #[serde(default)]
    pub safe_mode: SafeModeSettings,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
    #[serde(default)]
    pub site_level_alarms: Vec<AlarmDefinition>,
    /// Monotonic version stamp; a stale cache never overrides a newer one.
    #[serde(default)]
    pub updated_at: String,
}

impl SiteConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ControllerError::Config(format!("{}: {e}", path.display())))?;
        let config: SiteConfig = serde_yaml::from_str(&content)
            .map_err(|e| ControllerError::Config(format!("{}: {e}", path.display())))?;
        Ok(config)
    }

    /// Search the conventional locations for a config file.
    pub fn find_path() -> Option<PathBuf> {
        CONFIG_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|p| p.exists())
    }

    pub fn devices_by_type(&self, device_type: DeviceType) -> impl Iterator<Item = &DeviceConfig> {
        self.devices.iter().filter(move |d| d.device_type == device_type)
    }

    /// Sum of rated inverter capacity, the denominator for every
    /// limit-percent conversion.
    pub fn solar_capacity_kw(&self) -> f64 {
        self.devices_by_type(DeviceType::Inverter)
            .filter_map(|d| d.rated_power_kw)
            .sum()
    }

    /// The effective operation mode. Unknown ids fall back to zero
    /// generator feed with a warning — the safest default for a hybrid
    /// site is the one that cannot reverse-feed the generators.
    pub fn operation_mode(&self) -> OperationModeId {
        match OperationModeId::parse(&self.operation_mode_raw) {
            Some(mode) => mode,
            None => {
                tracing::warn!(
                    mode = %self.operation_mode_raw,
                    "unknown operation mode, using zero_generator_feed"
                );
                OperationModeId::ZeroGeneratorFeed
            }
        }
    }

    /// Resolve typed mode settings and validate the config for its mode.
    /// Returns warnings; the caller decides whether to hold in safe mode.
    pub fn resolve_mode_settings(&self) -> (ModeSettings, Vec<String>) {
        let mut warnings = Vec::new();
        if OperationModeId::parse(&self.operation_mode_raw).is_none() {
            warnings.push(format!(
                "unknown operation mode '{}', using zero_generator_feed",
                self.operation_mode_raw
            ));
        }
        let settings =
            ModeSettings::resolve(self.operation_mode(), &self.mode_settings, &mut warnings);

        if !(100..=60_000).contains(&self.control_interval_ms) {
            warnings.push(format!(
                "control_interval_ms {} outside [100, 60000]",
                self.control_interval_ms
            ));
        }
        if !(5..=300).contains(&self.safe_mode.timeout_s) {
            warnings.push(format!(
                "safe_mode.timeout_s {} outside [5, 300]",
                self.safe_mode.timeout_s
            ));
        }

        (settings, warnings)
    }

    /// Effective control interval with the configured bounds applied.
    pub fn control_interval_ms_clamped(&self) -> u64 {
        self.control_interval_ms.clamp(100, 60_000)
    }

    /// All alarm definitions: site-level plus per-device, with the device
    /// binding filled in.
    pub fn all_alarm_definitions(&self) -> Vec<AlarmDefinition> {
        let mut defs = self.site_level_alarms.clone();
        for device in &self.devices {
            for def in &device.alarm_definitions {
                let mut def = def.clone();
                def.device_id.get_or_insert_with(|| device.id.clone());
                def.device_name.get_or_insert_with(|| device.name.clone());
                defs.push(def);
            }
        }
        defs
    }
}

/// Controller-level identity, read from the environment alongside the
/// cloud credentials.
#[derive(Debug, Clone)]
pub struct ControllerIdentity {
    pub controller_id: String,
    pub firmware_version: String,
    pub hardware_type: String,
}

impl ControllerIdentity {
    pub fn from_env() -> Self {
        Self {
            controller_id: std::env::var("VOLTERIA_CONTROLLER_ID")
                .unwrap_or_else(|_| "controller-dev".to_string()),
            firmware_version: env!("CARGO_PKG_VERSION").to_string(),
            hardware_type: std::env::var("VOLTERIA_HARDWARE_TYPE")
                .unwrap_or_else(|_| "generic-x86".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL_YAML: &str = r#"
id: site-1
name: Test Site
operation_mode: zero_generator_feed
mode_settings:
  dg_reserve_kw: 10
devices:
  - id: inv-1
    name: Inverter 1
    device_type: inverter
    protocol: tcp
    host: 192.168.1.10
    rated_power_kw: 100
    registers:
      - address: 5008
        name: power_limit_pct
        type: holding
        datatype: uint16
        access: read_write
        scale: 0.1
  - id: meter-1
    name: Load Meter
    device_type: load_meter
    protocol: rtu_direct
    serial_port: /dev/ttyACM1
    baudrate: 9600
    slave_id: 3
    registers:
      - address: 100
        name: active_power_kw
        type: input
        datatype: float32
        role: load_active_power
"#;

    #[test]
    fn parses_minimal_site_config() {
        let config: SiteConfig = serde_yaml::from_str(MINIMAL_YAML).unwrap();
        assert_eq!(config.id, "site-1");
        assert_eq!(config.devices.len(), 2);
        assert_eq!(config.solar_capacity_kw(), 100.0);

        let meter = &config.devices[1];
        assert!(meter.transport.is_serial());
        assert_eq!(meter.transport.endpoint_key(), "/dev/ttyACM1");
        assert_eq!(meter.slave_id, 3);
        assert_eq!(
            meter.registers[0].role.as_deref(),
            Some("load_active_power")
        );
    }

    #[test]
    fn legacy_mode_alias_maps_to_zero_generator_feed() {
        let yaml = MINIMAL_YAML.replace("zero_generator_feed", "zero_dg_reverse");
        let config: SiteConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(config.operation_mode(), OperationModeId::ZeroGeneratorFeed);
    }

    #[test]
    fn unknown_mode_id_parses_and_falls_back_with_warning() {
        // A typo in the mode id must not fail the whole config load.
        let yaml = MINIMAL_YAML.replace("zero_generator_feed", "grid_export_boost");
        let config: SiteConfig = serde_yaml::from_str(&yaml).unwrap();

        assert_eq!(config.operation_mode_raw, "grid_export_boost");
        assert_eq!(config.operation_mode(), OperationModeId::ZeroGeneratorFeed);

        let (settings, warnings) = config.resolve_mode_settings();
        assert!(matches!(settings, ModeSettings::ZeroGeneratorFeed { .. }));
        assert!(warnings
            .iter()
            .any(|w| w.contains("unknown operation mode 'grid_export_boost'")));
    }

    #[test]
    fn absent_mode_id_defaults_to_zero_generator_feed() {
        let yaml = r#"
id: site-4
name: Defaulted
mode_settings:
  dg_reserve_kw: 0
"#;
        let config: SiteConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.operation_mode(), OperationModeId::ZeroGeneratorFeed);
        let (_, warnings) = config.resolve_mode_settings();
        assert!(!warnings.iter().any(|w| w.contains("unknown operation mode")));
    }

    #[test]
    fn missing_required_setting_is_a_warning_not_an_error() {
        let yaml = r#"
id: site-2
name: Sparse
operation_mode: peak_shaving
"#;
        let config: SiteConfig = serde_yaml::from_str(yaml).unwrap();
        let (settings, warnings) = config.resolve_mode_settings();
        assert!(matches!(settings, ModeSettings::PeakShaving { .. }));
        assert!(warnings.iter().any(|w| w.contains("peak_threshold_kw")));
        assert!(warnings.iter().any(|w| w.contains("battery_reserve_pct")));
    }

    #[test]
    fn interval_bounds_produce_warnings() {
        let yaml = r#"
id: site-3
name: Bad Intervals
control_interval_ms: 50
mode_settings:
  dg_reserve_kw: 5
safe_mode:
  timeout_s: 2
"#;
        let config: SiteConfig = serde_yaml::from_str(yaml).unwrap();
        let (_, warnings) = config.resolve_mode_settings();
        assert!(warnings.iter().any(|w| w.contains("control_interval_ms")));
        assert!(warnings.iter().any(|w| w.contains("timeout_s")));
        assert_eq!(config.control_interval_ms_clamped(), 100);
    }

    #[test]
    fn word_counts_follow_datatype() {
        assert_eq!(RegisterDataType::Uint16.word_count(0), 1);
        assert_eq!(RegisterDataType::Float32.word_count(0), 2);
        assert_eq!(RegisterDataType::Float64.word_count(0), 4);
        assert_eq!(RegisterDataType::Utf8.word_count(8), 8);
    }
}
