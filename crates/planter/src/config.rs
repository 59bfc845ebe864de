//! TOML device configuration: thresholds, calibration, task cadence, and
//! remote endpoints. Every field has a default so an empty file describes
//! the stock planter.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub device: DeviceSection,
    pub thresholds: Thresholds,
    pub moisture: MoistureCalibration,
    pub distance: DistanceCalibration,
    pub timing: Timing,
    pub update: UpdateSection,
    pub telemetry: TelemetrySection,
    pub pins: Pins,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DeviceSection {
    /// Network interface whose link state and MAC identify the device.
    pub interface: String,
    /// Overrides the MAC read from the interface (e.g. on a dev machine).
    pub hardware_address: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    /// Moisture at or below this percentage opens the valve.
    pub moisture_percent: u32,
    /// Distance above this many centimeters means the tank is empty.
    pub tank_empty_cm: u32,
    pub heat_index: f32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MoistureCalibration {
    /// Raw reading of bone-dry soil (maps to 0 %).
    pub raw_dry: i64,
    /// Raw reading of saturated soil (maps to 100 %).
    pub raw_wet: i64,
    pub samples: u32,
    pub sample_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DistanceCalibration {
    pub samples: u32,
    /// Microseconds of echo per centimeter of round trip.
    pub us_per_cm: f32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Timing {
    pub sample_period_ms: u64,
    pub actuation_period_ms: u64,
    pub indicator_tick_ms: u64,
    /// Full phase cycles a valve-open indicator runs before it stops.
    pub transient_cycles: u32,
    pub sync_period_ms: u64,
    pub publish_interval_s: u64,
    pub broker_settle_s: u64,
    pub connect_timeout_s: u64,
    pub portal_timeout_s: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UpdateSection {
    /// Base URL serving `<addr>.version` and `<addr>.bin`.
    pub base_url: String,
    pub settle_s: u64,
    /// Where a downloaded image is installed. Defaults to the running binary.
    pub install_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TelemetrySection {
    /// Register dumps are POSTed to `<endpoint>/<addr>`.
    pub endpoint: String,
    pub interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Pins {
    pub valve: u8,
    pub lamp_green: u8,
    pub lamp_red: u8,
    pub lamp_amber: u8,
    /// I2C address of the ADS1115 moisture ADC.
    pub adc_address: u16,
    pub adc_channel: usize,
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

impl Default for DeviceSection {
    fn default() -> Self {
        Self {
            interface: "wlan0".to_string(),
            hardware_address: None,
        }
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            moisture_percent: 20,
            tank_empty_cm: 60,
            heat_index: 100.0,
        }
    }
}

impl Default for MoistureCalibration {
    fn default() -> Self {
        Self {
            raw_dry: 2432,
            raw_wet: 1,
            samples: 20,
            sample_interval_ms: 5,
        }
    }
}

impl Default for DistanceCalibration {
    fn default() -> Self {
        Self {
            samples: 5,
            us_per_cm: 29.0,
        }
    }
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            sample_period_ms: 100,
            actuation_period_ms: 100,
            indicator_tick_ms: 1000,
            transient_cycles: 1,
            sync_period_ms: 50,
            publish_interval_s: 300,
            broker_settle_s: 3,
            connect_timeout_s: 30,
            portal_timeout_s: 300,
        }
    }
}

impl Default for UpdateSection {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000/ota".to_string(),
            settle_s: 5,
            install_path: None,
        }
    }
}

impl Default for TelemetrySection {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:3001/toExcel".to_string(),
            interval_ms: 1800,
        }
    }
}

impl Default for Pins {
    fn default() -> Self {
        Self {
            valve: 18,
            lamp_green: 14,
            lamp_red: 12,
            lamp_amber: 27,
            adc_address: 0x48,
            adc_channel: 0,
        }
    }
}

impl Timing {
    pub fn sample_period(&self) -> Duration {
        Duration::from_millis(self.sample_period_ms)
    }

    pub fn actuation_period(&self) -> Duration {
        Duration::from_millis(self.actuation_period_ms)
    }

    pub fn indicator_tick(&self) -> Duration {
        Duration::from_millis(self.indicator_tick_ms)
    }

    pub fn sync_period(&self) -> Duration {
        Duration::from_millis(self.sync_period_ms)
    }

    pub fn publish_interval(&self) -> Duration {
        Duration::from_secs(self.publish_interval_s)
    }

    pub fn broker_settle(&self) -> Duration {
        Duration::from_secs(self.broker_settle_s)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_s)
    }

    pub fn portal_timeout(&self) -> Duration {
        Duration::from_secs(self.portal_timeout_s)
    }
}

impl UpdateSection {
    pub fn settle(&self) -> Duration {
        Duration::from_secs(self.settle_s)
    }
}

impl TelemetrySection {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// BCM GPIO pins usable on the 40-pin header. GPIO 0-1 belong to the ID
/// EEPROM; 28+ are not broken out.
const VALID_GPIO_PINS: std::ops::RangeInclusive<u8> = 2..=27;

/// Largest single-ended ADS1115 reading.
const ADS1115_MAX: i64 = 32767;

/// Upper bound on blink rounds for a one-shot indicator.
const MAX_TRANSIENT_CYCLES: u32 = 1000;

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all sections. Returns `Ok(())` or an error listing every
    /// violation found.
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_thresholds(&mut errors);
        self.validate_sensors(&mut errors);
        self.validate_timing(&mut errors);
        self.validate_endpoints(&mut errors);
        self.validate_pins(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_thresholds(&self, errors: &mut Vec<String>) {
        let t = &self.thresholds;
        if t.moisture_percent > 100 {
            errors.push(format!(
                "thresholds.moisture_percent {} out of range [0, 100]",
                t.moisture_percent
            ));
        }
        if t.tank_empty_cm == 0 {
            errors.push("thresholds.tank_empty_cm must be positive".to_string());
        }
        if !t.heat_index.is_finite() {
            errors.push(format!("thresholds.heat_index {} is not finite", t.heat_index));
        }
    }

    fn validate_sensors(&self, errors: &mut Vec<String>) {
        let m = &self.moisture;
        for (name, raw) in [("raw_dry", m.raw_dry), ("raw_wet", m.raw_wet)] {
            if !(0..=ADS1115_MAX).contains(&raw) {
                errors.push(format!(
                    "moisture.{name} {raw} out of range [0, {ADS1115_MAX}]"
                ));
            }
        }
        if m.raw_dry == m.raw_wet {
            errors.push(format!(
                "moisture.raw_dry and raw_wet are both {}: calibration range is zero",
                m.raw_dry
            ));
        }
        if m.samples == 0 {
            errors.push("moisture.samples must be positive".to_string());
        }

        let d = &self.distance;
        if d.samples == 0 {
            errors.push("distance.samples must be positive".to_string());
        }
        if !(d.us_per_cm.is_finite() && d.us_per_cm > 0.0) {
            errors.push(format!(
                "distance.us_per_cm must be positive, got {}",
                d.us_per_cm
            ));
        }
    }

    fn validate_timing(&self, errors: &mut Vec<String>) {
        let t = &self.timing;
        let positive = [
            ("timing.sample_period_ms", t.sample_period_ms),
            ("timing.actuation_period_ms", t.actuation_period_ms),
            ("timing.indicator_tick_ms", t.indicator_tick_ms),
            ("timing.sync_period_ms", t.sync_period_ms),
            ("timing.publish_interval_s", t.publish_interval_s),
            ("timing.connect_timeout_s", t.connect_timeout_s),
            ("telemetry.interval_ms", self.telemetry.interval_ms),
        ];
        for (name, value) in positive {
            if value == 0 {
                errors.push(format!("{name} must be positive"));
            }
        }
        if t.transient_cycles == 0 {
            errors.push("timing.transient_cycles must be positive".to_string());
        } else if t.transient_cycles > MAX_TRANSIENT_CYCLES {
            errors.push(format!(
                "timing.transient_cycles must be at most {MAX_TRANSIENT_CYCLES}"
            ));
        }
    }

    fn validate_endpoints(&self, errors: &mut Vec<String>) {
        for (name, url) in [
            ("update.base_url", &self.update.base_url),
            ("telemetry.endpoint", &self.telemetry.endpoint),
        ] {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                errors.push(format!("{name} '{url}' is not an http(s) URL"));
            }
        }
        if let Some(addr) = &self.device.hardware_address {
            if normalize_hardware_address(addr).is_empty() {
                errors.push("device.hardware_address is empty".to_string());
            }
        } else if self.device.interface.trim().is_empty() {
            errors.push("device.interface is empty".to_string());
        }
    }

    fn validate_pins(&self, errors: &mut Vec<String>) {
        let p = &self.pins;
        let pins = [
            ("valve", p.valve),
            ("lamp_green", p.lamp_green),
            ("lamp_red", p.lamp_red),
            ("lamp_amber", p.lamp_amber),
        ];
        let mut seen: Vec<u8> = Vec::new();
        for (name, pin) in pins {
            if !VALID_GPIO_PINS.contains(&pin) {
                errors.push(format!(
                    "pins.{name} {pin} is not a valid BCM GPIO pin (allowed: 2-27)"
                ));
            } else if seen.contains(&pin) {
                errors.push(format!("pins.{name} {pin} is already used"));
            } else {
                seen.push(pin);
            }
        }
        if p.adc_channel > 3 {
            errors.push(format!(
                "pins.adc_channel {} out of range (0-3)",
                p.adc_channel
            ));
        }
    }
}

/// Strip separators from a MAC and upper-case it: `aa:bb:..` -> `AABB..`.
pub fn normalize_hardware_address(raw: &str) -> String {
    raw.trim()
        .chars()
        .filter(|c| !matches!(c, ':' | '-'))
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file. A missing file yields the
/// defaults.
pub fn load(path: &str) -> Result<Config> {
    let config: Config = if Path::new(path).exists() {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {path}"))?;
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?
    } else {
        tracing::warn!(path, "config file not found, using defaults");
        Config::default()
    };
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Assert validation fails and the error message contains `needle`.
    fn assert_validation_err(cfg: &Config, needle: &str) {
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(
            msg.contains(needle),
            "expected error containing {needle:?}, got: {msg}"
        );
    }

    // -- Parsing ----------------------------------------------------------

    #[test]
    fn parse_empty_config_uses_defaults() {
        let cfg: Config = toml::from_str("").unwrap();
        assert_eq!(cfg.thresholds.moisture_percent, 20);
        assert_eq!(cfg.thresholds.tank_empty_cm, 60);
        assert_eq!(cfg.thresholds.heat_index, 100.0);
        assert_eq!(cfg.moisture.raw_dry, 2432);
        assert_eq!(cfg.moisture.raw_wet, 1);
        assert_eq!(cfg.timing.publish_interval_s, 300);
        assert_eq!(cfg.telemetry.interval_ms, 1800);
        cfg.validate().unwrap();
    }

    #[test]
    fn parse_partial_section_keeps_other_defaults() {
        let toml_str = r#"
[thresholds]
heat_index = 41.0

[timing]
publish_interval_s = 60

[device]
hardware_address = "24:6F:28:AB:CD:EF"
"#;
        let cfg: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.thresholds.heat_index, 41.0);
        assert_eq!(cfg.thresholds.moisture_percent, 20);
        assert_eq!(cfg.timing.publish_interval_s, 60);
        assert_eq!(cfg.timing.sample_period_ms, 100);
        assert_eq!(
            cfg.device.hardware_address.as_deref(),
            Some("24:6F:28:AB:CD:EF")
        );
        cfg.validate().unwrap();
    }

    #[test]
    fn parse_unknown_type_fails() {
        let toml_str = r#"
[thresholds]
moisture_percent = "low"
"#;
        assert!(toml::from_str::<Config>(toml_str).is_err());
    }

    #[test]
    fn duration_helpers() {
        let t = Timing::default();
        assert_eq!(t.indicator_tick(), Duration::from_secs(1));
        assert_eq!(t.publish_interval(), Duration::from_secs(300));
        assert_eq!(t.broker_settle(), Duration::from_secs(3));
        assert_eq!(t.portal_timeout(), Duration::from_secs(300));
    }

    // -- Hardware address -------------------------------------------------

    #[test]
    fn normalize_strips_colons_and_uppercases() {
        assert_eq!(normalize_hardware_address("24:6f:28:ab:cd:ef\n"), "246F28ABCDEF");
        assert_eq!(normalize_hardware_address("24-6F-28-AB-CD-EF"), "246F28ABCDEF");
        assert_eq!(normalize_hardware_address("246F28ABCDEF"), "246F28ABCDEF");
    }

    // -- Validation -------------------------------------------------------

    #[test]
    fn moisture_threshold_above_100_rejected() {
        let mut cfg = Config::default();
        cfg.thresholds.moisture_percent = 101;
        assert_validation_err(&cfg, "moisture_percent 101 out of range");
    }

    #[test]
    fn heat_index_nan_rejected() {
        let mut cfg = Config::default();
        cfg.thresholds.heat_index = f32::NAN;
        assert_validation_err(&cfg, "heat_index NaN is not finite");
    }

    #[test]
    fn zero_calibration_range_rejected() {
        let mut cfg = Config::default();
        cfg.moisture.raw_dry = 1500;
        cfg.moisture.raw_wet = 1500;
        assert_validation_err(&cfg, "calibration range is zero");
    }

    #[test]
    fn raw_out_of_adc_range_rejected() {
        let mut cfg = Config::default();
        cfg.moisture.raw_wet = -1;
        assert_validation_err(&cfg, "moisture.raw_wet -1 out of range");
    }

    #[test]
    fn zero_samples_rejected() {
        let mut cfg = Config::default();
        cfg.moisture.samples = 0;
        cfg.distance.samples = 0;
        assert_validation_err(&cfg, "moisture.samples must be positive");
        assert_validation_err(&cfg, "distance.samples must be positive");
    }

    #[test]
    fn non_positive_speed_divisor_rejected() {
        let mut cfg = Config::default();
        cfg.distance.us_per_cm = 0.0;
        assert_validation_err(&cfg, "us_per_cm must be positive");
    }

    #[test]
    fn zero_period_rejected() {
        let mut cfg = Config::default();
        cfg.timing.actuation_period_ms = 0;
        assert_validation_err(&cfg, "timing.actuation_period_ms must be positive");
    }

    #[test]
    fn zero_transient_cycles_rejected() {
        let mut cfg = Config::default();
        cfg.timing.transient_cycles = 0;
        assert_validation_err(&cfg, "transient_cycles must be positive");
    }

    #[test]
    fn huge_transient_cycles_rejected() {
        let mut cfg = Config::default();
        cfg.timing.transient_cycles = u32::MAX;
        assert_validation_err(&cfg, "transient_cycles must be at most 1000");

        cfg.timing.transient_cycles = MAX_TRANSIENT_CYCLES;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn non_http_endpoint_rejected() {
        let mut cfg = Config::default();
        cfg.update.base_url = "ftp://example.com/ota".into();
        assert_validation_err(
            &cfg,
            "update.base_url 'ftp://example.com/ota' is not an http(s) URL",
        );
    }

    #[test]
    fn blank_hardware_address_rejected() {
        let mut cfg = Config::default();
        cfg.device.hardware_address = Some(" :: ".into());
        assert_validation_err(&cfg, "hardware_address is empty");
    }

    #[test]
    fn invalid_gpio_pin_rejected() {
        let mut cfg = Config::default();
        cfg.pins.valve = 1;
        assert_validation_err(&cfg, "pins.valve 1 is not a valid BCM GPIO pin");
    }

    #[test]
    fn duplicate_gpio_pin_rejected() {
        let mut cfg = Config::default();
        cfg.pins.lamp_red = cfg.pins.lamp_green;
        assert_validation_err(&cfg, "pins.lamp_red 14 is already used");
    }

    #[test]
    fn multiple_errors_collected() {
        let mut cfg = Config::default();
        cfg.thresholds.moisture_percent = 500;
        cfg.timing.sync_period_ms = 0;
        cfg.pins.adc_channel = 9;
        let msg = format!("{:#}", cfg.validate().unwrap_err());
        assert!(msg.contains("3 errors"), "got: {msg}");
        assert!(msg.contains("moisture_percent"), "got: {msg}");
        assert!(msg.contains("sync_period_ms"), "got: {msg}");
        assert!(msg.contains("adc_channel"), "got: {msg}");
    }

    #[test]
    fn load_missing_file_uses_defaults() {
        let cfg = load("/nonexistent/planter.toml").unwrap();
        assert_eq!(cfg.pins.valve, 18);
    }
}
