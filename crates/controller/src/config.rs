//! TOML config file loading and validation.
//!
//! The file is re-read on a timer while the controller runs; a file that
//! fails to parse or validate leaves the previous configuration active.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct Config {
    pub(crate) general: GeneralConfig,
    #[serde(default)]
    pub(crate) tank: Option<TankSection>,
    /// Zone name -> channel + schedule. BTreeMap so every tick walks zones
    /// in a stable order.
    #[serde(default)]
    pub(crate) zones: BTreeMap<String, ZoneEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct GeneralConfig {
    /// Device name, used in MQTT topics.
    pub(crate) name: String,
    pub(crate) main_power_channel: u8,
    pub(crate) water_input_channel: Option<u8>,
    pub(crate) sleep_time_seconds: u64,
    pub(crate) config_reload_timeout_minutes: i64,
    pub(crate) refill_timeout_minutes: i64,
    pub(crate) refill_amount_liters: Option<f64>,
    pub(crate) blocking_timeout_minutes: i64,
    #[serde(default = "default_namespace")]
    pub(crate) topic_namespace: String,
    pub(crate) rain_status_url: Option<String>,
    #[serde(default = "default_high_level_pin")]
    pub(crate) high_level_pin: u8,
    #[serde(default = "default_low_level_pin")]
    pub(crate) low_level_pin: u8,
}

/// Volumetric tank sensing. Presence of this section switches refill
/// triggering from the low-level switch to the volume threshold.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct TankSection {
    pub(crate) trigger_pin: u8,
    pub(crate) echo_pin: u8,
    /// Liters per centimeter of distance; negative because a fuller tank
    /// means a shorter echo.
    #[serde(default = "default_slope")]
    pub(crate) slope: f64,
    #[serde(default = "default_intercept")]
    pub(crate) intercept: f64,
    #[serde(default = "default_min_valid_cm")]
    pub(crate) min_valid_cm: f64,
    #[serde(default = "default_max_valid_cm")]
    pub(crate) max_valid_cm: f64,
    #[serde(default = "default_samples")]
    pub(crate) samples: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ZoneEntry {
    pub(crate) channel: u8,
    #[serde(default)]
    pub(crate) schedule: Vec<TimeWindow>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct TimeWindow {
    /// Three-letter day code, Mon..Sun.
    pub(crate) day: String,
    /// Local start time, "HH:MM".
    pub(crate) time: String,
    /// Minutes; 0 collapses the window to a single instant.
    pub(crate) duration: i64,
}

fn default_namespace() -> String {
    "watering".to_string()
}
fn default_high_level_pin() -> u8 {
    23
}
fn default_low_level_pin() -> u8 {
    24
}
fn default_slope() -> f64 {
    -11.11
}
fn default_intercept() -> f64 {
    1122.19
}
fn default_min_valid_cm() -> f64 {
    20.0
}
fn default_max_valid_cm() -> f64 {
    200.0
}
fn default_samples() -> usize {
    5
}

// ---------------------------------------------------------------------------
// GPIO whitelist
// ---------------------------------------------------------------------------

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM and must never be used.
/// GPIO 28+ are not exposed on the standard header.
const VALID_GPIO_PINS: &[u8] = &[
    2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27,
];

// ---------------------------------------------------------------------------
// Derived pin lists
// ---------------------------------------------------------------------------

impl Config {
    /// All relay output channels, main power first, then the water input,
    /// then the zones in name order.
    pub(crate) fn output_channels(&self) -> Vec<u8> {
        let mut channels = vec![self.general.main_power_channel];
        if let Some(ch) = self.general.water_input_channel {
            channels.push(ch);
        }
        channels.extend(self.zones.values().map(|z| z.channel));
        channels
    }

    pub(crate) fn input_pins(&self) -> Vec<u8> {
        vec![self.general.high_level_pin, self.general.low_level_pin]
    }

    pub(crate) fn zone_channels(&self) -> Vec<(String, u8)> {
        self.zones
            .iter()
            .map(|(name, z)| (name.clone(), z.channel))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate the whole document. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub(crate) fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_general(&mut errors);
        self.validate_tank(&mut errors);
        self.validate_zones(&mut errors);
        self.validate_pin_assignments(&mut errors);

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

    fn validate_general(&self, errors: &mut Vec<String>) {
        let g = &self.general;

        if g.name.trim().is_empty() {
            errors.push("general: name is empty".to_string());
        }
        if g.topic_namespace.trim().is_empty() {
            errors.push("general: topic_namespace is empty".to_string());
        }
        if g.sleep_time_seconds == 0 {
            errors.push("general: sleep_time_seconds must be at least 1".to_string());
        }
        if g.config_reload_timeout_minutes <= 0 {
            errors.push(format!(
                "general: config_reload_timeout_minutes must be positive, got {}",
                g.config_reload_timeout_minutes
            ));
        }
        if g.refill_timeout_minutes <= 0 {
            errors.push(format!(
                "general: refill_timeout_minutes must be positive, got {}",
                g.refill_timeout_minutes
            ));
        }
        if g.blocking_timeout_minutes <= 0 {
            errors.push(format!(
                "general: blocking_timeout_minutes must be positive, got {}",
                g.blocking_timeout_minutes
            ));
        }
        if let Some(amount) = g.refill_amount_liters {
            if amount <= 0.0 {
                errors.push(format!(
                    "general: refill_amount_liters must be positive, got {amount}"
                ));
            }
        } else if self.tank.is_some() && g.water_input_channel.is_some() {
            errors.push(
                "general: refill_amount_liters is required when a tank sensor and a \
                 water input channel are both configured"
                    .to_string(),
            );
        }
    }

    fn validate_tank(&self, errors: &mut Vec<String>) {
        let Some(tank) = &self.tank else { return };

        if tank.min_valid_cm >= tank.max_valid_cm {
            errors.push(format!(
                "tank: valid band is empty (min_valid_cm {} >= max_valid_cm {})",
                tank.min_valid_cm, tank.max_valid_cm
            ));
        }
        if tank.samples == 0 {
            errors.push("tank: samples must be at least 1".to_string());
        }
    }

    fn validate_zones(&self, errors: &mut Vec<String>) {
        for (name, zone) in &self.zones {
            if name.trim().is_empty() {
                errors.push("zones: zone name is empty".to_string());
            }
            for (i, window) in zone.schedule.iter().enumerate() {
                if let Err(e) = crate::schedule::parse_day(&window.day) {
                    errors.push(format!("zone '{name}' schedule[{i}]: {e}"));
                }
                if let Err(e) = crate::schedule::parse_start_time(&window.time) {
                    errors.push(format!("zone '{name}' schedule[{i}]: {e}"));
                }
                if window.duration < 0 {
                    errors.push(format!(
                        "zone '{name}' schedule[{i}]: duration must not be negative, got {}",
                        window.duration
                    ));
                }
            }
        }
    }

    fn validate_pin_assignments(&self, errors: &mut Vec<String>) {
        let mut named_pins: Vec<(String, u8)> = vec![(
            "general.main_power_channel".to_string(),
            self.general.main_power_channel,
        )];
        if let Some(ch) = self.general.water_input_channel {
            named_pins.push(("general.water_input_channel".to_string(), ch));
        }
        named_pins.push((
            "general.high_level_pin".to_string(),
            self.general.high_level_pin,
        ));
        named_pins.push((
            "general.low_level_pin".to_string(),
            self.general.low_level_pin,
        ));
        if let Some(tank) = &self.tank {
            named_pins.push(("tank.trigger_pin".to_string(), tank.trigger_pin));
            named_pins.push(("tank.echo_pin".to_string(), tank.echo_pin));
        }
        for (name, zone) in &self.zones {
            named_pins.push((format!("zone '{name}' channel"), zone.channel));
        }

        let mut seen: HashSet<u8> = HashSet::new();
        for (what, pin) in &named_pins {
            if !VALID_GPIO_PINS.contains(pin) {
                errors.push(format!(
                    "{what}: {pin} is not a valid BCM GPIO pin (allowed: 2-27)"
                ));
            } else if !seen.insert(*pin) {
                errors.push(format!("{what}: pin {pin} is already assigned"));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub(crate) fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
