//! Raw pin access. The `gpio` feature gates the real rppal driver; without
//! it, a mock implementation keeps levels in memory for development and tests.
//!
//! Everything here speaks *physical* levels (`true` = high). The relay board
//! is active-low, so the logical ON/OFF translation lives one layer up in
//! [`crate::actuator`] — nothing below that boundary knows about inversion.

use anyhow::Result;
use std::collections::HashMap;

#[cfg(feature = "gpio")]
use anyhow::bail;
#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, InputPin, OutputPin};
#[cfg(feature = "gpio")]
use std::time::{Duration, Instant};

// ---------------------------------------------------------------------------
// Real pin bank (production — requires rppal + Raspberry Pi hardware)
// ---------------------------------------------------------------------------

#[cfg(feature = "gpio")]
pub(crate) struct PinBank {
    outputs: HashMap<u8, OutputPin>,
    inputs: HashMap<u8, InputPin>,
}

#[cfg(feature = "gpio")]
impl PinBank {
    /// Claim output channels (initialised high, i.e. relay OFF) and input
    /// pins (pull-up; level switches short to ground when submerged).
    pub(crate) fn new(output_channels: &[u8], input_pins: &[u8]) -> Result<Self> {
        let gpio = Gpio::new()?;
        let mut outputs = HashMap::new();
        for &ch in output_channels {
            outputs.insert(ch, gpio.get(ch)?.into_output_high());
        }
        let mut inputs = HashMap::new();
        for &pin in input_pins {
            inputs.insert(pin, gpio.get(pin)?.into_input_pullup());
        }
        Ok(Self { outputs, inputs })
    }

    pub(crate) fn write_level(&mut self, channel: u8, level: bool) {
        match self.outputs.get_mut(&channel) {
            Some(pin) if level => pin.set_high(),
            Some(pin) => pin.set_low(),
            None => tracing::warn!(channel, "write to unclaimed channel ignored"),
        }
    }

    /// Read an output channel's driven level back. The pin itself is the
    /// single source of truth for actuator state.
    pub(crate) fn read_level(&self, channel: u8) -> bool {
        match self.outputs.get(&channel) {
            Some(pin) => pin.is_set_high(),
            None => {
                tracing::warn!(channel, "read of unclaimed channel — reporting high");
                true // high = de-energised, the safe reading
            }
        }
    }

    pub(crate) fn read_input_level(&self, pin: u8) -> bool {
        match self.inputs.get(&pin) {
            Some(p) => p.is_high(),
            None => {
                tracing::warn!(pin, "read of unclaimed input — reporting high");
                true
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Mock pin bank (development — no hardware)
// ---------------------------------------------------------------------------

#[cfg(not(feature = "gpio"))]
pub(crate) struct PinBank {
    pub(crate) outputs: HashMap<u8, bool>,
    pub(crate) inputs: HashMap<u8, bool>,
    /// Number of output writes performed, for idempotence checks.
    pub(crate) writes: usize,
}

#[cfg(not(feature = "gpio"))]
impl PinBank {
    pub(crate) fn new(output_channels: &[u8], input_pins: &[u8]) -> Result<Self> {
        let outputs = output_channels.iter().map(|&ch| (ch, true)).collect();
        let inputs = input_pins.iter().map(|&pin| (pin, true)).collect();
        tracing::info!(
            outputs = output_channels.len(),
            inputs = input_pins.len(),
            "[mock-gpio] pin bank initialised (no hardware)"
        );
        Ok(Self {
            outputs,
            inputs,
            writes: 0,
        })
    }

    pub(crate) fn write_level(&mut self, channel: u8, level: bool) {
        match self.outputs.get_mut(&channel) {
            Some(state) => {
                *state = level;
                self.writes += 1;
            }
            None => tracing::warn!(channel, "[mock-gpio] write to unclaimed channel ignored"),
        }
    }

    pub(crate) fn read_level(&self, channel: u8) -> bool {
        *self.outputs.get(&channel).unwrap_or(&true)
    }

    pub(crate) fn read_input_level(&self, pin: u8) -> bool {
        *self.inputs.get(&pin).unwrap_or(&true)
    }

    /// Force an input pin level (simulates a level switch in tests).
    pub(crate) fn set_input_level(&mut self, pin: u8, level: bool) {
        self.inputs.insert(pin, level);
    }
}

// ---------------------------------------------------------------------------
// Ultrasonic distance ranging (AJ-SR04M)
// ---------------------------------------------------------------------------

/// One raw distance sample from the tank-level sensor, in centimeters.
/// Outlier rejection and averaging live in [`crate::tank`].
pub(crate) trait DistanceSensor {
    fn read_distance_cm(&mut self) -> Result<f64>;
}

/// Speed-of-sound conversion: echo pulse seconds to one-way centimeters.
#[cfg(feature = "gpio")]
const CM_PER_PULSE_SEC: f64 = 17150.0;

#[cfg(feature = "gpio")]
const ECHO_TIMEOUT: Duration = Duration::from_secs(1);

#[cfg(feature = "gpio")]
pub(crate) struct AjSr04m {
    trigger: OutputPin,
    echo: InputPin,
}

#[cfg(feature = "gpio")]
impl AjSr04m {
    pub(crate) fn new(trigger_pin: u8, echo_pin: u8) -> Result<Self> {
        let gpio = Gpio::new()?;
        Ok(Self {
            trigger: gpio.get(trigger_pin)?.into_output_low(),
            echo: gpio.get(echo_pin)?.into_input(),
        })
    }
}

#[cfg(feature = "gpio")]
impl DistanceSensor for AjSr04m {
    fn read_distance_cm(&mut self) -> Result<f64> {
        // 10 µs trigger pulse starts a measurement cycle.
        self.trigger.set_high();
        std::thread::sleep(Duration::from_micros(10));
        self.trigger.set_low();

        let deadline = Instant::now() + ECHO_TIMEOUT;
        while self.echo.is_low() {
            if Instant::now() > deadline {
                bail!("ultrasonic sensor: echo never went high");
            }
        }
        let pulse_start = Instant::now();
        while self.echo.is_high() {
            if Instant::now() > deadline {
                bail!("ultrasonic sensor: echo stuck high");
            }
        }
        let pulse = pulse_start.elapsed();

        Ok(pulse.as_secs_f64() * CM_PER_PULSE_SEC)
    }
}

/// Scripted sensor for development and tests: yields queued samples, then a
/// fixed fallback forever.
#[cfg(not(feature = "gpio"))]
pub(crate) struct MockDistanceSensor {
    script: std::collections::VecDeque<f64>,
    fallback: f64,
}

#[cfg(not(feature = "gpio"))]
impl MockDistanceSensor {
    pub(crate) fn new(fallback: f64) -> Self {
        Self {
            script: std::collections::VecDeque::new(),
            fallback,
        }
    }

    pub(crate) fn with_script(samples: &[f64], fallback: f64) -> Self {
        Self {
            script: samples.iter().copied().collect(),
            fallback,
        }
    }
}

#[cfg(not(feature = "gpio"))]
impl DistanceSensor for MockDistanceSensor {
    fn read_distance_cm(&mut self) -> Result<f64> {
        Ok(self.script.pop_front().unwrap_or(self.fallback))
    }
}

// ===========================================================================
// Tests
// ===========================================================================
