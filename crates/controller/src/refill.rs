//! Refill state machine for the water-input valve.
//!
//! Two stop conditions: the high-level switch (normal) and a wall-clock
//! timeout (fail-safe). The timeout bounds worst-case water loss when a level
//! switch sticks or its wiring fails, so it fires regardless of sensor state.

use chrono::{DateTime, Duration, Local};
use tracing::{info, warn};

/// Sensor inputs for one refill evaluation. `volume_l` is present only when
/// a volumetric tank sensor is configured and produced a reading this tick.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RefillInputs {
    pub(crate) low_level: bool,
    pub(crate) high_level: bool,
    pub(crate) volume_l: Option<i64>,
}

/// Idle when `started` is None, refilling otherwise. The timestamp is the
/// start of the current refill cycle.
#[derive(Default)]
pub(crate) struct RefillController {
    started: Option<DateTime<Local>>,
}

impl RefillController {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn is_refilling(&self) -> bool {
        self.started.is_some()
    }

    /// Advance the state machine one tick; returns the desired logical state
    /// of the water-input valve.
    ///
    /// Trigger: `volume < refill_amount_l` when volumetric data is available,
    /// the low-level switch otherwise. Either way the high-level switch wins:
    /// while it reads true the valve is off and the timer clear.
    pub(crate) fn tick(
        &mut self,
        inputs: &RefillInputs,
        refill_amount_l: Option<f64>,
        timeout_minutes: i64,
        now: DateTime<Local>,
    ) -> bool {
        if inputs.high_level {
            if self.started.is_some() {
                info!("tank full — stopping refill");
                self.started = None;
            }
            return false;
        }

        match self.started {
            Some(started) => {
                if now - started > Duration::minutes(timeout_minutes) {
                    warn!(
                        timeout_minutes,
                        "refill timeout — closing input valve without high-level signal"
                    );
                    self.started = None;
                    false
                } else {
                    true
                }
            }
            None => {
                let needs_refill = match (refill_amount_l, inputs.volume_l) {
                    (Some(amount), Some(volume)) => (volume as f64) < amount,
                    _ => !inputs.low_level,
                };
                if needs_refill {
                    info!("starting refill");
                    self.started = Some(now);
                    true
                } else {
                    false
                }
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
