//! Tank volume estimation from ultrasonic distance samples.
//!
//! Raw distance readings are noisy (surface ripple, acoustic reflections), so
//! a sample is a burst: keep pulling readings, discard anything outside the
//! calibrated valid band, average the first `samples` good ones. Volume
//! follows the calibrated linear distance relation; flow is the delta against
//! the previous sample.

use anyhow::Result;
use chrono::{DateTime, Local};
use tracing::debug;

use crate::config::TankSection;
use crate::error::SensorError;
use crate::gpio::DistanceSensor;

/// A dead or disconnected sensor must error out instead of resampling
/// forever.
const MAX_ATTEMPTS_PER_SAMPLE: usize = 8;

#[derive(Debug, Clone, Copy)]
struct TankReading {
    volume_l: i64,
    flow_lpm: i64,
    at: DateTime<Local>,
}

/// Sole owner of the tank state; no other component touches the previous
/// volume/timestamp pair.
#[derive(Default)]
pub(crate) struct TankLevelFilter {
    last: Option<TankReading>,
}

impl TankLevelFilter {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Take one filtered measurement: `(volume_liters, flow_liters_per_min)`.
    pub(crate) fn sample(
        &mut self,
        cal: &TankSection,
        sensor: &mut dyn DistanceSensor,
        now: DateTime<Local>,
    ) -> Result<(i64, i64)> {
        let mut sum = 0.0;
        let mut valid = 0;
        let mut attempts = 0;

        while valid < cal.samples {
            if attempts >= cal.samples * MAX_ATTEMPTS_PER_SAMPLE {
                return Err(SensorError::Unstable {
                    valid,
                    wanted: cal.samples,
                    attempts,
                }
                .into());
            }
            attempts += 1;

            let distance = sensor.read_distance_cm()?;
            if distance > cal.min_valid_cm && distance < cal.max_valid_cm {
                sum += distance;
                valid += 1;
            } else {
                debug!(
                    distance,
                    min = cal.min_valid_cm,
                    max = cal.max_valid_cm,
                    "distance sample outside valid band — discarded"
                );
            }
        }

        let avg = sum / cal.samples as f64;
        let volume_l = (cal.slope * avg + cal.intercept).round() as i64;

        let flow_lpm = match self.last {
            Some(prev) => {
                let dt_sec = (now - prev.at).num_seconds();
                if dt_sec > 0 {
                    ((volume_l - prev.volume_l) as f64 / dt_sec as f64 * 60.0).round() as i64
                } else {
                    0
                }
            }
            None => 0,
        };

        self.last = Some(TankReading {
            volume_l,
            flow_lpm,
            at: now,
        });
        Ok((volume_l, flow_lpm))
    }

    /// Most recent `(volume, flow)` without touching the sensor. Used by the
    /// command path's snapshot, which must never block on a measurement burst.
    pub(crate) fn last(&self) -> Option<(i64, i64)> {
        self.last.map(|r| (r.volume_l, r.flow_lpm))
    }
}

// ===========================================================================
// Tests
// ===========================================================================
