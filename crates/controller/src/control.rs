//! The control loop: reconciles schedules, tank level, refill, manual
//! overrides and rain suppression into actuator commands once per tick, and
//! applies remote commands as they arrive.
//!
//! All shared state lives in [`Controller`], a plain synchronous struct
//! behind one `Arc<Mutex<_>>`. The tick task and the MQTT command path both
//! go through that lock; no hardware access happens outside it. Rain polling
//! is HTTP and runs before the lock is taken.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use chrono::{DateTime, Local};
use rumqttc::{AsyncClient, QoS};
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::actuator::ActuatorState;
use crate::config::{self, Config};
use crate::gpio::DistanceSensor;
use crate::mqtt::{self, StatusSnapshot};
use crate::overrides::{OverrideManager, ZoneCommand};
use crate::rain::RainOracle;
use crate::refill::{RefillController, RefillInputs};
use crate::schedule;
use crate::tank::TankLevelFilter;

/// Pause between applying a remote command and reading state back for its
/// out-of-band snapshot, so relay and sensor levels settle first.
const COMMAND_SETTLE: Duration = Duration::from_secs(1);

pub(crate) type SharedController = Arc<Mutex<Controller>>;

// ---------------------------------------------------------------------------
// Controller (synchronous core)
// ---------------------------------------------------------------------------

pub(crate) struct Controller {
    config: Config,
    actuators: ActuatorState,
    overrides: OverrideManager,
    refill: RefillController,
    tank: TankLevelFilter,
    distance: Option<Box<dyn DistanceSensor + Send>>,
    last_rain: bool,
}

impl Controller {
    pub(crate) fn new(
        config: Config,
        actuators: ActuatorState,
        distance: Option<Box<dyn DistanceSensor + Send>>,
    ) -> Self {
        Self {
            config,
            actuators,
            overrides: OverrideManager::new(),
            refill: RefillController::new(),
            tank: TankLevelFilter::new(),
            distance,
            last_rain: false,
        }
    }

    pub(crate) fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn actuators_mut(&mut self) -> &mut ActuatorState {
        &mut self.actuators
    }

    /// One pass of the periodic loop. `raining` comes from the oracle poll
    /// that happened just before the lock was taken.
    pub(crate) fn tick(&mut self, now: DateTime<Local>, raining: bool) -> StatusSnapshot {
        self.last_rain = raining;

        let low = self
            .actuators
            .read_input_active(self.config.general.low_level_pin);
        let high = self
            .actuators
            .read_input_active(self.config.general.high_level_pin);

        let volume = match (&self.config.tank, &mut self.distance) {
            (Some(cal), Some(sensor)) => match self.tank.sample(cal, sensor.as_mut(), now) {
                Ok((volume, flow)) => {
                    info!(volume, flow, "tank sampled");
                    Some(volume)
                }
                Err(e) => {
                    warn!("tank sampling failed: {e:#} — falling back to level switches");
                    None
                }
            },
            _ => None,
        };

        if let Some(input_channel) = self.config.general.water_input_channel {
            let inputs = RefillInputs {
                low_level: low,
                high_level: high,
                volume_l: volume,
            };
            let desired = self.refill.tick(
                &inputs,
                self.config.general.refill_amount_liters,
                self.config.general.refill_timeout_minutes,
                now,
            );
            self.actuators.set_logical(input_channel, desired);
        }

        let blocking_timeout = self.config.general.blocking_timeout_minutes;
        for (name, zone) in &self.config.zones {
            if self.overrides.is_blocked(name, blocking_timeout, now) {
                continue;
            }
            match schedule::needs_water(zone, now) {
                Ok(needs) => {
                    self.actuators.set_logical(zone.channel, needs && !raining);
                }
                Err(e) => {
                    warn!(zone = %name, "schedule evaluation failed: {e} — zone skipped");
                }
            }
        }

        self.snapshot()
    }

    /// Apply a remote command. Returns `false` for a zone this configuration
    /// does not know.
    pub(crate) fn apply_command(
        &mut self,
        zone: &str,
        command: ZoneCommand,
        now: DateTime<Local>,
    ) -> bool {
        let Some(entry) = self.config.zones.get(zone) else {
            return false;
        };
        self.actuators
            .set_logical(entry.channel, command == ZoneCommand::On);
        self.overrides.apply_command(zone, command, now);
        true
    }

    /// Current state of everything, without touching the tank sensor: the
    /// command path calls this and must never block on a measurement burst.
    pub(crate) fn snapshot(&self) -> StatusSnapshot {
        let g = &self.config.general;
        let (storage_l, flow_lpm) = match (&self.config.tank, self.tank.last()) {
            (Some(_), Some((volume, flow))) => (Some(volume), Some(flow)),
            _ => (None, None),
        };
        StatusSnapshot {
            rain: self.last_rain,
            low_water: self.actuators.read_input_active(g.low_level_pin),
            high_water: self.actuators.read_input_active(g.high_level_pin),
            storage_l,
            flow_lpm,
            input_water_on: g
                .water_input_channel
                .map(|ch| self.actuators.get_logical(ch)),
            zones: self
                .config
                .zones
                .iter()
                .map(|(name, zone)| (name.clone(), self.actuators.get_logical(zone.channel)))
                .collect(),
        }
    }

    /// Swap in a reloaded configuration. Pin assignments are claimed once at
    /// startup and cannot be re-negotiated at runtime, so a reload that moves
    /// any pin is rejected and the previous configuration stays active.
    pub(crate) fn reload(&mut self, new: Config) -> Result<()> {
        let current: HashSet<u8> = self.actuators.channels().iter().copied().collect();
        let incoming: HashSet<u8> = new.output_channels().into_iter().collect();
        if current != incoming {
            bail!("output channel assignments changed — restart to reclaim GPIO pins");
        }
        if self.config.input_pins() != new.input_pins() {
            bail!("level switch pin assignments changed — restart to reclaim GPIO pins");
        }
        let tank_pins =
            |c: &Config| c.tank.as_ref().map(|t| (t.trigger_pin, t.echo_pin));
        if tank_pins(&self.config) != tank_pins(&new) {
            bail!("tank sensor pin assignments changed — restart to reclaim GPIO pins");
        }
        if self.config.general.name != new.general.name
            || self.config.general.topic_namespace != new.general.topic_namespace
        {
            bail!("device name or topic namespace changed — restart to re-subscribe");
        }
        self.config = new;
        info!("configuration reloaded");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Async shell
// ---------------------------------------------------------------------------

/// Run the periodic tick loop forever. Intended to be `tokio::spawn`-ed from
/// main; config reload cadence and sleep time follow the live configuration.
pub(crate) async fn run_tick_loop(
    shared: SharedController,
    mqtt: AsyncClient,
    rain: RainOracle,
    config_path: String,
) {
    let mut last_reload = Local::now();

    loop {
        let now = Local::now();

        let (reload_after_min, sleep_secs) = {
            let c = shared.lock().await;
            let g = &c.config().general;
            (g.config_reload_timeout_minutes, g.sleep_time_seconds)
        };

        if now - last_reload > chrono::Duration::minutes(reload_after_min) {
            match config::load(&config_path) {
                Ok(new_config) => {
                    let mut c = shared.lock().await;
                    if let Err(e) = c.reload(new_config) {
                        error!("config reload rejected: {e:#} — keeping previous config");
                    }
                }
                Err(e) => {
                    error!("config reload failed: {e:#} — keeping previous config");
                }
            }
            last_reload = now;
        }

        // Rain polling is slow HTTP; keep it outside the state lock.
        let raining = rain.is_raining().await;

        let (topic, payload) = {
            let mut c = shared.lock().await;
            let snapshot = c.tick(Local::now(), raining);
            let g = &c.config().general;
            (
                mqtt::state_topic(&g.topic_namespace, &g.name),
                snapshot.to_payload(),
            )
        };

        if let Err(e) = mqtt.publish(&topic, QoS::AtLeastOnce, false, payload).await {
            warn!("status publish failed: {e} — snapshot dropped");
        }

        sleep(Duration::from_secs(sleep_secs)).await;
    }
}

/// Apply one inbound remote command, then publish an out-of-band snapshot
/// from a detached task. A slow or blocked publish must never stall the next
/// command or the next tick, so the publish is fire-and-forget.
pub(crate) async fn handle_command(
    shared: &SharedController,
    mqtt: &AsyncClient,
    zone: &str,
    command: ZoneCommand,
) {
    {
        let mut c = shared.lock().await;
        if !c.apply_command(zone, command, Local::now()) {
            warn!(zone, "command for unknown zone ignored");
            return;
        }
        info!(zone, ?command, "remote command applied");
    }

    let shared = Arc::clone(shared);
    let mqtt = mqtt.clone();
    tokio::spawn(async move {
        sleep(COMMAND_SETTLE).await;
        let (topic, payload) = {
            let c = shared.lock().await;
            let g = &c.config().general;
            (
                mqtt::state_topic(&g.topic_namespace, &g.name),
                c.snapshot().to_payload(),
            )
        };
        if let Err(e) = mqtt.publish(&topic, QoS::AtLeastOnce, false, payload).await {
            warn!("snapshot publish failed: {e} — snapshot dropped");
        }
    });
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(all(test, not(feature = "gpio")))]
mod tests {
    use super::*;
    use crate::gpio::{MockDistanceSensor, PinBank};
    use chrono::TimeZone;

    /// Two zones, no water input: zone1 waters Wed 06:00-06:30.
    const ZONES_ONLY: &str = r#"
[general]
name = "garden"
main_power_channel = 9
sleep_time_seconds = 60
config_reload_timeout_minutes = 10
refill_timeout_minutes = 45
blocking_timeout_minutes = 120

[zones.zone1]
channel = 3
schedule = [{ day = "Wed", time = "06:00", duration = 30 }]

[zones.zone2]
channel = 4
"#;

    /// Water input on channel 2, level-switch refill only.
    const WITH_REFILL: &str = r#"
[general]
name = "garden"
main_power_channel = 9
water_input_channel = 2
sleep_time_seconds = 60
config_reload_timeout_minutes = 10
refill_timeout_minutes = 45
blocking_timeout_minutes = 120

[zones.zone1]
channel = 3
schedule = [{ day = "Wed", time = "06:00", duration = 30 }]
"#;

    /// Volumetric variant: tank sensor plus refill threshold.
    const VOLUMETRIC: &str = r#"
[general]
name = "garden"
main_power_channel = 9
water_input_channel = 2
sleep_time_seconds = 60
config_reload_timeout_minutes = 10
refill_timeout_minutes = 45
refill_amount_liters = 400.0
blocking_timeout_minutes = 120

[tank]
trigger_pin = 17
echo_pin = 27

[zones.zone1]
channel = 3
schedule = [{ day = "Wed", time = "06:00", duration = 30 }]
"#;

    fn controller(toml: &str, distance: Option<Box<dyn DistanceSensor + Send>>) -> Controller {
        let cfg: Config = toml::from_str(toml).unwrap();
        cfg.validate().unwrap();
        let outputs = cfg.output_channels();
        let bank = PinBank::new(&outputs, &cfg.input_pins()).unwrap();
        let actuators = ActuatorState::new(bank, outputs, cfg.general.main_power_channel);
        Controller::new(cfg, actuators, distance)
    }

    /// 2024-01-03 was a Wednesday.
    fn wednesday(h: u32, m: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 1, 3, h, m, 0).unwrap()
    }

    // -- Schedule-driven actuation ---------------------------------------

    #[test]
    fn open_window_turns_zone_on() {
        let mut c = controller(ZONES_ONLY, None);
        c.tick(wednesday(6, 15), false);

        assert!(c.actuators.get_logical(3));
        assert!(!c.actuators.get_logical(4), "zone2 has no schedule");
        assert!(c.actuators.get_logical(9), "main power follows");
    }

    #[test]
    fn closed_window_turns_zone_off() {
        let mut c = controller(ZONES_ONLY, None);
        c.tick(wednesday(6, 15), false);
        c.tick(wednesday(6, 31), false);

        assert!(!c.actuators.get_logical(3));
        assert!(!c.actuators.get_logical(9));
    }

    #[test]
    fn rain_suppresses_schedule() {
        let mut c = controller(ZONES_ONLY, None);
        c.tick(wednesday(6, 15), true);
        assert!(!c.actuators.get_logical(3));
    }

    #[test]
    fn rain_shuts_off_an_already_watering_zone() {
        let mut c = controller(ZONES_ONLY, None);
        c.tick(wednesday(6, 10), false);
        assert!(c.actuators.get_logical(3));

        c.tick(wednesday(6, 15), true);
        assert!(!c.actuators.get_logical(3));
    }

    #[test]
    fn main_power_equals_or_of_outputs_after_every_tick() {
        let mut c = controller(ZONES_ONLY, None);
        for (now, rain) in [
            (wednesday(6, 15), false),
            (wednesday(6, 20), true),
            (wednesday(6, 25), false),
            (wednesday(7, 0), false),
        ] {
            c.tick(now, rain);
            let expected = c.actuators.get_logical(3) || c.actuators.get_logical(4);
            assert_eq!(c.actuators.get_logical(9), expected);
        }
    }

    #[test]
    fn broken_schedule_skips_zone_but_not_the_tick() {
        let mut c = controller(ZONES_ONLY, None);
        c.config
            .zones
            .get_mut("zone2")
            .unwrap()
            .schedule
            .push(crate::config::TimeWindow {
                day: "Caturday".into(),
                time: "06:00".into(),
                duration: 30,
            });

        c.tick(wednesday(6, 15), false);
        assert!(!c.actuators.get_logical(4), "broken zone left alone");
        assert!(c.actuators.get_logical(3), "healthy zone still evaluated");
    }

    // -- Manual overrides -------------------------------------------------

    #[test]
    fn override_holds_zone_against_schedule() {
        let mut c = controller(ZONES_ONLY, None);
        c.apply_command("zone1", ZoneCommand::On, wednesday(12, 0));
        assert!(c.actuators.get_logical(3));

        // Window closed, but the override keeps the schedule away.
        c.tick(wednesday(12, 5), false);
        assert!(c.actuators.get_logical(3));
    }

    #[test]
    fn expired_override_returns_zone_to_schedule() {
        let mut c = controller(ZONES_ONLY, None);
        c.apply_command("zone1", ZoneCommand::On, wednesday(9, 0));

        // 120 min blocking timeout: expired by 11:01, window closed — off.
        c.tick(wednesday(11, 1), false);
        assert!(!c.actuators.get_logical(3));
        assert!(!c.overrides.contains("zone1"));
    }

    #[test]
    fn on_then_off_round_trip_clears_everything() {
        let mut c = controller(ZONES_ONLY, None);
        assert!(c.apply_command("zone1", ZoneCommand::On, wednesday(12, 0)));
        assert!(c.apply_command("zone1", ZoneCommand::Off, wednesday(12, 1)));

        assert!(!c.actuators.get_logical(3));
        assert!(!c.overrides.contains("zone1"));
    }

    #[test]
    fn unknown_zone_command_is_rejected() {
        let mut c = controller(ZONES_ONLY, None);
        assert!(!c.apply_command("zone9", ZoneCommand::On, wednesday(12, 0)));
    }

    #[test]
    fn override_survives_rain_suppression() {
        let mut c = controller(ZONES_ONLY, None);
        c.apply_command("zone1", ZoneCommand::On, wednesday(6, 10));
        c.tick(wednesday(6, 15), true);
        assert!(
            c.actuators.get_logical(3),
            "rain suppresses schedule-driven actuation only"
        );
    }

    // -- Refill ------------------------------------------------------------

    #[test]
    fn empty_tank_starts_refill() {
        let mut c = controller(WITH_REFILL, None);
        // Level switch pins idle high = no water detected anywhere.
        c.tick(wednesday(12, 0), false);

        assert!(c.actuators.get_logical(2), "input valve open");
        assert!(c.actuators.get_logical(9), "main power follows input valve");
        assert!(c.refill.is_refilling());
    }

    #[test]
    fn high_level_stops_refill() {
        let mut c = controller(WITH_REFILL, None);
        c.tick(wednesday(12, 0), false);
        assert!(c.actuators.get_logical(2));

        // Submerge both switches: tank full.
        c.actuators.bank_mut().set_input_level(23, false);
        c.actuators.bank_mut().set_input_level(24, false);
        c.tick(wednesday(12, 1), false);

        assert!(!c.actuators.get_logical(2));
        assert!(!c.refill.is_refilling());
    }

    #[test]
    fn refill_times_out_on_stuck_sensors() {
        let mut c = controller(WITH_REFILL, None);
        c.tick(wednesday(12, 0), false);
        assert!(c.actuators.get_logical(2));

        // 46 minutes later the switches still read empty; timeout is 45.
        c.tick(wednesday(12, 46), false);
        assert!(!c.actuators.get_logical(2), "fail-safe closed the valve");
        assert!(!c.refill.is_refilling());
    }

    #[test]
    fn covered_low_switch_means_no_refill() {
        let mut c = controller(WITH_REFILL, None);
        c.actuators.bank_mut().set_input_level(24, false); // low switch submerged
        c.tick(wednesday(12, 0), false);
        assert!(!c.actuators.get_logical(2));
    }

    #[test]
    fn volumetric_refill_triggers_below_threshold() {
        // 70 cm -> 344 l, below the 400 l threshold.
        let sensor = MockDistanceSensor::new(70.0);
        let mut c = controller(VOLUMETRIC, Some(Box::new(sensor)));
        c.tick(wednesday(12, 0), false);
        assert!(c.actuators.get_logical(2));
    }

    #[test]
    fn volumetric_refill_skipped_above_threshold() {
        // 55 cm -> 511 l, above the 400 l threshold.
        let sensor = MockDistanceSensor::new(55.0);
        let mut c = controller(VOLUMETRIC, Some(Box::new(sensor)));
        c.tick(wednesday(12, 0), false);
        assert!(!c.actuators.get_logical(2));
    }

    // -- Snapshot ----------------------------------------------------------

    #[test]
    fn snapshot_reflects_zone_and_sensor_state() {
        let mut c = controller(ZONES_ONLY, None);
        let snapshot = c.tick(wednesday(6, 15), false);

        assert!(!snapshot.rain);
        assert_eq!(
            snapshot.zones,
            vec![("zone1".to_string(), true), ("zone2".to_string(), false)]
        );
        assert!(snapshot.storage_l.is_none(), "no tank sensor configured");
        assert!(snapshot.input_water_on.is_none(), "no water input configured");
    }

    #[test]
    fn snapshot_remembers_last_rain_state() {
        let mut c = controller(ZONES_ONLY, None);
        c.tick(wednesday(6, 15), true);
        assert!(c.snapshot().rain);
    }

    #[test]
    fn volumetric_snapshot_carries_storage_and_flow() {
        let sensor = MockDistanceSensor::new(60.0); // 456 l
        let mut c = controller(VOLUMETRIC, Some(Box::new(sensor)));
        let snapshot = c.tick(wednesday(12, 0), false);

        assert_eq!(snapshot.storage_l, Some(456));
        assert_eq!(snapshot.flow_lpm, Some(0));
        assert_eq!(snapshot.input_water_on, Some(false));
    }

    #[test]
    fn command_snapshot_reuses_last_tank_reading() {
        let sensor = MockDistanceSensor::new(60.0);
        let mut c = controller(VOLUMETRIC, Some(Box::new(sensor)));
        c.tick(wednesday(12, 0), false);

        // The command path builds its snapshot without a fresh burst.
        let snapshot = c.snapshot();
        assert_eq!(snapshot.storage_l, Some(456));
    }

    // -- Reload ------------------------------------------------------------

    #[test]
    fn reload_accepts_schedule_changes() {
        let mut c = controller(ZONES_ONLY, None);
        let mut new_cfg: Config = toml::from_str(ZONES_ONLY).unwrap();
        new_cfg.zones.get_mut("zone1").unwrap().schedule[0].duration = 60;

        c.reload(new_cfg).unwrap();
        assert_eq!(c.config.zones["zone1"].schedule[0].duration, 60);
    }

    #[test]
    fn reload_rejects_channel_changes() {
        let mut c = controller(ZONES_ONLY, None);
        let mut new_cfg: Config = toml::from_str(ZONES_ONLY).unwrap();
        new_cfg.zones.get_mut("zone1").unwrap().channel = 5;

        assert!(c.reload(new_cfg).is_err());
        assert_eq!(c.config.zones["zone1"].channel, 3, "previous config kept");
    }
}
