mod actuator;
mod config;
mod control;
mod error;
mod gpio;
mod mqtt;
mod overrides;
mod rain;
mod refill;
mod schedule;
mod tank;

use anyhow::{Context, Result};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::{env, sync::Arc, time::Duration};
use tokio::signal;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use actuator::ActuatorState;
use control::Controller;
use gpio::{DistanceSensor, PinBank};
use rain::RainOracle;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env::var("MQTT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1883);
    let mqtt_user = env::var("MQTT_USER").context("MQTT_USER is required")?;
    let mqtt_password = env::var("MQTT_PASSWORD").context("MQTT_PASSWORD is required")?;

    // ── Config file ─────────────────────────────────────────────────
    let cfg = config::load(&config_path)?;
    let namespace = cfg.general.topic_namespace.clone();
    let device = cfg.general.name.clone();
    info!(
        device = %device,
        zones = cfg.zones.len(),
        water_input = cfg.general.water_input_channel.is_some(),
        tank_sensor = cfg.tank.is_some(),
        "configuration loaded"
    );

    // ── Hardware ────────────────────────────────────────────────────
    let output_channels = cfg.output_channels();
    let bank = PinBank::new(&output_channels, &cfg.input_pins())?;
    let actuators = ActuatorState::new(bank, output_channels.clone(), cfg.general.main_power_channel);
    for &ch in &output_channels {
        info!(channel = ch, on = actuators.get_logical(ch), "startup channel state");
    }
    for (zone, status) in actuators.all_statuses(&cfg.zone_channels()) {
        info!(zone = %zone, status, "zone startup state");
    }

    let distance: Option<Box<dyn DistanceSensor + Send>> = match &cfg.tank {
        Some(tank) => {
            #[cfg(feature = "gpio")]
            let sensor: Box<dyn DistanceSensor + Send> =
                Box::new(gpio::AjSr04m::new(tank.trigger_pin, tank.echo_pin)?);
            #[cfg(not(feature = "gpio"))]
            let sensor: Box<dyn DistanceSensor + Send> = {
                info!(
                    trigger = tank.trigger_pin,
                    echo = tank.echo_pin,
                    "[mock-gpio] tank sensor simulated at a fixed mid level"
                );
                Box::new(gpio::MockDistanceSensor::new(60.0))
            };
            Some(sensor)
        }
        None => None,
    };

    let rain = RainOracle::new(cfg.general.rain_status_url.clone())?;
    let shared: control::SharedController =
        Arc::new(Mutex::new(Controller::new(cfg, actuators, distance)));

    // ── MQTT ────────────────────────────────────────────────────────
    let client_id = format!("watering-{device}");
    let mut mqttoptions = MqttOptions::new(client_id, broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));
    mqttoptions.set_credentials(mqtt_user, mqtt_password);

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 20);

    // Startup blocks on the first successful connection; everything after
    // that reconnects in the background.
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("mqtt connected");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                error!("mqtt connect failed: {e} — retrying");
                sleep(Duration::from_secs(2)).await;
            }
        }
    }

    let command_filter = mqtt::command_topic_filter(&namespace, &device);
    client
        .subscribe(command_filter.as_str(), QoS::AtLeastOnce)
        .await?;
    info!(filter = %command_filter, "subscribed to zone commands");

    tokio::spawn(control::run_tick_loop(
        Arc::clone(&shared),
        client.clone(),
        rain,
        config_path,
    ));

    // ── Event loop ──────────────────────────────────────────────────
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("interrupt — closing all valves and shutting down");
                let mut c = shared.lock().await;
                c.actuators_mut().all_off();
                return Ok(());
            }
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::Publish(p))) => {
                    let Some(zone) = mqtt::extract_zone(&p.topic, &namespace, &device) else {
                        warn!(topic = %p.topic, "unhandled topic");
                        continue;
                    };
                    match mqtt::parse_zone_command(&p.payload) {
                        Some(command) => {
                            control::handle_command(&shared, &client, zone, command).await;
                        }
                        None => {
                            warn!(
                                topic = %p.topic,
                                "unrecognized command payload ignored (use ON/OFF)"
                            );
                        }
                    }
                }
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("mqtt reconnected");
                }
                Ok(_) => {}
                Err(e) => {
                    error!("mqtt error: {e} — reconnecting");
                    sleep(Duration::from_secs(2)).await;
                }
            }
        }
    }
}
