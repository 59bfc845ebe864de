mod actuation;
mod config;
mod indicator;
mod lamps;
mod mqtt;
mod network;
mod registers;
mod restart;
mod sampler;
mod sensors;
mod sync;
mod telemetry;
mod update;
mod valve;
mod web;

#[cfg(not(feature = "sim"))]
compile_error!("the tank range finder and climate sensor are simulated; enable the `sim` feature");

use anyhow::{Context, Result};
use std::{env, path::PathBuf, sync::Arc};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use actuation::ActuationController;
use indicator::IndicatorFactory;
use lamps::LampBoard;
use mqtt::Topics;
use network::HostNetwork;
use registers::{reg, RegisterBank};
use restart::RestartHandle;
use sampler::SensorSampler;
use sensors::sim::{SimClimate, SimTank};
use sync::{SyncAgent, SyncTiming};
use telemetry::TelemetrySink;
use update::{HttpFirmware, UpdateGate, FIRMWARE_VERSION};
use valve::ValveBoard;
use web::StatusState;

/// Simulated day length for the climate sensor.
const SIM_DAY_S: f64 = 600.0;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "planter.toml".to_string());
    let broker_host = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let broker_port: u16 = env::var("MQTT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1883);
    let web_port: u16 = env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);
    // Many common relay boards are active-low. If yours is active-high, set false.
    let active_low = env::var("VALVE_ACTIVE_LOW")
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(true);

    let cfg = config::load(&config_path)?;

    // ── Identity ────────────────────────────────────────────────────
    let link = HostNetwork::new(&cfg.device.interface);
    let addr = match &cfg.device.hardware_address {
        Some(raw) => config::normalize_hardware_address(raw),
        None => link
            .hardware_address()
            .context("no device.hardware_address configured")?,
    };
    info!(%addr, version = FIRMWARE_VERSION, "planter starting");

    let bank = RegisterBank::shared();
    let restart = RestartHandle::new();

    // ── Outputs ─────────────────────────────────────────────────────
    let mut valve = ValveBoard::new(cfg.pins.valve, active_low)?;
    valve.set(false);
    bank.write(reg::VALVE, 0);

    let lamps = Arc::new(LampBoard::new(
        cfg.pins.lamp_green,
        cfg.pins.lamp_red,
        cfg.pins.lamp_amber,
    )?);
    let indicators = IndicatorFactory::new(
        bank.clone(),
        lamps,
        cfg.timing.indicator_tick(),
        cfg.timing.transient_cycles,
    );

    // ── Sensors ─────────────────────────────────────────────────────
    #[cfg(feature = "adc")]
    let probe = sensors::adc::Ads1115Probe::new(cfg.pins.adc_address, cfg.pins.adc_channel)?;
    #[cfg(not(feature = "adc"))]
    let probe =
        sensors::sim::SimSoil::new(bank.clone(), cfg.moisture.raw_dry, cfg.moisture.raw_wet);

    let mut sampler = SensorSampler::new(
        bank.clone(),
        probe,
        SimTank::new(bank.clone()),
        SimClimate::new(SIM_DAY_S),
        &cfg,
    )?;
    // Fill the moisture register before the valve logic first looks at it.
    let moisture_ready = sampler.moisture_ready();
    if !sampler.sample_once().await {
        warn!("no moisture reading at boot, valve held closed until one lands");
    }
    tokio::spawn(sampler.run(cfg.timing.sample_period()));

    // ── Actuation + indication ──────────────────────────────────────
    let actuator = ActuationController::new(
        bank.clone(),
        valve,
        indicators.clone(),
        moisture_ready,
        cfg.thresholds.moisture_percent,
    );
    tokio::spawn(actuator.run(cfg.timing.actuation_period()));
    tokio::spawn(indicators.long_lived().run());

    // ── Telemetry ───────────────────────────────────────────────────
    let sink = TelemetrySink::new(&cfg.telemetry.endpoint, &addr)?;
    tokio::spawn(sink.run(bank.clone(), cfg.telemetry.interval()));

    // ── Status endpoint ─────────────────────────────────────────────
    let status = StatusState::new(bank.clone(), addr.clone());
    tokio::spawn(async move {
        if let Err(e) = web::serve(status, web_port).await {
            error!("{e:#}");
        }
    });

    // ── MQTT ────────────────────────────────────────────────────────
    let topics = Topics::new(&addr);
    let (broker, pump) = mqtt::open(&addr, &broker_host, broker_port, &topics);
    tokio::spawn(pump.run(bank.clone(), restart.clone()));
    info!(
        host = %broker_host,
        port = broker_port,
        filter = %topics.inbound_filter(),
        "mqtt configured"
    );

    // ── Firmware update + link supervision ──────────────────────────
    let install_path = match &cfg.update.install_path {
        Some(p) => PathBuf::from(p),
        None => env::current_exe().context("locating current executable")?,
    };
    let firmware = HttpFirmware::new(&cfg.update.base_url, &addr, install_path)?;
    let gate = UpdateGate::new(&bank, FIRMWARE_VERSION, cfg.update.settle())?;
    let agent = SyncAgent::new(
        bank.clone(),
        link,
        broker,
        firmware,
        topics,
        restart.clone(),
        SyncTiming::from(&cfg.timing),
        FIRMWARE_VERSION,
        gate,
    )?;

    tokio::select! {
        _ = agent.run(cfg.timing.sync_period()) => {}
        _ = restart.requested() => {}
    }

    info!("restarting");
    restart::reexec()
}
