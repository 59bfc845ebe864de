//! Stateful sensor simulators for running the controller without hardware.
//!
//! Models the planter as a closed loop:
//! - Soil dries through a random walk with drift and mean reversion, with
//!   ADC noise and occasional spikes, and gets wetter while the valve
//!   register reads open
//! - The tank drains while watering and is refilled when it runs dry
//! - Climate follows a day/night cycle and occasionally fails to answer

use anyhow::Result;
use std::f64::consts::PI;

use super::{ClimateReading, ClimateSensor, MoistureProbe, RangeFinder};
use crate::registers::{reg, SharedBank};

// ---------------------------------------------------------------------------
// Gaussian approximation (no extra dependency)
// ---------------------------------------------------------------------------

/// Approximate a sample from N(0,1) using the Irwin-Hall method:
/// sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal() -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

/// Sample from N(mean, sigma).
fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

fn valve_open(bank: &SharedBank) -> bool {
    bank.read(reg::VALVE) != 0
}

fn now_secs() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

// ---------------------------------------------------------------------------
// Soil
// ---------------------------------------------------------------------------

/// Soil moisture probe. Raw values run from `raw_wet` (saturated) up to
/// `raw_dry` (bone dry).
pub struct SimSoil {
    bank: SharedBank,
    base: f64,
    raw_dry: f64,
    raw_wet: f64,
    center: f64,
    drift_per_sample: f64,
    walk_sigma: f64,
    mean_reversion: f64,
    noise_sigma: f64,
    spike_prob: f32,
    spike_sigma: f64,
    wet_rate: f64,
}

impl SimSoil {
    pub fn new(bank: SharedBank, raw_dry: i64, raw_wet: i64) -> Self {
        let (raw_dry, raw_wet) = (raw_dry as f64, raw_wet as f64);
        let range = raw_dry - raw_wet; // signed: calibration may be inverted
        Self {
            bank,
            base: raw_wet + 0.6 * range,
            raw_dry,
            raw_wet,
            center: raw_wet + 0.5 * range,
            drift_per_sample: range * 0.000_005,
            walk_sigma: range.abs() * 0.000_3,
            mean_reversion: 0.000_1,
            noise_sigma: range.abs() * 0.01,
            spike_prob: 0.005,
            spike_sigma: range.abs() * 0.1,
            wet_rate: -range * 0.000_05,
        }
    }

    fn bounds(&self) -> (f64, f64) {
        if self.raw_dry > self.raw_wet {
            (self.raw_wet, self.raw_dry)
        } else {
            (self.raw_dry, self.raw_wet)
        }
    }
}

impl MoistureProbe for SimSoil {
    fn read_raw(&mut self) -> Result<u32> {
        let pull = self.mean_reversion * (self.center - self.base);
        let walk = gaussian(0.0, self.walk_sigma);
        let wet = if valve_open(&self.bank) { self.wet_rate } else { 0.0 };

        let (lo, hi) = self.bounds();
        self.base = (self.base + self.drift_per_sample + pull + walk + wet).clamp(lo, hi);

        let noise = gaussian(0.0, self.noise_sigma);
        let spike = if fastrand::f32() < self.spike_prob {
            gaussian(0.0, self.spike_sigma)
        } else {
            0.0
        };

        Ok((self.base + noise + spike).round().max(0.0) as u32)
    }
}

// ---------------------------------------------------------------------------
// Tank
// ---------------------------------------------------------------------------

/// Echo time per centimeter of distance (there and back).
const ECHO_US_PER_CM: f64 = 58.0;
const TANK_FULL_CM: f64 = 10.0;
const TANK_BOTTOM_CM: f64 = 80.0;

/// Range finder over a tank that drains while the valve is open.
pub struct SimTank {
    bank: SharedBank,
    surface_cm: f64,
    drain_per_sample: f64,
}

impl SimTank {
    pub fn new(bank: SharedBank) -> Self {
        Self {
            bank,
            surface_cm: 30.0,
            drain_per_sample: 0.002,
        }
    }
}

impl RangeFinder for SimTank {
    fn echo_micros(&mut self) -> Result<u32> {
        if valve_open(&self.bank) {
            self.surface_cm += self.drain_per_sample;
        }
        if self.surface_cm >= TANK_BOTTOM_CM {
            tracing::info!("sim: tank refilled");
            self.surface_cm = TANK_FULL_CM;
        }
        let echo = (self.surface_cm + gaussian(0.0, 0.3)) * ECHO_US_PER_CM;
        Ok(echo.round().max(0.0) as u32)
    }
}

// ---------------------------------------------------------------------------
// Climate
// ---------------------------------------------------------------------------

/// Humidity / temperature sensor on a day/night cycle.
pub struct SimClimate {
    mean_c: f64,
    amplitude_c: f64,
    period_s: f64,
    dropout_prob: f32,
}

impl SimClimate {
    /// `period_s` is the simulated day length; 600 is handy for dev runs.
    pub fn new(period_s: f64) -> Self {
        Self {
            mean_c: 24.0,
            amplitude_c: 8.0,
            period_s,
            dropout_prob: 0.01,
        }
    }
}

impl ClimateSensor for SimClimate {
    fn read(&mut self) -> ClimateReading {
        if fastrand::f32() < self.dropout_prob {
            return ClimateReading::invalid();
        }
        let phase = (2.0 * PI * now_secs() / self.period_s).sin();
        let temperature = self.mean_c + self.amplitude_c * phase + gaussian(0.0, 0.2);
        // Humidity falls as the air warms.
        let humidity = (60.0 - 20.0 * phase + gaussian(0.0, 1.0)).clamp(5.0, 100.0);
        ClimateReading::from_measurement(humidity as f32, temperature as f32)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
