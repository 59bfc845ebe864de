//! Sensor driver boundary. The sampler only sees these traits; timing of
//! individual pulses and conversions is the driver's business.

use anyhow::Result;

#[cfg(feature = "adc")]
pub mod adc;
#[cfg(feature = "sim")]
pub mod sim;

/// Analog soil moisture probe.
pub trait MoistureProbe: Send {
    /// One raw conversion. Higher means drier.
    fn read_raw(&mut self) -> Result<u32>;
}

/// Ultrasonic range finder looking down into the water tank.
pub trait RangeFinder: Send {
    /// Width of one echo pulse in microseconds.
    fn echo_micros(&mut self) -> Result<u32>;
}

/// Combined humidity / temperature sensor.
pub trait ClimateSensor: Send {
    /// Latest reading. Fields are NaN when the sensor did not answer.
    fn read(&mut self) -> ClimateReading;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClimateReading {
    /// Relative humidity, percent.
    pub humidity: f32,
    /// Degrees Celsius.
    pub temperature: f32,
    /// Apparent temperature, degrees Celsius.
    pub heat_index: f32,
}

impl ClimateReading {
    pub fn invalid() -> Self {
        Self {
            humidity: f32::NAN,
            temperature: f32::NAN,
            heat_index: f32::NAN,
        }
    }

    /// Build a reading, deriving the heat index from the other two.
    pub fn from_measurement(humidity: f32, temperature: f32) -> Self {
        Self {
            humidity,
            temperature,
            heat_index: heat_index_celsius(temperature, humidity),
        }
    }

    pub fn is_valid(&self) -> bool {
        !(self.humidity.is_nan() || self.temperature.is_nan() || self.heat_index.is_nan())
    }
}

/// NOAA heat index (Steadman's simple form, Rothfusz regression above
/// 80 °F) for a Celsius temperature and relative humidity in percent.
pub fn heat_index_celsius(temperature: f32, humidity: f32) -> f32 {
    let t = temperature * 1.8 + 32.0;
    let rh = humidity;

    let mut hi = 0.5 * (t + 61.0 + (t - 68.0) * 1.2 + rh * 0.094);

    if hi > 79.0 {
        hi = -42.379 + 2.049_015_2 * t + 10.143_332 * rh
            - 0.224_755_4 * t * rh
            - 0.006_837_83 * t * t
            - 0.054_817_17 * rh * rh
            + 0.001_228_74 * t * t * rh
            + 0.000_852_82 * t * rh * rh
            - 0.000_001_99 * t * t * rh * rh;

        if rh < 13.0 && (80.0..=112.0).contains(&t) {
            hi -= ((13.0 - rh) * 0.25) * ((17.0 - (t - 95.0).abs()) * 0.058_82).sqrt();
        } else if rh > 85.0 && (80.0..=87.0).contains(&t) {
            hi += ((rh - 85.0) * 0.1) * ((87.0 - t) * 0.2);
        }
    }

    (hi - 32.0) * 0.555_56
}

// ===========================================================================
// Tests
// ===========================================================================
