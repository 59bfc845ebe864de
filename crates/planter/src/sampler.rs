//! Sensor sampling: turns averaged raw driver output into the physical
//! registers (0–6) and owns the three environmental alarm bits.
//!
//! Each pass is independent. A probe that fails every sample, or a climate
//! reading containing NaN, leaves the affected registers and alarm bit at
//! their previous values for that pass.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::config::{Config, DistanceCalibration, MoistureCalibration, Thresholds};
use crate::registers::{reg, Alarm, AlarmFlag, SharedBank};
use crate::sensors::{ClimateSensor, MoistureProbe, RangeFinder};

// ---------------------------------------------------------------------------
// Conversions
// ---------------------------------------------------------------------------

/// Map a raw moisture reading onto 0–100 % using integer arithmetic, so
/// `raw_dry` is 0 % and `raw_wet` is 100 %. Out-of-range input is clamped.
pub fn moisture_percent(raw: u32, raw_dry: i64, raw_wet: i64) -> u32 {
    let span = raw_wet - raw_dry;
    if span == 0 {
        return 0;
    }
    let pct = (raw as i64 - raw_dry) * 100 / span;
    pct.clamp(0, 100) as u32
}

/// Echo pulse width to one-way distance in whole centimeters.
pub fn distance_cm(echo_us: u32, us_per_cm: f32) -> u32 {
    (echo_us as f32 / us_per_cm / 2.0) as u32
}

// ---------------------------------------------------------------------------
// Readiness
// ---------------------------------------------------------------------------

/// Latches once the first moisture reading has reached the bank. Until
/// then register 1 holds its boot value and must not drive the valve.
#[derive(Debug, Clone, Default)]
pub struct MoistureReady(Arc<AtomicBool>);

impl MoistureReady {
    pub fn is_ready(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub(crate) fn mark(&self) {
        self.0.store(true, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// Sampler
// ---------------------------------------------------------------------------

pub struct SensorSampler<M, R, C> {
    bank: SharedBank,
    moisture: M,
    range: R,
    climate: C,
    dry_soil: AlarmFlag,
    tank_empty: AlarmFlag,
    heat: AlarmFlag,
    ready: MoistureReady,
    thresholds: Thresholds,
    moisture_cal: MoistureCalibration,
    distance_cal: DistanceCalibration,
}

impl<M, R, C> SensorSampler<M, R, C>
where
    M: MoistureProbe,
    R: RangeFinder,
    C: ClimateSensor,
{
    /// Claims the heat-index, tank-empty and dry-soil alarm bits.
    pub fn new(
        bank: SharedBank,
        moisture: M,
        range: R,
        climate: C,
        config: &Config,
    ) -> Result<Self> {
        Ok(Self {
            dry_soil: bank.claim(Alarm::DrySoil)?,
            tank_empty: bank.claim(Alarm::TankEmpty)?,
            heat: bank.claim(Alarm::HeatIndex)?,
            ready: MoistureReady::default(),
            bank,
            moisture,
            range,
            climate,
            thresholds: config.thresholds.clone(),
            moisture_cal: config.moisture.clone(),
            distance_cal: config.distance.clone(),
        })
    }

    /// Sample forever, pausing `period` between passes.
    pub async fn run(mut self, period: Duration) {
        info!(period_ms = period.as_millis() as u64, "sensor sampler started");
        loop {
            self.sample_once().await;
            tokio::time::sleep(period).await;
        }
    }

    /// Handle that reports whether moisture has ever been sampled.
    pub fn moisture_ready(&self) -> MoistureReady {
        self.ready.clone()
    }

    /// One full pass over all three sensors. Returns whether a moisture
    /// reading landed in the bank.
    pub async fn sample_once(&mut self) -> bool {
        let moisture = self.sample_moisture().await;
        self.sample_distance();
        self.sample_climate();
        moisture
    }

    async fn sample_moisture(&mut self) -> bool {
        let cal = &self.moisture_cal;
        let interval = Duration::from_millis(cal.sample_interval_ms);

        let mut sum: u64 = 0;
        let mut count: u64 = 0;
        for _ in 0..cal.samples {
            match self.moisture.read_raw() {
                Ok(raw) => {
                    sum += raw as u64;
                    count += 1;
                }
                Err(e) => debug!("moisture sample dropped: {e:#}"),
            }
            tokio::time::sleep(interval).await;
        }

        if count == 0 {
            warn!("moisture probe returned no samples, keeping previous reading");
            return false;
        }

        let raw = (sum / count) as u32;
        let percent = moisture_percent(raw, cal.raw_dry, cal.raw_wet);
        self.bank.write(reg::MOISTURE_RAW, raw);
        self.bank.write(reg::MOISTURE_PERCENT, percent);
        self.dry_soil.set(percent <= self.thresholds.moisture_percent);
        self.ready.mark();

        debug!(raw, percent, "moisture sampled");
        true
    }

    fn sample_distance(&mut self) {
        let mut sum: u64 = 0;
        let mut count: u64 = 0;
        for _ in 0..self.distance_cal.samples {
            match self.range.echo_micros() {
                Ok(us) => {
                    sum += us as u64;
                    count += 1;
                }
                Err(e) => debug!("echo sample dropped: {e:#}"),
            }
        }

        if count == 0 {
            warn!("range finder returned no echoes, keeping previous reading");
            return;
        }

        let echo = (sum / count) as u32;
        let cm = distance_cm(echo, self.distance_cal.us_per_cm);
        self.bank.write(reg::ECHO_RAW, echo);
        self.bank.write(reg::DISTANCE_CM, cm);
        self.tank_empty.set(cm > self.thresholds.tank_empty_cm);

        debug!(echo_us = echo, cm, "distance sampled");
    }

    fn sample_climate(&mut self) {
        let reading = self.climate.read();
        if !reading.is_valid() {
            debug!(?reading, "climate reading invalid, skipping this pass");
            return;
        }

        // Negative temperatures saturate to zero in the unsigned registers.
        self.bank.write(reg::HUMIDITY, reading.humidity as u32);
        self.bank.write(reg::TEMPERATURE, reading.temperature as u32);
        self.bank.write(reg::HEAT_INDEX, reading.heat_index as u32);
        self.heat.set(reading.heat_index > self.thresholds.heat_index);
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::RegisterBank;
    use crate::sensors::ClimateReading;
    use anyhow::bail;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    // -- Stub drivers -------------------------------------------------------

    /// Returns whatever the shared cell holds.
    #[derive(Clone, Default)]
    struct Dial(Arc<AtomicU32>);

    impl Dial {
        fn set(&self, v: u32) {
            self.0.store(v, Ordering::Relaxed);
        }
    }

    impl MoistureProbe for Dial {
        fn read_raw(&mut self) -> Result<u32> {
            Ok(self.0.load(Ordering::Relaxed))
        }
    }

    impl RangeFinder for Dial {
        fn echo_micros(&mut self) -> Result<u32> {
            Ok(self.0.load(Ordering::Relaxed))
        }
    }

    /// Cycles through a fixed list of raw values.
    struct Cycle(Vec<u32>, usize);

    impl MoistureProbe for Cycle {
        fn read_raw(&mut self) -> Result<u32> {
            let v = self.0[self.1 % self.0.len()];
            self.1 += 1;
            Ok(v)
        }
    }

    impl RangeFinder for Cycle {
        fn echo_micros(&mut self) -> Result<u32> {
            self.read_raw()
        }
    }

    struct Broken;

    impl MoistureProbe for Broken {
        fn read_raw(&mut self) -> Result<u32> {
            bail!("i2c nack")
        }
    }

    impl RangeFinder for Broken {
        fn echo_micros(&mut self) -> Result<u32> {
            bail!("no echo")
        }
    }

    #[derive(Clone)]
    struct Weather(Arc<Mutex<ClimateReading>>);

    impl Weather {
        fn new(reading: ClimateReading) -> Self {
            Self(Arc::new(Mutex::new(reading)))
        }

        fn set(&self, reading: ClimateReading) {
            *self.0.lock().unwrap() = reading;
        }
    }

    impl ClimateSensor for Weather {
        fn read(&mut self) -> ClimateReading {
            *self.0.lock().unwrap()
        }
    }

    fn reading(heat_index: f32) -> ClimateReading {
        ClimateReading {
            humidity: 55.0,
            temperature: 24.0,
            heat_index,
        }
    }

    /// Calibration where raw `n` reads as `100 - n` percent.
    fn test_config() -> Config {
        let mut cfg = Config::default();
        cfg.moisture.raw_dry = 100;
        cfg.moisture.raw_wet = 0;
        cfg
    }

    fn sampler<M: MoistureProbe, R: RangeFinder>(
        bank: &SharedBank,
        moisture: M,
        range: R,
        weather: &Weather,
    ) -> SensorSampler<M, R, Weather> {
        SensorSampler::new(bank.clone(), moisture, range, weather.clone(), &test_config()).unwrap()
    }

    // -- Conversions --------------------------------------------------------

    #[test]
    fn moisture_percent_endpoints() {
        assert_eq!(moisture_percent(2432, 2432, 1), 0);
        assert_eq!(moisture_percent(1, 2432, 1), 100);
    }

    #[test]
    fn moisture_percent_truncates_like_integer_map() {
        // (2000 - 2432) * 100 / (1 - 2432) = 17.77…
        assert_eq!(moisture_percent(2000, 2432, 1), 17);
    }

    #[test]
    fn moisture_percent_clamps_out_of_range() {
        assert_eq!(moisture_percent(4095, 2432, 1), 0);
        assert_eq!(moisture_percent(0, 2432, 1), 100);
    }

    #[test]
    fn moisture_percent_rising_calibration() {
        // Probes whose raw value grows with wetness.
        assert_eq!(moisture_percent(12000, 12000, 26000), 0);
        assert_eq!(moisture_percent(19000, 12000, 26000), 50);
        assert_eq!(moisture_percent(26000, 12000, 26000), 100);
    }

    #[test]
    fn moisture_percent_zero_span() {
        assert_eq!(moisture_percent(500, 1000, 1000), 0);
    }

    #[test]
    fn distance_from_echo() {
        assert_eq!(distance_cm(3480, 29.0), 60);
        assert_eq!(distance_cm(3538, 29.0), 61);
        assert_eq!(distance_cm(0, 29.0), 0);
    }

    // -- Construction -------------------------------------------------------

    #[test]
    fn new_claims_environmental_alarms() {
        let bank = RegisterBank::shared();
        let weather = Weather::new(reading(20.0));
        let _s = sampler(&bank, Dial::default(), Dial::default(), &weather);
        assert!(bank.claim(Alarm::DrySoil).is_err());
        assert!(bank.claim(Alarm::TankEmpty).is_err());
        assert!(bank.claim(Alarm::HeatIndex).is_err());
        assert!(bank.claim(Alarm::NoNetwork).is_ok());
    }

    // -- Moisture -----------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn moisture_at_threshold_sets_dry_soil() {
        let bank = RegisterBank::shared();
        let probe = Dial::default();
        let weather = Weather::new(reading(20.0));
        let mut s = sampler(&bank, probe.clone(), Dial::default(), &weather);

        probe.set(80); // 20 %
        s.sample_once().await;
        assert_eq!(bank.read(reg::MOISTURE_RAW), 80);
        assert_eq!(bank.read(reg::MOISTURE_PERCENT), 20);
        assert!(bank.alarms().contains(Alarm::DrySoil));

        probe.set(79); // 21 %
        s.sample_once().await;
        assert_eq!(bank.read(reg::MOISTURE_PERCENT), 21);
        assert!(!bank.alarms().contains(Alarm::DrySoil));
    }

    #[tokio::test(start_paused = true)]
    async fn moisture_is_averaged() {
        let bank = RegisterBank::shared();
        let weather = Weather::new(reading(20.0));
        let mut s = sampler(&bank, Cycle(vec![10, 30], 0), Dial::default(), &weather);

        s.sample_once().await;
        assert_eq!(bank.read(reg::MOISTURE_RAW), 20);
        assert_eq!(bank.read(reg::MOISTURE_PERCENT), 80);
    }

    #[tokio::test(start_paused = true)]
    async fn broken_moisture_probe_keeps_previous_reading() {
        let bank = RegisterBank::shared();
        bank.write(reg::MOISTURE_PERCENT, 55);
        let weather = Weather::new(reading(20.0));
        let mut s = sampler(&bank, Broken, Dial::default(), &weather);

        assert!(!s.sample_once().await);
        assert_eq!(bank.read(reg::MOISTURE_PERCENT), 55);
        assert!(!bank.alarms().contains(Alarm::DrySoil));
    }

    #[tokio::test(start_paused = true)]
    async fn dead_probe_at_boot_never_marks_ready() {
        let bank = RegisterBank::shared();
        let weather = Weather::new(reading(20.0));
        let mut s = sampler(&bank, Broken, Dial::default(), &weather);
        let ready = s.moisture_ready();

        for _ in 0..3 {
            assert!(!s.sample_once().await);
        }
        assert!(!ready.is_ready());
        assert_eq!(bank.read(reg::MOISTURE_PERCENT), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn first_reading_marks_ready() {
        let bank = RegisterBank::shared();
        let weather = Weather::new(reading(20.0));
        let probe = Dial::default();
        probe.set(40);
        let mut s = sampler(&bank, probe, Dial::default(), &weather);
        let ready = s.moisture_ready();

        assert!(!ready.is_ready());
        assert!(s.sample_once().await);
        assert!(ready.is_ready());
    }

    // -- Distance -----------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn distance_beyond_threshold_sets_tank_empty() {
        let bank = RegisterBank::shared();
        let echo = Dial::default();
        let weather = Weather::new(reading(20.0));
        let mut s = sampler(&bank, Dial::default(), echo.clone(), &weather);

        echo.set(61 * 58);
        s.sample_once().await;
        assert_eq!(bank.read(reg::DISTANCE_CM), 61);
        assert!(bank.alarms().contains(Alarm::TankEmpty));

        echo.set(60 * 58);
        s.sample_once().await;
        assert_eq!(bank.read(reg::ECHO_RAW), 3480);
        assert_eq!(bank.read(reg::DISTANCE_CM), 60);
        assert!(!bank.alarms().contains(Alarm::TankEmpty));
    }

    #[tokio::test(start_paused = true)]
    async fn echo_is_averaged() {
        let bank = RegisterBank::shared();
        let weather = Weather::new(reading(20.0));
        let echoes = Cycle(vec![1000, 1100, 1200, 1300, 1400], 0);
        let mut s = sampler(&bank, Dial::default(), echoes, &weather);

        s.sample_once().await;
        assert_eq!(bank.read(reg::ECHO_RAW), 1200);
        assert_eq!(bank.read(reg::DISTANCE_CM), 20);
    }

    #[tokio::test(start_paused = true)]
    async fn broken_range_finder_keeps_previous_reading() {
        let bank = RegisterBank::shared();
        bank.write(reg::DISTANCE_CM, 12);
        let weather = Weather::new(reading(20.0));
        let mut s = sampler(&bank, Dial::default(), Broken, &weather);

        s.sample_once().await;
        assert_eq!(bank.read(reg::DISTANCE_CM), 12);
    }

    // -- Climate ------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn heat_index_above_threshold_sets_alarm() {
        let bank = RegisterBank::shared();
        let weather = Weather::new(reading(100.5));
        let mut s = sampler(&bank, Dial::default(), Dial::default(), &weather);

        s.sample_once().await;
        assert_eq!(bank.read(reg::HUMIDITY), 55);
        assert_eq!(bank.read(reg::TEMPERATURE), 24);
        assert_eq!(bank.read(reg::HEAT_INDEX), 100);
        assert!(bank.alarms().contains(Alarm::HeatIndex));

        weather.set(reading(100.0));
        s.sample_once().await;
        assert!(!bank.alarms().contains(Alarm::HeatIndex));
    }

    #[tokio::test(start_paused = true)]
    async fn heat_index_threshold_is_configurable() {
        let bank = RegisterBank::shared();
        let weather = Weather::new(reading(42.0));
        let mut cfg = test_config();
        cfg.thresholds.heat_index = 41.0;
        let (moisture, range) = (Dial::default(), Dial::default());
        let mut s = SensorSampler::new(bank.clone(), moisture, range, weather, &cfg).unwrap();

        s.sample_once().await;
        assert!(bank.alarms().contains(Alarm::HeatIndex));
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_climate_reading_is_skipped() {
        let bank = RegisterBank::shared();
        let weather = Weather::new(reading(120.0));
        let mut s = sampler(&bank, Dial::default(), Dial::default(), &weather);

        s.sample_once().await;
        assert!(bank.alarms().contains(Alarm::HeatIndex));

        weather.set(ClimateReading::invalid());
        s.sample_once().await;
        assert_eq!(bank.read(reg::HEAT_INDEX), 120);
        assert!(bank.alarms().contains(Alarm::HeatIndex));
    }

    #[tokio::test(start_paused = true)]
    async fn negative_temperature_saturates_to_zero() {
        let bank = RegisterBank::shared();
        let weather = Weather::new(ClimateReading {
            humidity: 80.0,
            temperature: -4.0,
            heat_index: -5.0,
        });
        let mut s = sampler(&bank, Dial::default(), Dial::default(), &weather);

        s.sample_once().await;
        assert_eq!(bank.read(reg::TEMPERATURE), 0);
        assert_eq!(bank.read(reg::HEAT_INDEX), 0);
    }

    // -- Bit independence ---------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn sampler_leaves_foreign_bits_alone() {
        let bank = RegisterBank::shared();
        let net = bank.claim(Alarm::NoNetwork).unwrap();
        let broker = bank.claim(Alarm::NoBroker).unwrap();
        net.raise();
        broker.raise();

        let probe = Dial::default();
        let echo = Dial::default();
        let weather = Weather::new(reading(150.0));
        let mut s = sampler(&bank, probe.clone(), echo.clone(), &weather);

        // All three environmental alarms on.
        probe.set(95);
        echo.set(100 * 58);
        s.sample_once().await;
        assert_eq!(bank.alarms().bits(), 0b101111);

        // All three off.
        probe.set(10);
        echo.set(10 * 58);
        weather.set(reading(30.0));
        s.sample_once().await;
        assert_eq!(bank.alarms().bits(), 0b101000);
    }

    #[tokio::test(start_paused = true)]
    async fn each_environmental_bit_tracks_only_its_sensor() {
        let bank = RegisterBank::shared();
        let probe = Dial::default();
        let echo = Dial::default();
        let weather = Weather::new(reading(30.0));
        let mut s = sampler(&bank, probe.clone(), echo.clone(), &weather);

        probe.set(90); // 10 %, dry
        echo.set(10 * 58);
        s.sample_once().await;
        assert_eq!(bank.alarms().bits(), Alarm::DrySoil.mask());

        probe.set(10); // 90 %, wet
        echo.set(70 * 58);
        s.sample_once().await;
        assert_eq!(bank.alarms().bits(), Alarm::TankEmpty.mask());
    }
}
