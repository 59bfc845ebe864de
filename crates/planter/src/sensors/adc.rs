//! ADS1115 16-bit ADC over I2C as the soil moisture probe.
//!
//! Single-ended reads at PGA ±4.096 V, 128 SPS, single-shot mode. Pair
//! with `moisture.raw_dry` / `moisture.raw_wet` calibrated on this ADC
//! (capacitive probes on 3.3 V read roughly 26000 dry, 12000 wet).

use anyhow::{ensure, Result};
use rppal::i2c::I2c;
use std::{thread, time::Duration};

use super::MoistureProbe;

// ── ADS1115 register addresses ──────────────────────────────────────────────

/// Conversion result register (read-only, 16-bit signed).
const REG_CONVERSION: u8 = 0x00;
/// Configuration register (read/write).
const REG_CONFIG: u8 = 0x01;

// ── Config register bit fields ──────────────────────────────────────────────
//
// Layout (MSB first):
//   [15]    OS       : write 1 to start single-shot conversion
//   [14:12] MUX      : input multiplexer (channel selection)
//   [11:9]  PGA      : programmable gain amplifier
//   [8]     MODE     : 0 = continuous, 1 = single-shot
//   [7:5]   DR       : data rate
//   [1:0]   COMP_QUE : 11 = disable comparator

/// OS=1, PGA=001 (±4.096 V), MODE=1, DR=100 (128 SPS), COMP_QUE=11.
const CONFIG_BASE: u16 = 0b1_000_001_1_100_0_0_0_11;

/// MUX values for AINx vs GND.
const MUX_SHIFT: u8 = 12;
const MUX_SINGLE_ENDED: [u16; 4] = [0b100, 0b101, 0b110, 0b111];

const MAX_CHANNEL: usize = 3;

/// Conversion takes ~7.8 ms at 128 SPS.
const CONVERSION_WAIT: Duration = Duration::from_millis(9);

/// Set in the config register once the conversion is done.
const OS_READY_BIT: u16 = 1 << 15;

fn config_for_channel(channel: usize) -> u16 {
    CONFIG_BASE | (MUX_SINGLE_ENDED[channel] << MUX_SHIFT)
}

// ── Driver ──────────────────────────────────────────────────────────────────

/// Moisture probe wired to one ADS1115 input.
pub struct Ads1115Probe {
    i2c: I2c,
    channel: usize,
}

impl Ads1115Probe {
    /// Open I2C bus 1 and address the ADS1115 at `addr`.
    pub fn new(addr: u16, channel: usize) -> Result<Self> {
        ensure!(
            channel <= MAX_CHANNEL,
            "ADS1115 channel {channel} out of range (0–{MAX_CHANNEL})"
        );

        let mut i2c = I2c::new()?;
        i2c.set_slave_address(addr)?;

        tracing::info!(
            addr = format_args!("0x{addr:02x}"),
            channel,
            "ads1115 moisture probe initialised"
        );

        Ok(Self { i2c, channel })
    }
}

impl MoistureProbe for Ads1115Probe {
    fn read_raw(&mut self) -> Result<u32> {
        self.i2c
            .block_write(REG_CONFIG, &config_for_channel(self.channel).to_be_bytes())?;

        thread::sleep(CONVERSION_WAIT);

        for _ in 0..3 {
            let mut buf = [0u8; 2];
            self.i2c.block_read(REG_CONFIG, &mut buf)?;
            if u16::from_be_bytes(buf) & OS_READY_BIT != 0 {
                break;
            }
            thread::sleep(Duration::from_millis(2));
        }

        let mut buf = [0u8; 2];
        self.i2c.block_read(REG_CONVERSION, &mut buf)?;
        // Single-ended reads are non-negative; bus noise can flip the sign.
        Ok(i16::from_be_bytes(buf).max(0) as u32)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
