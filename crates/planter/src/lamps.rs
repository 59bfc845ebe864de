//! Green / red / amber indicator lamps. Shared by every indicator task, so
//! `show` takes `&self`. The `gpio` feature drives real pins; otherwise a
//! mock board remembers the last signal.

use anyhow::Result;
use std::sync::{Mutex, PoisonError};

use crate::indicator::Signal;

// ---------------------------------------------------------------------------
// Real GPIO lamps
// ---------------------------------------------------------------------------
#[cfg(feature = "gpio")]
pub struct LampBoard {
    // green, red, amber
    pins: Mutex<[rppal::gpio::OutputPin; 3]>,
}

#[cfg(feature = "gpio")]
impl LampBoard {
    pub fn new(green: u8, red: u8, amber: u8) -> Result<Self> {
        let gpio = rppal::gpio::Gpio::new()?;
        let mut pins = [
            gpio.get(green)?.into_output(),
            gpio.get(red)?.into_output(),
            gpio.get(amber)?.into_output(),
        ];
        for pin in &mut pins {
            pin.set_low();
        }
        Ok(Self {
            pins: Mutex::new(pins),
        })
    }

    pub fn show(&self, signal: Signal) {
        let mut pins = self.pins.lock().unwrap_or_else(PoisonError::into_inner);
        for (pin, on) in pins.iter_mut().zip([signal.green, signal.red, signal.amber]) {
            if on {
                pin.set_high();
            } else {
                pin.set_low();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Mock lamps
// ---------------------------------------------------------------------------
#[cfg(not(feature = "gpio"))]
pub struct LampBoard {
    state: Mutex<MockLamps>,
}

#[cfg(not(feature = "gpio"))]
#[derive(Default)]
struct MockLamps {
    last: Option<Signal>,
    shown: usize,
}

#[cfg(not(feature = "gpio"))]
impl LampBoard {
    pub fn new(green: u8, red: u8, amber: u8) -> Result<Self> {
        tracing::info!(green, red, amber, "[mock-gpio] lamps registered (not wired)");
        Ok(Self {
            state: Mutex::new(MockLamps::default()),
        })
    }

    pub fn show(&self, signal: Signal) {
        let mut st = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if st.last != Some(signal) {
            tracing::debug!(%signal, "[mock-gpio] lamps");
        }
        st.last = Some(signal);
        st.shown += 1;
    }

    /// Most recent signal put on the lamps.
    #[cfg(test)]
    pub fn last(&self) -> Option<Signal> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).last
    }

    /// Number of `show` calls so far.
    #[cfg(test)]
    pub fn shown(&self) -> usize {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).shown
    }
}
