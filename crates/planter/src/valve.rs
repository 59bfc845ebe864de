//! Irrigation valve relay. The `gpio` feature gates the real rppal driver;
//! without it, a mock implementation tracks and logs the state.

use anyhow::Result;

#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, OutputPin};

// ---------------------------------------------------------------------------
// Relay on a Raspberry Pi GPIO pin
// ---------------------------------------------------------------------------
#[cfg(feature = "gpio")]
pub struct ValveBoard {
    pin: OutputPin,
    active_low: bool, // many relay boards are active-low
    open: bool,
}

#[cfg(feature = "gpio")]
impl ValveBoard {
    pub fn new(gpio_pin: u8, active_low: bool) -> Result<Self> {
        let pin = Gpio::new()?.get(gpio_pin)?.into_output();
        let mut board = Self {
            pin,
            active_low,
            open: true,
        };
        // Fail-safe: closed at startup
        board.set(false);
        Ok(board)
    }

    pub fn set(&mut self, open: bool) {
        // active-low relay: LOW = energised
        if open != self.active_low {
            self.pin.set_high();
        } else {
            self.pin.set_low();
        }
        if open != self.open {
            tracing::info!(gpio = self.pin.pin(), "valve {}", if open { "OPEN" } else { "CLOSED" });
        }
        self.open = open;
    }

    #[cfg(test)]
    pub fn is_open(&self) -> bool {
        self.open
    }
}

// ---------------------------------------------------------------------------
// Mock relay
// ---------------------------------------------------------------------------
#[cfg(not(feature = "gpio"))]
pub struct ValveBoard {
    open: bool,
}

#[cfg(not(feature = "gpio"))]
impl ValveBoard {
    pub fn new(gpio_pin: u8, _active_low: bool) -> Result<Self> {
        tracing::info!(gpio = gpio_pin, "[mock-gpio] valve registered (not wired)");
        Ok(Self { open: false })
    }

    pub fn set(&mut self, open: bool) {
        if open != self.open {
            tracing::info!("[mock-gpio] valve {}", if open { "OPEN" } else { "CLOSED" });
        }
        self.open = open;
    }

    #[cfg(test)]
    pub fn is_open(&self) -> bool {
        self.open
    }
}

// ===========================================================================
// Tests
// ===========================================================================
