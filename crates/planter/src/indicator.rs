//! Alarm presentation on the three indicator lamps.
//!
//! The indicator walks a seven-phase round robin, one phase per tick.
//! Phases 0–5 belong to alarm bits 0–5; phase 6 is idle. Each tick looks
//! only at the current alarm register:
//!
//! ```text
//! no alarm set         → ALL-CLEAR (green), every phase
//! phase n, bit n set   → that alarm's lamp pattern
//! phase n, bit n clear → lamps unchanged
//! phase 6, any alarm   → lamps unchanged
//! ```
//!
//! One indicator runs for the life of the process. The actuation
//! controller starts short-lived extra ones when the valve opens; those run
//! a fixed number of cycles and stop early when their handle is dropped.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

use crate::lamps::LampBoard;
use crate::registers::{Alarm, AlarmSet, SharedBank};

/// Phases per cycle: one per alarm bit plus an idle phase.
pub const PHASES: u8 = 7;

// ---------------------------------------------------------------------------
// Lamp patterns
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signal {
    pub green: bool,
    pub red: bool,
    pub amber: bool,
}

impl Signal {
    pub const ALL_CLEAR: Signal = Signal::lamps(true, false, false);

    const fn lamps(green: bool, red: bool, amber: bool) -> Self {
        Self { green, red, amber }
    }

    pub fn for_alarm(alarm: Alarm) -> Self {
        match alarm {
            Alarm::HeatIndex => Signal::lamps(true, true, true),
            Alarm::TankEmpty => Signal::lamps(true, false, true),
            Alarm::DrySoil => Signal::lamps(false, false, true),
            Alarm::NoNetwork => Signal::lamps(false, true, false),
            Alarm::UpdatePending => Signal::lamps(true, true, false),
            Alarm::NoBroker => Signal::lamps(false, true, true),
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lamp = |on: bool, c: char| if on { c } else { '-' };
        write!(
            f,
            "{}{}{}",
            lamp(self.green, 'G'),
            lamp(self.red, 'R'),
            lamp(self.amber, 'A')
        )
    }
}

/// What the lamps should show in `phase` for the given alarms, or `None`
/// to leave them as they are.
pub fn phase_signal(alarms: AlarmSet, phase: u8) -> Option<Signal> {
    if alarms.is_empty() {
        return Some(Signal::ALL_CLEAR);
    }
    Alarm::from_bit(phase)
        .filter(|a| alarms.contains(*a))
        .map(Signal::for_alarm)
}

// ---------------------------------------------------------------------------
// Indicator task
// ---------------------------------------------------------------------------

pub struct AlarmIndicator {
    bank: SharedBank,
    lamps: Arc<LampBoard>,
    tick: Duration,
    phase: u8,
}

impl AlarmIndicator {
    pub fn new(bank: SharedBank, lamps: Arc<LampBoard>, tick: Duration) -> Self {
        Self {
            bank,
            lamps,
            tick,
            phase: 0,
        }
    }

    /// Present the current phase and advance to the next one.
    pub fn step(&mut self) -> Option<Signal> {
        let signal = phase_signal(self.bank.alarms(), self.phase);
        if let Some(s) = signal {
            self.lamps.show(s);
        }
        self.phase = (self.phase + 1) % PHASES;
        signal
    }

    /// Tick forever.
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.tick);
        loop {
            ticker.tick().await;
            self.step();
        }
    }

    /// Tick through `cycles` full rounds, then return.
    pub async fn run_cycles(mut self, cycles: u32) {
        let mut ticker = tokio::time::interval(self.tick);
        for _ in 0..cycles.saturating_mul(PHASES as u32) {
            ticker.tick().await;
            self.step();
        }
        debug!(cycles, "transient indicator finished");
    }
}

// ---------------------------------------------------------------------------
// Transient instances
// ---------------------------------------------------------------------------

/// Handle to a short-lived indicator task. Dropping it stops the task.
pub struct TransientIndicator {
    handle: JoinHandle<()>,
}

impl TransientIndicator {
    #[cfg(test)]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for TransientIndicator {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Everything needed to start indicator tasks on the shared lamps.
#[derive(Clone)]
pub struct IndicatorFactory {
    bank: SharedBank,
    lamps: Arc<LampBoard>,
    tick: Duration,
    transient_cycles: u32,
}

impl IndicatorFactory {
    pub fn new(
        bank: SharedBank,
        lamps: Arc<LampBoard>,
        tick: Duration,
        transient_cycles: u32,
    ) -> Self {
        Self {
            bank,
            lamps,
            tick,
            transient_cycles,
        }
    }

    /// The process-lifetime indicator.
    pub fn long_lived(&self) -> AlarmIndicator {
        AlarmIndicator::new(self.bank.clone(), self.lamps.clone(), self.tick)
    }

    /// Spawn a bounded indicator task on the current runtime.
    pub fn launch_transient(&self) -> TransientIndicator {
        let indicator = AlarmIndicator::new(self.bank.clone(), self.lamps.clone(), self.tick);
        let cycles = self.transient_cycles;
        TransientIndicator {
            handle: tokio::spawn(indicator.run_cycles(cycles)),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
