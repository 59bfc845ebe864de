//! Valve actuation: a two-state machine driven by the moisture register.
//!
//! ```text
//! Closed ──[moisture <= threshold]──▶ Open   (valve on, start blink)
//!   ▲                                  │
//!   └────[moisture > threshold]────────┘      (valve off, stop blink)
//! ```
//!
//! Evaluation is level-triggered: every tick re-reads the moisture register
//! and rewrites the valve register and output, so a remote override of the
//! valve register lasts until the next tick. Only the Closed → Open edge
//! starts a transient indicator; the handle lives in the Open state and is
//! dropped (stopping the task) on the way back to Closed.
//!
//! Until the sampler has written a first moisture reading the controller
//! holds the valve closed, whatever register 1 says.

use std::time::Duration;

use tracing::{debug, info};

use crate::indicator::{IndicatorFactory, TransientIndicator};
use crate::registers::{reg, SharedBank};
use crate::sampler::MoistureReady;
use crate::valve::ValveBoard;

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

enum ValveState {
    Closed,
    Open { _blink: TransientIndicator },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Opened,
    HeldOpen,
    Closed,
    HeldClosed,
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

pub struct ActuationController {
    bank: SharedBank,
    valve: ValveBoard,
    indicators: IndicatorFactory,
    ready: MoistureReady,
    /// Moisture percentage at or below which the valve opens.
    threshold: u32,
    state: ValveState,
}

impl ActuationController {
    pub fn new(
        bank: SharedBank,
        valve: ValveBoard,
        indicators: IndicatorFactory,
        ready: MoistureReady,
        threshold: u32,
    ) -> Self {
        Self {
            bank,
            valve,
            indicators,
            ready,
            threshold,
            state: ValveState::Closed,
        }
    }

    /// Evaluate forever at a fixed period.
    pub async fn run(mut self, period: Duration) {
        info!(
            period_ms = period.as_millis() as u64,
            threshold = self.threshold,
            "actuation controller started"
        );
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            self.evaluate();
        }
    }

    /// Read the moisture register once and drive valve and register to
    /// match. Must run inside a tokio runtime (the Open edge spawns a task).
    pub fn evaluate(&mut self) -> Transition {
        let moisture = self.bank.read(reg::MOISTURE_PERCENT);
        let ready = self.ready.is_ready();
        if !ready {
            debug!("no moisture reading yet, valve held closed");
        }
        let open = ready && moisture <= self.threshold;

        let transition = match (&self.state, open) {
            (ValveState::Closed, true) => {
                self.state = ValveState::Open {
                    _blink: self.indicators.launch_transient(),
                };
                info!(moisture, "soil dry, valve opening");
                Transition::Opened
            }
            (ValveState::Open { .. }, true) => Transition::HeldOpen,
            (ValveState::Open { .. }, false) => {
                self.state = ValveState::Closed;
                info!(moisture, "soil wet, valve closing");
                Transition::Closed
            }
            (ValveState::Closed, false) => Transition::HeldClosed,
        };

        self.bank.write(reg::VALVE, open as u32);
        self.valve.set(open);
        transition
    }

    #[cfg(test)]
    fn is_open(&self) -> bool {
        matches!(self.state, ValveState::Open { .. })
    }

    #[cfg(test)]
    fn blink_running(&self) -> bool {
        match &self.state {
            ValveState::Open { _blink } => !_blink.is_finished(),
            ValveState::Closed => false,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
