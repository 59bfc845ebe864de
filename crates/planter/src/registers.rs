//! Shared register bank and alarm bitmask.
//!
//! Every periodic task holds a [`SharedBank`] and touches the slots it owns
//! directly. There is no lock around the bank: each slot is an atomic cell,
//! so a single read or write is always whole, but nothing ties two slots
//! together and a reader may see one register updated and its neighbour
//! not yet.
//!
//! Slot 20 packs six independent alarm conditions. A producer gets write
//! access to its bits only by claiming an [`AlarmFlag`]; each bit can be
//! claimed once per bank, and flags flip their bit with a single atomic
//! OR / AND-NOT so concurrent producers never clobber each other.

use anyhow::{bail, Result};
use serde::Serialize;
use std::fmt;
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Number of slots in the bank.
pub const REGISTER_COUNT: usize = 30;

/// Registers a remote peer may overwrite.
pub const REMOTE_WRITABLE: RangeInclusive<usize> = 10..=19;

/// Register indices with a fixed meaning.
pub mod reg {
    /// Averaged raw analog moisture reading.
    pub const MOISTURE_RAW: usize = 0;
    /// Moisture percentage, 0–100.
    pub const MOISTURE_PERCENT: usize = 1;
    /// Averaged raw echo pulse width in microseconds.
    pub const ECHO_RAW: usize = 2;
    /// Distance to the water surface in centimeters.
    pub const DISTANCE_CM: usize = 3;
    pub const HUMIDITY: usize = 4;
    pub const TEMPERATURE: usize = 5;
    pub const HEAT_INDEX: usize = 6;
    /// Valve state, 0 = closed, 1 = open.
    pub const VALVE: usize = 10;
    /// Alarm bitmask, see [`super::Alarm`].
    pub const ALARMS: usize = 20;
}

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedBank = Arc<RegisterBank>;

// ---------------------------------------------------------------------------
// Alarm conditions
// ---------------------------------------------------------------------------

/// One bit of the alarm register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Alarm {
    /// Heat index above the configured threshold.
    HeatIndex,
    /// Water tank reads empty.
    TankEmpty,
    /// Soil moisture at or below the irrigation threshold.
    DrySoil,
    NoNetwork,
    /// Firmware update available or being installed.
    UpdatePending,
    NoBroker,
}

impl Alarm {
    /// All alarms in bit order.
    pub const ALL: [Alarm; 6] = [
        Alarm::HeatIndex,
        Alarm::TankEmpty,
        Alarm::DrySoil,
        Alarm::NoNetwork,
        Alarm::UpdatePending,
        Alarm::NoBroker,
    ];

    pub fn bit(self) -> u8 {
        match self {
            Alarm::HeatIndex => 0,
            Alarm::TankEmpty => 1,
            Alarm::DrySoil => 2,
            Alarm::NoNetwork => 3,
            Alarm::UpdatePending => 4,
            Alarm::NoBroker => 5,
        }
    }

    pub fn mask(self) -> u32 {
        1 << self.bit()
    }

    pub fn from_bit(bit: u8) -> Option<Self> {
        Self::ALL.get(bit as usize).copied()
    }
}

impl fmt::Display for Alarm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Alarm::HeatIndex => "heat_index",
            Alarm::TankEmpty => "tank_empty",
            Alarm::DrySoil => "dry_soil",
            Alarm::NoNetwork => "no_network",
            Alarm::UpdatePending => "update_pending",
            Alarm::NoBroker => "no_broker",
        };
        f.write_str(name)
    }
}

/// A snapshot of the alarm register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AlarmSet(u32);

impl AlarmSet {
    #[cfg(test)]
    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    #[cfg(test)]
    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, alarm: Alarm) -> bool {
        self.0 & alarm.mask() != 0
    }

    /// Active alarms in bit order. Bits with no named alarm are skipped.
    pub fn iter(self) -> impl Iterator<Item = Alarm> {
        Alarm::ALL.into_iter().filter(move |a| self.contains(*a))
    }
}

// ---------------------------------------------------------------------------
// Register bank
// ---------------------------------------------------------------------------

pub struct RegisterBank {
    slots: [AtomicU32; REGISTER_COUNT],
    /// Alarm bits already handed out as [`AlarmFlag`]s.
    claimed: AtomicU32,
}

impl Default for RegisterBank {
    fn default() -> Self {
        Self::new()
    }
}

impl RegisterBank {
    /// A bank with every slot at zero.
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| AtomicU32::new(0)),
            claimed: AtomicU32::new(0),
        }
    }

    pub fn shared() -> SharedBank {
        Arc::new(Self::new())
    }

    /// Read one slot.
    ///
    /// # Panics
    ///
    /// If `index >= REGISTER_COUNT`.
    pub fn read(&self, index: usize) -> u32 {
        self.slots[index].load(Ordering::Relaxed)
    }

    /// Overwrite one slot.
    ///
    /// # Panics
    ///
    /// If `index >= REGISTER_COUNT`, or if `index` is the alarm register,
    /// which only changes through [`AlarmFlag`].
    pub fn write(&self, index: usize, value: u32) {
        assert_ne!(
            index,
            reg::ALARMS,
            "alarm register is written through AlarmFlag only"
        );
        self.slots[index].store(value, Ordering::Relaxed);
    }

    /// Copy of every slot, read one at a time.
    pub fn snapshot(&self) -> [u32; REGISTER_COUNT] {
        std::array::from_fn(|i| self.read(i))
    }

    pub fn alarms(&self) -> AlarmSet {
        AlarmSet(self.read(reg::ALARMS))
    }

    /// Take exclusive write ownership of one alarm bit.
    ///
    /// Fails if the bit was already claimed on this bank.
    pub fn claim(self: &Arc<Self>, alarm: Alarm) -> Result<AlarmFlag> {
        let prev = self.claimed.fetch_or(alarm.mask(), Ordering::AcqRel);
        if prev & alarm.mask() != 0 {
            bail!("alarm {alarm} already has a producer");
        }
        Ok(AlarmFlag {
            bank: Arc::clone(self),
            alarm,
        })
    }
}

// ---------------------------------------------------------------------------
// Alarm producer handle
// ---------------------------------------------------------------------------

/// Write access to exactly one alarm bit.
pub struct AlarmFlag {
    bank: SharedBank,
    alarm: Alarm,
}

impl AlarmFlag {
    /// Set or clear this flag's bit, leaving every other bit untouched.
    pub fn set(&self, active: bool) {
        let cell = &self.bank.slots[reg::ALARMS];
        if active {
            cell.fetch_or(self.alarm.mask(), Ordering::Relaxed);
        } else {
            cell.fetch_and(!self.alarm.mask(), Ordering::Relaxed);
        }
    }

    pub fn raise(&self) {
        self.set(true);
    }

    pub fn clear(&self) {
        self.set(false);
    }

    pub fn is_active(&self) -> bool {
        self.bank.alarms().contains(self.alarm)
    }
}

impl fmt::Debug for AlarmFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlarmFlag")
            .field("alarm", &self.alarm)
            .field("active", &self.is_active())
            .finish()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
