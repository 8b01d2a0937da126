//! Mechanical meter bank.
//!
//! Financial code records meter advances in a persisted ledger; a worker
//! thread turns them into physical pulses, one verified tick per
//! persistence transaction, and a health monitor re-enables the bank once
//! the hardware answers again after a fault.

mod actuator;
mod ledger;
mod wake;
mod worker;

pub use actuator::{CycleOutcome, MechanicalMeterActuator};
pub use ledger::{COMMITTED_BLOCK, LEDGER_BLOCK, MeterLedger, REMAINING_BLOCK};
pub use wake::WakeSignal;

use egm_common::config::ConfigError;
use egm_common::device::{DisabledReasons, LifecycleState};
use egm_common::hal::config::DeviceDescriptor;
use egm_common::hal::driver::HalError;
use egm_common::persistence::PersistenceError;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

/// Meter bank errors.
#[derive(Debug, Error)]
pub enum MeterError {
    /// No meters configured.
    #[error("No mechanical meters configured")]
    ConfigurationMissing,

    /// A meter descriptor is unusable.
    #[error("Invalid meter configuration: {0}")]
    InvalidConfiguration(#[from] ConfigError),

    /// Persistent blocks could not be created or accessed.
    #[error("Meter persistence unavailable: {0}")]
    PersistenceUnavailable(#[from] PersistenceError),

    /// No meter with this logical id.
    #[error("Unknown meter: {0}")]
    UnknownMeter(u32),

    /// Advance amounts must be positive.
    #[error("Invalid meter amount {0}: must be positive")]
    InvalidAmount(i64),

    /// The bank is disabled.
    #[error("Meter bank disabled ({0:?})")]
    Disabled(DisabledReasons),

    /// Driver failure outside the pulse handshake.
    #[error(transparent)]
    Hal(#[from] HalError),

    /// Worker thread could not be started.
    #[error("Failed to spawn meter thread: {0}")]
    Spawn(#[source] std::io::Error),

    /// Worker threads already started.
    #[error("Meter bank already running")]
    AlreadyRunning,
}

/// Logical state of the meter bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeterBankState {
    /// Not initialized yet.
    Uninitialized,
    /// Enabled, nothing to do.
    Idle,
    /// At least one disable reason set.
    Disabled,
    /// Moving ledger amounts into pending pulses.
    Draining,
    /// Pulsing meters.
    Actuating,
}

impl LifecycleState for MeterBankState {
    const UNINITIALIZED: Self = MeterBankState::Uninitialized;
    const IDLE: Self = MeterBankState::Idle;
    const DISABLED: Self = MeterBankState::Disabled;
}

/// One configured meter.
#[derive(Debug)]
pub struct LogicalMeter {
    /// Platform-wide id used by `advance_meter`.
    pub logical_id: u32,
    /// Output bit on the board.
    pub physical_id: u8,
    /// Display name.
    pub name: String,
    /// Value units per physical pulse.
    pub tick_value: i64,
    suspended: AtomicBool,
}

impl LogicalMeter {
    pub(crate) fn from_descriptor(descriptor: &DeviceDescriptor) -> Self {
        Self {
            logical_id: descriptor.logical_id,
            physical_id: descriptor.physical_id,
            name: descriptor.name.clone(),
            tick_value: descriptor.default_tick_value,
            suspended: AtomicBool::new(!descriptor.enabled_by_default),
        }
    }

    /// Output mask of this meter.
    pub fn bit(&self) -> u64 {
        1u64 << self.physical_id
    }

    /// Whether pulsing is suspended for this meter.
    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }

    pub(crate) fn set_suspended(&self, suspended: bool) {
        self.suspended.store(suspended, Ordering::SeqCst);
    }
}
