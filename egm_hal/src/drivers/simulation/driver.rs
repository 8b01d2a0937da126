//! Simulation driver implementation.
//!
//! The `SimulationDriver` implements the `IoDriver` trait on top of a
//! [`SimulatedBoard`] so the poller and the meter actuator can run without
//! physical hardware. Tests reach the board through [`SimulationDriver::board`]
//! to toggle contacts, count pulses and inject faults.

use super::board::SimulatedBoard;
use egm_common::hal::config::IoBoardConfig;
use egm_common::hal::driver::{HalError, IoDriver};
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;

/// Simulation driver implementing the IoDriver trait.
pub struct SimulationDriver {
    /// Initialized flag
    initialized: AtomicBool,
    /// Board model
    board: Mutex<SimulatedBoard>,
}

impl SimulationDriver {
    /// Create a new, uninitialized simulation driver.
    pub fn new() -> Self {
        Self {
            initialized: AtomicBool::new(false),
            board: Mutex::new(SimulatedBoard::default()),
        }
    }

    /// Lock the simulated board.
    pub fn board(&self) -> MutexGuard<'_, SimulatedBoard> {
        self.board.lock()
    }

    fn online(&self) -> Result<MutexGuard<'_, SimulatedBoard>, HalError> {
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(HalError::CommunicationError(
                "simulated board not initialized".to_string(),
            ));
        }
        let board = self.board.lock();
        if board.is_offline() {
            return Err(HalError::CommunicationError(
                "simulated board offline".to_string(),
            ));
        }
        Ok(board)
    }
}

impl Default for SimulationDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl IoDriver for SimulationDriver {
    fn name(&self) -> &'static str {
        "simulation"
    }

    fn version(&self) -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    fn init(&self, config: &IoBoardConfig) -> Result<(), HalError> {
        info!(
            "Initializing simulation driver: {} input bits, {} inputs, {} meters",
            config.board.physical_width,
            config.inputs.len(),
            config.meters.len()
        );

        let mut board = self.board.lock();
        let previous = board.clone();
        *board = SimulatedBoard::new(config.board.physical_width, config.meter_mask());
        board.set_inputs(previous.inputs());
        board.set_offline(previous.is_offline());
        board.set_self_test_ok(previous.self_test_ok());

        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn self_test(&self) -> Result<(), HalError> {
        let board = self.online()?;
        if !board.self_test_ok() {
            return Err(HalError::SelfTestFailed(
                "simulated self test failure".to_string(),
            ));
        }
        Ok(())
    }

    fn read_bits(&self) -> Result<u64, HalError> {
        Ok(self.online()?.inputs())
    }

    fn set_meter_bits(&self, mask: u64) -> Result<(), HalError> {
        self.online()?.raise(mask);
        Ok(())
    }

    fn clear_meter_bits(&self, mask: u64) -> Result<(), HalError> {
        self.online()?.lower(mask);
        Ok(())
    }

    fn status_meter_bits(&self, mask: u64) -> Result<u64, HalError> {
        Ok(self.online()?.status(mask))
    }

    fn shutdown(&self) -> Result<(), HalError> {
        info!("Simulation driver shutting down");
        self.initialized.store(false, Ordering::SeqCst);
        Ok(())
    }
}
