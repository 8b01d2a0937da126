//! Simulation driver module.
//!
//! Software model of the I/O board for development and testing without
//! physical hardware.

mod board;
mod driver;

pub use board::SimulatedBoard;
pub use driver::SimulationDriver;

use egm_common::hal::driver::IoDriver;
use std::sync::Arc;

/// Factory function to create a simulation driver instance.
pub fn create_driver() -> Arc<dyn IoDriver> {
    Arc::new(SimulationDriver::new())
}
