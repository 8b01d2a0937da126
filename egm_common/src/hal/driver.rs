//! I/O board driver trait and error types.
//!
//! This module defines:
//! - `IoDriver` trait - the only seam through which hardware is touched
//! - `HalError` enum - Error types for driver operations
//! - `DriverFactory` type alias - Factory function type

use crate::hal::config::IoBoardConfig;
use std::sync::Arc;
use thiserror::Error;

/// Error types for HAL operations.
#[derive(Debug, Clone, Error)]
pub enum HalError {
    /// Driver initialization failed
    #[error("Initialization failed: {0}")]
    InitFailed(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Hardware communication error (no or garbage response)
    #[error("Hardware communication error: {0}")]
    CommunicationError(String),

    /// Board self test reported a failure
    #[error("Self test failed: {0}")]
    SelfTestFailed(String),

    /// Driver not found
    #[error("Driver not found: {0}")]
    DriverNotFound(String),
}

/// Factory function type for creating driver instances.
pub type DriverFactory = fn() -> Arc<dyn IoDriver>;

/// Trait defining the interface for I/O board drivers.
///
/// The poller thread, the meter worker and the health probe all hold the
/// same driver, so every method takes `&self` and implementations keep
/// their state behind interior mutability.
///
/// # Lifecycle
///
/// 1. `init()` - Called once before any loop starts
/// 2. `self_test()` - Called by the poller during its own initialization
/// 3. bit access - Called from the loops, short and synchronous
/// 4. `shutdown()` - Called when the service is stopping
///
/// # Bit access contract
///
/// Each call returns immediately with the current hardware state. Meter
/// masks use one bit per meter at the meter's physical id; a status bit
/// reads `1` while the meter coil is energized.
pub trait IoDriver: Send + Sync {
    /// Returns the driver's unique identifier (e.g., "simulation").
    fn name(&self) -> &'static str;

    /// Returns the driver's semantic version.
    fn version(&self) -> &'static str;

    /// Initialize the driver with the board configuration.
    ///
    /// # Errors
    /// Return `HalError::InitFailed` if initialization cannot complete.
    fn init(&self, config: &IoBoardConfig) -> Result<(), HalError>;

    /// Run the board self test.
    fn self_test(&self) -> Result<(), HalError>;

    /// Read the current physical input image.
    fn read_bits(&self) -> Result<u64, HalError>;

    /// Raise the meter outputs in `mask`.
    fn set_meter_bits(&self, mask: u64) -> Result<(), HalError>;

    /// Lower the meter outputs in `mask`.
    fn clear_meter_bits(&self, mask: u64) -> Result<(), HalError>;

    /// Read meter status restricted to `mask`.
    fn status_meter_bits(&self, mask: u64) -> Result<u64, HalError>;

    /// Graceful shutdown of the driver.
    fn shutdown(&self) -> Result<(), HalError>;
}
