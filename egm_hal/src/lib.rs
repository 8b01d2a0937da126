//! # EGM I/O Library
//!
//! Hardware control core of an electronic gaming machine: physical input
//! polling, logical input devices and mechanical meter actuation on top of
//! a pluggable I/O board driver.
//!
//! # Module Structure
//!
//! - [`core`] - IoCore wiring, startup and shutdown
//! - [`driver_registry`] - Driver factory registration
//! - [`drivers`] - I/O board driver implementations
//! - [`poller`] - Physical input polling and boot gating
//! - [`inputs`] - Logical input devices
//! - [`meters`] - Mechanical meter bank
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                       egm_hal (single crate)                   │
//! │  ┌──────────────┐   ┌──────────────┐   ┌───────────────────┐   │
//! │  │  EventBus    │◄─►│   IoCore     │◄─►│  Driver Registry  │   │
//! │  └──────┬───────┘   └──────┬───────┘   └───────────────────┘   │
//! │         │                  │                                   │
//! │   ┌─────┴──────┬───────────┼──────────────┐                    │
//! │   ▼            ▼           ▼              ▼                    │
//! │ Logical     Physical    Mechanical     IoDriver                │
//! │ inputs      IoPoller    meters  ──────► (trait object)         │
//! └────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]

pub mod core;
pub mod driver_registry;
pub mod drivers;
pub mod inputs;
pub mod meters;
pub mod poller;

// Re-export key types for convenience
pub use crate::core::{CoreError, IoCore};
pub use crate::driver_registry::DriverRegistry;
pub use crate::inputs::LogicalInputService;
pub use crate::meters::{MechanicalMeterActuator, MeterBankState, MeterError};
pub use crate::poller::{PhysicalIoPoller, PollerError, PollerState};
