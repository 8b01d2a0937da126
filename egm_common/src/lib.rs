//! EGM Common Library
//!
//! Shared contracts for the cabinet I/O layer: configuration loading, the
//! hardware driver seam, the disable-reason lifecycle, platform events and
//! the transactional slot store used by the meter actuator.
//!
//! # Module Structure
//!
//! - [`config`] - Configuration loading traits and types
//! - [`consts`] - System-wide limits and defaults
//! - [`device`] - Disable-reason bitmask and lifecycle state machine
//! - [`event`] - Input events, platform events and event sinks
//! - [`hal`] - I/O board configuration and driver trait
//! - [`persistence`] - Named integer blocks with transaction semantics
//! - [`prelude`] - Common re-exports for convenience
//!
//! # Usage
//!
//! ```rust
//! use egm_common::prelude::*;
//! ```

pub mod config;
pub mod consts;
pub mod device;
pub mod event;
pub mod hal;
pub mod persistence;
pub mod prelude;
