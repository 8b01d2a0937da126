//! Prelude module for common re-exports.
//!
//! ```rust
//! use egm_common::prelude::*;
//! ```

// ─── Configuration ──────────────────────────────────────────────────
pub use crate::config::{ConfigError, ConfigLoader, LogLevel, SharedConfig};
pub use crate::hal::config::{BoardSettings, DeviceDescriptor, IoBoardConfig};

// ─── Lifecycle ──────────────────────────────────────────────────────
pub use crate::device::{
    DeviceKind, DisableReasonTracker, DisabledReasons, EnabledReason, LifecycleState,
};

// ─── Events ─────────────────────────────────────────────────────────
pub use crate::event::{
    EventBus, EventSink, HardwareFault, InputEvent, LogSink, MemorySink, PlatformEvent,
    timestamp_us,
};

// ─── Hardware ───────────────────────────────────────────────────────
pub use crate::consts::{MAX_PHYSICAL_BITS, width_mask};
pub use crate::hal::driver::{DriverFactory, HalError, IoDriver};

// ─── Persistence ────────────────────────────────────────────────────
pub use crate::persistence::{BlockHandle, PersistenceError, PersistentStore, Transaction};
