//! Device lifecycle: disable-reason bitmask and logical state.
//!
//! Every logical device (the I/O poller, the meter bank, the input
//! services) composes one [`DisableReasonTracker`]. The tracker combines an
//! additive set of disable reasons with a device-specific logical state and
//! publishes an enabled/disabled event on every request.
//!
//! Reasons are removed one at a time by the matching enable reason, with
//! one exception: `ERROR` and `FIRMWARE_UPDATE` share a combined clear
//! triggered by [`EnabledReason::Reset`] or [`EnabledReason::Operator`].
//!
//! | set flag                    | enable reason        | cleared                     |
//! |-----------------------------|----------------------|-----------------------------|
//! | ERROR or FIRMWARE_UPDATE    | Reset, Operator      | ERROR and FIRMWARE_UPDATE   |
//! | OPERATOR                    | Operator             | OPERATOR                    |
//! | SERVICE                     | Service              | SERVICE                     |
//! | SYSTEM                      | System               | SYSTEM                      |
//! | CONFIGURATION               | Configuration        | CONFIGURATION               |
//!
//! Only the first matching row applies.

use crate::event::{EventSink, PlatformEvent};
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Device class, used to tag lifecycle and fault events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    /// The physical I/O board poller.
    IoBoard,
    /// Door contact.
    Door,
    /// Push button.
    #[default]
    Button,
    /// Key switch.
    KeySwitch,
    /// Mechanical meter bank.
    MechanicalMeter,
}

bitflags! {
    /// Independent causes currently keeping a device disabled.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct DisabledReasons: u32 {
        /// Service request (e.g. attendant).
        const SERVICE         = 0x0001;
        /// Platform-level disable.
        const SYSTEM          = 0x0002;
        /// Operator menu.
        const OPERATOR        = 0x0004;
        /// Configuration not complete.
        const CONFIGURATION   = 0x0008;
        /// Hardware fault.
        const ERROR           = 0x0010;
        /// Firmware update in progress.
        const FIRMWARE_UPDATE = 0x0020;
        /// Backend host request.
        const BACKEND         = 0x0040;
        /// Game play in progress.
        const GAME_PLAY       = 0x0080;
        /// Device-originated disable.
        const DEVICE          = 0x0100;
    }
}

impl DisabledReasons {
    /// Flags sharing the combined Reset/Operator clear.
    pub const FAULT_MASK: Self =
        Self::from_bits_truncate(Self::ERROR.bits() | Self::FIRMWARE_UPDATE.bits());
}

impl Default for DisabledReasons {
    fn default() -> Self {
        Self::empty()
    }
}

/// Reason attached to an enable request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnabledReason {
    /// Fault recovery.
    Reset,
    /// Operator menu.
    Operator,
    /// Service request cleared.
    Service,
    /// Platform-level enable.
    System,
    /// Configuration complete.
    Configuration,
    /// Backend host request.
    Backend,
    /// Game play finished.
    GamePlay,
    /// Device-originated enable.
    Device,
}

/// Device-specific logical state with the three states every device shares.
pub trait LifecycleState: Copy + Eq + fmt::Debug + Send + 'static {
    /// Before initialization completed.
    const UNINITIALIZED: Self;
    /// Enabled and not busy.
    const IDLE: Self;
    /// At least one disable reason is set.
    const DISABLED: Self;
}

/// Disable-reason bitmask combined with a logical state.
///
/// Invariants (after `initialize`):
/// - `enabled == (reasons.is_empty() && initialized)`
/// - `state == S::DISABLED` whenever `!enabled`
pub struct DisableReasonTracker<S: LifecycleState> {
    device: DeviceKind,
    enabled: bool,
    reasons: DisabledReasons,
    state: S,
    last_enabled_state: S,
    initialized: bool,
    sink: Arc<dyn EventSink>,
}

impl<S: LifecycleState> DisableReasonTracker<S> {
    /// Create an uninitialized tracker publishing to `sink`.
    pub fn new(device: DeviceKind, sink: Arc<dyn EventSink>) -> Self {
        Self {
            device,
            enabled: false,
            reasons: DisabledReasons::empty(),
            state: S::UNINITIALIZED,
            last_enabled_state: S::UNINITIALIZED,
            initialized: false,
            sink,
        }
    }

    /// Mark initialization complete.
    ///
    /// The device becomes enabled in `IDLE` unless reasons were recorded
    /// before initialization, in which case it stays disabled and will
    /// restore `IDLE` once the last reason is removed.
    pub fn initialize(&mut self) {
        self.initialized = true;
        self.last_enabled_state = S::IDLE;
        if self.reasons.is_empty() {
            self.enabled = true;
            self.state = S::IDLE;
            info!("{:?} initialized", self.device);
        } else {
            self.enabled = false;
            self.state = S::DISABLED;
            info!(
                "{:?} initialized while disabled ({:?})",
                self.device, self.reasons
            );
            self.publish_disabled();
        }
    }

    /// Add `reason` to the disable mask.
    ///
    /// Re-disabling with a reason that is already set leaves the mask
    /// unchanged but still republishes the disabled event.
    pub fn disable(&mut self, reason: DisabledReasons) {
        self.reasons |= reason;
        self.enabled = false;
        if self.state != S::DISABLED {
            self.last_enabled_state = self.state;
            self.state = S::DISABLED;
        }
        info!(
            "{:?} disabled by {:?} (mask {:?})",
            self.device, reason, self.reasons
        );
        self.publish_disabled();
    }

    /// Remove the reason matching `reason` and re-enable if none remain.
    ///
    /// Returns whether the device is enabled afterwards.
    pub fn enable(&mut self, reason: EnabledReason) -> bool {
        if self.enabled {
            debug!("{:?} already enabled ({:?})", self.device, reason);
            self.sink.publish(PlatformEvent::Enabled {
                device: self.device,
                reason,
            });
            return true;
        }

        if !self.initialized {
            debug!(
                "{:?} enable({:?}) rejected: not initialized",
                self.device, reason
            );
            self.publish_disabled();
            return false;
        }

        let removed = Self::removal_for(self.reasons, reason);
        self.reasons.remove(removed);
        self.enabled = self.reasons.is_empty();

        if self.enabled {
            self.state = if self.last_enabled_state == S::UNINITIALIZED
                || self.last_enabled_state == S::IDLE
            {
                self.last_enabled_state
            } else {
                S::IDLE
            };
            info!("{:?} enabled by {:?}", self.device, reason);
            self.sink.publish(PlatformEvent::Enabled {
                device: self.device,
                reason,
            });
        } else {
            debug!(
                "{:?} enable({:?}) removed {:?}, still disabled ({:?})",
                self.device, reason, removed, self.reasons
            );
            self.publish_disabled();
        }
        self.enabled
    }

    /// Flags removed by an enable request, first matching rule wins.
    fn removal_for(reasons: DisabledReasons, reason: EnabledReason) -> DisabledReasons {
        if reasons.intersects(DisabledReasons::FAULT_MASK)
            && matches!(reason, EnabledReason::Reset | EnabledReason::Operator)
        {
            DisabledReasons::FAULT_MASK
        } else if reasons.contains(DisabledReasons::OPERATOR) && reason == EnabledReason::Operator
        {
            DisabledReasons::OPERATOR
        } else if reasons.contains(DisabledReasons::SERVICE) && reason == EnabledReason::Service {
            DisabledReasons::SERVICE
        } else if reasons.contains(DisabledReasons::SYSTEM) && reason == EnabledReason::System {
            DisabledReasons::SYSTEM
        } else if reasons.contains(DisabledReasons::CONFIGURATION)
            && reason == EnabledReason::Configuration
        {
            DisabledReasons::CONFIGURATION
        } else {
            DisabledReasons::empty()
        }
    }

    /// Move to a device-specific busy state. Ignored while disabled.
    pub fn set_state(&mut self, state: S) -> bool {
        if !self.enabled {
            return false;
        }
        self.state = state;
        true
    }

    fn publish_disabled(&self) {
        self.sink.publish(PlatformEvent::Disabled {
            device: self.device,
            reasons: self.reasons,
        });
    }

    /// Whether the device is enabled.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Whether initialization completed.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Current disable reasons.
    pub fn reasons(&self) -> DisabledReasons {
        self.reasons
    }

    /// Current logical state.
    pub fn state(&self) -> S {
        self.state
    }

    /// State that will be considered for restoration on enable.
    pub fn last_enabled_state(&self) -> S {
        self.last_enabled_state
    }

    /// Device class this tracker reports for.
    pub fn device(&self) -> DeviceKind {
        self.device
    }
}
