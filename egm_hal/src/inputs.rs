//! Logical input devices.
//!
//! Turns raw contact events into per-device on/off events for doors,
//! buttons and key switches. Every configured device carries its own
//! disable-reason tracker; events of disabled devices update the known
//! state but are not published.

use egm_common::device::{
    DeviceKind, DisableReasonTracker, DisabledReasons, EnabledReason, LifecycleState,
};
use egm_common::event::{EventSink, InputEvent, PlatformEvent};
use egm_common::hal::config::DeviceDescriptor;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, trace};

/// Logical state of an input device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputDeviceState {
    /// Not initialized yet.
    Uninitialized,
    /// Enabled.
    Idle,
    /// At least one disable reason set.
    Disabled,
}

impl LifecycleState for InputDeviceState {
    const UNINITIALIZED: Self = InputDeviceState::Uninitialized;
    const IDLE: Self = InputDeviceState::Idle;
    const DISABLED: Self = InputDeviceState::Disabled;
}

struct InputDevice {
    descriptor: DeviceDescriptor,
    lifecycle: DisableReasonTracker<InputDeviceState>,
    is_on: Option<bool>,
}

/// Maps physical contacts to logical devices.
pub struct LogicalInputService {
    sink: Arc<dyn EventSink>,
    devices: Mutex<Vec<InputDevice>>,
    by_physical_id: HashMap<u8, Vec<usize>>,
    by_logical_id: HashMap<u32, usize>,
}

impl LogicalInputService {
    /// Build and initialize one device per descriptor.
    ///
    /// Descriptors with `enabled_by_default = false` start disabled for
    /// `CONFIGURATION`.
    pub fn new(descriptors: &[DeviceDescriptor], sink: Arc<dyn EventSink>) -> Self {
        let mut by_physical_id: HashMap<u8, Vec<usize>> = HashMap::new();
        let mut by_logical_id = HashMap::new();
        let mut devices = Vec::with_capacity(descriptors.len());

        for (index, descriptor) in descriptors.iter().enumerate() {
            let mut lifecycle = DisableReasonTracker::new(descriptor.kind, sink.clone());
            if !descriptor.enabled_by_default {
                lifecycle.disable(DisabledReasons::CONFIGURATION);
            }
            lifecycle.initialize();

            by_physical_id
                .entry(descriptor.physical_id)
                .or_default()
                .push(index);
            by_logical_id.insert(descriptor.logical_id, index);
            devices.push(InputDevice {
                descriptor: descriptor.clone(),
                lifecycle,
                is_on: None,
            });
        }

        info!("Logical input service: {} devices", devices.len());
        Self {
            sink,
            devices: Mutex::new(devices),
            by_physical_id,
            by_logical_id,
        }
    }

    /// Apply one raw input event. Returns how many logical events were
    /// published.
    pub fn handle_input(&self, event: &InputEvent) -> usize {
        let Some(indices) = self.by_physical_id.get(&event.physical_id) else {
            trace!("No logical device on physical input {}", event.physical_id);
            return 0;
        };

        let mut published = Vec::new();
        {
            let mut devices = self.devices.lock();
            for &index in indices {
                let device = &mut devices[index];
                device.is_on = Some(event.is_on);
                if !device.lifecycle.is_enabled() {
                    debug!(
                        "{} ({}) masked: {:?}",
                        device.descriptor.name,
                        device.descriptor.logical_id,
                        device.lifecycle.reasons()
                    );
                    continue;
                }
                published.push(PlatformEvent::LogicalInput {
                    logical_id: device.descriptor.logical_id,
                    kind: device.descriptor.kind,
                    name: device.descriptor.name.clone(),
                    is_on: event.is_on,
                    timestamp_us: event.timestamp_us,
                });
            }
        }

        let count = published.len();
        for event in published {
            self.sink.publish(event);
        }
        count
    }

    /// Last observed state of a device, `None` before its first event.
    pub fn current_state(&self, logical_id: u32) -> Option<bool> {
        let index = *self.by_logical_id.get(&logical_id)?;
        self.devices.lock()[index].is_on
    }

    /// Add a disable reason to one device.
    pub fn disable_device(&self, logical_id: u32, reason: DisabledReasons) -> bool {
        let Some(&index) = self.by_logical_id.get(&logical_id) else {
            return false;
        };
        self.devices.lock()[index].lifecycle.disable(reason);
        true
    }

    /// Remove a disable reason from one device. Returns whether the device
    /// is enabled afterwards.
    pub fn enable_device(&self, logical_id: u32, reason: EnabledReason) -> bool {
        let Some(&index) = self.by_logical_id.get(&logical_id) else {
            return false;
        };
        self.devices.lock()[index].lifecycle.enable(reason)
    }

    /// Whether a device is enabled.
    pub fn is_device_enabled(&self, logical_id: u32) -> bool {
        self.by_logical_id
            .get(&logical_id)
            .is_some_and(|&index| self.devices.lock()[index].lifecycle.is_enabled())
    }

    /// Kind of a configured device.
    pub fn device_kind(&self, logical_id: u32) -> Option<DeviceKind> {
        let index = *self.by_logical_id.get(&logical_id)?;
        Some(self.devices.lock()[index].descriptor.kind)
    }
}

impl EventSink for LogicalInputService {
    fn publish(&self, event: PlatformEvent) {
        if let PlatformEvent::Input(input) = event {
            self.handle_input(&input);
        }
    }
}
