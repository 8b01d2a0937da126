//! Platform events and event sinks.
//!
//! The publish/subscribe bus of the platform is an external collaborator;
//! this module only defines the events crossing it and the [`EventSink`]
//! seam. [`EventBus`] is a synchronous fan-out used to wire the services
//! of this process together.

use crate::device::{DeviceKind, DisabledReasons, EnabledReason};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

/// A change of one physical contact. Immutable once created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputEvent {
    /// Bit position on the I/O board.
    pub physical_id: u8,
    /// Contact state after the change.
    pub is_on: bool,
    /// Microseconds since UNIX epoch.
    pub timestamp_us: u64,
}

impl InputEvent {
    /// Create an input event.
    pub fn new(physical_id: u8, is_on: bool, timestamp_us: u64) -> Self {
        Self {
            physical_id,
            is_on,
            timestamp_us,
        }
    }
}

/// Hardware fault classification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HardwareFault {
    /// Meter status bits did not match the expected pattern.
    HandshakeMismatch {
        /// Expected status pattern.
        expected: u64,
        /// Status pattern read back.
        actual: u64,
    },
    /// No or garbage response from the board.
    CommunicationTimeout(String),
    /// Board self test failed.
    SelfTestFailed(String),
    /// Meter counts could not be persisted.
    PersistenceFailure(String),
}

/// Events published to, or consumed from, the platform bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlatformEvent {
    /// Raw contact change produced by the poller.
    Input(InputEvent),
    /// Per-device logical on/off event.
    LogicalInput {
        /// Logical device id.
        logical_id: u32,
        /// Device class.
        kind: DeviceKind,
        /// Device name.
        name: String,
        /// Logical state after the change.
        is_on: bool,
        /// Timestamp of the underlying input event.
        timestamp_us: u64,
    },
    /// Device disabled, carrying the full current mask.
    Disabled {
        /// Device class.
        device: DeviceKind,
        /// Reasons currently set.
        reasons: DisabledReasons,
    },
    /// Device enabled.
    Enabled {
        /// Device class.
        device: DeviceKind,
        /// Reason of the enable request.
        reason: EnabledReason,
    },
    /// Initial hardware inspection failed.
    InspectionFailed {
        /// Device class.
        device: DeviceKind,
    },
    /// Hardware fault detected.
    HardwareFault {
        /// Device class.
        device: DeviceKind,
        /// Fault detail.
        fault: HardwareFault,
    },
    /// Previously reported hardware fault cleared.
    HardwareFaultCleared {
        /// Device class.
        device: DeviceKind,
    },
    /// Meter has no more whole ticks pending.
    TickStopped {
        /// Logical meter id.
        meter_id: u32,
    },
    /// Platform finished booting.
    BootCompleted,
    /// Feature toggle changed.
    PropertyChanged {
        /// Property key.
        key: String,
        /// New value.
        enabled: bool,
    },
    /// A subsystem stopped responding.
    StoppedResponding {
        /// Subsystem that stopped responding.
        source: DeviceKind,
    },
    /// A subsystem started responding again.
    StartedResponding {
        /// Subsystem that recovered.
        source: DeviceKind,
    },
}

/// Destination of published events.
pub trait EventSink: Send + Sync {
    /// Publish one event. Must not block for long.
    fn publish(&self, event: PlatformEvent);
}

/// Synchronous fan-out to all subscribers.
///
/// The subscriber list is snapshotted before dispatch, so subscribers may
/// publish back onto the bus.
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Arc<dyn EventSink>>>,
}

impl EventBus {
    /// Create a bus without subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a subscriber. Receives every event published afterwards.
    pub fn subscribe(&self, subscriber: Arc<dyn EventSink>) {
        self.subscribers.lock().push(subscriber);
    }

    /// Number of subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

impl EventSink for EventBus {
    fn publish(&self, event: PlatformEvent) {
        let subscribers = self.subscribers.lock().clone();
        for subscriber in subscribers {
            subscriber.publish(event.clone());
        }
    }
}

/// Logs every event as JSON through `tracing`.
#[derive(Debug, Default)]
pub struct LogSink;

impl EventSink for LogSink {
    fn publish(&self, event: PlatformEvent) {
        let json = serde_json::to_string(&event).unwrap_or_else(|e| format!("{event:?} ({e})"));
        match event {
            PlatformEvent::HardwareFault { .. }
            | PlatformEvent::InspectionFailed { .. }
            | PlatformEvent::StoppedResponding { .. } => warn!(event = %json, "platform event"),
            _ => info!(event = %json, "platform event"),
        }
    }
}

/// Records published events in order.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<PlatformEvent>>,
}

impl MemorySink {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of all recorded events.
    pub fn events(&self) -> Vec<PlatformEvent> {
        self.events.lock().clone()
    }

    /// Remove and return all recorded events.
    pub fn take(&self) -> Vec<PlatformEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    /// Recorded raw input events, in publish order.
    pub fn inputs(&self) -> Vec<InputEvent> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                PlatformEvent::Input(input) => Some(*input),
                _ => None,
            })
            .collect()
    }

    /// Whether any recorded event satisfies `pred`.
    pub fn contains(&self, pred: impl Fn(&PlatformEvent) -> bool) -> bool {
        self.events.lock().iter().any(pred)
    }
}

impl EventSink for MemorySink {
    fn publish(&self, event: PlatformEvent) {
        self.events.lock().push(event);
    }
}

/// Current timestamp in microseconds since UNIX epoch.
pub fn timestamp_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bus_fans_out_in_subscription_order() {
        let bus = EventBus::new();
        let a = Arc::new(MemorySink::new());
        let b = Arc::new(MemorySink::new());
        bus.subscribe(a.clone());
        bus.subscribe(b.clone());

        bus.publish(PlatformEvent::BootCompleted);
        bus.publish(PlatformEvent::TickStopped { meter_id: 7 });

        assert_eq!(a.events(), b.events());
        assert_eq!(a.events().len(), 2);
        assert_eq!(bus.subscriber_count(), 2);
    }

    #[test]
    fn bus_allows_reentrant_publish() {
        struct Echo {
            bus: Arc<EventBus>,
        }
        impl EventSink for Echo {
            fn publish(&self, event: PlatformEvent) {
                if event == PlatformEvent::BootCompleted {
                    self.bus.publish(PlatformEvent::TickStopped { meter_id: 1 });
                }
            }
        }

        let bus = Arc::new(EventBus::new());
        let recorder = Arc::new(MemorySink::new());
        bus.subscribe(Arc::new(Echo { bus: bus.clone() }));
        bus.subscribe(recorder.clone());

        bus.publish(PlatformEvent::BootCompleted);
        assert_eq!(recorder.events().len(), 2);
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let event = PlatformEvent::Disabled {
            device: DeviceKind::MechanicalMeter,
            reasons: DisabledReasons::ERROR,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"disabled\""));
        assert!(json.contains("mechanical_meter"));
    }
}
