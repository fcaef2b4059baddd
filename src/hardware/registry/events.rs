//! Device Events
//!
//! Events emitted by the prober and fanned out by the device index so the
//! drive sync loop can react to hot-plug and media changes.

use crate::hardware::discovery::DeviceFact;

/// A change to the set of observed block devices
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// A device appeared
    Added(DeviceFact),

    /// A device went away
    Removed(DeviceFact),

    /// A device's facts changed (or it was re-probed)
    Changed(DeviceFact),
}

impl std::fmt::Display for DeviceEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceEvent::Added(d) => write!(f, "added {}", d.name),
            DeviceEvent::Removed(d) => write!(f, "removed {}", d.name),
            DeviceEvent::Changed(d) => write!(f, "changed {}", d.name),
        }
    }
}

impl DeviceEvent {
    /// The device this event is about
    pub fn device(&self) -> &DeviceFact {
        match self {
            DeviceEvent::Added(d) | DeviceEvent::Removed(d) | DeviceEvent::Changed(d) => d,
        }
    }

    pub fn into_device(self) -> DeviceFact {
        match self {
            DeviceEvent::Added(d) | DeviceEvent::Removed(d) | DeviceEvent::Changed(d) => d,
        }
    }

    pub fn is_removal(&self) -> bool {
        matches!(self, DeviceEvent::Removed(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_device() {
        let fact = DeviceFact {
            name: "sdb".to_string(),
            major: 8,
            minor: 16,
            ..Default::default()
        };
        let event = DeviceEvent::Removed(fact.clone());
        assert_eq!(event.device().key(), (8, 16));
        assert!(event.is_removal());
        assert_eq!(event.to_string(), "removed sdb");
        assert_eq!(event.into_device(), fact);
    }
}
