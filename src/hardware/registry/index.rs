//! Device Index
//!
//! In-memory index of the block devices the prober has observed, keyed by
//! `(major, minor)`. Only the prober task owns a [`DeviceIndex`]; every other
//! component gets a cloneable [`DeviceIndexReader`].

use super::events::DeviceEvent;
use crate::hardware::discovery::DeviceFact;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

/// Capacity of the event fan-out channel
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

type Key = (u32, u32);

struct Shared {
    devices: RwLock<BTreeMap<Key, DeviceFact>>,
    updates: AtomicU64,
    events: broadcast::Sender<DeviceEvent>,
}

/// Writable handle, held by the prober
pub struct DeviceIndex {
    shared: Arc<Shared>,
}

/// Read-only handle
#[derive(Clone)]
pub struct DeviceIndexReader {
    shared: Arc<Shared>,
}

impl DeviceIndex {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                devices: RwLock::new(BTreeMap::new()),
                updates: AtomicU64::new(0),
                events,
            }),
        }
    }

    pub fn reader(&self) -> DeviceIndexReader {
        DeviceIndexReader {
            shared: self.shared.clone(),
        }
    }

    /// Replace the whole index with a fresh enumeration and publish the
    /// difference as events
    pub fn replace_all(&self, facts: Vec<DeviceFact>) -> Vec<DeviceEvent> {
        let fresh: BTreeMap<Key, DeviceFact> = facts.into_iter().map(|f| (f.key(), f)).collect();
        let mut events = Vec::new();
        {
            let mut devices = self.shared.devices.write();
            for (key, old) in devices.iter() {
                if !fresh.contains_key(key) {
                    events.push(DeviceEvent::Removed(old.clone()));
                }
            }
            for (key, fact) in &fresh {
                match devices.get(key) {
                    None => events.push(DeviceEvent::Added(fact.clone())),
                    Some(old) if old != fact => events.push(DeviceEvent::Changed(fact.clone())),
                    Some(_) => {}
                }
            }
            *devices = fresh;
        }
        for event in &events {
            self.publish(event.clone());
        }
        events
    }

    /// Apply one live event. Removing a disk also removes its partitions.
    pub fn apply(&self, event: DeviceEvent) {
        {
            let mut devices = self.shared.devices.write();
            match &event {
                DeviceEvent::Added(fact) | DeviceEvent::Changed(fact) => {
                    devices.insert(fact.key(), fact.clone());
                }
                DeviceEvent::Removed(fact) => {
                    devices.remove(&fact.key());
                    if !fact.name.is_empty() {
                        devices.retain(|_, d| d.parent != fact.name);
                    }
                }
            }
        }
        debug!(event = %event, "device index updated");
        self.publish(event);
    }

    fn publish(&self, event: DeviceEvent) {
        self.shared.updates.fetch_add(1, Ordering::Relaxed);
        // No subscribers yet is fine.
        let _ = self.shared.events.send(event);
    }
}

impl Default for DeviceIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceIndexReader {
    /// Device by kernel name
    pub fn get(&self, name: &str) -> Option<DeviceFact> {
        self.shared
            .devices
            .read()
            .values()
            .find(|d| d.name == name)
            .cloned()
    }

    pub fn by_major_minor(&self, major: u32, minor: u32) -> Option<DeviceFact> {
        self.shared.devices.read().get(&(major, minor)).cloned()
    }

    /// Every observed device, ordered by `(major, minor)`
    pub fn all(&self) -> Vec<DeviceFact> {
        self.shared.devices.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.shared.devices.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of events published so far
    pub fn update_count(&self) -> u64 {
        self.shared.updates.load(Ordering::Relaxed)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.shared.events.subscribe()
    }
}

impl std::fmt::Debug for DeviceIndexReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceIndexReader")
            .field("devices", &self.len())
            .finish()
    }
}
