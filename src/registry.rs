//! ==============================================================================
//! registry.rs - the one device map
//! ==============================================================================
//!
//! purpose:
//!     owns every known device session, keyed by identity. the heartbeat
//!     listener, the aggregation engine and the fleet directory all go through
//!     this handle; nothing else holds the map.
//!
//! locking:
//!     the map lock only guards membership. per-device state has its own lock
//!     inside `Device`, so callbacks passed to `for_each*` run on a snapshot of
//!     the members, never under the map lock.
//!
//! ownership:
//!     the registry owns the devices and each device reports readings into the
//!     aggregator, so the aggregator only keeps a `WeakRegistry`.
//!
//! ==============================================================================

use crate::domain::Liveness;
use crate::session::Device;

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

type DeviceMap = RwLock<HashMap<String, Arc<Device>>>;

#[derive(Clone, Default)]
pub struct Registry {
    devices: Arc<DeviceMap>,
}

/// Handle that does not keep the device map alive.
#[derive(Clone)]
pub struct WeakRegistry {
    devices: Weak<DeviceMap>,
}

impl WeakRegistry {
    pub fn upgrade(&self) -> Option<Registry> {
        self.devices.upgrade().map(|devices| Registry { devices })
    }
}

impl Registry {
    pub fn downgrade(&self) -> WeakRegistry {
        WeakRegistry {
            devices: Arc::downgrade(&self.devices),
        }
    }

    pub fn get(&self, identity: &str) -> Option<Arc<Device>> {
        self.devices.read().get(identity).cloned()
    }

    /// Get-or-insert as one step. The bool is true when `create` ran.
    pub fn upsert<F>(&self, identity: &str, create: F) -> (Arc<Device>, bool)
    where
        F: FnOnce() -> Arc<Device>,
    {
        if let Some(existing) = self.get(identity) {
            return (existing, false);
        }
        let mut devices = self.devices.write();
        // someone may have inserted between the read and write locks
        if let Some(existing) = devices.get(identity) {
            return (Arc::clone(existing), false);
        }
        let device = create();
        devices.insert(identity.to_string(), Arc::clone(&device));
        (device, true)
    }

    /// Snapshot of all members.
    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.devices.read().values().cloned().collect()
    }

    pub fn for_each<F: FnMut(&Arc<Device>)>(&self, mut f: F) {
        for device in self.devices() {
            f(&device);
        }
    }

    pub fn for_each_active<F: FnMut(&Arc<Device>)>(&self, mut f: F) {
        self.for_each(|device| {
            if device.liveness() == Liveness::Up {
                f(device);
            }
        });
    }

    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
