//! Registry of the cast receivers seen on the network.
//!
//! The registry holds no network or timer logic: the discovery scanner feeds
//! it and every mutation reports what changed as [`DeviceUpdate`] values.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::DeviceId;
use crate::model::{Device, DiscoveryStatus};

pub type SharedRegistry = Arc<RwLock<DeviceRegistry>>;

#[derive(Clone, Debug, PartialEq)]
pub enum DeviceUpdate {
    Added(Device),
    /// Address or name changed.
    Refreshed(Device),
    StatusChanged {
        id: DeviceId,
        status: DiscoveryStatus,
    },
    Removed(DeviceId),
}

/// Discovery status a device moves to at the end of a scan cycle.
///
/// Returns `None` when the status does not change.
///
/// | current           | seen  | next      |
/// |-------------------|-------|-----------|
/// | any               | true  | Online    |
/// | unset, Online     | false | Searching |
/// | Searching         | false | Offline   |
/// | Offline           | false | unchanged |
pub fn next_status(current: Option<DiscoveryStatus>, seen: bool) -> Option<DiscoveryStatus> {
    let next = match (current, seen) {
        (_, true) => DiscoveryStatus::Online,
        (None, false) | (Some(DiscoveryStatus::Online), false) => DiscoveryStatus::Searching,
        (Some(DiscoveryStatus::Searching), false) | (Some(DiscoveryStatus::Offline), false) => {
            DiscoveryStatus::Offline
        }
    };

    if current == Some(next) { None } else { Some(next) }
}

#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: HashMap<DeviceId, Device>,
    in_use: Option<DeviceId>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedRegistry {
        Arc::new(RwLock::new(Self::new()))
    }

    pub fn get(&self, id: &DeviceId) -> Option<&Device> {
        self.devices.get(id)
    }

    /// All devices, sorted by display name.
    pub fn list(&self) -> Vec<Device> {
        let mut devices: Vec<Device> = self.devices.values().cloned().collect();
        devices.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        devices
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn snapshot_ids(&self) -> Vec<DeviceId> {
        self.devices.keys().cloned().collect()
    }

    /// Inserts a device or updates the known record with the same id.
    ///
    /// The status is overwritten when the incoming record carries one; address
    /// and name are only refreshed when supplied non-empty.
    pub fn upsert(&mut self, device: Device) -> Option<DeviceUpdate> {
        let Some(existing) = self.devices.get_mut(&device.id) else {
            debug!(id = %device.id, name = %device.name, "New cast device");
            self.devices.insert(device.id.clone(), device.clone());
            return Some(DeviceUpdate::Added(device));
        };

        let mut refreshed = false;
        if !device.address.is_empty() && existing.address != device.address {
            existing.address = device.address;
            refreshed = true;
        }
        if !device.name.is_empty() && existing.name != device.name {
            existing.name = device.name;
            refreshed = true;
        }

        let status_changed = device.status.is_some() && existing.status != device.status;
        if status_changed {
            existing.status = device.status;
        }

        if refreshed {
            Some(DeviceUpdate::Refreshed(existing.clone()))
        } else if let (true, Some(status)) = (status_changed, existing.status) {
            Some(DeviceUpdate::StatusChanged {
                id: existing.id.clone(),
                status,
            })
        } else {
            None
        }
    }

    /// Applies the end-of-cycle transition to every known device missing
    /// from `seen`.
    pub fn mark_absent(&mut self, seen: &HashSet<DeviceId>) -> Vec<DeviceUpdate> {
        let candidates = self.snapshot_ids();
        self.mark_absent_among(&candidates, seen)
    }

    /// Same as [`mark_absent`](Self::mark_absent), restricted to `candidates`
    /// (the devices known when the cycle started).
    pub fn mark_absent_among(
        &mut self,
        candidates: &[DeviceId],
        seen: &HashSet<DeviceId>,
    ) -> Vec<DeviceUpdate> {
        let mut updates = Vec::new();

        for id in candidates.iter().filter(|id| !seen.contains(*id)) {
            let Some(device) = self.devices.get_mut(id) else {
                continue;
            };
            if let Some(status) = next_status(device.status, false) {
                debug!(id = %id, ?status, "Cast device missed a scan cycle");
                device.status = Some(status);
                updates.push(DeviceUpdate::StatusChanged {
                    id: id.clone(),
                    status,
                });
            }
        }

        updates
    }

    /// Removes a device on explicit offline/disconnect.
    ///
    /// A device pinned by the active session is kept and marked offline.
    pub fn remove(&mut self, id: &DeviceId) -> Option<DeviceUpdate> {
        if self.in_use.as_ref() == Some(id) {
            let device = self.devices.get_mut(id)?;
            if device.status == Some(DiscoveryStatus::Offline) {
                return None;
            }
            device.status = Some(DiscoveryStatus::Offline);
            return Some(DeviceUpdate::StatusChanged {
                id: id.clone(),
                status: DiscoveryStatus::Offline,
            });
        }

        self.devices
            .remove(id)
            .map(|device| DeviceUpdate::Removed(device.id))
    }

    /// Pins the device referenced by the active session.
    pub fn set_in_use(&mut self, id: Option<DeviceId>) {
        self.in_use = id;
    }

    pub fn in_use(&self) -> Option<&DeviceId> {
        self.in_use.as_ref()
    }
}
