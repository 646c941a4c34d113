//! Native enumeration gateway
//!
//! Turns raw backend listings into identified snapshots and hands out
//! independently referenced device handles for callers working outside the
//! scan cycle.

use crate::error::TopologyError;
use crate::usb::backend::{NativeDevice, UsbBackend};
use crate::usb::id::DeviceId;
use tracing::{debug, trace};

/// Identified snapshot entry
#[derive(Debug)]
pub struct SnapshotEntry<D> {
    pub handle: D,
    pub id: DeviceId,
    /// Parent identity, resolved while the native list was alive
    pub parent_id: Option<DeviceId>,
}

pub struct EnumerationGateway<B: UsbBackend> {
    backend: B,
}

impl<B: UsbBackend> EnumerationGateway<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// List the devices currently on the bus with their identities
    ///
    /// Devices whose identity cannot be resolved are released right away and
    /// left out of the result. Parents are looked up before the native list
    /// is freed.
    pub fn list_current_devices(&self) -> Result<Vec<SnapshotEntry<B::Device>>, TopologyError> {
        let (listed, snapshot) = self.backend.with_device_list(|devices| {
            let listed = devices.len();
            let snapshot: Vec<_> = devices
                .into_iter()
                .filter_map(|handle| {
                    let id = DeviceId::resolve(&handle)?;
                    let parent_id = self.resolve_parent_id(&handle);
                    Some(SnapshotEntry {
                        handle,
                        id,
                        parent_id,
                    })
                })
                .collect();
            (listed, snapshot)
        })?;

        trace!(
            "Listed {} devices, {} identified",
            listed,
            snapshot.len()
        );
        Ok(snapshot)
    }

    /// Identity of the parent of `device`
    ///
    /// `None` if the device sits on a root port or the parent cannot be
    /// identified. The parent handle is released before returning. Same
    /// validity window as [`Self::resolve_parent`].
    pub fn resolve_parent_id(&self, device: &B::Device) -> Option<DeviceId> {
        self.resolve_parent(device)
            .and_then(|parent| DeviceId::resolve(&parent))
    }

    /// Parent of `device` in the physical tree
    ///
    /// Only meaningful while the device list `device` was taken from is
    /// alive; outside [`UsbBackend::with_device_list`] use the parent
    /// identity recorded in [`SnapshotEntry`].
    pub fn resolve_parent(&self, device: &B::Device) -> Option<B::Device> {
        device.parent()
    }

    /// Acquire a fresh handle for the device with the given identity
    ///
    /// The returned handle must be given back through [`Self::release_handle`]
    /// (or simply dropped).
    pub fn acquire_handle(&self, id: &DeviceId) -> Result<B::Device, TopologyError> {
        let snapshot = self.list_current_devices()?;

        let handle = snapshot
            .into_iter()
            .find_map(|entry| (entry.id == *id).then_some(entry.handle))
            .ok_or(TopologyError::DeviceNotFound(*id))?;

        debug!("Acquired handle for {}", id);
        Ok(handle)
    }

    /// Release a handle obtained from [`Self::acquire_handle`]
    pub fn release_handle(&self, handle: B::Device) {
        trace!(
            "Releasing handle for device {} at bus {}",
            handle.address(),
            handle.bus_number()
        );
        drop(handle);
    }

    /// Run `f` with a temporarily acquired handle
    ///
    /// The handle is released when `f` returns or unwinds.
    pub fn with_device<T>(
        &self,
        id: &DeviceId,
        f: impl FnOnce(&B::Device) -> T,
    ) -> Result<T, TopologyError> {
        let handle = self.acquire_handle(id)?;
        let result = f(&handle);
        self.release_handle(handle);
        Ok(result)
    }
}
