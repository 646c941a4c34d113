//! USB topology node model
//!
//! A [`UsbNode`] is one physical device in the resident topology. Hubs carry a
//! [`Ports`] set of attached children; every other device is a leaf. The
//! synthetic [`RootHub`] sits above all devices that have no parent.

use crate::usb::backend::{DeviceSpeed, NativeDevice};
use crate::usb::id::DeviceId;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

/// Set of devices attached below a hub
pub struct Ports<D: NativeDevice> {
    attached: RwLock<HashMap<DeviceId, Arc<UsbNode<D>>>>,
}

impl<D: NativeDevice> Ports<D> {
    fn new() -> Self {
        Self {
            attached: RwLock::new(HashMap::new()),
        }
    }

    fn connect(&self, node: Arc<UsbNode<D>>) {
        self.attached
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(*node.id(), node);
    }

    fn disconnect(&self, id: &DeviceId) -> Option<Arc<UsbNode<D>>> {
        self.attached
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
    }

    fn drain(&self) -> Vec<Arc<UsbNode<D>>> {
        self.attached
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, node)| node)
            .collect()
    }

    /// Currently attached devices, in no particular order
    pub fn attached_devices(&self) -> Vec<Arc<UsbNode<D>>> {
        self.attached
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn contains(&self, id: &DeviceId) -> bool {
        self.attached
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.attached
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Role of a node in the tree
pub enum NodeKind<D: NativeDevice> {
    Hub(Ports<D>),
    NonHub,
}

/// A device in the resident topology
///
/// Everything except a hub's port set is fixed at construction. Two nodes are
/// equal when their identities are.
pub struct UsbNode<D: NativeDevice> {
    id: DeviceId,
    parent_id: Option<DeviceId>,
    speed: DeviceSpeed,
    handle: D,
    kind: NodeKind<D>,
}

impl<D: NativeDevice> UsbNode<D> {
    /// Create a node; hubs are recognized from the descriptor class
    pub fn new(id: DeviceId, parent_id: Option<DeviceId>, speed: DeviceSpeed, handle: D) -> Self {
        let kind = if id.is_hub() {
            NodeKind::Hub(Ports::new())
        } else {
            NodeKind::NonHub
        };

        Self {
            id,
            parent_id,
            speed,
            handle,
            kind,
        }
    }

    pub fn id(&self) -> &DeviceId {
        &self.id
    }

    pub fn parent_id(&self) -> Option<&DeviceId> {
        self.parent_id.as_ref()
    }

    pub fn speed(&self) -> DeviceSpeed {
        self.speed
    }

    /// Native handle held for the lifetime of the node
    pub fn handle(&self) -> &D {
        &self.handle
    }

    pub fn kind(&self) -> &NodeKind<D> {
        &self.kind
    }

    pub fn is_hub(&self) -> bool {
        matches!(self.kind, NodeKind::Hub(_))
    }

    /// Port set of a hub, `None` for leaf devices
    pub fn ports(&self) -> Option<&Ports<D>> {
        match &self.kind {
            NodeKind::Hub(ports) => Some(ports),
            NodeKind::NonHub => None,
        }
    }

    /// Attached children; always empty for leaf devices
    pub fn attached_devices(&self) -> Vec<Arc<UsbNode<D>>> {
        self.ports()
            .map(Ports::attached_devices)
            .unwrap_or_default()
    }

    /// Attach `node` below this hub
    ///
    /// Returns the node back when this is not a hub.
    pub fn connect_usb_device(&self, node: Arc<UsbNode<D>>) -> Result<(), Arc<UsbNode<D>>> {
        match &self.kind {
            NodeKind::Hub(ports) => {
                debug!("Connected {} to hub {}", node.id(), self.id);
                ports.connect(node);
                Ok(())
            }
            NodeKind::NonHub => Err(node),
        }
    }

    /// Detach the device with identity `id` from this hub
    pub fn disconnect_usb_device(&self, id: &DeviceId) -> Option<Arc<UsbNode<D>>> {
        let node = self.ports()?.disconnect(id);
        if node.is_some() {
            debug!("Disconnected {} from hub {}", id, self.id);
        }
        node
    }

    /// Detach every child, returning them
    pub(crate) fn disconnect_all(&self) -> Vec<Arc<UsbNode<D>>> {
        self.ports().map(Ports::drain).unwrap_or_default()
    }
}

impl<D: NativeDevice> PartialEq for UsbNode<D> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<D: NativeDevice> Eq for UsbNode<D> {}

impl<D: NativeDevice> Hash for UsbNode<D> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl<D: NativeDevice> std::fmt::Debug for UsbNode<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsbNode")
            .field("id", &self.id)
            .field("parent_id", &self.parent_id)
            .field("speed", &self.speed)
            .field("hub", &self.is_hub())
            .finish()
    }
}

/// Synthetic top of the device tree
pub struct RootHub<D: NativeDevice> {
    ports: Ports<D>,
}

impl<D: NativeDevice> RootHub<D> {
    pub fn new() -> Self {
        Self {
            ports: Ports::new(),
        }
    }

    pub fn connect_usb_device(&self, node: Arc<UsbNode<D>>) {
        debug!("Connected {} to root hub", node.id());
        self.ports.connect(node);
    }

    pub fn disconnect_usb_device(&self, id: &DeviceId) -> Option<Arc<UsbNode<D>>> {
        let node = self.ports.disconnect(id);
        if node.is_some() {
            debug!("Disconnected {} from root hub", id);
        }
        node
    }

    pub fn ports(&self) -> &Ports<D> {
        &self.ports
    }

    pub fn attached_devices(&self) -> Vec<Arc<UsbNode<D>>> {
        self.ports.attached_devices()
    }
}

impl<D: NativeDevice> Default for RootHub<D> {
    fn default() -> Self {
        Self::new()
    }
}
