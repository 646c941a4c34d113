//! USB device manager
//!
//! Owns the resident topology and reconciles it with the bus. Each scan
//! lists the devices currently present, then
//! 1. detaches and forgets every resident device that is gone, and only then
//! 2. attaches and registers every device seen for the first time.
//!
//! Running removals first means a device that vanished and another device
//! that picked up its address in the same cycle are never merged.
//!
//! Concurrency: scans are serialized by the scan state lock. Readers never
//! take it, so they are not held up by a slow native listing, and can observe
//! the map between the two phases of a cycle.

use crate::error::TopologyError;
use crate::usb::backend::{LibusbBackend, NativeDevice, UsbBackend};
use crate::usb::device::{RootHub, UsbNode};
use crate::usb::gateway::{EnumerationGateway, SnapshotEntry};
use crate::usb::id::DeviceId;
use crate::usb::tree::TopologyTree;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

type Node<B> = Arc<UsbNode<<B as UsbBackend>::Device>>;
type ResidentMap<B> = HashMap<DeviceId, Node<B>>;

/// Outcome of one reconciliation cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    /// Devices seen for the first time
    pub added: Vec<DeviceId>,
    /// Devices no longer present
    pub removed: Vec<DeviceId>,
    /// Resident devices not attached to any hub after the cycle
    pub orphaned: Vec<DeviceId>,
}

impl ScanReport {
    pub fn has_changes(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty()
    }
}

/// State only touched while scanning
#[derive(Debug, Default)]
struct ScanState {
    cycles: u64,
}

/// USB device manager
///
/// Manages the resident topology: every known device keyed by identity,
/// plus the tree rooted at the virtual root hub.
pub struct DeviceManager<B: UsbBackend = LibusbBackend> {
    /// Enumeration gateway
    gateway: EnumerationGateway<B>,
    /// Virtual root hub, parent of every device without a parent
    root_hub: RootHub<B::Device>,
    /// Registry of resident devices
    devices: RwLock<ResidentMap<B>>,
    /// Resident devices waiting for their parent hub
    ///
    /// Written with the registry lock held; read on its own.
    orphans: RwLock<HashSet<DeviceId>>,
    /// Serializes scans
    scan_state: Mutex<ScanState>,
    /// Set once a scan completed successfully
    scanned: AtomicBool,
}

impl DeviceManager<LibusbBackend> {
    /// Create a device manager on a fresh libusb context
    pub fn with_libusb() -> Result<Self, TopologyError> {
        let backend = LibusbBackend::new().map_err(TopologyError::Init)?;
        Ok(Self::new(backend))
    }
}

impl<B: UsbBackend> DeviceManager<B> {
    /// Create a new device manager
    ///
    /// The topology stays empty until the first scan.
    pub fn new(backend: B) -> Self {
        Self {
            gateway: EnumerationGateway::new(backend),
            root_hub: RootHub::new(),
            devices: RwLock::new(HashMap::new()),
            orphans: RwLock::new(HashSet::new()),
            scan_state: Mutex::new(ScanState::default()),
            scanned: AtomicBool::new(false),
        }
    }

    /// Scan the USB busses for new or removed devices
    ///
    /// On enumeration failure the resident topology is left untouched.
    pub fn scan(&self) -> Result<ScanReport, TopologyError> {
        let mut state = self.lock_scan_state();
        self.scan_locked(&mut state)
    }

    /// Scan only if no scan completed yet
    ///
    /// Concurrent callers block until the first scan finished; only one of
    /// them actually scans.
    pub fn first_scan(&self) -> Result<(), TopologyError> {
        let mut state = self.lock_scan_state();
        if self.has_scanned() {
            return Ok(());
        }
        self.scan_locked(&mut state).map(|_| ())
    }

    /// Whether at least one scan completed
    pub fn has_scanned(&self) -> bool {
        self.scanned.load(Ordering::Acquire)
    }

    fn scan_locked(&self, state: &mut ScanState) -> Result<ScanReport, TopologyError> {
        let snapshot = self
            .gateway
            .list_current_devices()
            .map_err(TopologyError::into_scan_error)?;

        let found: HashSet<DeviceId> = snapshot.iter().map(|entry| entry.id).collect();
        let fresh = self.build_new_nodes(snapshot);

        let mut removed = self.process_removed_devices(&found);
        let mut added = self.process_new_devices(fresh);

        state.cycles += 1;
        self.scanned.store(true, Ordering::Release);

        removed.sort();
        added.sort();

        let report = ScanReport {
            added,
            removed,
            orphaned: self.orphans(),
        };

        if report.has_changes() {
            debug!(
                "Scan cycle {}: {} added, {} removed, {} resident",
                state.cycles,
                report.added.len(),
                report.removed.len(),
                self.len()
            );
        }

        Ok(report)
    }

    /// Create nodes for listed devices that are not resident yet
    ///
    /// Handles of devices that are already resident are released here.
    fn build_new_nodes(&self, snapshot: Vec<SnapshotEntry<B::Device>>) -> Vec<Node<B>> {
        let devices = self.read_devices();
        let mut fresh: HashMap<DeviceId, Node<B>> = HashMap::new();

        for SnapshotEntry {
            handle,
            id,
            parent_id,
        } in snapshot
        {
            if devices.contains_key(&id) {
                continue;
            }
            if fresh.contains_key(&id) {
                debug!("Duplicate device {} in listing, ignoring", id);
                continue;
            }

            let speed = handle.speed();
            fresh.insert(id, Arc::new(UsbNode::new(id, parent_id, speed, handle)));
        }

        fresh.into_values().collect()
    }

    /// Detach and forget every resident device missing from `found`
    fn process_removed_devices(&self, found: &HashSet<DeviceId>) -> Vec<DeviceId> {
        let mut devices = self.write_devices();
        let mut orphans = self.write_orphans();

        let gone: Vec<Node<B>> = devices
            .values()
            .filter(|node| !found.contains(node.id()))
            .cloned()
            .collect();

        // Parents removed in this cycle are still in the map at this point
        for node in &gone {
            self.detach(&devices, node);
        }

        for node in &gone {
            devices.remove(node.id());
            orphans.remove(node.id());
            info!("Device disconnected: {}", node.id());
        }

        // Whatever is still hanging off a removed hub has lost its parent
        for node in &gone {
            for child in node.disconnect_all() {
                if devices.contains_key(child.id()) {
                    warn!(
                        "Device {} lost its parent hub {}, waiting for it to reappear",
                        child.id(),
                        node.id()
                    );
                    orphans.insert(*child.id());
                }
            }
        }

        gone.iter().map(|node| *node.id()).collect()
    }

    /// Attach and register newly found devices
    fn process_new_devices(&self, fresh: Vec<Node<B>>) -> Vec<DeviceId> {
        let mut devices = self.write_devices();
        let mut orphans = self.write_orphans();
        let mut added = Vec::with_capacity(fresh.len());
        let mut pending = fresh;

        // Listing order is arbitrary, so a child can show up before its new
        // parent hub. Keep going while each round attaches something.
        loop {
            let before = pending.len();
            let mut waiting = Vec::new();

            for node in pending {
                if self.attach(&devices, &node) {
                    let id = *node.id();
                    info!("Device connected: {}", id);
                    devices.insert(id, node);
                    added.push(id);
                } else {
                    waiting.push(node);
                }
            }

            pending = waiting;
            if pending.is_empty() || pending.len() == before {
                break;
            }
        }

        // Register the rest unattached; they are retried every cycle
        for node in pending {
            let id = *node.id();
            if let Some(parent_id) = node.parent_id() {
                warn!(
                    "Parent {} of device {} is not a connected hub, deferring attachment",
                    parent_id, id
                );
            }
            info!("Device connected: {}", id);
            devices.insert(id, node);
            orphans.insert(id);
            added.push(id);
        }

        // Orphans attach below any resident hub, even an unattached one
        orphans.retain(|id| match devices.get(id) {
            Some(node) => {
                let attached = self.attach(&devices, node);
                if attached {
                    debug!("Device {} attached to its parent hub", id);
                }
                !attached
            }
            None => false,
        });

        added
    }

    /// Attach `node` to its parent
    ///
    /// Returns false when the parent is not a resident hub.
    fn attach(&self, devices: &ResidentMap<B>, node: &Node<B>) -> bool {
        match node.parent_id() {
            None => {
                self.root_hub.connect_usb_device(Arc::clone(node));
                true
            }
            Some(parent_id) => match devices.get(parent_id) {
                Some(parent) => parent.connect_usb_device(Arc::clone(node)).is_ok(),
                None => false,
            },
        }
    }

    /// Detach `node` from its parent, if the parent is still resident
    fn detach(&self, devices: &ResidentMap<B>, node: &Node<B>) {
        match node.parent_id() {
            None => {
                self.root_hub.disconnect_usb_device(node.id());
            }
            Some(parent_id) => match devices.get(parent_id) {
                Some(parent) => {
                    parent.disconnect_usb_device(node.id());
                }
                None => debug!(
                    "Parent {} of {} already gone, skipping detach",
                    parent_id,
                    node.id()
                ),
            },
        }
    }

    /// Get a resident device by identity
    pub fn get_device(&self, id: &DeviceId) -> Option<Node<B>> {
        self.read_devices().get(id).cloned()
    }

    pub fn contains(&self, id: &DeviceId) -> bool {
        self.read_devices().contains_key(id)
    }

    /// All resident devices, ordered by identity
    pub fn devices(&self) -> Vec<Node<B>> {
        let mut nodes: Vec<_> = self.read_devices().values().cloned().collect();
        nodes.sort_by(|a, b| a.id().cmp(b.id()));
        nodes
    }

    /// Identities of all resident devices
    pub fn device_ids(&self) -> HashSet<DeviceId> {
        self.read_devices().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.read_devices().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resident devices currently not attached to a parent hub
    pub fn orphans(&self) -> Vec<DeviceId> {
        let mut orphans: Vec<_> = self
            .orphans
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .collect();
        orphans.sort();
        orphans
    }

    pub fn root_hub(&self) -> &RootHub<B::Device> {
        &self.root_hub
    }

    pub fn gateway(&self) -> &EnumerationGateway<B> {
        &self.gateway
    }

    /// Snapshot of the tree below the root hub
    pub fn tree(&self) -> TopologyTree {
        TopologyTree::capture(&self.root_hub)
    }

    /// Get a fresh native handle for a connected device
    ///
    /// The handle must be released with [`Self::release_handle`] (dropping it
    /// has the same effect).
    pub fn get_device_handle(&self, id: &DeviceId) -> Result<B::Device, TopologyError> {
        self.gateway.acquire_handle(id)
    }

    pub fn release_handle(&self, handle: B::Device) {
        self.gateway.release_handle(handle);
    }

    /// Run `f` with a temporarily acquired handle for `id`
    pub fn with_device<T>(
        &self,
        id: &DeviceId,
        f: impl FnOnce(&B::Device) -> T,
    ) -> Result<T, TopologyError> {
        self.gateway.with_device(id, f)
    }

    /// Tear down the manager
    ///
    /// Releases every handle held by the topology and the enumeration
    /// context. Consuming `self` rules out scans afterwards.
    pub fn dispose(self) {
        info!("Disposing USB device manager with {} devices", self.len());
        drop(self);
    }

    fn read_devices(&self) -> RwLockReadGuard<'_, ResidentMap<B>> {
        self.devices.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_devices(&self) -> RwLockWriteGuard<'_, ResidentMap<B>> {
        self.devices.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_orphans(&self) -> RwLockWriteGuard<'_, HashSet<DeviceId>> {
        self.orphans.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_scan_state(&self) -> MutexGuard<'_, ScanState> {
        self.scan_state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
