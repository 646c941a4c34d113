//! Test utilities for usb-topology
//!
//! Provides a scriptable in-memory USB bus that implements [`UsbBackend`].
//! Every native reference it hands out is counted in a [`HandleLedger`], so
//! tests can check that handles are released exactly once.
//!
//! # Example
//!
//! ```
//! use usb_topology::test_utils::{MockBus, MockDeviceSpec};
//! use usb_topology::DeviceManager;
//!
//! let bus = MockBus::new();
//! let hub = MockDeviceSpec::hub(1, 1, 0);
//! bus.plug(hub.clone());
//! bus.plug(MockDeviceSpec::mass_storage(1, 2, 1).with_parent(&hub));
//!
//! let manager = DeviceManager::new(bus.clone());
//! manager.scan().unwrap();
//! assert_eq!(manager.len(), 2);
//! assert_eq!(bus.ledger().live(), 2);
//! ```

use crate::usb::backend::{DeviceSpeed, NativeDevice, UsbBackend};
use crate::usb::id::{CLASS_HUB, DescriptorSnapshot, DeviceId, UsbVersion};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Counts native references taken and given back
#[derive(Debug, Default)]
pub struct HandleLedger {
    acquired: AtomicUsize,
    released: AtomicUsize,
    /// Device lists currently alive
    open_lists: AtomicUsize,
    /// Parent lookups made while no device list was alive
    stale_parent_lookups: AtomicUsize,
}

impl HandleLedger {
    fn acquire(&self) {
        self.acquired.fetch_add(1, Ordering::SeqCst);
    }

    fn release(&self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    /// References currently held
    ///
    /// `released` is read first: a reference is always counted as acquired
    /// before it can be released, so the difference cannot go negative.
    pub fn live(&self) -> usize {
        let released = self.released();
        self.acquired() - released
    }

    /// Parent lookups that libusb would have answered from a freed list
    pub fn stale_parent_lookups(&self) -> usize {
        self.stale_parent_lookups.load(Ordering::SeqCst)
    }
}

/// Description of a device plugged into the mock bus
#[derive(Debug, Clone, PartialEq)]
pub struct MockDeviceSpec {
    pub bus_number: u8,
    pub address: u8,
    pub port_number: u8,
    pub speed: DeviceSpeed,
    pub descriptor: DescriptorSnapshot,
    /// When false, reading the descriptor fails
    pub readable: bool,
    pub parent: Option<Box<MockDeviceSpec>>,
}

/// Create a descriptor snapshot with the given class and VID:PID
pub fn mock_descriptor(class_code: u8, vendor_id: u16, product_id: u16) -> DescriptorSnapshot {
    DescriptorSnapshot {
        usb_version: UsbVersion::new(2, 0, 0),
        class_code,
        max_packet_size: 64,
        vendor_id,
        product_id,
        device_version: UsbVersion::new(1, 0, 0),
        num_configurations: 1,
        ..Default::default()
    }
}

impl MockDeviceSpec {
    pub fn new(bus_number: u8, address: u8, port_number: u8, descriptor: DescriptorSnapshot) -> Self {
        Self {
            bus_number,
            address,
            port_number,
            speed: DeviceSpeed::High,
            descriptor,
            readable: true,
            parent: None,
        }
    }

    /// A generic USB 2.0 hub
    pub fn hub(bus_number: u8, address: u8, port_number: u8) -> Self {
        Self::new(
            bus_number,
            address,
            port_number,
            mock_descriptor(CLASS_HUB, 0x05e3, 0x0608),
        )
    }

    /// A mass storage stick
    pub fn mass_storage(bus_number: u8, address: u8, port_number: u8) -> Self {
        Self::new(
            bus_number,
            address,
            port_number,
            mock_descriptor(0x00, 0x0781, 0x5581),
        )
    }

    /// A full speed HID device (keyboard/mouse receiver)
    pub fn hid(bus_number: u8, address: u8, port_number: u8) -> Self {
        Self::new(
            bus_number,
            address,
            port_number,
            mock_descriptor(0x00, 0x046d, 0xc52b),
        )
        .with_speed(DeviceSpeed::Full)
    }

    pub fn with_parent(mut self, parent: &MockDeviceSpec) -> Self {
        self.parent = Some(Box::new(parent.clone()));
        self
    }

    pub fn with_speed(mut self, speed: DeviceSpeed) -> Self {
        self.speed = speed;
        self
    }

    /// Make descriptor reads fail for this device
    pub fn unreadable(mut self) -> Self {
        self.readable = false;
        self
    }

    /// Identity the manager will compute for this device
    pub fn id(&self) -> DeviceId {
        DeviceId::new(
            self.bus_number,
            self.address,
            self.port_number,
            self.descriptor,
        )
    }
}

/// Native handle of a mock device
#[derive(Debug)]
pub struct MockDevice {
    spec: Arc<MockDeviceSpec>,
    ledger: Arc<HandleLedger>,
}

impl MockDevice {
    fn new(spec: Arc<MockDeviceSpec>, ledger: Arc<HandleLedger>) -> Self {
        ledger.acquire();
        Self { spec, ledger }
    }

    pub fn spec(&self) -> &MockDeviceSpec {
        &self.spec
    }
}

impl Clone for MockDevice {
    fn clone(&self) -> Self {
        Self::new(Arc::clone(&self.spec), Arc::clone(&self.ledger))
    }
}

impl Drop for MockDevice {
    fn drop(&mut self) {
        self.ledger.release();
    }
}

impl NativeDevice for MockDevice {
    fn bus_number(&self) -> u8 {
        self.spec.bus_number
    }

    fn address(&self) -> u8 {
        self.spec.address
    }

    fn port_number(&self) -> u8 {
        self.spec.port_number
    }

    fn speed(&self) -> DeviceSpeed {
        self.spec.speed
    }

    fn device_descriptor(&self) -> rusb::Result<DescriptorSnapshot> {
        if self.spec.readable {
            Ok(self.spec.descriptor)
        } else {
            Err(rusb::Error::Io)
        }
    }

    fn parent(&self) -> Option<Self> {
        if self.ledger.open_lists.load(Ordering::SeqCst) == 0 {
            self.ledger
                .stale_parent_lookups
                .fetch_add(1, Ordering::SeqCst);
        }
        self.spec.parent.as_ref().map(|parent| {
            MockDevice::new(Arc::new(parent.as_ref().clone()), Arc::clone(&self.ledger))
        })
    }
}

#[derive(Debug, Default)]
struct BusState {
    devices: Vec<MockDeviceSpec>,
    failure: Option<rusb::Error>,
    list_delay: Option<Duration>,
}

#[derive(Debug, Default)]
struct MockBusInner {
    state: Mutex<BusState>,
    ledger: Arc<HandleLedger>,
    list_calls: AtomicUsize,
}

/// Scriptable USB bus
///
/// Clones share the same bus, so a test can keep one clone and hand another
/// to the [`crate::DeviceManager`].
#[derive(Debug, Clone, Default)]
pub struct MockBus {
    inner: Arc<MockBusInner>,
}

impl MockBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_devices(devices: Vec<MockDeviceSpec>) -> Self {
        let bus = Self::new();
        bus.set_devices(devices);
        bus
    }

    fn state(&self) -> std::sync::MutexGuard<'_, BusState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the whole bus content
    pub fn set_devices(&self, devices: Vec<MockDeviceSpec>) {
        self.state().devices = devices;
    }

    pub fn plug(&self, device: MockDeviceSpec) {
        self.state().devices.push(device);
    }

    pub fn unplug(&self, device: &MockDeviceSpec) {
        self.state().devices.retain(|d| d != device);
    }

    /// Make listing fail with `error` until cleared with `None`
    pub fn fail_with(&self, error: Option<rusb::Error>) {
        self.state().failure = error;
    }

    /// Make every listing block for `delay` before returning devices
    pub fn set_list_delay(&self, delay: Option<Duration>) {
        self.state().list_delay = delay;
    }

    pub fn ledger(&self) -> &HandleLedger {
        &self.inner.ledger
    }

    /// Number of times the device list was requested
    pub fn list_calls(&self) -> usize {
        self.inner.list_calls.load(Ordering::SeqCst)
    }

    /// Create a standalone handle for `spec`, counted in the ledger
    pub fn handle(&self, spec: &MockDeviceSpec) -> MockDevice {
        MockDevice::new(Arc::new(spec.clone()), Arc::clone(&self.inner.ledger))
    }
}

impl UsbBackend for MockBus {
    type Device = MockDevice;

    fn with_device_list<T>(&self, f: impl FnOnce(Vec<MockDevice>) -> T) -> rusb::Result<T> {
        self.inner.list_calls.fetch_add(1, Ordering::SeqCst);

        let (devices, delay) = {
            let state = self.state();
            if let Some(error) = state.failure {
                return Err(error);
            }
            (state.devices.clone(), state.list_delay)
        };

        if let Some(delay) = delay {
            thread::sleep(delay);
        }

        let ledger = self.ledger();
        ledger.open_lists.fetch_add(1, Ordering::SeqCst);
        let result = f(devices.iter().map(|spec| self.handle(spec)).collect());
        ledger.open_lists.fetch_sub(1, Ordering::SeqCst);
        Ok(result)
    }
}

/// Poll `condition` until it holds or `timeout` expires
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
