//! Native enumeration subsystem
//!
//! The reconciliation engine only talks to libusb through these two traits.
//! [`LibusbBackend`] implements them on top of `rusb`; tests plug in the mock
//! backend from [`crate::test_utils`].
//!
//! Reference counting follows Rust ownership: cloning a [`NativeDevice`] takes
//! a new native reference and dropping it gives the reference back. A handle
//! value can therefore be released at most once, and is released on every
//! exit path, early returns included.

use crate::usb::id::DescriptorSnapshot;
use rusb::{Context, Device, UsbContext};
use serde::Serialize;
use std::fmt;
use tracing::debug;

/// Negotiated device speed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
pub enum DeviceSpeed {
    #[default]
    Unknown,
    Low,
    Full,
    High,
    Super,
    SuperPlus,
}

impl fmt::Display for DeviceSpeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DeviceSpeed::Unknown => "unknown",
            DeviceSpeed::Low => "1.5M",
            DeviceSpeed::Full => "12M",
            DeviceSpeed::High => "480M",
            DeviceSpeed::Super => "5000M",
            DeviceSpeed::SuperPlus => "10000M",
        };
        f.write_str(label)
    }
}

impl From<rusb::Speed> for DeviceSpeed {
    fn from(speed: rusb::Speed) -> Self {
        match speed {
            rusb::Speed::Low => DeviceSpeed::Low,
            rusb::Speed::Full => DeviceSpeed::Full,
            rusb::Speed::High => DeviceSpeed::High,
            rusb::Speed::Super => DeviceSpeed::Super,
            rusb::Speed::SuperPlus => DeviceSpeed::SuperPlus,
            _ => DeviceSpeed::Unknown,
        }
    }
}

/// A reference counted native device handle
///
/// `Clone` takes a native reference, `Drop` releases it.
pub trait NativeDevice: Clone + Send + Sync + 'static {
    fn bus_number(&self) -> u8;

    fn address(&self) -> u8;

    /// Port on the parent hub, 0 when unknown
    fn port_number(&self) -> u8;

    fn speed(&self) -> DeviceSpeed;

    fn device_descriptor(&self) -> rusb::Result<DescriptorSnapshot>;

    /// Parent device in the physical tree, `None` for devices on a root port
    ///
    /// Only valid while the device list this handle came from is alive.
    fn parent(&self) -> Option<Self>;
}

/// Access to the native device list
pub trait UsbBackend: Send + Sync + 'static {
    type Device: NativeDevice;

    /// List the devices currently on the bus and hand them to `f`
    ///
    /// The native list stays alive while `f` runs and is freed right after.
    /// Parent links are only valid inside that window, so [`NativeDevice::parent`]
    /// must be called from `f`. Every handle passed in carries its own
    /// reference; handles `f` keeps outlive the list.
    fn with_device_list<T>(&self, f: impl FnOnce(Vec<Self::Device>) -> T) -> rusb::Result<T>;
}

/// libusb backed enumeration
///
/// Dropping the backend (and every device handle obtained from it) exits the
/// libusb context.
pub struct LibusbBackend {
    context: Context,
}

impl LibusbBackend {
    /// Initialize a fresh libusb context
    pub fn new() -> rusb::Result<Self> {
        let context = Context::new()?;
        debug!("libusb context initialized");
        Ok(Self { context })
    }

    pub fn context(&self) -> &Context {
        &self.context
    }
}

impl UsbBackend for LibusbBackend {
    type Device = Device<Context>;

    fn with_device_list<T>(&self, f: impl FnOnce(Vec<Self::Device>) -> T) -> rusb::Result<T> {
        // `DeviceList` frees the libusb list (unreferencing its entries) on
        // drop, which must come after every `get_parent` call made by `f`.
        // The iterator hands out separately referenced devices.
        let list = self.context.devices()?;
        let result = f(list.iter().collect());
        drop(list);
        Ok(result)
    }
}

impl NativeDevice for Device<Context> {
    fn bus_number(&self) -> u8 {
        Device::bus_number(self)
    }

    fn address(&self) -> u8 {
        Device::address(self)
    }

    fn port_number(&self) -> u8 {
        Device::port_number(self)
    }

    fn speed(&self) -> DeviceSpeed {
        Device::speed(self).into()
    }

    fn device_descriptor(&self) -> rusb::Result<DescriptorSnapshot> {
        Device::device_descriptor(self).map(|desc| DescriptorSnapshot::from(&desc))
    }

    fn parent(&self) -> Option<Self> {
        self.get_parent()
    }
}
