//! USB device identity
//!
//! A [`DeviceId`] pins a physical device down for the lifetime of one
//! connection. Addresses are recycled by the bus after a disconnect, so the
//! device descriptor is part of the identity: a different device picking up a
//! freed address in the same scan cycle never compares equal to the old one.

use crate::usb::backend::NativeDevice;
use serde::Serialize;
use std::fmt;
use tracing::warn;

/// USB hub device class code
pub const CLASS_HUB: u8 = 0x09;

/// Binary coded version number as found in device descriptors
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct UsbVersion {
    pub major: u8,
    pub minor: u8,
    pub sub_minor: u8,
}

impl UsbVersion {
    pub fn new(major: u8, minor: u8, sub_minor: u8) -> Self {
        Self {
            major,
            minor,
            sub_minor,
        }
    }
}

impl From<rusb::Version> for UsbVersion {
    fn from(version: rusb::Version) -> Self {
        Self::new(version.major(), version.minor(), version.sub_minor())
    }
}

impl fmt::Display for UsbVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}{}", self.major, self.minor, self.sub_minor)
    }
}

/// Immutable snapshot of the identity relevant fields of a device descriptor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct DescriptorSnapshot {
    pub usb_version: UsbVersion,
    pub class_code: u8,
    pub sub_class_code: u8,
    pub protocol_code: u8,
    pub max_packet_size: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub device_version: UsbVersion,
    pub manufacturer_string_index: Option<u8>,
    pub product_string_index: Option<u8>,
    pub serial_number_string_index: Option<u8>,
    pub num_configurations: u8,
}

impl DescriptorSnapshot {
    /// Whether the descriptor announces a hub
    pub fn is_hub(&self) -> bool {
        self.class_code == CLASS_HUB
    }
}

impl From<&rusb::DeviceDescriptor> for DescriptorSnapshot {
    fn from(desc: &rusb::DeviceDescriptor) -> Self {
        Self {
            usb_version: desc.usb_version().into(),
            class_code: desc.class_code(),
            sub_class_code: desc.sub_class_code(),
            protocol_code: desc.protocol_code(),
            max_packet_size: desc.max_packet_size(),
            vendor_id: desc.vendor_id(),
            product_id: desc.product_id(),
            device_version: desc.device_version().into(),
            manufacturer_string_index: desc.manufacturer_string_index(),
            product_string_index: desc.product_string_index(),
            serial_number_string_index: desc.serial_number_string_index(),
            num_configurations: desc.num_configurations(),
        }
    }
}

/// Identity of a connected USB device
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct DeviceId {
    bus_number: u8,
    address: u8,
    port_number: u8,
    descriptor: DescriptorSnapshot,
}

impl DeviceId {
    pub fn new(
        bus_number: u8,
        address: u8,
        port_number: u8,
        descriptor: DescriptorSnapshot,
    ) -> Self {
        Self {
            bus_number,
            address,
            port_number,
            descriptor,
        }
    }

    /// Build the identity of a native device
    ///
    /// Returns `None` when the device descriptor cannot be read. The device
    /// must then be ignored until the next scan.
    pub fn resolve<D: NativeDevice>(device: &D) -> Option<Self> {
        let bus_number = device.bus_number();
        let address = device.address();

        match device.device_descriptor() {
            Ok(descriptor) => Some(Self::new(
                bus_number,
                address,
                device.port_number(),
                descriptor,
            )),
            Err(e) => {
                warn!(
                    "Unable to get device descriptor for device {} at bus {}: {}",
                    address, bus_number, e
                );
                None
            }
        }
    }

    pub fn bus_number(&self) -> u8 {
        self.bus_number
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn port_number(&self) -> u8 {
        self.port_number
    }

    pub fn descriptor(&self) -> &DescriptorSnapshot {
        &self.descriptor
    }

    pub fn vendor_id(&self) -> u16 {
        self.descriptor.vendor_id
    }

    pub fn product_id(&self) -> u16 {
        self.descriptor.product_id
    }

    pub fn is_hub(&self) -> bool {
        self.descriptor.is_hub()
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "bus {:03} device {:03} port {} ({:04x}:{:04x})",
            self.bus_number,
            self.address,
            self.port_number,
            self.descriptor.vendor_id,
            self.descriptor.product_id
        )
    }
}
