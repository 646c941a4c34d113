//! usb-topology
//!
//! Live model of the USB device tree attached to the host, rooted at a
//! virtual root hub and kept in sync with the bus by periodic re-enumeration.
//!
//! ```no_run
//! use std::sync::Arc;
//! use usb_topology::{DEFAULT_SCAN_INTERVAL, DeviceManager, ScanScheduler};
//!
//! # async fn run() -> Result<(), usb_topology::TopologyError> {
//! let manager = Arc::new(DeviceManager::with_libusb()?);
//! manager.first_scan()?;
//! println!("{}", manager.tree());
//!
//! let scheduler = ScanScheduler::start(Arc::clone(&manager), DEFAULT_SCAN_INTERVAL)?;
//! // ... query the topology while it is kept up to date ...
//! scheduler.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod test_utils;
pub mod usb;

pub use error::{Result, TopologyError};
pub use usb::{
    DEFAULT_SCAN_INTERVAL, DeviceId, DeviceManager, DeviceSpeed, LibusbBackend, RootHub,
    ScanReport, ScanScheduler, TopologyTree, UsbNode,
};
