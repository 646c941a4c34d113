//! USB subsystem
//!
//! Keeps the in-memory USB topology in sync with the bus by polling.
//!
//! This module implements:
//! - Device identity (bus, address, port and descriptor snapshot)
//! - The native backend seam and its libusb implementation
//! - The enumeration gateway (snapshots, parent lookup, handle acquisition)
//! - The hub / leaf node model below a virtual root hub
//! - Reconciliation of the resident topology against fresh snapshots
//! - The background scan scheduler
//!
//! Scans block on libusb, so the scheduler runs them on the Tokio blocking
//! pool instead of the async worker threads.

pub mod backend;
pub mod device;
pub mod gateway;
pub mod id;
pub mod manager;
pub mod scanner;
pub mod tree;

// Re-export public types
pub use backend::{DeviceSpeed, LibusbBackend, NativeDevice, UsbBackend};
pub use device::{NodeKind, Ports, RootHub, UsbNode};
pub use gateway::EnumerationGateway;
pub use id::{CLASS_HUB, DescriptorSnapshot, DeviceId, UsbVersion};
pub use manager::{DeviceManager, ScanReport};
pub use scanner::{DEFAULT_SCAN_INTERVAL, ScanScheduler};
pub use tree::{TopologyTree, TreeNode};
