//! Topology error types

use crate::usb::DeviceId;
use thiserror::Error;

/// Errors surfaced by the topology manager and scheduler
///
/// A device whose descriptor cannot be read is not an error: it is logged and
/// skipped for the current scan cycle.
#[derive(Debug, Error)]
pub enum TopologyError {
    /// The libusb context could not be created
    #[error("Unable to initialize libusb: {0}")]
    Init(#[source] rusb::Error),

    /// Listing devices failed outside of a scan cycle
    #[error("Unable to get USB device list: {0}")]
    Enumeration(#[from] rusb::Error),

    /// A scan cycle was aborted because the device list could not be read
    #[error("Unable to scan USB devices: {source}")]
    Scan {
        #[source]
        source: rusb::Error,
    },

    /// No connected device matches the requested identity
    #[error("USB device not found: {0}")]
    DeviceNotFound(DeviceId),

    /// Contract violation by the caller
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl TopologyError {
    /// Convert a listing failure into a scan failure
    pub(crate) fn into_scan_error(self) -> Self {
        match self {
            TopologyError::Enumeration(source) => TopologyError::Scan { source },
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, TopologyError>;
