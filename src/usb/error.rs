//! USB subsystem error type.

use crate::error::{ErrorClass, ErrorKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbError {
    /// Caller passed an out-of-range endpoint/interface index or malformed request.
    InvalidArgument,
    /// Hub still powering a port, address bitmap momentarily contended.
    NotReady,
    /// Descriptor parse failure, stall/NAK from the device, mismatched child count.
    DeviceError,
    /// A requested item (endpoint index, language ID, configuration value) is absent.
    NotFound,
    /// Bounded port-reset/recovery wait exceeded.
    Timeout,
    /// Address bitmap exhausted, or a bounded table (devices/controllers/configs) is full.
    OutOfResources,
    /// Isochronous transfers; requested on a hub controller where forbidden.
    Unsupported,
}

impl ErrorClass for UsbError {
    fn kind(&self) -> ErrorKind {
        match self {
            UsbError::InvalidArgument | UsbError::NotFound => ErrorKind::InvalidArgument,
            UsbError::NotReady => ErrorKind::NotReady,
            UsbError::DeviceError => ErrorKind::DeviceError,
            UsbError::Timeout => ErrorKind::Timeout,
            UsbError::OutOfResources => ErrorKind::OutOfResources,
            UsbError::Unsupported => ErrorKind::Unsupported,
        }
    }
}
