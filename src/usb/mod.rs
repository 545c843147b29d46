//! USB bus enumerator: topology discovery, descriptor parsing, and the
//! per-interface transfer surface (spec.md §1-§4, §9's "THE CORE" half 1).

pub mod bus;
pub mod controller;
pub mod descriptors;
pub mod devpath;
pub mod disconnect;
pub mod error;
pub mod hcc;
pub mod hub;
pub mod io;

pub use bus::Bus;
pub use controller::{Controller, ControllerHandle, Device, DeviceHandle, UsbSpeed};
pub use error::UsbError;
pub use hcc::HostControllerCapability;
pub use io::UsbIoHandle;
