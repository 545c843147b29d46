//! `is_device_disconnected` (spec.md §4.4): queries the parent-hub port
//! status, using the root-hub HCC surface directly when the parent is the
//! root hub, or the parent hub's own control-transfer surface otherwise,
//! recursing on hub-query failure since the parent itself may be gone.

use super::bus::{Bus, PortSource};
use super::controller::ControllerHandle;
use super::hcc::{HostControllerCapability, PortStatus};
use crate::time::PlatformClock;

/// `true` if the controller's parent port no longer reports the device as
/// connected (or the parent hub itself could not be queried, in which case
/// the device is assumed gone too).
pub fn is_device_disconnected<H: HostControllerCapability, C: PlatformClock>(
    bus: &Bus<'_, H, C>,
    controller: ControllerHandle,
) -> bool {
    let Some(ctrl) = bus.controllers().get(controller) else {
        return true;
    };
    let source = match ctrl.parent_hub {
        None => PortSource::Root,
        Some(hub) => PortSource::Hub(hub),
    };
    match bus.query_port_status(source, ctrl.parent_port) {
        Ok(status) => !status.contains(PortStatus::CONNECTED),
        Err(_) => {
            // The parent hub may itself be gone; recurse on its own
            // parent if it's a nested hub, otherwise treat as disconnected.
            if let PortSource::Hub(hub) = source {
                return is_device_disconnected(bus, hub);
            }
            true
        }
    }
}
