//! Hub-specific read views over the controller/device arena.
//!
//! The hub bring-up sequence and the interrupt-event producer live in
//! `bus.rs` (they need mutable access to the arenas); this module holds the
//! read-only queries a class driver or the disconnect-detection path needs
//! against a hub controller, plus the status-change payload decoder.

use super::controller::{Arena, Controller, Device, DeviceHandle, HubFields, MAX_DEVICES, MAX_CONTROLLERS};

/// Decode a hub interrupt-IN status-change payload (one bit per port, bit 0
/// reserved for the hub's own status) into the lowest-numbered changed
/// port, per spec.md §4.2's "ties broken toward lower port index."
pub fn lowest_changed_port(payload: &[u8], num_ports: u8) -> Option<u8> {
    let bitmap = payload.first().copied().unwrap_or(0);
    (1..=num_ports).find(|port| bitmap & (1 << port) != 0)
}

/// A read-only view of a hub controller plus its owning device.
pub struct HubView<'a> {
    pub controller: &'a Controller,
    pub fields: &'a HubFields,
    pub device: &'a Device,
}

impl<'a> HubView<'a> {
    pub fn lookup(
        controllers: &'a Arena<Controller, MAX_CONTROLLERS>,
        devices: &'a Arena<Device, MAX_DEVICES>,
        hub: u16,
    ) -> Option<Self> {
        let controller = controllers.get(hub)?;
        let fields = controller.hub.as_ref()?;
        let device = devices.get(controller.device)?;
        Some(Self {
            controller,
            fields,
            device,
        })
    }

    pub fn child(&self, port: u8) -> Option<DeviceHandle> {
        self.fields.children.get(port as usize).copied().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowest_changed_port_prefers_lower_index() {
        // bits 2 and 4 set: port 2 should win.
        let payload = [0b0001_0100u8];
        assert_eq!(lowest_changed_port(&payload, 4), Some(2));
    }

    #[test]
    fn no_changed_port_returns_none() {
        let payload = [0u8];
        assert_eq!(lowest_changed_port(&payload, 4), None);
    }
}
