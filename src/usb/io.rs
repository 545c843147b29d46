//! The per-interface USB-IO transfer surface (spec.md §4.3), exposed as a
//! lightweight handle over a `ControllerHandle` plus the owning `Bus` — the
//! teacher's `EhciController` implements transfer methods directly
//! (`ehci.rs`); this crate's `HostControllerCapability` abstracts over that
//! one level higher, so `UsbIoHandle` only has to orchestrate cache
//! look-ups, toggle bookkeeping, and the disconnect short-circuit, not the
//! wire protocol itself.

use super::bus::{Bus, PortSource};
use super::controller::ControllerHandle;
use super::descriptors::{
    DeviceDescriptor, EndpointDescriptor, InterfaceDescriptor, FEATURE_ENDPOINT_HALT,
    REQ_CLEAR_FEATURE,
};
use super::disconnect::is_device_disconnected;
use super::error::UsbError;
use super::hcc::{Direction, HostControllerCapability, SetupPacket};
use crate::time::PlatformClock;

#[derive(Debug, Clone, Copy)]
pub struct UsbIoHandle {
    pub controller: ControllerHandle,
}

impl UsbIoHandle {
    pub fn new(controller: ControllerHandle) -> Self {
        Self { controller }
    }

    fn source_and_port<H: HostControllerCapability, C: PlatformClock>(
        &self,
        bus: &Bus<'_, H, C>,
    ) -> Result<(PortSource, u8), UsbError> {
        let ctrl = bus.controller(self.controller).ok_or(UsbError::InvalidArgument)?;
        let source = match ctrl.parent_hub {
            None => PortSource::Root,
            Some(hub) => PortSource::Hub(hub),
        };
        Ok((source, ctrl.parent_port))
    }

    /// Control transfer: validates direction/length only, per spec.md §4.3.
    /// A CLEAR_FEATURE(ENDPOINT_HALT) additionally clears the endpoint's
    /// toggle, but only if the transfer reports no error, and only after
    /// probing the parent port to short-circuit already-detached devices.
    pub fn control_transfer<H: HostControllerCapability, C: PlatformClock>(
        &self,
        bus: &mut Bus<'_, H, C>,
        setup: SetupPacket,
        direction: Direction,
        data: &mut [u8],
    ) -> Result<usize, UsbError> {
        let is_clear_halt = setup.request == REQ_CLEAR_FEATURE && setup.value == FEATURE_ENDPOINT_HALT;
        if is_clear_halt && is_device_disconnected(bus, self.controller) {
            return Err(UsbError::DeviceError);
        }

        let (address, max_packet_size0, interface_number) = {
            let ctrl = bus.controller(self.controller).ok_or(UsbError::InvalidArgument)?;
            let device = bus.device(ctrl.device).ok_or(UsbError::DeviceError)?;
            (device.address, device.descriptor.max_packet_size0, ctrl.interface_number)
        };

        let result = bus
            .hcc()
            .control_transfer(address, max_packet_size0, setup, direction, data);

        if is_clear_halt && result.is_ok() {
            let endpoint = setup.index as u8;
            let device = bus.controller(self.controller).map(|c| c.device);
            if let Some(device) = device {
                if let Some(toggle) = bus.endpoint_toggle_mut(device, interface_number, endpoint) {
                    *toggle = false;
                }
            }
        }
        result
    }

    /// Bulk transfer: `endpoint & 0x7F` must be 1..=15 with bulk attributes.
    /// Toggle is written back only if the HCC reported a different value
    /// (some controllers don't update it — spec.md §4.3).
    pub fn bulk_transfer<H: HostControllerCapability, C: PlatformClock>(
        &self,
        bus: &mut Bus<'_, H, C>,
        endpoint: u8,
        direction: Direction,
        data: &mut [u8],
    ) -> Result<usize, UsbError> {
        self.transfer_checked(
            bus,
            endpoint,
            direction,
            data,
            super::descriptors::EP_ATTR_BULK,
            |hcc, address, max_packet_size, dir, buf, toggle| {
                hcc.bulk_transfer(address, endpoint & 0x7F, max_packet_size, dir, buf, toggle)
            },
        )
    }

    /// Synchronous interrupt transfer: identical contract to bulk, but
    /// requires interrupt attributes.
    pub fn sync_interrupt_transfer<H: HostControllerCapability, C: PlatformClock>(
        &self,
        bus: &mut Bus<'_, H, C>,
        endpoint: u8,
        direction: Direction,
        data: &mut [u8],
    ) -> Result<usize, UsbError> {
        self.transfer_checked(
            bus,
            endpoint,
            direction,
            data,
            super::descriptors::EP_ATTR_INTERRUPT,
            |hcc, address, max_packet_size, dir, buf, toggle| {
                hcc.sync_interrupt_transfer(address, endpoint & 0x7F, max_packet_size, dir, buf, toggle)
            },
        )
    }

    fn transfer_checked<H: HostControllerCapability, C: PlatformClock>(
        &self,
        bus: &mut Bus<'_, H, C>,
        endpoint: u8,
        direction: Direction,
        data: &mut [u8],
        expected_attr: u8,
        call: impl FnOnce(&H, u8, u16, Direction, &mut [u8], &mut bool) -> Result<usize, UsbError>,
    ) -> Result<usize, UsbError> {
        let number = endpoint & 0x7F;
        if !(1..=15).contains(&number) {
            return Err(UsbError::InvalidArgument);
        }
        let (address, interface_number, max_packet_size, mut toggle) = {
            let ctrl = bus.controller(self.controller).ok_or(UsbError::InvalidArgument)?;
            let device = bus.device(ctrl.device).ok_or(UsbError::DeviceError)?;
            let config = device.active_config_info().ok_or(UsbError::NotFound)?;
            let iface = config
                .interfaces
                .iter()
                .find(|i| i.descriptor.interface_number == ctrl.interface_number)
                .ok_or(UsbError::NotFound)?;
            let ep = iface
                .endpoints
                .iter()
                .find(|e| e.descriptor.number() == number)
                .ok_or(UsbError::NotFound)?;
            if ep.descriptor.transfer_type() != expected_attr {
                return Err(UsbError::InvalidArgument);
            }
            (
                device.address,
                ctrl.interface_number,
                ep.descriptor.max_packet_size,
                ep.data_toggle,
            )
        };

        let before = toggle;
        let result = call(bus.hcc(), address, max_packet_size, direction, data, &mut toggle);
        if toggle != before {
            if let Some(dev) = bus.controller(self.controller).map(|c| c.device) {
                if let Some(slot) = bus.endpoint_toggle_mut(dev, interface_number, number) {
                    *slot = toggle;
                }
            }
        }
        result
    }

    /// Arm/cancel a periodic interrupt subscription.
    pub fn async_interrupt_transfer<H: HostControllerCapability, C: PlatformClock>(
        &self,
        bus: &mut Bus<'_, H, C>,
        endpoint: u8,
        is_new: bool,
        polling_interval_ms: u16,
    ) -> Result<(), UsbError> {
        let number = endpoint & 0x7F;
        let (address, interface_number, max_packet_size, mut toggle) = {
            let ctrl = bus.controller(self.controller).ok_or(UsbError::InvalidArgument)?;
            let device = bus.device(ctrl.device).ok_or(UsbError::DeviceError)?;
            let config = device.active_config_info().ok_or(UsbError::NotFound)?;
            let iface = config
                .interfaces
                .iter()
                .find(|i| i.descriptor.interface_number == ctrl.interface_number)
                .ok_or(UsbError::NotFound)?;
            let ep = iface
                .endpoints
                .iter()
                .find(|e| e.descriptor.number() == number)
                .ok_or(UsbError::NotFound)?;
            (
                device.address,
                ctrl.interface_number,
                ep.descriptor.max_packet_size,
                ep.data_toggle,
            )
        };
        let result = bus.hcc().async_interrupt_transfer(
            address,
            number,
            max_packet_size,
            is_new,
            polling_interval_ms,
            &mut toggle,
        );
        if !is_new {
            if let Some(dev) = bus.controller(self.controller).map(|c| c.device) {
                if let Some(slot) = bus.endpoint_toggle_mut(dev, interface_number, number) {
                    *slot = toggle;
                }
            }
        }
        result
    }

    pub fn isochronous_transfer<H: HostControllerCapability, C: PlatformClock>(
        &self,
        _bus: &Bus<'_, H, C>,
        _endpoint: u8,
        _data: &mut [u8],
    ) -> Result<usize, UsbError> {
        Err(UsbError::Unsupported)
    }

    pub fn async_isochronous_transfer<H: HostControllerCapability, C: PlatformClock>(
        &self,
        _bus: &Bus<'_, H, C>,
        _endpoint: u8,
        _data: &mut [u8],
    ) -> Result<(), UsbError> {
        Err(UsbError::Unsupported)
    }

    pub fn get_device_descriptor<H: HostControllerCapability, C: PlatformClock>(
        &self,
        bus: &Bus<'_, H, C>,
    ) -> Result<DeviceDescriptor, UsbError> {
        let ctrl = bus.controller(self.controller).ok_or(UsbError::InvalidArgument)?;
        let device = bus.device(ctrl.device).ok_or(UsbError::DeviceError)?;
        if device.active_configuration.is_none() {
            return Err(UsbError::NotReady);
        }
        Ok(device.descriptor)
    }

    pub fn get_active_config_descriptor<H: HostControllerCapability, C: PlatformClock>(
        &self,
        bus: &Bus<'_, H, C>,
    ) -> Result<super::descriptors::ConfigDescriptorHeader, UsbError> {
        let ctrl = bus.controller(self.controller).ok_or(UsbError::InvalidArgument)?;
        let device = bus.device(ctrl.device).ok_or(UsbError::DeviceError)?;
        device
            .active_config_info()
            .map(|c| c.header)
            .ok_or(UsbError::NotReady)
    }

    pub fn get_interface_descriptor<H: HostControllerCapability, C: PlatformClock>(
        &self,
        bus: &Bus<'_, H, C>,
    ) -> Result<InterfaceDescriptor, UsbError> {
        let ctrl = bus.controller(self.controller).ok_or(UsbError::InvalidArgument)?;
        let device = bus.device(ctrl.device).ok_or(UsbError::DeviceError)?;
        let config = device.active_config_info().ok_or(UsbError::NotReady)?;
        config
            .interfaces
            .iter()
            .find(|i| i.descriptor.interface_number == ctrl.interface_number)
            .map(|i| i.descriptor)
            .ok_or(UsbError::NotFound)
    }

    pub fn get_endpoint_descriptor<H: HostControllerCapability, C: PlatformClock>(
        &self,
        bus: &Bus<'_, H, C>,
        index: usize,
    ) -> Result<EndpointDescriptor, UsbError> {
        let ctrl = bus.controller(self.controller).ok_or(UsbError::InvalidArgument)?;
        let device = bus.device(ctrl.device).ok_or(UsbError::DeviceError)?;
        let config = device.active_config_info().ok_or(UsbError::NotReady)?;
        let iface = config
            .interfaces
            .iter()
            .find(|i| i.descriptor.interface_number == ctrl.interface_number)
            .ok_or(UsbError::NotFound)?;
        iface
            .endpoints
            .get(index)
            .map(|e| e.descriptor)
            .ok_or(UsbError::NotFound)
    }

    /// `lang = 0` returns `NotFound` without any wire transfer (spec.md §8
    /// boundary behavior).
    pub fn get_string_descriptor<H: HostControllerCapability, C: PlatformClock>(
        &self,
        bus: &Bus<'_, H, C>,
        lang: u16,
        id: u8,
        out: &mut [u8],
    ) -> Result<usize, UsbError> {
        if lang == 0 {
            return Err(UsbError::NotFound);
        }
        let ctrl = bus.controller(self.controller).ok_or(UsbError::InvalidArgument)?;
        let device = bus.device(ctrl.device).ok_or(UsbError::DeviceError)?;
        if !device.language_ids.contains(&lang) {
            return Err(UsbError::NotFound);
        }

        let setup_len = SetupPacket {
            request_type: 0x80,
            request: super::descriptors::REQ_GET_DESCRIPTOR,
            value: (super::descriptors::DESC_TYPE_STRING as u16) << 8 | id as u16,
            index: lang,
            length: 2,
        };
        let mut head = [0u8; 2];
        bus.hcc()
            .control_transfer(device.address, device.descriptor.max_packet_size0, setup_len, Direction::In, &mut head)?;
        let total = head[0] as usize;
        if total < 2 || total - 2 > out.len() {
            return Err(UsbError::OutOfResources);
        }

        let setup_full = SetupPacket {
            request_type: 0x80,
            request: super::descriptors::REQ_GET_DESCRIPTOR,
            value: (super::descriptors::DESC_TYPE_STRING as u16) << 8 | id as u16,
            index: lang,
            length: total as u16,
        };
        let mut buf = [0u8; 256];
        if total > buf.len() {
            return Err(UsbError::OutOfResources);
        }
        bus.hcc()
            .control_transfer(device.address, device.descriptor.max_packet_size0, setup_full, Direction::In, &mut buf[..total])?;
        // Strip the 2-byte (length, type) header; return the raw UCS-2 payload.
        let payload_len = total - 2;
        out[..payload_len].copy_from_slice(&buf[2..total]);
        Ok(payload_len)
    }

    /// Delegates to the build-new-device procedure's reset + re-address +
    /// re-configure steps (spec.md §4.3); forbidden on hub controllers.
    pub fn port_reset<H: HostControllerCapability, C: PlatformClock>(
        &self,
        bus: &mut Bus<'_, H, C>,
    ) -> Result<(), UsbError> {
        let ctrl = bus.controller(self.controller).ok_or(UsbError::InvalidArgument)?;
        if ctrl.is_hub() {
            return Err(UsbError::InvalidArgument);
        }
        let (source, port) = self.source_and_port(bus)?;
        bus.reapply_build_sequence(source, port)
    }
}
