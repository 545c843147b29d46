//! `Bus`: the top-level USB enumerator state machine (spec.md §4.2).
//!
//! `poll()` is the single non-reentrant tick function a caller invokes from
//! its 1-second root-hub timer callback or from a hub's interrupt-completion
//! callback; per spec.md §9's "cooperative polling loop disguised as
//! interrupt callback" redesign, those callers only *enqueue* a port-changed
//! event (`on_root_timer_tick` / `on_hub_interrupt`) — `poll()` itself drains
//! the queue and does the actual reset/address/configure work.

use super::controller::{
    Arena, Controller, Device, DeviceHandle, HubFields, HubHandle, PortState, UsbSpeed,
    MAX_CONTROLLERS, MAX_DEVICES, MAX_HUB_PORTS,
};
use super::descriptors::{
    self, ConfigDescriptorHeader, Configuration, DeviceDescriptor, DESC_TYPE_DEVICE,
    DEVICE_DESCRIPTOR_LEN, FEATURE_ENDPOINT_HALT, REQ_GET_DESCRIPTOR, REQ_SET_ADDRESS,
    REQ_SET_CONFIGURATION,
};
use super::devpath::Fragment;
use super::error::UsbError;
use super::hcc::{Direction, HccResetAttributes, HostControllerCapability, PortFeature, PortStatus, SetupPacket};
use crate::time::{delay_ms, PlatformClock};
use heapless::{Deque, Vec};
use zerocopy::FromBytes;

/// Maximum root-hub ports tracked directly (bounded by the HCC's reported count).
pub const MAX_ROOT_PORTS: usize = 16;
/// Internal producer/consumer queue between the timer/interrupt callbacks and `poll()`.
pub const MAX_QUEUED_EVENTS: usize = 32;

const HUB_FEATURE_RESET: u16 = 4;
const HUB_FEATURE_ENABLE: u16 = 1;
const HUB_FEATURE_POWER: u16 = 8;
const HUB_FEATURE_C_CONNECTION: u16 = 16;
const HUB_FEATURE_C_ENABLE: u16 = 17;
const HUB_FEATURE_C_RESET: u16 = 20;
const HUB_FEATURE_C_OVER_CURRENT: u16 = 19;

fn feature_selector(f: PortFeature) -> u16 {
    match f {
        PortFeature::Reset => HUB_FEATURE_RESET,
        PortFeature::Enable => HUB_FEATURE_ENABLE,
        PortFeature::Power => HUB_FEATURE_POWER,
        PortFeature::ConnectChange => HUB_FEATURE_C_CONNECTION,
        PortFeature::ResetChange => HUB_FEATURE_C_RESET,
        PortFeature::EnableChange => HUB_FEATURE_C_ENABLE,
        PortFeature::OverCurrentChange => HUB_FEATURE_C_OVER_CURRENT,
    }
}

/// Where a port event originated: the root hub (handled directly through
/// the HCC) or a downstream hub (handled over that hub's control endpoint).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortSource {
    Root,
    Hub(HubHandle),
}

#[derive(Debug, Clone, Copy)]
pub enum PortEventKind {
    ConnectChange { connected: bool },
    OverCurrentChange,
    ResetChange,
    EnableChange,
}

#[derive(Debug, Clone, Copy)]
pub struct PortEvent {
    pub source: PortSource,
    pub port: u8,
    pub kind: PortEventKind,
}

/// Default reset-recovery tick: spec.md §9 leaves `ResetHubPort`'s delay
/// unresolved and directs implementers to a conservative 1 ms per tick.
const RESET_RECOVERY_TICK_MS: u64 = 50;
const PORT_RESET_SETTLE_MS: u64 = 100;
const PORT_RESET_ACTIVE_MS: u64 = 50;
const PORT_RESET_CLEAR_MS: u64 = 1;
const MAX_ADDRESSING_RETRIES: u8 = 3;

pub struct Bus<'a, H: HostControllerCapability, C: PlatformClock> {
    hcc: &'a H,
    clock: &'a C,
    devices: Arena<Device, MAX_DEVICES>,
    controllers: Arena<Controller, MAX_CONTROLLERS>,
    bitmap: AddressBitmap,
    root_port_states: Vec<PortState, MAX_ROOT_PORTS>,
    /// `children[port]` at the root level; child-hub children live in that
    /// hub controller's own `HubFields::children`.
    root_children: [Option<DeviceHandle>; MAX_ROOT_PORTS],
    events: Deque<PortEvent, MAX_QUEUED_EVENTS>,
}

/// `[u8; 16]`-backed bitmap over USB addresses 0..128. Address 0 is
/// reserved for enumeration, address 1 is always the root hub (spec.md §3).
pub struct AddressBitmap {
    bits: [u8; 16],
}

impl AddressBitmap {
    pub fn new() -> Self {
        let mut bits = [0u8; 16];
        bits[0] |= 0b0000_0011; // addresses 0 and 1 reserved
        Self { bits }
    }

    fn is_set(&self, addr: u8) -> bool {
        self.bits[(addr / 8) as usize] & (1 << (addr % 8)) != 0
    }

    fn set(&mut self, addr: u8) {
        self.bits[(addr / 8) as usize] |= 1 << (addr % 8);
    }

    fn clear(&mut self, addr: u8) {
        self.bits[(addr / 8) as usize] &= !(1 << (addr % 8));
    }

    /// First-clear-bit scan over addresses 2..128. Never returns an address
    /// whose bit is already set.
    pub fn alloc(&mut self) -> Result<u8, UsbError> {
        for addr in 2u16..128 {
            let addr = addr as u8;
            if !self.is_set(addr) {
                self.set(addr);
                return Ok(addr);
            }
        }
        Err(UsbError::OutOfResources)
    }

    pub fn free(&mut self, addr: u8) {
        if addr >= 2 {
            self.clear(addr);
        }
    }
}

impl<'a, H: HostControllerCapability, C: PlatformClock> Bus<'a, H, C> {
    pub fn new(hcc: &'a H, clock: &'a C) -> Self {
        let num_ports = hcc.get_root_hub_port_number().min(MAX_ROOT_PORTS as u8);
        let mut root_port_states = Vec::new();
        for _ in 0..num_ports {
            let _ = root_port_states.push(PortState::Empty);
        }
        Self {
            hcc,
            clock,
            devices: Arena::new(),
            controllers: Arena::new(),
            bitmap: AddressBitmap::new(),
            root_port_states,
            root_children: [None; MAX_ROOT_PORTS],
            events: Deque::new(),
        }
    }

    pub fn devices(&self) -> &Arena<Device, MAX_DEVICES> {
        &self.devices
    }

    pub fn controllers(&self) -> &Arena<Controller, MAX_CONTROLLERS> {
        &self.controllers
    }

    pub fn controller(&self, handle: super::controller::ControllerHandle) -> Option<&Controller> {
        self.controllers.get(handle)
    }

    pub fn device(&self, handle: DeviceHandle) -> Option<&Device> {
        self.devices.get(handle)
    }

    pub fn hcc(&self) -> &'a H {
        self.hcc
    }

    pub fn clock(&self) -> &'a C {
        self.clock
    }

    /// Mutable access to one endpoint's data-toggle bit, addressed by the
    /// owning device and the interface's currently-active configuration.
    pub fn endpoint_toggle_mut(
        &mut self,
        device: DeviceHandle,
        interface_number: u8,
        endpoint: u8,
    ) -> Option<&mut bool> {
        let dev = self.devices.get_mut(device)?;
        let active = dev.active_configuration?;
        let config = dev
            .configurations
            .configurations
            .iter_mut()
            .find(|c| c.header.configuration_value == active)?;
        let iface = config
            .interfaces
            .iter_mut()
            .find(|i| i.descriptor.interface_number == interface_number)?;
        let ep = iface
            .endpoints
            .iter_mut()
            .find(|e| e.descriptor.number() == endpoint)?;
        Some(&mut ep.data_toggle)
    }

    /// Producer: called from the 1-second root-hub timer. Reads every root
    /// port's status and enqueues one event per pending change bit.
    pub fn on_root_timer_tick(&mut self) {
        let n = self.root_port_states.len() as u8;
        for port in 0..n {
            let Ok(status) = self.hcc.get_root_hub_port_status(port) else {
                continue;
            };
            self.enqueue_from_status(PortSource::Root, port, status);
        }
    }

    /// Producer: called when a hub's interrupt-IN transfer completes with a
    /// status-change payload. The lowest-numbered changed port wins when
    /// multiple bits are set (spec.md §4.2).
    pub fn on_hub_interrupt(&mut self, hub: HubHandle, payload: &[u8]) {
        let Some(ctrl) = self.controllers.get_mut(hub) else {
            return;
        };
        let Some(hub_fields) = ctrl.hub.as_mut() else {
            return;
        };
        let Some(port) = super::hub::lowest_changed_port(payload, hub_fields.num_ports) else {
            return;
        };
        hub_fields.status_change_latch |= 1 << port;
        let _ = self.events.push_back(PortEvent {
            source: PortSource::Hub(hub),
            port,
            kind: PortEventKind::ConnectChange { connected: false },
        });
        // Only the lowest-numbered changed port is enqueued per tick;
        // the remaining bits stay latched for the next interrupt.
    }

    fn enqueue_from_status(&mut self, source: PortSource, port: u8, status: PortStatus) {
        if status.contains(PortStatus::CONNECT_CHANGE) {
            let _ = self.events.push_back(PortEvent {
                source,
                port,
                kind: PortEventKind::ConnectChange {
                    connected: status.contains(PortStatus::CONNECTED),
                },
            });
        }
        if status.contains(PortStatus::OC_CHANGE) {
            let _ = self.events.push_back(PortEvent {
                source,
                port,
                kind: PortEventKind::OverCurrentChange,
            });
        }
        if status.contains(PortStatus::RESET_CHANGE) {
            let _ = self.events.push_back(PortEvent {
                source,
                port,
                kind: PortEventKind::ResetChange,
            });
        }
        if status.contains(PortStatus::ENABLE_CHANGE) {
            let _ = self.events.push_back(PortEvent {
                source,
                port,
                kind: PortEventKind::EnableChange,
            });
        }
    }

    /// `UsbIoHandle::port_reset`'s backing sequence: §4.2 steps 2 + 5 + 8
    /// (reset, re-address, re-configure) applied to the device already
    /// occupying `port`, without tearing down its controllers/handles.
    pub fn reapply_build_sequence(&mut self, source: PortSource, port: u8) -> Result<(), UsbError> {
        let device_handle = self
            .child_slot(source, port)
            .and_then(|s| *s)
            .ok_or(UsbError::DeviceError)?;

        self.reset_port(source, port, 0)?;

        let (old_addr, max_packet_size0, active) = {
            let dev = self.devices.get(device_handle).ok_or(UsbError::DeviceError)?;
            (dev.address, dev.descriptor.max_packet_size0, dev.active_configuration)
        };

        let new_addr = self.bitmap.alloc()?;
        if self.set_address(new_addr).is_err() {
            self.bitmap.free(new_addr);
            return Err(UsbError::DeviceError);
        }
        self.bitmap.free(old_addr);

        if let Some(dev) = self.devices.get_mut(device_handle) {
            dev.address = new_addr;
        }

        if let Some(value) = active {
            self.set_configuration(new_addr, max_packet_size0, value)?;
        }
        Ok(())
    }

    /// Drain and process every queued event. The single non-reentrant tick
    /// function; not safe to call recursively/concurrently with itself.
    pub fn poll(&mut self) {
        while let Some(event) = self.events.pop_front() {
            self.handle_event(event);
        }
    }

    fn handle_event(&mut self, event: PortEvent) {
        match event.kind {
            PortEventKind::ConnectChange { connected } => {
                self.tear_down_port(event.source, event.port);
                if connected {
                    match self.build_new_device(event.source, event.port) {
                        Ok(_handle) => {
                            log::info!("usb: device enumerated on port {}", event.port);
                        }
                        Err(e) => {
                            log::warn!("usb: enumeration failed on port {}: {:?}", event.port, e);
                        }
                    }
                }
            }
            PortEventKind::OverCurrentChange => {
                let _ = self.clear_feature(event.source, event.port, PortFeature::OverCurrentChange);
                let _ = self.read_port_status(event.source, event.port);
            }
            PortEventKind::ResetChange => {
                let _ = self.clear_feature(event.source, event.port, PortFeature::ResetChange);
                let _ = self.read_port_status(event.source, event.port);
            }
            PortEventKind::EnableChange => {
                let _ = self.clear_feature(event.source, event.port, PortFeature::EnableChange);
                let _ = self.read_port_status(event.source, event.port);
            }
        }
    }

    fn child_slot(&mut self, source: PortSource, port: u8) -> Option<&mut Option<DeviceHandle>> {
        match source {
            PortSource::Root => self.root_children.get_mut(port as usize),
            PortSource::Hub(hub) => self
                .controllers
                .get_mut(hub)
                .and_then(|c| c.hub.as_mut())
                .and_then(|h| h.children.get_mut(port as usize)),
        }
    }

    /// Tear down whatever occupies `port`, recursively for hubs
    /// (spec.md §3: "logical and physical attachment must not diverge").
    fn tear_down_port(&mut self, source: PortSource, port: u8) {
        let existing = self.child_slot(source, port).and_then(|s| s.take());
        if let Some(device) = existing {
            self.destroy_device(device);
        }
    }

    fn destroy_device(&mut self, device: DeviceHandle) {
        // Tear down any hub controllers on this device first, recursively.
        let mut controller_handles: Vec<u16, MAX_CONTROLLERS> = Vec::new();
        for (handle, ctrl) in self.controllers.iter() {
            if ctrl.device == device {
                let _ = controller_handles.push(handle);
            }
        }
        for handle in controller_handles {
            if let Some(ctrl) = self.controllers.get(handle) {
                if let Some(hub) = &ctrl.hub {
                    let mut children: Vec<DeviceHandle, MAX_HUB_PORTS> = Vec::new();
                    for child in hub.children.iter().filter_map(|c| *c) {
                        let _ = children.push(child);
                    }
                    for child in children {
                        self.destroy_device(child);
                    }
                }
            }
            self.controllers.remove(handle);
        }
        if let Some(dev) = self.devices.remove(device) {
            self.bitmap.free(dev.address);
        }
    }

    /// Public entry point for `usb::disconnect::is_device_disconnected`.
    pub fn query_port_status(&self, source: PortSource, port: u8) -> Result<PortStatus, UsbError> {
        self.read_port_status(source, port)
    }

    fn read_port_status(&self, source: PortSource, port: u8) -> Result<PortStatus, UsbError> {
        match source {
            PortSource::Root => self.hcc.get_root_hub_port_status(port),
            PortSource::Hub(hub) => self.hub_get_port_status(hub, port),
        }
    }

    fn set_feature(&self, source: PortSource, port: u8, feature: PortFeature) -> Result<(), UsbError> {
        match source {
            PortSource::Root => self.hcc.set_root_hub_port_feature(port, feature),
            PortSource::Hub(hub) => self.hub_set_port_feature(hub, port, feature, true),
        }
    }

    fn clear_feature(&self, source: PortSource, port: u8, feature: PortFeature) -> Result<(), UsbError> {
        match source {
            PortSource::Root => self.hcc.clear_root_hub_port_feature(port, feature),
            PortSource::Hub(hub) => self.hub_set_port_feature(hub, port, feature, false),
        }
    }

    fn hub_device(&self, hub: HubHandle) -> Result<&Device, UsbError> {
        super::hub::HubView::lookup(&self.controllers, &self.devices, hub)
            .map(|view| view.device)
            .ok_or(UsbError::InvalidArgument)
    }

    fn hub_get_port_status(&self, hub: HubHandle, port: u8) -> Result<PortStatus, UsbError> {
        let device = self.hub_device(hub)?;
        let mut buf = [0u8; 4];
        let setup = SetupPacket {
            request_type: 0xA3,
            request: 0x00,
            value: 0,
            index: port as u16,
            length: 4,
        };
        self.hcc
            .control_transfer(device.address, device.descriptor.max_packet_size0, setup, Direction::In, &mut buf)?;
        Ok(PortStatus::from_bits_truncate(u32::from_le_bytes(buf)))
    }

    fn hub_set_port_feature(
        &self,
        hub: HubHandle,
        port: u8,
        feature: PortFeature,
        set: bool,
    ) -> Result<(), UsbError> {
        let device = self.hub_device(hub)?;
        let setup = SetupPacket {
            request_type: 0x23,
            request: if set { 0x03 } else { 0x01 },
            value: feature_selector(feature),
            index: port as u16,
            length: 0,
        };
        self.hcc
            .control_transfer(device.address, device.descriptor.max_packet_size0, setup, Direction::Out, &mut [])?;
        Ok(())
    }

    /// Read/write the device descriptor fetch path used both at address 0
    /// (8-byte provisional fetch) and after addressing (18-byte full fetch).
    fn get_device_descriptor(
        &self,
        address: u8,
        max_packet_size0: u8,
        length: u16,
        buf: &mut [u8],
    ) -> Result<usize, UsbError> {
        let setup = SetupPacket {
            request_type: 0x80,
            request: REQ_GET_DESCRIPTOR,
            value: (DESC_TYPE_DEVICE as u16) << 8,
            index: 0,
            length,
        };
        self.hcc
            .control_transfer(address, max_packet_size0, setup, Direction::In, buf)
    }

    fn get_config_descriptor(
        &self,
        address: u8,
        max_packet_size0: u8,
        config_index: u8,
        buf: &mut [u8],
    ) -> Result<usize, UsbError> {
        let setup = SetupPacket {
            request_type: 0x80,
            request: REQ_GET_DESCRIPTOR,
            value: ((descriptors::DESC_TYPE_CONFIGURATION as u16) << 8) | config_index as u16,
            index: 0,
            length: buf.len() as u16,
        };
        self.hcc
            .control_transfer(address, max_packet_size0, setup, Direction::In, buf)
    }

    fn set_address(&self, address: u8) -> Result<(), UsbError> {
        let setup = SetupPacket {
            request_type: 0x00,
            request: REQ_SET_ADDRESS,
            value: address as u16,
            index: 0,
            length: 0,
        };
        // Addressed at 0 until this completes; the HCC is told the new
        // address separately once the device is fully enumerated.
        self.hcc
            .control_transfer(0, 8, setup, Direction::Out, &mut [])?;
        Ok(())
    }

    fn set_configuration(&self, address: u8, max_packet_size0: u8, value: u8) -> Result<(), UsbError> {
        let setup = SetupPacket {
            request_type: 0x00,
            request: REQ_SET_CONFIGURATION,
            value: value as u16,
            index: 0,
            length: 0,
        };
        self.hcc
            .control_transfer(address, max_packet_size0, setup, Direction::Out, &mut [])?;
        Ok(())
    }

    /// Reset `port`, waiting out the settle/active/clear windows from
    /// spec.md §4.6 and §9 (1 ms per recovery tick, conservative choice
    /// where the source's intent was ambiguous).
    fn reset_port(&self, source: PortSource, port: u8, retry: u8) -> Result<(), UsbError> {
        delay_ms(self.clock, PORT_RESET_SETTLE_MS);
        self.set_feature(source, port, PortFeature::Reset)?;
        delay_ms(self.clock, PORT_RESET_ACTIVE_MS);
        delay_ms(self.clock, PORT_RESET_CLEAR_MS);

        let deadline_ticks = (retry as u64 + 1) * RESET_RECOVERY_TICK_MS;
        let mut waited = 0u64;
        loop {
            let status = self.read_port_status(source, port)?;
            if status.contains(PortStatus::ENABLED) || waited >= deadline_ticks {
                break;
            }
            delay_ms(self.clock, 1);
            waited += 1;
        }
        self.clear_feature(source, port, PortFeature::EnableChange)?;
        Ok(())
    }

    /// spec.md §4.2's "build-new-device procedure," the single most
    /// intricate sequence in the enumerator.
    fn build_new_device(&mut self, source: PortSource, port: u8) -> Result<DeviceHandle, UsbError> {
        // 1. Read port status, detect low speed.
        let status = self.read_port_status(source, port)?;
        let speed = if status.contains(PortStatus::LOW_SPEED) {
            UsbSpeed::Low
        } else if status.contains(PortStatus::HIGH_SPEED) {
            UsbSpeed::High
        } else {
            UsbSpeed::Full
        };

        // 2. Reset the port.
        self.reset_port(source, port, 0)?;

        // 3. Provisional 8-byte device descriptor fetch at address 0, with
        // up to 3 retries, each preceded by another port reset.
        let mut provisional = [0u8; 8];
        let mut fetched = false;
        for attempt in 0..=MAX_ADDRESSING_RETRIES {
            if attempt > 0 {
                self.reset_port(source, port, attempt)?;
            }
            if self.get_device_descriptor(0, 8, 8, &mut provisional).is_ok() {
                fetched = true;
                break;
            }
        }
        if !fetched {
            return Err(UsbError::DeviceError);
        }
        let max_packet_size0 = provisional[7];

        // 4. Allocate a new address.
        let new_addr = match self.bitmap.alloc() {
            Ok(addr) => addr,
            Err(e) => return Err(e),
        };

        // 5. SET_ADDRESS.
        if let Err(e) = self.set_address(new_addr) {
            self.bitmap.free(new_addr);
            return Err(e);
        }

        // If the device vanished mid-addressing, undo and bail (scenario 3).
        if !self.read_port_status(source, port)?.contains(PortStatus::CONNECTED) {
            self.bitmap.free(new_addr);
            return Err(UsbError::DeviceError);
        }

        // 6. GET_DESCRIPTOR(DEVICE, 18).
        let mut full = [0u8; DEVICE_DESCRIPTOR_LEN];
        if self
            .get_device_descriptor(new_addr, max_packet_size0, DEVICE_DESCRIPTOR_LEN as u16, &mut full)
            .is_err()
        {
            self.bitmap.free(new_addr);
            return Err(UsbError::DeviceError);
        }
        let device_descriptor = DeviceDescriptor::read_from_bytes(&full).map_err(|_| {
            self.bitmap.free(new_addr);
            UsbError::DeviceError
        })?;

        // 7. Walk every advertised configuration.
        let mut configurations: Vec<descriptors::ConfigurationInfo, { descriptors::MAX_CONFIGURATIONS }> =
            Vec::new();
        for idx in 0..device_descriptor.num_configurations {
            let mut head = [0u8; 4];
            if self
                .get_config_descriptor(new_addr, max_packet_size0, idx, &mut head)
                .is_err()
            {
                continue;
            }
            let Ok(total_len) = descriptors::peek_config_total_length(&head) else {
                continue;
            };
            let mut scratch = [0u8; descriptors::MAX_CONFIG_DESCRIPTOR_BYTES];
            let total_len = total_len as usize;
            if total_len > scratch.len() {
                continue;
            }
            match self.get_config_descriptor(new_addr, max_packet_size0, idx, &mut scratch[..total_len]) {
                Ok(n) if n == total_len => {}
                _ => continue,
            }
            if let Ok(config) = descriptors::parse_configuration(&scratch[..total_len]) {
                let _ = configurations.push(config);
            }
        }

        // 8. SET_CONFIGURATION to the first configuration's value (if any).
        let active_configuration = configurations.first().map(|c| c.header.configuration_value);
        if let Some(value) = active_configuration {
            if self.set_configuration(new_addr, max_packet_size0, value).is_err() {
                self.bitmap.free(new_addr);
                return Err(UsbError::DeviceError);
            }
        }

        // 9. Optional language-ID table; failure is non-fatal.
        let mut language_ids = Vec::new();
        let mut lang_head = [0u8; 2];
        let lang_setup_len = 2u16;
        if self
            .get_descriptor_raw(new_addr, max_packet_size0, descriptors::DESC_TYPE_STRING, 0, 0, &mut lang_head)
            .is_ok()
        {
            let total = lang_head[0] as usize;
            if total >= 2 && total <= descriptors::MAX_CONFIG_DESCRIPTOR_BYTES {
                let mut buf = [0u8; 64];
                if total <= buf.len()
                    && self
                        .get_descriptor_raw(new_addr, max_packet_size0, descriptors::DESC_TYPE_STRING, 0, 0, &mut buf[..total])
                        .is_ok()
                {
                    let mut i = 2;
                    while i + 1 < total {
                        let id = u16::from_le_bytes([buf[i], buf[i + 1]]);
                        let _ = language_ids.push(id);
                        i += 2;
                    }
                }
            }
        }
        let _ = lang_setup_len;

        let device = Device {
            address: new_addr,
            speed,
            descriptor: device_descriptor,
            configurations: Configuration { configurations },
            active_configuration,
            language_ids,
        };
        let device_handle = self.devices.insert(device).ok_or(UsbError::OutOfResources)?;

        if let Some(slot) = self.child_slot(source, port) {
            *slot = Some(device_handle);
        }

        // 10-11. One controller per interface of the active configuration.
        let hub_handles = self.create_controllers_for_device(device_handle, source, port)?;

        // 12. Bring up any controller that is itself a hub.
        for hub_handle in hub_handles {
            if let Err(e) = self.bring_up_hub(hub_handle) {
                log::warn!("usb: hub bring-up failed: {:?}", e);
            }
        }

        Ok(device_handle)
    }

    fn get_descriptor_raw(
        &self,
        address: u8,
        max_packet_size0: u8,
        desc_type: u8,
        desc_index: u8,
        index: u16,
        buf: &mut [u8],
    ) -> Result<usize, UsbError> {
        let setup = SetupPacket {
            request_type: 0x80,
            request: REQ_GET_DESCRIPTOR,
            value: ((desc_type as u16) << 8) | desc_index as u16,
            index,
            length: buf.len() as u16,
        };
        self.hcc.control_transfer(address, max_packet_size0, setup, Direction::In, buf)
    }

    fn create_controllers_for_device(
        &mut self,
        device_handle: DeviceHandle,
        source: PortSource,
        port: u8,
    ) -> Result<Vec<HubHandle, MAX_HUB_PORTS>, UsbError> {
        let mut new_hubs: Vec<HubHandle, MAX_HUB_PORTS> = Vec::new();
        let parent_path = self.parent_fragment(source);
        let parent_hub = match source {
            PortSource::Root => None,
            PortSource::Hub(h) => Some(h),
        };

        let (config_value, interfaces) = {
            let device = self.devices.get(device_handle).ok_or(UsbError::DeviceError)?;
            match device.active_config_info() {
                Some(info) => (info.header.configuration_value, info.interfaces.clone()),
                None => return Ok(new_hubs),
            }
        };

        for iface in interfaces.iter() {
            let path = Fragment::child(&parent_path, port, iface.descriptor.interface_number)
                .unwrap_or_else(|_| parent_path.clone());
            let hub = if iface.is_hub() {
                let ep = iface
                    .endpoints
                    .iter()
                    .find(|e| e.descriptor.is_in())
                    .map(|e| e.descriptor.number())
                    .unwrap_or(0);
                Some(HubFields::new(0, ep))
            } else {
                None
            };
            let controller = Controller {
                interface_number: iface.descriptor.interface_number,
                configuration_value: config_value,
                device: device_handle,
                parent_hub,
                parent_port: port,
                path,
                bound: false,
                hub,
            };
            let is_hub = controller.is_hub();
            if let Some(handle) = self.controllers.insert(controller) {
                if is_hub {
                    let _ = new_hubs.push(handle);
                }
            }
        }
        Ok(new_hubs)
    }

    fn parent_fragment(&self, source: PortSource) -> Fragment {
        match source {
            PortSource::Root => Fragment::empty(),
            PortSource::Hub(h) => self
                .controllers
                .get(h)
                .map(|c| c.path.clone())
                .unwrap_or_else(Fragment::empty),
        }
    }

    /// spec.md §4.2 step 12: read the hub descriptor, power every
    /// downstream port, clear pending change bits, arm the interrupt
    /// endpoint subscription.
    fn bring_up_hub(&mut self, hub_handle: HubHandle) -> Result<(), UsbError> {
        let (address, max_packet_size0, interrupt_endpoint) = {
            let ctrl = self.controllers.get(hub_handle).ok_or(UsbError::DeviceError)?;
            let device = self.devices.get(ctrl.device).ok_or(UsbError::DeviceError)?;
            let hub = ctrl.hub.as_ref().ok_or(UsbError::InvalidArgument)?;
            (device.address, device.descriptor.max_packet_size0, hub.interrupt_endpoint)
        };

        // First fetch: 2 bytes to learn the descriptor's declared length.
        let mut head = [0u8; 2];
        self.get_descriptor_raw(address, max_packet_size0, 0x29, 0, 0, &mut head)?;
        let declared_len = head[0] as usize;
        if declared_len < 2 {
            return Err(UsbError::DeviceError);
        }
        let mut full = [0u8; 16];
        if declared_len > full.len() {
            return Err(UsbError::DeviceError);
        }
        let got = self.get_descriptor_raw(address, max_packet_size0, 0x29, 0, 0, &mut full[..declared_len])?;
        // A short second fetch is rejected; no ports are powered.
        if got < declared_len {
            return Err(UsbError::DeviceError);
        }
        let num_ports = full.get(2).copied().unwrap_or(0).min(MAX_HUB_PORTS as u8);

        {
            let ctrl = self.controllers.get_mut(hub_handle).ok_or(UsbError::DeviceError)?;
            if let Some(hub) = ctrl.hub.as_mut() {
                hub.num_ports = num_ports;
            }
        }

        for port in 1..=num_ports {
            let setup = SetupPacket {
                request_type: 0x23,
                request: 0x03,
                value: HUB_FEATURE_POWER,
                index: port as u16,
                length: 0,
            };
            let _ = self.hcc.control_transfer(address, max_packet_size0, setup, Direction::Out, &mut []);
        }

        {
            let ctrl = self.controllers.get_mut(hub_handle).ok_or(UsbError::DeviceError)?;
            if let Some(hub) = ctrl.hub.as_mut() {
                hub.status_change_latch = 0;
            }
        }

        let mut toggle = false;
        self.hcc.async_interrupt_transfer(address, interrupt_endpoint, 1, true, 255, &mut toggle)
    }
}

/// Classify a raw device-descriptor buffer without committing anything;
/// used by `usb::io::GetDeviceDescriptor`.
pub fn reset_attributes_for_handoff() -> HccResetAttributes {
    HccResetAttributes::HostOnly
}

#[allow(dead_code)]
const _UNUSED_FEATURE_HALT: u16 = FEATURE_ENDPOINT_HALT;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_bitmap_reserves_zero_and_one() {
        let bitmap = AddressBitmap::new();
        assert!(bitmap.is_set(0));
        assert!(bitmap.is_set(1));
    }

    #[test]
    fn address_bitmap_allocates_all_126_unique_addresses() {
        let mut bitmap = AddressBitmap::new();
        let mut seen: Vec<u8, 126> = Vec::new();
        for _ in 0..126 {
            let addr = bitmap.alloc().expect("should have free addresses");
            assert!(!seen.contains(&addr), "address {} allocated twice", addr);
            let _ = seen.push(addr);
        }
        assert_eq!(bitmap.alloc(), Err(UsbError::OutOfResources));
    }

    #[test]
    fn address_bitmap_frees_and_reallocates() {
        let mut bitmap = AddressBitmap::new();
        let addr = bitmap.alloc().unwrap();
        bitmap.free(addr);
        assert!(!bitmap.is_set(addr));
        let addr2 = bitmap.alloc().unwrap();
        assert_eq!(addr, addr2);
    }

    use crate::testutil::{
        canned_bulk_config_descriptor, canned_device_descriptor, canned_hub_config_descriptor, FakeClock,
        MockHcc,
    };

    /// Scenario 1 (spec.md §8): a bulk device connects on a root port and is
    /// fully enumerated — addressed, configured, and visible via `devices()`.
    #[test]
    fn bulk_device_connects_and_enumerates() {
        let hcc = MockHcc::new(1);
        let clock = FakeClock::new();
        hcc.script_device_descriptor(&canned_device_descriptor(8, 1));
        hcc.script_config_descriptor(0, &canned_bulk_config_descriptor(1));

        let mut bus = Bus::new(&hcc, &clock);
        hcc.set_port_status(0, PortStatus::CONNECTED | PortStatus::CONNECT_CHANGE);
        bus.on_root_timer_tick();
        bus.poll();

        assert_eq!(hcc.set_address_call_count(), 1);
        assert_eq!(hcc.set_configuration_call_count(), 1);
        assert_eq!(bus.devices().iter().count(), 1);
        let (_, device) = bus.devices().iter().next().unwrap();
        assert_eq!(device.active_configuration, Some(1));
    }

    /// A `CONNECT_CHANGE` with the `CONNECTED` bit already clear (the port
    /// settled back to disconnected before the tick observed it) must not
    /// be treated as an attach — no enumeration attempt at all.
    #[test]
    fn connect_change_without_connected_bit_is_not_an_attach() {
        let hcc = MockHcc::new(1);
        let clock = FakeClock::new();
        hcc.script_device_descriptor(&canned_device_descriptor(8, 1));

        let mut bus = Bus::new(&hcc, &clock);
        hcc.set_port_status(0, PortStatus::CONNECT_CHANGE);
        bus.on_root_timer_tick();
        bus.poll();

        assert_eq!(bus.devices().iter().count(), 0);
        assert_eq!(hcc.set_address_call_count(), 0);
    }

    /// Scenario 3 (spec.md §8): the device vanishes mid-addressing — the
    /// provisional fetch succeeds but the port has gone not-connected by
    /// the time `build_new_device` re-checks it right after `SET_ADDRESS`.
    /// Enumeration must back out cleanly and leave the address free.
    #[test]
    fn device_disappearing_mid_addressing_frees_the_address() {
        let hcc = MockHcc::new(1);
        let clock = FakeClock::new();
        hcc.script_device_descriptor(&canned_device_descriptor(8, 1));

        let mut bus = Bus::new(&hcc, &clock);
        hcc.set_port_status(0, PortStatus::CONNECTED | PortStatus::CONNECT_CHANGE);
        hcc.vanish_after_address(0); // drop CONNECTED the instant SET_ADDRESS completes
        bus.on_root_timer_tick();
        bus.poll();

        assert_eq!(bus.devices().iter().count(), 0);
        assert_eq!(hcc.set_address_call_count(), 1);
        // address 2 was allocated then freed on the bail-out path.
        assert_eq!(bus.bitmap.alloc(), Ok(2));
    }

    /// Scenario: a connected device later disconnects; `poll()` must tear
    /// it down and free its address for reallocation.
    #[test]
    fn disconnect_tears_down_device_and_frees_address() {
        let hcc = MockHcc::new(1);
        let clock = FakeClock::new();
        hcc.script_device_descriptor(&canned_device_descriptor(8, 1));
        hcc.script_config_descriptor(0, &canned_bulk_config_descriptor(1));

        let mut bus = Bus::new(&hcc, &clock);
        hcc.set_port_status(0, PortStatus::CONNECTED | PortStatus::CONNECT_CHANGE);
        bus.on_root_timer_tick();
        bus.poll();
        assert_eq!(bus.devices().iter().count(), 1);

        hcc.set_port_status(0, PortStatus::CONNECT_CHANGE); // connected bit now clear
        bus.on_root_timer_tick();
        bus.poll();

        assert_eq!(bus.devices().iter().count(), 0);
        // The freed address (2, the first non-reserved one) must be reusable.
        assert_eq!(bus.bitmap.alloc(), Ok(2));
    }

    /// Scenario 2 (spec.md §8): a hub connects, gets enumerated, and its
    /// bring-up sequence arms the async interrupt subscription on its
    /// status-change endpoint.
    #[test]
    fn hub_device_is_enumerated_and_brought_up() {
        let hcc = MockHcc::new(1);
        let clock = FakeClock::new();
        hcc.script_device_descriptor(&canned_device_descriptor(8, 1));
        hcc.script_config_descriptor(0, &canned_hub_config_descriptor(1));
        // Hub descriptor: bLength=9, bDescriptorType=0x29, bNbrPorts=2.
        hcc.script_hub_descriptor(&[9, 0x29, 2, 0, 0, 0, 0, 0xFF, 0xFF]);

        let mut bus = Bus::new(&hcc, &clock);
        hcc.set_port_status(0, PortStatus::CONNECTED | PortStatus::CONNECT_CHANGE);
        bus.on_root_timer_tick();
        bus.poll();

        assert_eq!(bus.devices().iter().count(), 1);
        let hub_controller = bus
            .controllers()
            .iter()
            .find(|(_, c)| c.hub.is_some())
            .map(|(_, c)| c);
        assert!(hub_controller.is_some(), "hub controller must be created");
        assert_eq!(hub_controller.unwrap().hub.as_ref().unwrap().num_ports, 2);
        assert_eq!(hcc.async_interrupt_arm_call_count(), 1);
    }
}
