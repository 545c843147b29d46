//! Test-only collaborator fakes shared by `tests/` and unit tests across the
//! crate: a scriptable clock and a scriptable `HostControllerCapability` so
//! `usb::bus::Bus` can be driven end-to-end without real silicon.

use core::cell::{Cell, RefCell};

use heapless::FnvIndexMap;

use crate::time::PlatformClock;
use crate::usb::descriptors::{
    DESC_TYPE_CONFIGURATION, DESC_TYPE_DEVICE, REQ_GET_DESCRIPTOR, REQ_SET_ADDRESS,
    REQ_SET_CONFIGURATION,
};
use crate::usb::error::UsbError;
use crate::usb::hcc::{
    Direction, HccResetAttributes, HostControllerCapability, PortFeature, PortStatus, SetupPacket,
};

pub const MAX_MOCK_PORTS: usize = 4;
const MAX_SCRIPTED_RESPONSES: usize = 32;
const MAX_RESPONSE_BYTES: usize = 256;

/// A clock that only advances when told to, mirroring `time.rs`'s own
/// private test fixture but exposed crate-wide for integration tests.
pub struct FakeClock {
    now: Cell<u64>,
}

impl FakeClock {
    pub fn new() -> Self {
        Self { now: Cell::new(0) }
    }

    pub fn advance(&self, microseconds: u64) {
        self.now.set(self.now.get() + microseconds);
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new()
    }
}

impl PlatformClock for FakeClock {
    fn monotonic_us(&self) -> u64 {
        self.now.get()
    }

    fn stall_us(&self, microseconds: u64) {
        self.advance(microseconds);
    }
}

fn response_key(setup: &SetupPacket) -> (u8, u8, u16, u16) {
    (setup.request_type, setup.request, setup.value, setup.index)
}

/// A single scripted control-transfer response: the bytes returned on an IN
/// transfer, or just a completion marker for an OUT transfer.
#[derive(Clone)]
struct Canned {
    bytes: heapless::Vec<u8, MAX_RESPONSE_BYTES>,
}

/// Scriptable `HostControllerCapability`: root-hub port status is a plain
/// mutable table a test pokes directly; control-transfer responses are
/// looked up by `(bmRequestType, bRequest, wValue, wIndex)` so a test only
/// has to script the handful of requests its scenario actually issues.
pub struct MockHcc {
    ports: RefCell<heapless::Vec<PortStatus, MAX_MOCK_PORTS>>,
    responses: RefCell<FnvIndexMap<(u8, u8, u16, u16), Canned, MAX_SCRIPTED_RESPONSES>>,
    set_address_calls: Cell<u32>,
    set_configuration_calls: Cell<u32>,
    async_interrupt_arm_calls: Cell<u32>,
    vanish_port_after_address: Cell<Option<u8>>,
}

impl MockHcc {
    pub fn new(port_count: usize) -> Self {
        let mut ports = heapless::Vec::new();
        for _ in 0..port_count {
            let _ = ports.push(PortStatus::empty());
        }
        Self {
            ports: RefCell::new(ports),
            responses: RefCell::new(FnvIndexMap::new()),
            set_address_calls: Cell::new(0),
            set_configuration_calls: Cell::new(0),
            async_interrupt_arm_calls: Cell::new(0),
            vanish_port_after_address: Cell::new(None),
        }
    }

    /// Clear `CONNECTED` on `port` the moment the next `SET_ADDRESS`
    /// completes, modeling scenario 3's "device unplugged mid-addressing."
    pub fn vanish_after_address(&self, port: u8) {
        self.vanish_port_after_address.set(Some(port));
    }

    /// Directly set a root port's status bits, as if a connect/disconnect
    /// or over-current IRQ had just landed.
    pub fn set_port_status(&self, port: u8, status: PortStatus) {
        if let Some(slot) = self.ports.borrow_mut().get_mut(port as usize) {
            *slot = status;
        }
    }

    pub fn port_status(&self, port: u8) -> PortStatus {
        self.ports
            .borrow()
            .get(port as usize)
            .copied()
            .unwrap_or(PortStatus::empty())
    }

    /// Script the IN-transfer response for a `GET_DESCRIPTOR(DEVICE)` fetch.
    /// The same setup packet (and so the same canned bytes) serves both the
    /// provisional 8-byte fetch at address 0 and the full 18-byte fetch
    /// after addressing, since only the caller's buffer length differs.
    pub fn script_device_descriptor(&self, bytes: &[u8]) {
        let value = (DESC_TYPE_DEVICE as u16) << 8;
        self.script_raw(0x80, REQ_GET_DESCRIPTOR, value, 0, bytes);
    }

    /// Script the IN-transfer response for `GET_DESCRIPTOR(CONFIG, index)`,
    /// used for both the 4-byte header peek and the full-length fetch
    /// (both reuse the same setup packet; only the caller's buffer length
    /// differs, so the same canned bytes serve both as long as they're
    /// sliced by `control_transfer`).
    pub fn script_config_descriptor(&self, config_index: u8, bytes: &[u8]) {
        let request_type = 0x80;
        let value = ((DESC_TYPE_CONFIGURATION as u16) << 8) | config_index as u16;
        self.script_raw(request_type, REQ_GET_DESCRIPTOR, value, 0, bytes);
    }

    fn script_raw(&self, request_type: u8, request: u8, value: u16, index: u16, bytes: &[u8]) {
        let mut canned = heapless::Vec::new();
        canned.extend_from_slice(bytes).expect("scripted response exceeds MAX_RESPONSE_BYTES");
        self.responses
            .borrow_mut()
            .insert((request_type, request, value, index), Canned { bytes: canned })
            .ok();
    }

    pub fn set_address_call_count(&self) -> u32 {
        self.set_address_calls.get()
    }

    pub fn set_configuration_call_count(&self) -> u32 {
        self.set_configuration_calls.get()
    }

    pub fn async_interrupt_arm_call_count(&self) -> u32 {
        self.async_interrupt_arm_calls.get()
    }

    /// Script the class-specific hub descriptor response used by
    /// `Bus::bring_up_hub`'s two fetches (both reuse the same setup packet).
    pub fn script_hub_descriptor(&self, bytes: &[u8]) {
        self.script_raw(0x80, REQ_GET_DESCRIPTOR, (0x29u16) << 8, 0, bytes);
    }

    /// Script a string descriptor (e.g. the language-ID table) at `index`.
    pub fn script_string_descriptor(&self, index: u8, bytes: &[u8]) {
        let value = ((crate::usb::descriptors::DESC_TYPE_STRING as u16) << 8) | index as u16;
        self.script_raw(0x80, REQ_GET_DESCRIPTOR, value, 0, bytes);
    }
}

impl HostControllerCapability for MockHcc {
    fn reset(&self, _attributes: HccResetAttributes) -> Result<(), UsbError> {
        Ok(())
    }

    fn set_state_enabled(&self, _enabled: bool) -> Result<(), UsbError> {
        Ok(())
    }

    fn get_root_hub_port_number(&self) -> u8 {
        self.ports.borrow().len() as u8
    }

    fn get_root_hub_port_status(&self, port: u8) -> Result<PortStatus, UsbError> {
        self.ports
            .borrow()
            .get(port as usize)
            .copied()
            .ok_or(UsbError::InvalidArgument)
    }

    fn set_root_hub_port_feature(&self, port: u8, feature: PortFeature) -> Result<(), UsbError> {
        let mut ports = self.ports.borrow_mut();
        let status = ports.get_mut(port as usize).ok_or(UsbError::InvalidArgument)?;
        match feature {
            PortFeature::Reset => status.insert(PortStatus::RESET | PortStatus::ENABLED),
            PortFeature::Enable => status.insert(PortStatus::ENABLED),
            PortFeature::Power => {}
            PortFeature::ConnectChange => status.insert(PortStatus::CONNECT_CHANGE),
            PortFeature::ResetChange => status.insert(PortStatus::RESET_CHANGE),
            PortFeature::EnableChange => status.insert(PortStatus::ENABLE_CHANGE),
            PortFeature::OverCurrentChange => status.insert(PortStatus::OC_CHANGE),
        }
        Ok(())
    }

    fn clear_root_hub_port_feature(&self, port: u8, feature: PortFeature) -> Result<(), UsbError> {
        let mut ports = self.ports.borrow_mut();
        let status = ports.get_mut(port as usize).ok_or(UsbError::InvalidArgument)?;
        match feature {
            PortFeature::Reset => status.remove(PortStatus::RESET),
            PortFeature::Enable => status.remove(PortStatus::ENABLED),
            PortFeature::Power => {}
            PortFeature::ConnectChange => status.remove(PortStatus::CONNECT_CHANGE),
            PortFeature::ResetChange => status.remove(PortStatus::RESET_CHANGE),
            PortFeature::EnableChange => status.remove(PortStatus::ENABLE_CHANGE),
            PortFeature::OverCurrentChange => status.remove(PortStatus::OC_CHANGE),
        }
        Ok(())
    }

    fn control_transfer(
        &self,
        _address: u8,
        _max_packet_size0: u8,
        setup: SetupPacket,
        direction: Direction,
        data: &mut [u8],
    ) -> Result<usize, UsbError> {
        match (direction, setup.request) {
            (Direction::Out, REQ_SET_ADDRESS) => {
                self.set_address_calls.set(self.set_address_calls.get() + 1);
                if let Some(port) = self.vanish_port_after_address.take() {
                    let mut ports = self.ports.borrow_mut();
                    if let Some(status) = ports.get_mut(port as usize) {
                        status.remove(PortStatus::CONNECTED);
                    }
                }
                Ok(0)
            }
            (Direction::Out, REQ_SET_CONFIGURATION) => {
                self.set_configuration_calls.set(self.set_configuration_calls.get() + 1);
                Ok(0)
            }
            (Direction::In, _) => {
                let responses = self.responses.borrow();
                let canned = responses.get(&response_key(&setup)).ok_or(UsbError::DeviceError)?;
                let n = data.len().min(canned.bytes.len());
                data[..n].copy_from_slice(&canned.bytes[..n]);
                Ok(n)
            }
            _ => Ok(0),
        }
    }

    fn bulk_transfer(
        &self,
        _address: u8,
        _endpoint: u8,
        _max_packet_size: u16,
        _direction: Direction,
        _data: &mut [u8],
        _toggle: &mut bool,
    ) -> Result<usize, UsbError> {
        Ok(0)
    }

    fn sync_interrupt_transfer(
        &self,
        _address: u8,
        _endpoint: u8,
        _max_packet_size: u16,
        _direction: Direction,
        _data: &mut [u8],
        _toggle: &mut bool,
    ) -> Result<usize, UsbError> {
        Ok(0)
    }

    fn async_interrupt_transfer(
        &self,
        _address: u8,
        _endpoint: u8,
        _max_packet_size: u16,
        is_new: bool,
        _polling_interval_ms: u16,
        _toggle: &mut bool,
    ) -> Result<(), UsbError> {
        if is_new {
            self.async_interrupt_arm_calls.set(self.async_interrupt_arm_calls.get() + 1);
        }
        Ok(())
    }
}

/// An 18-byte device descriptor with every field set explicitly, matching
/// `descriptors::DeviceDescriptor`'s layout byte-for-byte.
pub fn canned_device_descriptor(max_packet_size0: u8, num_configurations: u8) -> [u8; 18] {
    [
        18,
        DESC_TYPE_DEVICE,
        0x10,
        0x02, // bcdUSB 2.0.0 little-endian
        0,    // device class
        0,    // device subclass
        0,    // device protocol
        max_packet_size0,
        0xAA,
        0x55, // idVendor
        0x01,
        0x00, // idProduct
        0x00,
        0x01, // bcdDevice
        0,    // manufacturer string index
        0,    // product string index
        0,    // serial number string index
        num_configurations,
    ]
}

/// One configuration with one interface and one bulk IN endpoint, the
/// simplest non-hub device a scenario test needs.
pub fn canned_bulk_config_descriptor(configuration_value: u8) -> heapless::Vec<u8, 32> {
    let mut bytes: heapless::Vec<u8, 32> = heapless::Vec::new();
    bytes
        .extend_from_slice(&[9, DESC_TYPE_CONFIGURATION, 9 + 9 + 7, 0, 1, configuration_value, 0, 0x80, 50])
        .unwrap();
    bytes.extend_from_slice(&[9, 0x04, 0, 0, 1, 0xFF, 0, 0, 0]).unwrap();
    bytes.extend_from_slice(&[7, 0x05, 0x81, 0x02, 64, 0, 0]).unwrap();
    bytes
}

/// One configuration whose single interface is a USB hub: class 0x09, an
/// interrupt IN status endpoint, matching `InterfaceInfo::is_hub`.
pub fn canned_hub_config_descriptor(configuration_value: u8) -> heapless::Vec<u8, 32> {
    let mut bytes: heapless::Vec<u8, 32> = heapless::Vec::new();
    bytes
        .extend_from_slice(&[9, DESC_TYPE_CONFIGURATION, 9 + 9 + 7, 0, 1, configuration_value, 0, 0x80, 50])
        .unwrap();
    bytes.extend_from_slice(&[9, 0x04, 0, 0, 1, 0x09, 0, 0, 0]).unwrap();
    bytes.extend_from_slice(&[7, 0x05, 0x81, 0x03, 1, 1, 0x0C]).unwrap();
    bytes
}
