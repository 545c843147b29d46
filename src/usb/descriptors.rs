//! Device/configuration/interface/endpoint descriptor types and the
//! forward-scanning, type-tolerant parser that builds a `Configuration`
//! tree out of the raw bytes returned by GET_DESCRIPTOR(CONFIG).

use super::error::UsbError;
use heapless::Vec;
use zerocopy::{FromBytes, Immutable, KnownLayout};

pub const MAX_CONFIGURATIONS: usize = 8;
pub const MAX_INTERFACES: usize = 8;
pub const MAX_ENDPOINTS: usize = 8;
pub const MAX_LANGUAGE_IDS: usize = 16;

/// Largest CONFIG descriptor this crate will fetch/parse in one shot.
/// Exceeding this on the `wTotalLength`-driven second fetch is a loud
/// `OutOfResources` rather than a silent truncation.
pub const MAX_CONFIG_DESCRIPTOR_BYTES: usize = 512;

pub const DESC_TYPE_DEVICE: u8 = 0x01;
pub const DESC_TYPE_CONFIGURATION: u8 = 0x02;
pub const DESC_TYPE_STRING: u8 = 0x03;
pub const DESC_TYPE_INTERFACE: u8 = 0x04;
pub const DESC_TYPE_ENDPOINT: u8 = 0x05;

pub const USB_CLASS_HUB: u8 = 0x09;

const EP_ATTR_TYPE_MASK: u8 = 0x03;
pub const EP_ATTR_CONTROL: u8 = 0x00;
pub const EP_ATTR_ISOCHRONOUS: u8 = 0x01;
pub const EP_ATTR_BULK: u8 = 0x02;
pub const EP_ATTR_INTERRUPT: u8 = 0x03;

/// USB request codes (spec.md §6's wire-level constant table).
pub const REQ_CLEAR_FEATURE: u8 = 0x01;
pub const REQ_SET_ADDRESS: u8 = 0x05;
pub const REQ_GET_DESCRIPTOR: u8 = 0x06;
pub const REQ_SET_CONFIGURATION: u8 = 0x09;

pub const FEATURE_ENDPOINT_HALT: u16 = 0x00;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbSpeed {
    Low,
    Full,
    High,
}

/// 18-byte USB device descriptor, read byte-wise (callers must not assume
/// alignment of the source buffer).
#[derive(Debug, Clone, Copy, FromBytes, Immutable, KnownLayout)]
#[repr(C, packed)]
pub struct DeviceDescriptor {
    pub length: u8,
    pub descriptor_type: u8,
    pub bcd_usb: u16,
    pub device_class: u8,
    pub device_sub_class: u8,
    pub device_protocol: u8,
    pub max_packet_size0: u8,
    pub id_vendor: u16,
    pub id_product: u16,
    pub bcd_device: u16,
    pub manufacturer: u8,
    pub product: u8,
    pub serial_number: u8,
    pub num_configurations: u8,
}

pub const DEVICE_DESCRIPTOR_LEN: usize = core::mem::size_of::<DeviceDescriptor>();

#[derive(Debug, Clone, Copy, FromBytes, Immutable, KnownLayout)]
#[repr(C, packed)]
pub struct ConfigDescriptorHeader {
    pub length: u8,
    pub descriptor_type: u8,
    pub total_length: u16,
    pub num_interfaces: u8,
    pub configuration_value: u8,
    pub configuration: u8,
    pub attributes: u8,
    pub max_power: u8,
}

pub const CONFIG_DESCRIPTOR_LEN: usize = core::mem::size_of::<ConfigDescriptorHeader>();

#[derive(Debug, Clone, Copy, FromBytes, Immutable, KnownLayout)]
#[repr(C, packed)]
pub struct InterfaceDescriptor {
    pub length: u8,
    pub descriptor_type: u8,
    pub interface_number: u8,
    pub alternate_setting: u8,
    pub num_endpoints: u8,
    pub interface_class: u8,
    pub interface_sub_class: u8,
    pub interface_protocol: u8,
    pub interface: u8,
}

pub const INTERFACE_DESCRIPTOR_LEN: usize = core::mem::size_of::<InterfaceDescriptor>();

#[derive(Debug, Clone, Copy, FromBytes, Immutable, KnownLayout)]
#[repr(C, packed)]
pub struct EndpointDescriptor {
    pub length: u8,
    pub descriptor_type: u8,
    pub endpoint_address: u8,
    pub attributes: u8,
    pub max_packet_size: u16,
    pub interval: u8,
}

pub const ENDPOINT_DESCRIPTOR_LEN: usize = core::mem::size_of::<EndpointDescriptor>();

impl EndpointDescriptor {
    pub fn number(&self) -> u8 {
        self.endpoint_address & 0x0F
    }

    pub fn is_in(&self) -> bool {
        self.endpoint_address & 0x80 != 0
    }

    pub fn transfer_type(&self) -> u8 {
        self.attributes & EP_ATTR_TYPE_MASK
    }
}

/// Endpoint plus the private, mutable data-toggle bit (spec.md §3: "toggle
/// bits are private to the endpoint and must survive across transfers").
#[derive(Debug, Clone, Copy)]
pub struct EndpointInfo {
    pub descriptor: EndpointDescriptor,
    pub data_toggle: bool,
}

#[derive(Debug, Clone)]
pub struct InterfaceInfo {
    pub descriptor: InterfaceDescriptor,
    pub endpoints: Vec<EndpointInfo, MAX_ENDPOINTS>,
}

impl InterfaceInfo {
    pub fn is_hub(&self) -> bool {
        self.descriptor.interface_class == USB_CLASS_HUB
            && self.descriptor.interface_protocol == 0
            && self
                .endpoints
                .iter()
                .any(|e| e.descriptor.transfer_type() == EP_ATTR_INTERRUPT && e.descriptor.is_in())
    }
}

#[derive(Debug, Clone)]
pub struct ConfigurationInfo {
    pub header: ConfigDescriptorHeader,
    pub interfaces: Vec<InterfaceInfo, MAX_INTERFACES>,
}

#[derive(Debug, Clone)]
pub struct Configuration {
    pub configurations: Vec<ConfigurationInfo, MAX_CONFIGURATIONS>,
}

/// A byte-wise `(length, type)` cursor over a descriptor buffer.
struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    /// Peek the `(length, type)` header of the descriptor at the cursor,
    /// without consuming it. `None` at end-of-buffer.
    fn peek_header(&self) -> Option<(u8, u8)> {
        if self.remaining() < 2 {
            return None;
        }
        Some((self.bytes[self.pos], self.bytes[self.pos + 1]))
    }

    fn skip(&mut self, len: u8) {
        self.pos += len as usize;
    }

    /// Advance past descriptors that don't match `expected_type`, per
    /// spec.md §4.1 step 1. Returns `Ok(Some(()))` once positioned on a
    /// matching descriptor, `Ok(None)` at end-of-buffer, or an error if a
    /// descriptor's declared length is out of range.
    fn skip_to(&mut self, expected_type: u8) -> Result<Option<()>, UsbError> {
        loop {
            let Some((len, ty)) = self.peek_header() else {
                return Ok(None);
            };
            if ty == expected_type {
                return Ok(Some(()));
            }
            if (len as usize) < 2 || len as usize > self.remaining() {
                return Err(UsbError::DeviceError);
            }
            self.skip(len);
        }
    }

    /// Read a fixed-size descriptor header at the cursor, enforcing
    /// spec.md §4.1 step 2: a type match with length greater than
    /// expected is fatal (we'd misalign everything after it).
    fn read_fixed<T: FromBytes + Immutable + KnownLayout>(
        &mut self,
        expected_type: u8,
        expected_len: usize,
    ) -> Result<T, UsbError> {
        let (len, ty) = self.peek_header().ok_or(UsbError::DeviceError)?;
        if (len as usize) < 2 || len as usize > self.remaining() {
            return Err(UsbError::DeviceError);
        }
        if ty != expected_type {
            return Err(UsbError::DeviceError);
        }
        if len as usize > expected_len {
            return Err(UsbError::DeviceError);
        }
        let slice = &self.bytes[self.pos..self.pos + expected_len.min(len as usize)];
        let value = T::read_from_prefix(slice)
            .map_err(|_| UsbError::DeviceError)?
            .0;
        self.skip(len);
        Ok(value)
    }
}

/// Parse one endpoint descriptor at the cursor.
fn parse_endpoint(cursor: &mut Cursor) -> Result<EndpointInfo, UsbError> {
    cursor.skip_to(DESC_TYPE_ENDPOINT)?.ok_or(UsbError::DeviceError)?;
    let descriptor: EndpointDescriptor =
        cursor.read_fixed(DESC_TYPE_ENDPOINT, ENDPOINT_DESCRIPTOR_LEN)?;
    Ok(EndpointInfo {
        descriptor,
        data_toggle: false,
    })
}

/// Parse one interface descriptor plus its endpoints.
fn parse_interface(cursor: &mut Cursor) -> Result<InterfaceInfo, UsbError> {
    cursor
        .skip_to(DESC_TYPE_INTERFACE)?
        .ok_or(UsbError::DeviceError)?;
    let descriptor: InterfaceDescriptor =
        cursor.read_fixed(DESC_TYPE_INTERFACE, INTERFACE_DESCRIPTOR_LEN)?;

    let mut endpoints = Vec::new();
    for _ in 0..descriptor.num_endpoints {
        match parse_endpoint(cursor) {
            Ok(ep) => {
                // A full endpoint table is a malformed/hostile descriptor;
                // the mismatch is caught by the caller comparing counts.
                let _ = endpoints.push(ep);
            }
            Err(e) => return Err(e),
        }
    }
    if endpoints.len() != descriptor.num_endpoints as usize {
        return Err(UsbError::DeviceError);
    }
    Ok(InterfaceInfo {
        descriptor,
        endpoints,
    })
}

/// Parse one configuration descriptor plus its interfaces. A child's parse
/// failure aborts only this configuration (spec.md §4.1 step 4); the
/// caller continues with the next configuration index.
fn parse_one_configuration(cursor: &mut Cursor) -> Result<ConfigurationInfo, UsbError> {
    cursor
        .skip_to(DESC_TYPE_CONFIGURATION)?
        .ok_or(UsbError::DeviceError)?;
    let header: ConfigDescriptorHeader =
        cursor.read_fixed(DESC_TYPE_CONFIGURATION, CONFIG_DESCRIPTOR_LEN)?;

    let mut interfaces = Vec::new();
    for _ in 0..header.num_interfaces {
        let iface = parse_interface(cursor)?;
        let _ = interfaces.push(iface);
    }
    if interfaces.len() != header.num_interfaces as usize {
        return Err(UsbError::DeviceError);
    }
    Ok(ConfigurationInfo { header, interfaces })
}

/// Parse a full CONFIG descriptor buffer (the bytes of exactly one
/// configuration, as returned by the second GET_DESCRIPTOR(CONFIG, total_length)
/// fetch) into a `ConfigurationInfo`. A bad child configuration aborts
/// only itself; it is up to `usb::bus` to call this once per configuration
/// index and skip indices that fail.
pub fn parse_configuration(bytes: &[u8]) -> Result<ConfigurationInfo, UsbError> {
    if bytes.len() > MAX_CONFIG_DESCRIPTOR_BYTES {
        return Err(UsbError::OutOfResources);
    }
    let mut cursor = Cursor::new(bytes);
    parse_one_configuration(&mut cursor)
}

/// Read just `bLength`/`bDescriptorType`/`wTotalLength` out of the first 4
/// bytes of a CONFIG descriptor (spec.md §4.2 step 7's first fetch).
pub fn peek_config_total_length(first_four_bytes: &[u8]) -> Result<u16, UsbError> {
    if first_four_bytes.len() < 4 {
        return Err(UsbError::DeviceError);
    }
    if first_four_bytes[1] != DESC_TYPE_CONFIGURATION {
        return Err(UsbError::DeviceError);
    }
    Ok(u16::from_le_bytes([first_four_bytes[2], first_four_bytes[3]]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config_bytes() -> Vec<u8, MAX_CONFIG_DESCRIPTOR_BYTES> {
        let mut v: Vec<u8, MAX_CONFIG_DESCRIPTOR_BYTES> = Vec::new();
        // Configuration header: 9 bytes, 1 interface.
        v.extend_from_slice(&[9, DESC_TYPE_CONFIGURATION, 9 + 9 + 7, 0, 1, 1, 0, 0x80, 50])
            .unwrap();
        // Interface: 9 bytes, 1 endpoint, class 3 (HID) to avoid the hub path.
        v.extend_from_slice(&[9, DESC_TYPE_INTERFACE, 0, 0, 1, 3, 0, 0, 0])
            .unwrap();
        // Endpoint: 7 bytes, bulk IN ep 1, max packet 64, interval 0.
        v.extend_from_slice(&[7, DESC_TYPE_ENDPOINT, 0x81, EP_ATTR_BULK, 64, 0, 0])
            .unwrap();
        v
    }

    #[test]
    fn parses_single_interface_single_endpoint() {
        let bytes = sample_config_bytes();
        let config = parse_configuration(&bytes).expect("should parse");
        assert_eq!(config.interfaces.len(), 1);
        assert_eq!(config.interfaces[0].endpoints.len(), 1);
        assert_eq!(config.interfaces[0].endpoints[0].descriptor.number(), 1);
        assert!(config.interfaces[0].endpoints[0].descriptor.is_in());
    }

    #[test]
    fn skips_unknown_descriptor_types() {
        let mut bytes = sample_config_bytes();
        // Insert a vendor-specific descriptor (type 0x21) between config header
        // and the interface; it must be skipped, not misparsed as an interface.
        let mut with_vendor: Vec<u8, MAX_CONFIG_DESCRIPTOR_BYTES> = Vec::new();
        with_vendor.extend_from_slice(&bytes[0..9]).unwrap();
        with_vendor.extend_from_slice(&[4, 0x21, 0xAA, 0xBB]).unwrap();
        with_vendor.extend_from_slice(&bytes[9..]).unwrap();
        // Patch total_length to include the 4 extra bytes.
        with_vendor[2] = with_vendor[2].wrapping_add(4);
        bytes = with_vendor;

        let config = parse_configuration(&bytes).expect("should parse past vendor descriptor");
        assert_eq!(config.interfaces.len(), 1);
    }

    #[test]
    fn oversized_expected_length_is_fatal() {
        let mut bytes = sample_config_bytes();
        // Claim the config header is 10 bytes long (greater than the 9 we expect).
        bytes[0] = 10;
        assert!(parse_configuration(&bytes).is_err());
    }

    #[test]
    fn mismatched_endpoint_count_discards_configuration() {
        let mut bytes = sample_config_bytes();
        // Claim 2 endpoints but only provide 1.
        bytes[9 + 4] = 2;
        assert!(parse_configuration(&bytes).is_err());
    }

    #[test]
    fn oversized_buffer_is_out_of_resources() {
        let bytes = [0u8; MAX_CONFIG_DESCRIPTOR_BYTES + 1];
        assert_eq!(parse_configuration(&bytes), Err(UsbError::OutOfResources));
    }

    #[test]
    fn peek_total_length_reads_little_endian() {
        let bytes = sample_config_bytes();
        let total = peek_config_total_length(&bytes[0..4]).unwrap();
        assert_eq!(total, 9 + 9 + 7);
    }
}
