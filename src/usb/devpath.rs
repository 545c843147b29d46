//! Device-path fragment builder.
//!
//! spec.md §4.2 step 11: each controller gets a fragment
//! `{parent_path, USB(interface, parent_port)}`. Appending that fragment
//! onto a published, firmware-owned device path is external (spec.md §1's
//! "device-path append" collaborator) — this module only builds the USB
//! node bytes, modeled after the teacher's `UsbDevicePathNode` layout in
//! `efi/protocols/device_path.rs`, without the allocator/pointer machinery
//! that module used for an owned, published path.

use heapless::Vec;

const TYPE_MESSAGING: u8 = 0x03;
const SUBTYPE_USB: u8 = 0x05;
const USB_NODE_LEN: u8 = 6;

/// Maximum device-path fragment length this crate will build: the root
/// hub's own fragment (from the firmware) is not copied in, only the USB
/// nodes this crate appends on top, one per hub hop plus the final device.
pub const MAX_FRAGMENT_BYTES: usize = 64;

/// A bounded sequence of raw USB device-path nodes, built bottom-up as the
/// enumerator descends through nested hubs. Never appended into a
/// published path by this crate (spec.md §1); handed to the caller's
/// device-path-append collaborator instead.
#[derive(Debug, Clone, Default)]
pub struct Fragment {
    bytes: Vec<u8, MAX_FRAGMENT_BYTES>,
}

impl Fragment {
    pub fn empty() -> Self {
        Self { bytes: Vec::new() }
    }

    /// Append a USB(interface, parent_port) node onto `parent`, returning
    /// the child's fragment. Matches the teacher's `UsbDevicePathNode`
    /// field order (type, sub_type, length-le16, parent_port, interface).
    pub fn child(parent: &Fragment, parent_port: u8, interface: u8) -> Result<Self, ()> {
        let mut bytes = parent.bytes.clone();
        let node = [
            TYPE_MESSAGING,
            SUBTYPE_USB,
            USB_NODE_LEN,
            0,
            parent_port,
            interface,
        ];
        bytes.extend_from_slice(&node).map_err(|_| ())?;
        Ok(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn node_count(&self) -> usize {
        self.bytes.len() / USB_NODE_LEN as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_fragment_appends_one_node() {
        let root = Fragment::empty();
        let hub_iface = Fragment::child(&root, 1, 0).unwrap();
        assert_eq!(hub_iface.node_count(), 1);
        let device = Fragment::child(&hub_iface, 3, 0).unwrap();
        assert_eq!(device.node_count(), 2);
        assert_eq!(device.as_bytes()[0], TYPE_MESSAGING);
        assert_eq!(device.as_bytes()[1], SUBTYPE_USB);
        assert_eq!(device.as_bytes()[6 + 4], 3); // second node's parent_port
    }
}
