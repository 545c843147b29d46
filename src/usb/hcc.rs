//! Host-Controller Capability (HCC): the one trait surface both the USB
//! enumerator and the produced `UsbIo` transfer surface are built against.
//! A concrete EHCI/XHCI/OHCI driver implements this; this crate never
//! knows which.

use super::error::UsbError;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PortStatus: u32 {
        const CONNECTED      = 1 << 0;
        const ENABLED        = 1 << 1;
        const SUSPENDED      = 1 << 2;
        const OVER_CURRENT   = 1 << 3;
        const RESET          = 1 << 4;
        const LOW_SPEED      = 1 << 9;
        const HIGH_SPEED     = 1 << 10;
        const CONNECT_CHANGE = 1 << 16;
        const ENABLE_CHANGE  = 1 << 17;
        const OC_CHANGE      = 1 << 18;
        const RESET_CHANGE   = 1 << 20;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortFeature {
    Reset,
    Enable,
    Power,
    ConnectChange,
    ResetChange,
    EnableChange,
    OverCurrentChange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HccResetAttributes {
    /// A full host-controller reset.
    Global,
    /// Reset state for the driver, without touching the silicon (used at OS handoff).
    HostOnly,
}

/// Direction of a control/bulk/interrupt transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

/// The SETUP stage of a control transfer.
#[derive(Debug, Clone, Copy)]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

/// Host-controller capability surface consumed by the bus enumerator and
/// the per-interface `UsbIo` transfer surface (spec.md §6).
pub trait HostControllerCapability {
    fn reset(&self, attributes: HccResetAttributes) -> Result<(), UsbError>;

    fn set_state_enabled(&self, enabled: bool) -> Result<(), UsbError>;

    fn get_root_hub_port_number(&self) -> u8;

    fn get_root_hub_port_status(&self, port: u8) -> Result<PortStatus, UsbError>;

    fn set_root_hub_port_feature(&self, port: u8, feature: PortFeature) -> Result<(), UsbError>;

    fn clear_root_hub_port_feature(&self, port: u8, feature: PortFeature) -> Result<(), UsbError>;

    /// Issue a control transfer to `address`. `data` is the data-stage buffer;
    /// its length and `setup.length` must agree with `direction`. Returns the
    /// number of bytes actually transferred.
    fn control_transfer(
        &self,
        address: u8,
        max_packet_size0: u8,
        setup: SetupPacket,
        direction: Direction,
        data: &mut [u8],
    ) -> Result<usize, UsbError>;

    /// Issue a bulk transfer. `toggle` is the endpoint's current data toggle
    /// on entry; on return it holds the HCC-reported final toggle.
    fn bulk_transfer(
        &self,
        address: u8,
        endpoint: u8,
        max_packet_size: u16,
        direction: Direction,
        data: &mut [u8],
        toggle: &mut bool,
    ) -> Result<usize, UsbError>;

    fn sync_interrupt_transfer(
        &self,
        address: u8,
        endpoint: u8,
        max_packet_size: u16,
        direction: Direction,
        data: &mut [u8],
        toggle: &mut bool,
    ) -> Result<usize, UsbError>;

    /// Arm (`is_new = true`) or cancel (`is_new = false`) a periodic interrupt
    /// subscription. `toggle` is written back on cancellation.
    fn async_interrupt_transfer(
        &self,
        address: u8,
        endpoint: u8,
        max_packet_size: u16,
        is_new: bool,
        polling_interval_ms: u16,
        toggle: &mut bool,
    ) -> Result<(), UsbError>;

    fn isochronous_transfer(
        &self,
        _address: u8,
        _endpoint: u8,
        _data: &mut [u8],
    ) -> Result<usize, UsbError> {
        Err(UsbError::Unsupported)
    }

    fn async_isochronous_transfer(
        &self,
        _address: u8,
        _endpoint: u8,
        _data: &mut [u8],
    ) -> Result<(), UsbError> {
        Err(UsbError::Unsupported)
    }
}
