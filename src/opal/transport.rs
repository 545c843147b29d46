//! Trusted-I/O multiplexer (spec.md §4.5): a single entry point that routes
//! SECURITY SEND/RECEIVE to the transport matching a device's `OpalDeviceKind`.

use super::ahci::AhciContext;
use super::error::OpalError;
use super::ide::IdeContext;
use super::nvme::NvmeContext;
use crate::time::PlatformClock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustedIoDirection {
    Send,
    Receive,
}

/// The concrete transport context backing a trusted-I/O request, chosen by
/// the caller to match the `OpalSmmDevice::kind` being serviced.
pub enum TransportHandle<'a> {
    Ahci(&'a mut AhciContext),
    Nvme(&'a mut NvmeContext),
    Ide(&'a mut IdeContext),
}

/// spec.md §4.5: route to AHCI/NVMe/IDE based on which handle the caller
/// supplies (the caller already dispatched on `device.kind` to build it).
pub fn trusted_io(
    handle: TransportHandle,
    clock: &impl PlatformClock,
    direction: TrustedIoDirection,
    protocol_id: u8,
    sp_specific: u16,
    buffer: &mut [u8],
) -> Result<(), OpalError> {
    match handle {
        TransportHandle::Ahci(ctx) => {
            super::ahci::trusted_io(ctx, clock, direction, protocol_id, sp_specific, buffer)
        }
        TransportHandle::Nvme(ctx) => {
            super::nvme::trusted_io(ctx, clock, direction, protocol_id, sp_specific, buffer)
        }
        TransportHandle::Ide(ctx) => {
            super::ide::trusted_io(ctx, clock, direction, protocol_id, sp_specific, buffer)
        }
    }
}

/// Produced interface (spec.md §6): the external-facing send/receive surface,
/// implemented on top of [`trusted_io`] for a caller that already knows which
/// transport a given device uses.
pub trait StorageSecurityCommand {
    fn send_data(&mut self, protocol_id: u8, sp_specific: u16, buffer: &[u8]) -> Result<(), OpalError>;

    fn receive_data(
        &mut self,
        protocol_id: u8,
        sp_specific: u16,
        buffer: &mut [u8],
    ) -> Result<(), OpalError>;
}

/// Largest SECURITY SEND payload this surface copies onto its local stack
/// buffer; sized for the 8 KiB PRP-chaining case (spec.md §8 scenario 5).
/// A transport with a tighter limit (AHCI's single 512-byte bounce buffer)
/// still enforces its own bound inside its own `trusted_io`.
pub const MAX_SEND_PAYLOAD_BYTES: usize = 8192;

/// Binds a transport handle and a clock into a [`StorageSecurityCommand`]
/// implementation, so `replay::run` can hand the Opal session helper a
/// single object regardless of which storage stack backs it.
pub struct OpalTrustedIo<'a, 'c, C: PlatformClock> {
    handle: TransportHandle<'a>,
    clock: &'c C,
}

impl<'a, 'c, C: PlatformClock> OpalTrustedIo<'a, 'c, C> {
    pub fn new(handle: TransportHandle<'a>, clock: &'c C) -> Self {
        Self { handle, clock }
    }
}

impl<'a, 'c, C: PlatformClock> StorageSecurityCommand for OpalTrustedIo<'a, 'c, C> {
    fn send_data(&mut self, protocol_id: u8, sp_specific: u16, buffer: &[u8]) -> Result<(), OpalError> {
        if buffer.len() > MAX_SEND_PAYLOAD_BYTES {
            return Err(OpalError::OutOfResources);
        }
        let mut scratch = [0u8; MAX_SEND_PAYLOAD_BYTES];
        scratch[..buffer.len()].copy_from_slice(buffer);
        trusted_io(
            replace_handle(&mut self.handle),
            self.clock,
            TrustedIoDirection::Send,
            protocol_id,
            sp_specific,
            &mut scratch[..buffer.len()],
        )
    }

    fn receive_data(
        &mut self,
        protocol_id: u8,
        sp_specific: u16,
        buffer: &mut [u8],
    ) -> Result<(), OpalError> {
        trusted_io(
            replace_handle(&mut self.handle),
            self.clock,
            TrustedIoDirection::Receive,
            protocol_id,
            sp_specific,
            buffer,
        )
    }
}

/// Re-borrows the transport handle for a single `trusted_io` call without
/// requiring `TransportHandle` to implement `Clone` (its variants hold
/// exclusive references).
fn replace_handle<'a, 'b>(handle: &'b mut TransportHandle<'a>) -> TransportHandle<'b> {
    match handle {
        TransportHandle::Ahci(ctx) => TransportHandle::Ahci(ctx),
        TransportHandle::Nvme(ctx) => TransportHandle::Nvme(ctx),
        TransportHandle::Ide(ctx) => TransportHandle::Ide(ctx),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::ide::IdeContext;

    struct NoopClock;
    impl PlatformClock for NoopClock {
        fn monotonic_us(&self) -> u64 {
            0
        }
        fn stall_us(&self, _microseconds: u64) {}
    }

    #[test]
    fn oversized_send_payload_is_rejected_not_truncated() {
        let mut ide = IdeContext { command_block: 0x1F0, control_block: 0x3F6, port: 0 };
        let mut security = OpalTrustedIo::new(TransportHandle::Ide(&mut ide), &NoopClock);
        let oversized = [0u8; MAX_SEND_PAYLOAD_BYTES + 1];

        let result = security.send_data(0x01, 0x0000, &oversized);

        assert_eq!(result, Err(OpalError::OutOfResources));
    }
}
