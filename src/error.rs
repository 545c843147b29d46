//! Shared error classification for the USB and Opal subsystems.
//!
//! Every subsystem keeps its own error enum (`usb::error::UsbError`,
//! `opal::error::OpalError`) so call sites match on concrete, meaningful
//! variants, but both classify into the same six kinds from the error
//! taxonomy so propagation-policy code (and tests) can reason about
//! "is this retryable" without matching every variant.

/// The six error kinds this core distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Caller passed a null pointer, out-of-range endpoint, or malformed request.
    InvalidArgument,
    /// Command slot busy, hub still powering, controller still enabling. Retry after stall.
    NotReady,
    /// Descriptor parse failure, PIO ERR, non-zero completion status.
    DeviceError,
    /// Bounded wait exceeded.
    Timeout,
    /// Page allocation or bounded-table exhaustion.
    OutOfResources,
    /// Isochronous transfers, unknown command set, unsupported alignment.
    Unsupported,
}

/// Implemented by every subsystem error enum so generic propagation-policy
/// code can classify an error without knowing its concrete type.
pub trait ErrorClass {
    fn kind(&self) -> ErrorKind;

    fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::NotReady)
    }
}
