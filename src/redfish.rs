//! Attribute-Registry bridge stub (spec.md §1's "ancillary glue"): the only
//! surface this core needs from the platform's Redfish plumbing is
//! registering a human-readable name for a device it enumerated or
//! unlocked. The HII forms/string-database mining that builds the rest of
//! the registry is explicitly out of scope (spec.md Non-goals).

use crate::error::{ErrorClass, ErrorKind};
use heapless::String;

pub const MAX_TAG_LEN: usize = 64;
pub const MAX_NAME_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedfishError {
    /// Tag or name exceeded the bounded buffer.
    InvalidArgument,
    /// The registry has no room for another entry.
    OutOfResources,
}

impl ErrorClass for RedfishError {
    fn kind(&self) -> ErrorKind {
        match self {
            RedfishError::InvalidArgument => ErrorKind::InvalidArgument,
            RedfishError::OutOfResources => ErrorKind::OutOfResources,
        }
    }
}

/// Collaborator implemented by the platform's Redfish attribute-registry
/// glue; this crate only ever calls `register_device_name`.
pub trait AttributeRegistryBridge {
    fn register_device_name(&mut self, tag: &str, name: &str) -> Result<(), RedfishError>;
}

/// In-memory registry used by tests and by firmware glue that defers the
/// actual HII publication to a later boot phase.
pub struct StaticAttributeRegistry<const N: usize> {
    entries: heapless::Vec<(String<MAX_TAG_LEN>, String<MAX_NAME_LEN>), N>,
}

impl<const N: usize> StaticAttributeRegistry<N> {
    pub fn new() -> Self {
        Self { entries: heapless::Vec::new() }
    }

    pub fn entries(&self) -> &[(String<MAX_TAG_LEN>, String<MAX_NAME_LEN>)] {
        &self.entries
    }
}

impl<const N: usize> Default for StaticAttributeRegistry<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> AttributeRegistryBridge for StaticAttributeRegistry<N> {
    fn register_device_name(&mut self, tag: &str, name: &str) -> Result<(), RedfishError> {
        let tag: String<MAX_TAG_LEN> = String::try_from(tag).map_err(|_| RedfishError::InvalidArgument)?;
        let name: String<MAX_NAME_LEN> =
            String::try_from(name).map_err(|_| RedfishError::InvalidArgument)?;
        if let Some(existing) = self.entries.iter_mut().find(|(t, _)| *t == tag) {
            existing.1 = name;
            return Ok(());
        }
        self.entries
            .push((tag, name))
            .map_err(|_| RedfishError::OutOfResources)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_and_updates_a_device_name() {
        let mut registry: StaticAttributeRegistry<4> = StaticAttributeRegistry::new();
        registry.register_device_name("x-UEFI-redfish-usb0", "USB Root Hub").unwrap();
        registry.register_device_name("x-UEFI-redfish-usb0", "USB Root Hub (renamed)").unwrap();
        assert_eq!(registry.entries().len(), 1);
        assert_eq!(registry.entries()[0].1.as_str(), "USB Root Hub (renamed)");
    }

    #[test]
    fn out_of_resources_when_registry_is_full() {
        let mut registry: StaticAttributeRegistry<1> = StaticAttributeRegistry::new();
        registry.register_device_name("a", "A").unwrap();
        let err = registry.register_device_name("b", "B").unwrap_err();
        assert_eq!(err, RedfishError::OutOfResources);
    }
}
