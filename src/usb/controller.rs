//! Per-interface `Controller` / `Device` / hub tree model (spec.md §3),
//! stored in a bounded arena and cross-referenced by `u16` handles rather
//! than intrusive back-pointers (spec.md §9's back-pointer-cycle redesign
//! flag: `USB_IO_DEVICE <-> USB_IO_CONTROLLER_DEVICE <-> parent-hub
//! controller` becomes index lookups into `Bus`'s two arenas).

use super::descriptors::{Configuration, ConfigurationInfo, DeviceDescriptor, MAX_LANGUAGE_IDS};
use super::devpath::Fragment;
use super::hcc::HostControllerCapability;
use heapless::Vec;

pub const MAX_DEVICES: usize = 32;
pub const MAX_CONTROLLERS: usize = 64;
pub const MAX_HUB_PORTS: usize = 8;

/// Index into `Bus`'s device arena. Never an owning pointer.
pub type DeviceHandle = u16;
/// Index into `Bus`'s controller arena.
pub type ControllerHandle = u16;
/// A `ControllerHandle` known to own `HubFields`.
pub type HubHandle = ControllerHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbSpeed {
    Low,
    Full,
    High,
}

/// A device (spec.md §3's "device" entity).
#[derive(Debug, Clone)]
pub struct Device {
    pub address: u8,
    pub speed: UsbSpeed,
    pub descriptor: DeviceDescriptor,
    pub configurations: Configuration,
    pub active_configuration: Option<u8>,
    pub language_ids: Vec<u16, MAX_LANGUAGE_IDS>,
}

impl Device {
    pub fn active_config_info(&self) -> Option<&ConfigurationInfo> {
        let value = self.active_configuration?;
        self.configurations
            .configurations
            .iter()
            .find(|c| c.header.configuration_value == value)
    }
}

/// Per-port state (spec.md §4.9's port state machine).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    Empty,
    Resetting,
    Addressing,
    Configuring,
    Ready,
    TornDown,
}

/// Hub-specific fields, present on a `Controller` only when its interface
/// is itself a hub (spec.md §3's "hub" entity).
#[derive(Debug, Clone)]
pub struct HubFields {
    pub num_ports: u8,
    pub interrupt_endpoint: u8,
    /// One bit per port, set while a status-change is pending acknowledgement.
    pub status_change_latch: u8,
    pub children: [Option<DeviceHandle>; MAX_HUB_PORTS],
    pub port_states: [PortState; MAX_HUB_PORTS],
}

impl HubFields {
    pub fn new(num_ports: u8, interrupt_endpoint: u8) -> Self {
        Self {
            num_ports,
            interrupt_endpoint,
            status_change_latch: 0,
            children: [None; MAX_HUB_PORTS],
            port_states: [PortState::Empty; MAX_HUB_PORTS],
        }
    }
}

/// A controller: the per-interface handle (spec.md §3's "controller" entity).
#[derive(Debug, Clone)]
pub struct Controller {
    pub interface_number: u8,
    pub configuration_value: u8,
    pub device: DeviceHandle,
    pub parent_hub: Option<HubHandle>,
    pub parent_port: u8,
    pub path: Fragment,
    pub bound: bool,
    pub hub: Option<HubFields>,
}

impl Controller {
    pub fn is_hub(&self) -> bool {
        self.hub.is_some()
    }
}

/// A bounded slot arena with free-list reuse, used for both the device and
/// controller tables. Slots are `None` when free.
#[derive(Debug)]
pub struct Arena<T, const N: usize> {
    slots: Vec<Option<T>, N>,
}

impl<T, const N: usize> Arena<T, N> {
    pub fn new() -> Self {
        Self { slots: Vec::new() }
    }

    /// Insert `value` into the first free slot, or append if none exists.
    /// Returns `None` if the arena is full.
    pub fn insert(&mut self, value: T) -> Option<u16> {
        if let Some(idx) = self.slots.iter().position(|s| s.is_none()) {
            self.slots[idx] = Some(value);
            return Some(idx as u16);
        }
        if self.slots.push(Some(value)).is_err() {
            return None;
        }
        Some((self.slots.len() - 1) as u16)
    }

    pub fn get(&self, handle: u16) -> Option<&T> {
        self.slots.get(handle as usize).and_then(|s| s.as_ref())
    }

    pub fn get_mut(&mut self, handle: u16) -> Option<&mut T> {
        self.slots.get_mut(handle as usize).and_then(|s| s.as_mut())
    }

    /// Remove and return the value at `handle`, freeing the slot for reuse.
    pub fn remove(&mut self, handle: u16) -> Option<T> {
        self.slots.get_mut(handle as usize).and_then(|s| s.take())
    }

    pub fn iter(&self) -> impl Iterator<Item = (u16, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|v| (i as u16, v)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (u16, &mut T)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(i, s)| s.as_mut().map(|v| (i as u16, v)))
    }
}

/// Marker type used only to name the HCC generic parameter threaded through
/// `Bus`; kept here so `bus.rs` and `hub.rs` share one spelling.
pub trait Hcc: HostControllerCapability {}
impl<T: HostControllerCapability> Hcc for T {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arena_reuses_freed_slots() {
        let mut arena: Arena<u32, 4> = Arena::new();
        let a = arena.insert(1).unwrap();
        let b = arena.insert(2).unwrap();
        arena.remove(a);
        let c = arena.insert(3).unwrap();
        assert_eq!(c, a, "freed slot should be reused before growing");
        assert_eq!(*arena.get(b).unwrap(), 2);
    }

    #[test]
    fn arena_reports_full() {
        let mut arena: Arena<u32, 2> = Arena::new();
        assert!(arena.insert(1).is_some());
        assert!(arena.insert(2).is_some());
        assert!(arena.insert(3).is_none());
    }
}
