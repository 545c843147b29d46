//! PCI config-space collaborator surface plus the bridge walk and
//! root-port memory-window programming the NVMe S3-replay path needs
//! (spec.md §4.8 step 1).

use super::device::PciAddress;
use super::error::OpalError;

/// PCI config-space read/write (spec.md §6: "PCI config read/write 8/16/32").
pub trait PciConfigIo {
    fn read8(&self, addr: PciAddress, offset: u16) -> u8;
    fn read16(&self, addr: PciAddress, offset: u16) -> u16;
    fn read32(&self, addr: PciAddress, offset: u16) -> u32;
    fn write8(&self, addr: PciAddress, offset: u16, value: u8);
    fn write16(&self, addr: PciAddress, offset: u16, value: u16);
    fn write32(&self, addr: PciAddress, offset: u16, value: u32);
}

pub const OFFSET_COMMAND: u16 = 0x04;
pub const OFFSET_SECONDARY_BUS: u16 = 0x19;
pub const OFFSET_SUBORDINATE_BUS: u16 = 0x1A;
pub const OFFSET_MEMORY_BASE: u16 = 0x20;
pub const OFFSET_MEMORY_LIMIT: u16 = 0x22;

const COMMAND_MEMORY_SPACE: u16 = 1 << 1;
const COMMAND_BUS_MASTER: u16 = 1 << 2;

/// Snapshot of one bridge's config-space fields this crate mutates, so they
/// can be restored byte-for-byte once S3 resume completes (spec.md §4.8 step 5).
#[derive(Debug, Clone, Copy)]
pub struct BridgeSnapshot {
    pub addr: PciAddress,
    pub command: u16,
    pub secondary_bus: u8,
    pub subordinate_bus: u8,
    pub memory_base: u16,
    pub memory_limit: u16,
}

impl BridgeSnapshot {
    pub fn capture(io: &impl PciConfigIo, addr: PciAddress) -> Self {
        Self {
            addr,
            command: io.read16(addr, OFFSET_COMMAND),
            secondary_bus: io.read8(addr, OFFSET_SECONDARY_BUS),
            subordinate_bus: io.read8(addr, OFFSET_SUBORDINATE_BUS),
            memory_base: io.read16(addr, OFFSET_MEMORY_BASE),
            memory_limit: io.read16(addr, OFFSET_MEMORY_LIMIT),
        }
    }

    pub fn restore(&self, io: &impl PciConfigIo) {
        io.write8(self.addr, OFFSET_SECONDARY_BUS, self.secondary_bus);
        io.write8(self.addr, OFFSET_SUBORDINATE_BUS, self.subordinate_bus);
        io.write16(self.addr, OFFSET_MEMORY_BASE, self.memory_base);
        io.write16(self.addr, OFFSET_MEMORY_LIMIT, self.memory_limit);
        io.write16(self.addr, OFFSET_COMMAND, self.command);
    }
}

/// Encode a 32-bit BAR into the 16-bit base/limit register pair bridges use
/// (bits 15:4 of the BAR placed at bits 15:4 of the register, per the PCI
/// bridge spec's 1 MiB memory-window granularity).
fn window_register(addr: u32) -> u16 {
    ((addr >> 16) as u16) & 0xFFF0
}

/// spec.md §4.8 step 1: walk every bridge hop, program each intermediate
/// bridge's secondary/subordinate bus and memory window to cover the
/// endpoint's BAR, then enable bus-master + memory on the final root port.
/// Returns the snapshots needed to undo this in reverse at step 5.
pub fn open_bridge_path<const N: usize>(
    io: &impl PciConfigIo,
    bridge_chain: &[PciAddress],
    secondary_bus: u8,
    endpoint_bar: u32,
    window_size: u32,
) -> Result<heapless::Vec<BridgeSnapshot, N>, OpalError> {
    let mut snapshots: heapless::Vec<BridgeSnapshot, N> = heapless::Vec::new();
    let base = window_register(endpoint_bar);
    let limit = window_register(endpoint_bar.saturating_add(window_size.saturating_sub(1)));

    for (i, &hop) in bridge_chain.iter().enumerate() {
        let snapshot = BridgeSnapshot::capture(io, hop);
        snapshots.push(snapshot).map_err(|_| OpalError::OutOfResources)?;

        io.write8(hop, OFFSET_SECONDARY_BUS, secondary_bus);
        io.write8(hop, OFFSET_SUBORDINATE_BUS, secondary_bus);
        io.write16(hop, OFFSET_MEMORY_BASE, base);
        io.write16(hop, OFFSET_MEMORY_LIMIT, limit);

        let is_final = i == bridge_chain.len() - 1;
        let mut command = io.read16(hop, OFFSET_COMMAND);
        command |= COMMAND_MEMORY_SPACE;
        if is_final {
            command |= COMMAND_BUS_MASTER;
        }
        io.write16(hop, OFFSET_COMMAND, command);
    }

    Ok(snapshots)
}

/// spec.md §4.8 step 5: restore each saved bridge config space in reverse,
/// disabling memory/bus-master decode as part of the restored command word.
pub fn close_bridge_path(io: &impl PciConfigIo, snapshots: &[BridgeSnapshot]) {
    for snapshot in snapshots.iter().rev() {
        snapshot.restore(io);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::RefCell;

    struct FakePci {
        regs: RefCell<heapless::FnvIndexMap<(u8, u8, u8, u16), u32, 32>>,
    }

    impl FakePci {
        fn new() -> Self {
            Self {
                regs: RefCell::new(heapless::FnvIndexMap::new()),
            }
        }

        fn key(addr: PciAddress, offset: u16) -> (u8, u8, u8, u16) {
            (addr.bus, addr.device, addr.function, offset)
        }
    }

    impl PciConfigIo for FakePci {
        fn read8(&self, addr: PciAddress, offset: u16) -> u8 {
            *self.regs.borrow().get(&Self::key(addr, offset)).unwrap_or(&0) as u8
        }
        fn read16(&self, addr: PciAddress, offset: u16) -> u16 {
            *self.regs.borrow().get(&Self::key(addr, offset)).unwrap_or(&0) as u16
        }
        fn read32(&self, addr: PciAddress, offset: u16) -> u32 {
            *self.regs.borrow().get(&Self::key(addr, offset)).unwrap_or(&0)
        }
        fn write8(&self, addr: PciAddress, offset: u16, value: u8) {
            self.regs.borrow_mut().insert(Self::key(addr, offset), value as u32).ok();
        }
        fn write16(&self, addr: PciAddress, offset: u16, value: u16) {
            self.regs.borrow_mut().insert(Self::key(addr, offset), value as u32).ok();
        }
        fn write32(&self, addr: PciAddress, offset: u16, value: u32) {
            self.regs.borrow_mut().insert(Self::key(addr, offset), value).ok();
        }
    }

    #[test]
    fn open_then_close_restores_original_command() {
        let pci = FakePci::new();
        let bridge = PciAddress { bus: 0, device: 2, function: 0 };
        pci.write16(bridge, OFFSET_COMMAND, 0); // memory/bus-master initially off

        let snapshots: heapless::Vec<BridgeSnapshot, 4> =
            open_bridge_path(&pci, &[bridge], 0x02, 0xFE000000, 0x0010_0000).unwrap();
        assert_eq!(pci.read8(bridge, OFFSET_SECONDARY_BUS), 0x02);
        assert_ne!(pci.read16(bridge, OFFSET_COMMAND) & COMMAND_MEMORY_SPACE, 0);

        close_bridge_path(&pci, &snapshots);
        assert_eq!(pci.read16(bridge, OFFSET_COMMAND), 0);
        assert_eq!(pci.read8(bridge, OFFSET_SECONDARY_BUS), 0);
    }
}
