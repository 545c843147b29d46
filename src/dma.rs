//! DMA-memory collaborator surface shared by the AHCI and NVMe transports.
//!
//! spec.md §6 lists "page allocation with 4 KiB alignment below 4 GiB" as an
//! external platform service; this core never owns physical memory, it only
//! asks for windows and uses them until told to release them.

/// A physical address. Firmware-side allocators return these directly;
/// MMIO register windows are identified the same way.
pub type PhysAddr = u64;

/// 4 KiB, the minimum alignment/granularity every allocation in this crate
/// assumes (NVMe PRP pages, AHCI command tables, the Opal bounce buffer).
pub const PAGE_SIZE: usize = 4096;

/// Physical page allocator. The caller (firmware) is the real owner of the
/// memory; this trait only hands out and reclaims windows.
pub trait PageAllocator {
    /// Allocate `pages` contiguous, zeroed, 4 KiB-aligned pages below 4 GiB.
    /// Returns `None` on exhaustion (mapped to `OutOfResources` by callers).
    fn allocate_pages(&self, pages: usize) -> Option<PhysAddr>;

    /// Release a region previously returned by `allocate_pages`.
    fn free_pages(&self, addr: PhysAddr, pages: usize);
}
