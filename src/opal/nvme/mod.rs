//! NVMe transport for Opal trusted-I/O (spec.md §4.7): controller bring-up,
//! admin-queue command submission, and PRP list construction.

use core::ptr;

use super::error::OpalError;
use super::transport::TrustedIoDirection;
use crate::time::{PlatformClock, Timeout};

use regs::{
    cap_bits, CompletionQueueEntry, NvmeRegisters, SubmissionQueueEntry, ADMIN_QUEUE_ENTRIES,
    DOORBELL_BASE, DOORBELL_STRIDE, IOCQES_LOG2, IOSQES_LOG2, IO_QUEUE_ENTRIES, OPCODE_CREATE_IO_CQ,
    OPCODE_CREATE_IO_SQ, OPCODE_IDENTIFY, OPCODE_SECURITY_RECEIVE, OPCODE_SECURITY_SEND,
};

pub mod regs;

/// Entries per 4 KiB PRP list page (page_size / 8).
pub const PRP_ENTRIES_PER_PAGE: usize = 512;
/// This crate never needs more than two chained PRP list pages: trusted-I/O
/// payloads are bounded to a few KiB by spec.md §3's bounce-buffer sizing.
pub const MAX_PRP_LIST_PAGES: usize = 2;

/// Fixed-layout NVMe resources (spec.md §4.7's region table), addresses
/// physical == virtual under the firmware's flat memory model.
pub struct NvmeContext {
    pub mmio_base: u64,
    pub controller_data: u64,
    pub namespace_data: u64,
    pub admin_sq: u64,
    pub admin_cq: u64,
    pub io_sq: u64,
    pub io_cq: u64,
    pub prp_list_pages: [u64; MAX_PRP_LIST_PAGES],
    pub bounce: u64,

    admin_sq_tail: u16,
    admin_cq_head: u16,
    admin_phase: bool,
    io_sq_tail: u16,
    io_cq_head: u16,
    io_phase: bool,
}

impl NvmeContext {
    pub fn new(
        mmio_base: u64,
        controller_data: u64,
        namespace_data: u64,
        admin_sq: u64,
        admin_cq: u64,
        io_sq: u64,
        io_cq: u64,
        prp_list_pages: [u64; MAX_PRP_LIST_PAGES],
        bounce: u64,
    ) -> Self {
        Self {
            mmio_base,
            controller_data,
            namespace_data,
            admin_sq,
            admin_cq,
            io_sq,
            io_cq,
            prp_list_pages,
            bounce,
            admin_sq_tail: 0,
            admin_cq_head: 0,
            admin_phase: true,
            io_sq_tail: 0,
            io_cq_head: 0,
            io_phase: true,
        }
    }

    fn regs(&self) -> &NvmeRegisters {
        unsafe { &*(self.mmio_base as *const NvmeRegisters) }
    }

    fn doorbell(&self, index: u64) -> *mut u32 {
        (self.mmio_base + DOORBELL_BASE + index * DOORBELL_STRIDE) as *mut u32
    }

    /// spec.md §4.7 init sequence: disable, program AQA/ASQ/ACQ, enable,
    /// create the I/O CQ/SQ, identify controller and namespace.
    pub fn init(&mut self, clock: &impl PlatformClock, nsid: u32) -> Result<(), OpalError> {
        use regs::{AQA, CC, CSTS};

        let regs = self.regs();
        let cap = regs.cap.get();
        if cap & cap_bits::CSS_NVM_COMMAND_SET == 0 {
            return Err(OpalError::Unsupported);
        }
        let mpsmin = (cap >> cap_bits::MPSMIN_SHIFT) & cap_bits::MPSMIN_MASK;
        if mpsmin + 12 > 12 {
            return Err(OpalError::Unsupported);
        }
        let timeout_500ms_units = ((cap >> cap_bits::TO_SHIFT) & cap_bits::TO_MASK).max(1);

        regs.cc.modify(CC::EN::CLEAR);
        let disable_timeout = Timeout::from_ms(clock, timeout_500ms_units * 500);
        while regs.csts.is_set(CSTS::RDY) {
            if disable_timeout.is_expired(clock) {
                return Err(OpalError::Timeout);
            }
            clock.stall_us(100);
        }

        regs.aqa.write(
            AQA::ASQS.val((ADMIN_QUEUE_ENTRIES - 1) as u32)
                + AQA::ACQS.val((ADMIN_QUEUE_ENTRIES - 1) as u32),
        );
        regs.asq.set(self.admin_sq);
        regs.acq.set(self.admin_cq);

        regs.cc.write(
            CC::EN::SET
                + CC::CSS::NvmCommandSet
                + CC::MPS.val(0)
                + CC::IOSQES.val(IOSQES_LOG2 as u32)
                + CC::IOCQES.val(IOCQES_LOG2 as u32),
        );
        let enable_timeout = Timeout::from_ms(clock, timeout_500ms_units * 500);
        while !regs.csts.is_set(CSTS::RDY) {
            if enable_timeout.is_expired(clock) {
                return Err(OpalError::Timeout);
            }
            clock.stall_us(100);
        }

        self.create_io_cq(clock)?;
        self.create_io_sq(clock)?;
        self.identify(clock, 1, 0, self.controller_data)?;
        self.identify(clock, 0, nsid, self.namespace_data)?;
        Ok(())
    }

    fn create_io_cq(&mut self, clock: &impl PlatformClock) -> Result<(), OpalError> {
        let mut sqe = SubmissionQueueEntry::zeroed();
        sqe.cdw0 = OPCODE_CREATE_IO_CQ as u32;
        sqe.prp1 = self.io_cq;
        sqe.cdw10 = ((IO_QUEUE_ENTRIES as u32 - 1) << 16) | 1;
        sqe.cdw11 = 1; // physically contiguous
        let cqe = self.submit_admin(sqe, clock)?;
        check_status(&cqe)
    }

    fn create_io_sq(&mut self, clock: &impl PlatformClock) -> Result<(), OpalError> {
        let mut sqe = SubmissionQueueEntry::zeroed();
        sqe.cdw0 = OPCODE_CREATE_IO_SQ as u32;
        sqe.prp1 = self.io_sq;
        sqe.cdw10 = ((IO_QUEUE_ENTRIES as u32 - 1) << 16) | 1;
        sqe.cdw11 = (1 << 16) | 1; // CQID=1, physically contiguous
        let cqe = self.submit_admin(sqe, clock)?;
        check_status(&cqe)
    }

    fn identify(
        &mut self,
        clock: &impl PlatformClock,
        cns: u32,
        nsid: u32,
        dest: u64,
    ) -> Result<(), OpalError> {
        let mut sqe = SubmissionQueueEntry::zeroed();
        sqe.cdw0 = OPCODE_IDENTIFY as u32;
        sqe.nsid = nsid;
        sqe.prp1 = dest;
        sqe.cdw10 = cns;
        let cqe = self.submit_admin(sqe, clock)?;
        check_status(&cqe)
    }

    /// Submit one admin-queue command and poll for its completion, per
    /// spec.md §4.7's "polls the current phase bit, advances the head
    /// doorbell, toggles phase on wrap" protocol.
    fn submit_admin(
        &mut self,
        mut sqe: SubmissionQueueEntry,
        clock: &impl PlatformClock,
    ) -> Result<CompletionQueueEntry, OpalError> {
        sqe.cdw0 |= (self.admin_sq_tail as u32) << 16; // command identifier = tail index
        let slot = self.admin_sq as *mut SubmissionQueueEntry;
        unsafe {
            ptr::write_volatile(slot.add(self.admin_sq_tail as usize), sqe);
        }
        self.admin_sq_tail = (self.admin_sq_tail + 1) % ADMIN_QUEUE_ENTRIES;
        core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
        unsafe {
            ptr::write_volatile(self.doorbell(0), self.admin_sq_tail as u32);
        }

        let timeout = Timeout::from_ms(clock, 3000);
        let cq_slot = self.admin_cq as *const CompletionQueueEntry;
        loop {
            let cqe = unsafe { ptr::read_volatile(cq_slot.add(self.admin_cq_head as usize)) };
            if cqe.phase() == self.admin_phase {
                self.admin_cq_head = (self.admin_cq_head + 1) % ADMIN_QUEUE_ENTRIES;
                if self.admin_cq_head == 0 {
                    self.admin_phase = !self.admin_phase;
                }
                unsafe {
                    ptr::write_volatile(self.doorbell(1), self.admin_cq_head as u32);
                }
                return Ok(cqe);
            }
            if timeout.is_expired(clock) {
                return Err(OpalError::Timeout);
            }
            clock.stall_us(100);
        }
    }
}

fn check_status(cqe: &CompletionQueueEntry) -> Result<(), OpalError> {
    if cqe.sct_sc() != 0 {
        Err(OpalError::DeviceError)
    } else {
        Ok(())
    }
}

/// spec.md §4.5/§4.7: SECURITY SEND/RECEIVE admin command, `sp_specific`
/// byte-swapped before placement per the original firmware's field layout.
pub fn trusted_io(
    ctx: &mut NvmeContext,
    clock: &impl PlatformClock,
    direction: TrustedIoDirection,
    protocol_id: u8,
    sp_specific: u16,
    buffer: &mut [u8],
) -> Result<(), OpalError> {
    if direction == TrustedIoDirection::Send {
        unsafe {
            ptr::copy_nonoverlapping(buffer.as_ptr(), ctx.bounce as *mut u8, buffer.len());
        }
    }

    let (prp1, prp2) = build_prp(ctx.bounce, buffer.len(), &ctx.prp_list_pages)?;

    let mut sqe = SubmissionQueueEntry::zeroed();
    sqe.cdw0 = match direction {
        TrustedIoDirection::Send => OPCODE_SECURITY_SEND as u32,
        TrustedIoDirection::Receive => OPCODE_SECURITY_RECEIVE as u32,
    };
    sqe.prp1 = prp1;
    sqe.prp2 = prp2;
    sqe.cdw10 = ((protocol_id as u32) << 24) | (sp_specific.swap_bytes() as u32) << 8;
    sqe.cdw11 = buffer.len() as u32;

    let cqe = ctx.submit_admin(sqe, clock)?;
    check_status(&cqe)?;

    if direction == TrustedIoDirection::Receive {
        unsafe {
            ptr::copy_nonoverlapping(ctx.bounce as *const u8, buffer.as_mut_ptr(), buffer.len());
        }
    }
    Ok(())
}

const PAGE_SIZE: usize = 4096;

/// Build PRP1/PRP2 for a buffer starting at `addr` spanning `length` bytes,
/// materializing a chained PRP list in `list_page_addrs`' backing pages when
/// the payload spans more than two host pages. Ground truth:
/// `OpalNvmeMode.c`'s `NvmeCreatePrpList` (see DESIGN.md).
pub fn build_prp(addr: u64, length: usize, list_page_addrs: &[u64; MAX_PRP_LIST_PAGES]) -> Result<(u64, u64), OpalError> {
    if length == 0 {
        return Err(OpalError::InvalidArgument);
    }
    let offset = (addr as usize) % PAGE_SIZE;
    let first_page = addr - offset as u64;
    let total_span = offset + length;
    let num_pages = (total_span + PAGE_SIZE - 1) / PAGE_SIZE;

    if num_pages <= 1 {
        return Ok((addr, 0));
    }
    if num_pages == 2 {
        let second_page = first_page + PAGE_SIZE as u64;
        return Ok((addr, second_page));
    }

    let mut rest_pages = [0u64; 64];
    if num_pages - 1 > rest_pages.len() {
        return Err(OpalError::OutOfResources);
    }
    for i in 0..(num_pages - 1) {
        rest_pages[i] = first_page + ((i + 1) as u64) * PAGE_SIZE as u64;
    }
    let mut list_pages = [[0u64; PRP_ENTRIES_PER_PAGE]; MAX_PRP_LIST_PAGES];
    let prp2 = build_prp_list(&rest_pages[..num_pages - 1], list_page_addrs, &mut list_pages)?;
    Ok((addr, prp2))
}

/// Chained PRP-list builder, pure and host-testable. `entries_per_page` is
/// implicitly `PRP_ENTRIES_PER_PAGE`; the last entry of a list page is a
/// chain pointer unless that page's data exactly or partially fills it
/// (i.e. there is no further page to chain to).
fn build_prp_list(
    mut remaining: &[u64],
    list_page_addrs: &[u64],
    list_pages: &mut [[u64; PRP_ENTRIES_PER_PAGE]],
) -> Result<u64, OpalError> {
    if remaining.is_empty() {
        return Err(OpalError::InvalidArgument);
    }
    let mut page_idx = 0;
    loop {
        if page_idx >= list_page_addrs.len() || page_idx >= list_pages.len() {
            return Err(OpalError::OutOfResources);
        }
        let needs_chain = remaining.len() > PRP_ENTRIES_PER_PAGE;
        let entries_here = if needs_chain {
            PRP_ENTRIES_PER_PAGE - 1
        } else {
            remaining.len()
        };
        for i in 0..entries_here {
            list_pages[page_idx][i] = remaining[i];
        }
        if needs_chain {
            list_pages[page_idx][PRP_ENTRIES_PER_PAGE - 1] = list_page_addrs[page_idx + 1];
            remaining = &remaining[entries_here..];
            page_idx += 1;
        } else {
            break;
        }
    }
    Ok(list_page_addrs[0])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_page_payload_needs_no_prp_list() {
        let list_addrs = [0x9000, 0xA000];
        let (prp1, prp2) = build_prp(0x1000, 100, &list_addrs).unwrap();
        assert_eq!(prp1, 0x1000);
        assert_eq!(prp2, 0);
    }

    #[test]
    fn two_page_payload_uses_prp2_directly() {
        let list_addrs = [0x9000, 0xA000];
        let (prp1, prp2) = build_prp(0x1F00, 0x200, &list_addrs).unwrap();
        assert_eq!(prp1, 0x1F00);
        assert_eq!(prp2, 0x2000);
    }

    #[test]
    fn three_page_payload_builds_single_list_page_without_chain() {
        let list_addrs = [0x9000, 0xA000];
        // offset 0, spans exactly 3 pages -> 2 entries in the list, no chain needed.
        let (prp1, prp2) = build_prp(0x1000, 3 * PAGE_SIZE, &list_addrs).unwrap();
        assert_eq!(prp1, 0x1000);
        assert_eq!(prp2, 0x9000);
    }

    #[test]
    fn list_page_filled_exactly_has_no_chain_pointer_in_last_slot() {
        // rest_pages length == PRP_ENTRIES_PER_PAGE exactly: last entry is data.
        let mut rest = [0u64; PRP_ENTRIES_PER_PAGE];
        for (i, slot) in rest.iter_mut().enumerate() {
            *slot = 0x2000 + (i as u64) * PAGE_SIZE as u64;
        }
        let list_addrs = [0x9000, 0xA000];
        let mut list_pages = [[0u64; PRP_ENTRIES_PER_PAGE]; MAX_PRP_LIST_PAGES];
        let prp2 = build_prp_list(&rest, &list_addrs, &mut list_pages).unwrap();
        assert_eq!(prp2, 0x9000);
        assert_eq!(list_pages[0][PRP_ENTRIES_PER_PAGE - 1], *rest.last().unwrap());
    }

    #[test]
    fn list_spanning_two_pages_chains_through_last_entry() {
        let count = PRP_ENTRIES_PER_PAGE + 3;
        let mut rest = [0u64; PRP_ENTRIES_PER_PAGE + 3];
        for (i, slot) in rest.iter_mut().enumerate() {
            *slot = 0x2000 + (i as u64) * PAGE_SIZE as u64;
        }
        let list_addrs = [0x9000, 0xA000];
        let mut list_pages = [[0u64; PRP_ENTRIES_PER_PAGE]; MAX_PRP_LIST_PAGES];
        build_prp_list(&rest, &list_addrs, &mut list_pages).unwrap();
        assert_eq!(list_pages[0][PRP_ENTRIES_PER_PAGE - 1], 0xA000);
        assert_eq!(list_pages[1][0], rest[PRP_ENTRIES_PER_PAGE - 1]);
        assert_eq!(list_pages[1][3], rest[count - 1]);
    }
}
