//! AHCI transport for Opal trusted-I/O (spec.md §4.6).
//!
//! Port bring-up and the single-slot TRUSTED SEND/RECEIVE PIO command. Like
//! the teacher's EHCI/SDHCI drivers this talks to real MMIO and is not unit
//! tested; correctness here is exercised by the mock `HostControllerCapability`
//! path in tests instead, and by the invariants this module hand-enforces
//! (timeouts, PRDT bounds).

use core::ptr;

use super::error::OpalError;
use super::transport::TrustedIoDirection;
use crate::time::{PlatformClock, Timeout};

use regs::{
    AhciHbaRegisters, AhciPortRegisters, CommandHeader, CommandTable, FisRegH2d, PrdtEntry,
    ATA_CMD_TRUSTED_RECEIVE, ATA_CMD_TRUSTED_SEND, CMD_HEADER_CFL_DWORDS, CMD_HEADER_WRITE,
    PORT_BASE, PORT_SIZE,
};

pub mod regs;

/// Maximum payload a single trusted-I/O PRDT entry carries; matches the
/// bounce buffer size spec.md §3 calls out ("[u8; 512] minimum").
pub const MAX_TRUSTED_IO_BYTES: usize = 512;

/// One AHCI port's hardware resources. Addresses are physical == virtual,
/// the flat identity-mapped model firmware runs under.
pub struct AhciContext {
    pub hba_base: u64,
    pub port: u8,
    pub command_list: u64,
    pub command_table: u64,
    pub received_fis: u64,
    pub bounce: u64,
}

impl AhciContext {
    fn hba(&self) -> &AhciHbaRegisters {
        unsafe { &*(self.hba_base as *const AhciHbaRegisters) }
    }

    fn port_regs(&self) -> &AhciPortRegisters {
        let addr = self.hba_base + PORT_BASE + self.port as u64 * PORT_SIZE;
        unsafe { &*(addr as *const AhciPortRegisters) }
    }

    fn command_header(&self) -> *mut CommandHeader {
        self.command_list as *mut CommandHeader
    }

    fn command_table(&self) -> *mut CommandTable {
        self.command_table as *mut CommandTable
    }
}

/// spec.md §4.6 port bring-up: enable AHCI, HBA reset, program CLB/FB,
/// start the FIS engine then the command engine, wait for device present.
pub fn port_init(ctx: &AhciContext, clock: &impl PlatformClock) -> Result<(), OpalError> {
    use regs::{GHC, PORT_CMD, PORT_SSTS};

    let hba = ctx.hba();
    hba.ghc.modify(GHC::AE::SET);
    if !hba.ghc.is_set(GHC::AE) {
        return Err(OpalError::DeviceError);
    }

    hba.ghc.modify(GHC::HR::SET);
    let reset_timeout = Timeout::from_ms(clock, 1000);
    while hba.ghc.is_set(GHC::HR) {
        if reset_timeout.is_expired(clock) {
            return Err(OpalError::Timeout);
        }
        clock.stall_us(100);
    }
    hba.ghc.modify(GHC::AE::SET);

    let port = ctx.port_regs();
    port.clb.set(ctx.command_list as u32);
    port.clbu.set((ctx.command_list >> 32) as u32);
    port.fb.set(ctx.received_fis as u32);
    port.fbu.set((ctx.received_fis >> 32) as u32);

    port.cmd.modify(PORT_CMD::FRE::SET);
    port.cmd.modify(PORT_CMD::ST::SET);

    let present_timeout = Timeout::from_ms(clock, 3000);
    loop {
        if port.ssts.matches_all(PORT_SSTS::DET::PresentComm) {
            return Ok(());
        }
        if present_timeout.is_expired(clock) {
            return Err(OpalError::Timeout);
        }
        clock.stall_us(100);
    }
}

/// spec.md §4.5/§4.6: one TRUSTED SEND/RECEIVE FIS on command slot 0,
/// payload routed through the pre-allocated NVS bounce buffer.
pub fn trusted_io(
    ctx: &mut AhciContext,
    clock: &impl PlatformClock,
    direction: TrustedIoDirection,
    protocol_id: u8,
    sp_specific: u16,
    buffer: &mut [u8],
) -> Result<(), OpalError> {
    if buffer.len() > MAX_TRUSTED_IO_BYTES {
        return Err(OpalError::InvalidArgument);
    }

    if direction == TrustedIoDirection::Send {
        unsafe {
            ptr::copy_nonoverlapping(buffer.as_ptr(), ctx.bounce as *mut u8, buffer.len());
        }
    }

    let mut fis = FisRegH2d::zeroed();
    fis.command = match direction {
        TrustedIoDirection::Send => ATA_CMD_TRUSTED_SEND,
        TrustedIoDirection::Receive => ATA_CMD_TRUSTED_RECEIVE,
    };
    fis.features = protocol_id;
    fis.lba1 = (sp_specific & 0xFF) as u8;
    fis.lba2 = (sp_specific >> 8) as u8;
    let blocks = ((buffer.len() + 511) / 512).max(1) as u16;
    fis.count_low = (blocks & 0xFF) as u8;
    fis.count_high = (blocks >> 8) as u8;

    let table = ctx.command_table();
    unsafe {
        let cfis_bytes = core::slice::from_raw_parts(
            &fis as *const FisRegH2d as *const u8,
            core::mem::size_of::<FisRegH2d>(),
        );
        ptr::copy_nonoverlapping(cfis_bytes.as_ptr(), (*table).cfis.as_mut_ptr(), cfis_bytes.len());

        let mut prdt = PrdtEntry::zeroed();
        prdt.dba = ctx.bounce as u32;
        prdt.dbau = (ctx.bounce >> 32) as u32;
        prdt.dbc = (buffer.len().max(1) as u32 - 1) & 0x3F_FFFF;
        (*table).prdt[0] = prdt;
    }

    let mut header = CommandHeader::zeroed();
    header.flags = CMD_HEADER_CFL_DWORDS;
    if direction == TrustedIoDirection::Send {
        header.flags |= CMD_HEADER_WRITE;
    }
    header.prdtl = 1;
    header.ctba = ctx.command_table as u32;
    header.ctbau = (ctx.command_table >> 32) as u32;
    unsafe {
        ptr::write_volatile(ctx.command_header(), header);
    }

    let port = ctx.port_regs();
    port.ci.set(1);

    let timeout = Timeout::from_ms(clock, 3000);
    loop {
        if port.ci.get() & 1 == 0 {
            break;
        }
        if timeout.is_expired(clock) {
            return Err(OpalError::Timeout);
        }
        clock.stall_us(100);
    }

    let tfd = port.tfd.get();
    if tfd & 1 != 0 {
        return Err(OpalError::DeviceError);
    }

    if direction == TrustedIoDirection::Receive {
        unsafe {
            ptr::copy_nonoverlapping(ctx.bounce as *const u8, buffer.as_mut_ptr(), buffer.len());
        }
    }

    Ok(())
}
