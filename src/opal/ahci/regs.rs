//! AHCI register bitfields and HBA/port memory maps, trimmed from the
//! teacher's `drivers/ahci/regs.rs` to the subset the trusted-I/O transport
//! (spec.md §4.6) needs: port bring-up and one PIO command issued on slot 0.

use tock_registers::register_bitfields;
use tock_registers::registers::{ReadOnly, ReadWrite};

register_bitfields! [
    u32,
    /// Host Capabilities (CAP) Register
    pub CAP [
        NP OFFSET(0) NUMBITS(5) [],
        NCS OFFSET(8) NUMBITS(5) [],
        S64A OFFSET(31) NUMBITS(1) []
    ],

    /// Global HBA Control (GHC) Register
    pub GHC [
        HR OFFSET(0) NUMBITS(1) [],
        IE OFFSET(1) NUMBITS(1) [],
        AE OFFSET(31) NUMBITS(1) []
    ],

    /// Ports Implemented (PI) Register
    pub PI [
        PI OFFSET(0) NUMBITS(32) []
    ],

    /// Port Command and Status (PxCMD) Register
    pub PORT_CMD [
        ST OFFSET(0) NUMBITS(1) [],
        SUD OFFSET(1) NUMBITS(1) [],
        POD OFFSET(2) NUMBITS(1) [],
        FRE OFFSET(4) NUMBITS(1) [],
        FR OFFSET(14) NUMBITS(1) [],
        CR OFFSET(15) NUMBITS(1) []
    ],

    /// Port Task File Data (PxTFD) Register
    pub PORT_TFD [
        STS_ERR OFFSET(0) NUMBITS(1) [],
        STS_DRQ OFFSET(3) NUMBITS(1) [],
        STS_BSY OFFSET(7) NUMBITS(1) [],
        ERR OFFSET(8) NUMBITS(8) []
    ],

    /// Port Serial ATA Status (PxSSTS) Register
    pub PORT_SSTS [
        DET OFFSET(0) NUMBITS(4) [
            NotPresent = 0,
            PresentNoComm = 1,
            PresentComm = 3,
            PhyOffline = 4
        ]
    ],

    /// Port Serial ATA Control (PxSCTL) Register
    pub PORT_SCTL [
        DET OFFSET(0) NUMBITS(4) [
            NoAction = 0,
            Comreset = 1,
            DisableSata = 4
        ]
    ]
];

/// AHCI HBA Generic Host Control registers (0x00-0x2B)
#[repr(C)]
pub struct AhciHbaRegisters {
    pub cap: ReadOnly<u32, CAP::Register>,
    pub ghc: ReadWrite<u32, GHC::Register>,
    pub is: ReadWrite<u32>,
    pub pi: ReadOnly<u32, PI::Register>,
    pub vs: ReadOnly<u32>,
    pub ccc_ctl: ReadWrite<u32>,
    pub ccc_ports: ReadWrite<u32>,
    pub em_loc: ReadOnly<u32>,
    pub em_ctl: ReadWrite<u32>,
    pub cap2: ReadOnly<u32>,
    pub bohc: ReadWrite<u32>,
}

/// AHCI Port registers (each port has 0x80 bytes starting at 0x100)
#[repr(C)]
pub struct AhciPortRegisters {
    pub clb: ReadWrite<u32>,
    pub clbu: ReadWrite<u32>,
    pub fb: ReadWrite<u32>,
    pub fbu: ReadWrite<u32>,
    pub is: ReadWrite<u32>,
    pub ie: ReadWrite<u32>,
    pub cmd: ReadWrite<u32, PORT_CMD::Register>,
    _reserved0: u32,
    pub tfd: ReadOnly<u32, PORT_TFD::Register>,
    pub sig: ReadOnly<u32>,
    pub ssts: ReadOnly<u32, PORT_SSTS::Register>,
    pub sctl: ReadWrite<u32, PORT_SCTL::Register>,
    pub serr: ReadWrite<u32>,
    pub sact: ReadWrite<u32>,
    pub ci: ReadWrite<u32>,
    pub sntf: ReadWrite<u32>,
    pub fbs: ReadWrite<u32>,
    pub devslp: ReadWrite<u32>,
    _reserved1: [u32; 10],
    _vendor: [u32; 4],
}

/// Port registers base offset from AHCI base
pub const PORT_BASE: u64 = 0x100;
/// Port register block size
pub const PORT_SIZE: u64 = 0x80;

/// Register FIS - Host to Device
pub const FIS_TYPE_REG_H2D: u8 = 0x27;

/// ATA TRUSTED RECEIVE (PIO)
pub const ATA_CMD_TRUSTED_RECEIVE: u8 = 0x5C;
/// ATA TRUSTED SEND (PIO)
pub const ATA_CMD_TRUSTED_SEND: u8 = 0x5E;

/// Host-to-Device Register FIS, 20 bytes, per the Serial ATA spec.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct FisRegH2d {
    pub fis_type: u8,
    pub pm_port_c: u8,
    pub command: u8,
    pub features: u8,
    pub lba0: u8,
    pub lba1: u8,
    pub lba2: u8,
    pub device: u8,
    pub lba3: u8,
    pub lba4: u8,
    pub lba5: u8,
    pub features_exp: u8,
    pub count_low: u8,
    pub count_high: u8,
    pub icc: u8,
    pub control: u8,
    _reserved: [u8; 4],
}

impl FisRegH2d {
    pub const fn zeroed() -> Self {
        Self {
            fis_type: FIS_TYPE_REG_H2D,
            pm_port_c: 1 << 7,
            command: 0,
            features: 0,
            lba0: 0,
            lba1: 0,
            lba2: 0,
            device: 1 << 6,
            lba3: 0,
            lba4: 0,
            lba5: 0,
            features_exp: 0,
            count_low: 0,
            count_high: 0,
            icc: 0,
            control: 0,
            _reserved: [0; 4],
        }
    }
}

/// One entry of a command list (32 bytes); slot 0 is the only slot trusted-I/O uses.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct CommandHeader {
    /// bits 0-4 CFL (dwords), bit 6 W (write), others unused here.
    pub flags: u16,
    pub prdtl: u16,
    pub prdbc: u32,
    pub ctba: u32,
    pub ctbau: u32,
    _reserved: [u32; 4],
}

impl CommandHeader {
    pub const fn zeroed() -> Self {
        Self {
            flags: 0,
            prdtl: 0,
            prdbc: 0,
            ctba: 0,
            ctbau: 0,
            _reserved: [0; 4],
        }
    }
}

pub const CMD_HEADER_CFL_DWORDS: u16 = (core::mem::size_of::<FisRegH2d>() / 4) as u16;
pub const CMD_HEADER_WRITE: u16 = 1 << 6;

/// A single-entry PRDT bound into the command table.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct PrdtEntry {
    pub dba: u32,
    pub dbau: u32,
    _reserved: u32,
    /// bits 0-21 byte count minus one, bit 31 interrupt-on-completion.
    pub dbc: u32,
}

impl PrdtEntry {
    pub const fn zeroed() -> Self {
        Self {
            dba: 0,
            dbau: 0,
            _reserved: 0,
            dbc: 0,
        }
    }
}

/// Command table: command FIS, ATAPI command, one PRDT entry.
#[repr(C)]
pub struct CommandTable {
    pub cfis: [u8; 64],
    pub acmd: [u8; 16],
    _reserved: [u8; 48],
    pub prdt: [PrdtEntry; 1],
}

impl CommandTable {
    pub const fn zeroed() -> Self {
        Self {
            cfis: [0; 64],
            acmd: [0; 16],
            _reserved: [0; 48],
            prdt: [PrdtEntry::zeroed(); 1],
        }
    }
}
