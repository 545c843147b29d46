//! NVMe controller register and queue-entry layouts (spec.md §4.7).

use tock_registers::register_bitfields;
use tock_registers::registers::{ReadOnly, ReadWrite};

register_bitfields! [
    u32,
    /// Controller Configuration (CC) Register
    pub CC [
        EN OFFSET(0) NUMBITS(1) [],
        CSS OFFSET(4) NUMBITS(3) [
            NvmCommandSet = 0
        ],
        MPS OFFSET(7) NUMBITS(4) [],
        IOSQES OFFSET(16) NUMBITS(4) [],
        IOCQES OFFSET(20) NUMBITS(4) []
    ],

    /// Controller Status (CSTS) Register
    pub CSTS [
        RDY OFFSET(0) NUMBITS(1) [],
        CFS OFFSET(1) NUMBITS(1) []
    ],

    /// Admin Queue Attributes (AQA) Register
    pub AQA [
        ASQS OFFSET(0) NUMBITS(12) [],
        ACQS OFFSET(16) NUMBITS(12) []
    ]
];

/// NVMe 64-bit capability register bit layout (not a tock_registers
/// bitfield since CAP.MPSMIN/MPSMAX/TO are read with plain shifts below).
pub mod cap_bits {
    pub const CSS_NVM_COMMAND_SET: u64 = 1 << (37);
    pub const TO_SHIFT: u64 = 24;
    pub const TO_MASK: u64 = 0xFF;
    pub const MPSMIN_SHIFT: u64 = 48;
    pub const MPSMIN_MASK: u64 = 0xF;
}

/// Subset of the NVMe controller register BAR this crate touches.
#[repr(C)]
pub struct NvmeRegisters {
    pub cap: ReadOnly<u64>,
    pub vs: ReadOnly<u32>,
    pub intms: ReadWrite<u32>,
    pub intmc: ReadWrite<u32>,
    pub cc: ReadWrite<u32, CC::Register>,
    _reserved0: u32,
    pub csts: ReadOnly<u32, CSTS::Register>,
    pub nssr: ReadWrite<u32>,
    pub aqa: ReadWrite<u32, AQA::Register>,
    pub asq: ReadWrite<u64>,
    pub acq: ReadWrite<u64>,
}

/// Doorbell stride is CAP.DSTRD; this crate only targets DSTRD=0 controllers
/// (4-byte doorbells), matching the fixed-layout assumption spec.md §4.7
/// bakes into the region table.
pub const DOORBELL_BASE: u64 = 0x1000;
pub const DOORBELL_STRIDE: u64 = 8;

/// 64-byte Submission Queue Entry common header + command-specific dwords.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SubmissionQueueEntry {
    pub cdw0: u32,
    pub nsid: u32,
    _reserved0: u64,
    pub mptr: u64,
    pub prp1: u64,
    pub prp2: u64,
    pub cdw10: u32,
    pub cdw11: u32,
    pub cdw12: u32,
    pub cdw13: u32,
    pub cdw14: u32,
    pub cdw15: u32,
}

impl SubmissionQueueEntry {
    pub const fn zeroed() -> Self {
        Self {
            cdw0: 0,
            nsid: 0,
            _reserved0: 0,
            mptr: 0,
            prp1: 0,
            prp2: 0,
            cdw10: 0,
            cdw11: 0,
            cdw12: 0,
            cdw13: 0,
            cdw14: 0,
            cdw15: 0,
        }
    }
}

/// 16-byte Completion Queue Entry.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct CompletionQueueEntry {
    pub dw0: u32,
    pub dw1: u32,
    pub sq_head: u16,
    pub sq_id: u16,
    pub command_id_cid: u16,
    pub status: u16,
}

impl CompletionQueueEntry {
    pub const fn zeroed() -> Self {
        Self {
            dw0: 0,
            dw1: 0,
            sq_head: 0,
            sq_id: 0,
            command_id_cid: 0,
            status: 0,
        }
    }

    /// Phase tag, bit 0 of `status`.
    pub fn phase(&self) -> bool {
        self.status & 1 != 0
    }

    /// SCT/SC (bits 1-8 of `status`), zero on success.
    pub fn sct_sc(&self) -> u8 {
        ((self.status >> 1) & 0xFF) as u8
    }
}

pub const OPCODE_CREATE_IO_CQ: u8 = 0x05;
pub const OPCODE_CREATE_IO_SQ: u8 = 0x01;
pub const OPCODE_IDENTIFY: u8 = 0x06;
pub const OPCODE_SECURITY_SEND: u8 = 0x81;
pub const OPCODE_SECURITY_RECEIVE: u8 = 0x82;

pub const ADMIN_QUEUE_ENTRIES: u16 = 2;
pub const IO_QUEUE_ENTRIES: u16 = 2;
pub const IOSQES_LOG2: u8 = 6;
pub const IOCQES_LOG2: u8 = 4;
