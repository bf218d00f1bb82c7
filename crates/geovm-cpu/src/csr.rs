//! Control and status registers.
//!
//! Storage is sparse: only addresses that have been written occupy space. Counter CSRs and
//! `mhartid` are read-only views computed by the engine and never stored here.

use std::collections::BTreeMap;

pub const SSTATUS: u16 = 0x100;
pub const STVEC: u16 = 0x105;
pub const SSCRATCH: u16 = 0x140;
pub const SEPC: u16 = 0x141;
pub const SCAUSE: u16 = 0x142;
pub const STVAL: u16 = 0x143;
pub const SATP: u16 = 0x180;

pub const MSTATUS: u16 = 0x300;
pub const MISA: u16 = 0x301;
pub const MIE: u16 = 0x304;
pub const MTVEC: u16 = 0x305;
pub const MSCRATCH: u16 = 0x340;
pub const MEPC: u16 = 0x341;
pub const MCAUSE: u16 = 0x342;
pub const MTVAL: u16 = 0x343;
pub const MIP: u16 = 0x344;

pub const CYCLE: u16 = 0xC00;
pub const INSTRET: u16 = 0xC02;
pub const CYCLEH: u16 = 0xC80;
pub const INSTRETH: u16 = 0xC82;
pub const MHARTID: u16 = 0xF14;

/// MXL = 32-bit, extensions I and M.
pub const MISA_RV32IM: u32 = (1 << 30) | (1 << 8) | (1 << 12);

pub const MSTATUS_SIE: u32 = 1 << 1;
pub const MSTATUS_MIE: u32 = 1 << 3;
pub const MSTATUS_SPIE: u32 = 1 << 5;
pub const MSTATUS_MPIE: u32 = 1 << 7;
pub const MSTATUS_SPP: u32 = 1 << 8;
pub const MSTATUS_MPP_SHIFT: u32 = 11;
pub const MSTATUS_MPP: u32 = 3 << MSTATUS_MPP_SHIFT;

/// Bits of `mstatus` visible through `sstatus`.
const SSTATUS_MASK: u32 = MSTATUS_SIE | MSTATUS_SPIE | MSTATUS_SPP;

pub const CAUSE_INTERRUPT: u32 = 1 << 31;
pub const CAUSE_FETCH_PAGE_FAULT: u32 = 12;
pub const CAUSE_LOAD_PAGE_FAULT: u32 = 13;
pub const CAUSE_STORE_PAGE_FAULT: u32 = 15;

/// CSR addresses are 12 bits wide.
pub const CSR_SPACE: u16 = 4096;

/// Addresses whose top two bits are `11` are read-only.
#[inline]
pub const fn is_read_only(addr: u16) -> bool {
    (addr >> 10) & 0b11 == 0b11
}

#[derive(Debug, Clone, Default)]
pub struct CsrFile {
    regs: BTreeMap<u16, u32>,
}

impl CsrFile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw stored value; unwritten CSRs read as zero. `sstatus` is a view of `mstatus`.
    pub fn get(&self, addr: u16) -> u32 {
        match addr {
            SSTATUS => self.get(MSTATUS) & SSTATUS_MASK,
            _ => self.regs.get(&addr).copied().unwrap_or(0),
        }
    }

    /// Store a value. Addresses outside the 12-bit CSR space are ignored.
    pub fn set(&mut self, addr: u16, value: u32) {
        if addr >= CSR_SPACE {
            return;
        }
        match addr {
            SSTATUS => {
                let mstatus = (self.get(MSTATUS) & !SSTATUS_MASK) | (value & SSTATUS_MASK);
                self.set(MSTATUS, mstatus);
            }
            _ => {
                self.regs.insert(addr, value);
            }
        }
    }

    #[inline]
    pub fn mstatus(&self) -> u32 {
        self.get(MSTATUS)
    }

    #[inline]
    pub fn set_mstatus(&mut self, value: u32) {
        self.set(MSTATUS, value);
    }

    pub fn clear(&mut self) {
        self.regs.clear();
    }

    /// Number of explicitly stored CSRs.
    pub fn len(&self) -> usize {
        self.regs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regs.is_empty()
    }
}
