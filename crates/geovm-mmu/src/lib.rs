//! Sv32 address translation with a small direct-mapped software TLB.
//!
//! The MMU is driven by the `satp` CSR:
//! - bit 31 (`MODE`) enables translation,
//! - bits 21:0 hold the physical page number of the root page table.
//!
//! Translation is a two-level walk over 4 KiB pages with 4 MiB megapage leaves. Page tables
//! are read through [`geovm_mem::MemoryBus`], so a table outside physical memory surfaces as
//! [`TranslateFault::AccessFault`] instead of a panic.

#![forbid(unsafe_code)]

mod tlb;

use core::fmt;

use geovm_mem::MemoryBus;
use thiserror::Error;
use tracing::debug;

use tlb::{Tlb, TlbEntry, TlbEntryAttributes};

pub use tlb::TLB_ENTRIES;


pub const PAGE_SIZE: u64 = 4096;
pub const MEGAPAGE_SIZE: u64 = 4 * 1024 * 1024;

/// `satp.MODE` (Sv32 when set).
pub const SATP_MODE: u32 = 1 << 31;
/// `satp.PPN`.
pub const SATP_PPN_MASK: u32 = 0x003f_ffff;

pub const PTE_V: u32 = 1 << 0;
pub const PTE_R: u32 = 1 << 1;
pub const PTE_W: u32 = 1 << 2;
pub const PTE_X: u32 = 1 << 3;
pub const PTE_U: u32 = 1 << 4;
pub const PTE_G: u32 = 1 << 5;
pub const PTE_A: u32 = 1 << 6;
pub const PTE_D: u32 = 1 << 7;

const PTE_PPN_SHIFT: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessType {
    Read,
    Write,
    Execute,
}

impl AccessType {
    #[inline]
    fn is_write(self) -> bool {
        matches!(self, AccessType::Write)
    }
}

impl fmt::Display for AccessType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AccessType::Read => "read",
            AccessType::Write => "write",
            AccessType::Execute => "execute",
        })
    }
}

/// Hart privilege level, ordered from least to most privileged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Privilege {
    User,
    Supervisor,
    #[default]
    Machine,
}

impl Privilege {
    /// Two-bit encoding used by `mstatus.MPP`.
    pub const fn bits(self) -> u32 {
        match self {
            Privilege::User => 0,
            Privilege::Supervisor => 1,
            Privilege::Machine => 3,
        }
    }

    /// Decode `mstatus.MPP`; the reserved encoding 2 maps to `User`.
    pub const fn from_bits(bits: u32) -> Self {
        match bits & 3 {
            3 => Privilege::Machine,
            1 => Privilege::Supervisor,
            _ => Privilege::User,
        }
    }
}

/// A translation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TranslateFault {
    #[error("page not present for {access} at 0x{vaddr:08x}")]
    PageNotPresent { vaddr: u32, access: AccessType },

    #[error("{access} permission denied at 0x{vaddr:08x}")]
    PermissionDenied { vaddr: u32, access: AccessType },

    #[error("page-table access at physical 0x{pte_addr:x} failed while translating 0x{vaddr:08x}")]
    AccessFault {
        vaddr: u32,
        access: AccessType,
        pte_addr: u64,
    },
}

impl TranslateFault {
    #[inline]
    pub fn vaddr(&self) -> u32 {
        match *self {
            TranslateFault::PageNotPresent { vaddr, .. }
            | TranslateFault::PermissionDenied { vaddr, .. }
            | TranslateFault::AccessFault { vaddr, .. } => vaddr,
        }
    }

    #[inline]
    pub fn access(&self) -> AccessType {
        match *self {
            TranslateFault::PageNotPresent { access, .. }
            | TranslateFault::PermissionDenied { access, .. }
            | TranslateFault::AccessFault { access, .. } => access,
        }
    }
}

/// MMU/TLB counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MmuStats {
    /// TLB lookups (one per translated access).
    pub lookups: u64,
    pub hits: u64,
    pub misses: u64,
    /// Page-table walks performed due to TLB misses.
    pub page_walks: u64,
    /// Whole-TLB invalidations.
    pub flushes: u64,
}

#[derive(Debug, Clone, Default)]
pub struct Mmu {
    satp: u32,
    tlb: Tlb,
    stats: MmuStats,
}

impl Mmu {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn satp(&self) -> u32 {
        self.satp
    }

    /// Install a new `satp` value. The TLB is flushed unconditionally, even if the value is
    /// unchanged.
    pub fn set_satp(&mut self, value: u32) {
        self.satp = value;
        self.flush_all();
    }

    #[inline]
    pub fn enabled(&self) -> bool {
        self.satp & SATP_MODE != 0
    }

    #[inline]
    pub fn root_table(&self) -> u64 {
        u64::from(self.satp & SATP_PPN_MASK) * PAGE_SIZE
    }

    pub fn flush_all(&mut self) {
        self.tlb.flush_all();
        self.stats.flushes = self.stats.flushes.wrapping_add(1);
        debug!(satp = self.satp, "tlb flush");
    }

    #[inline]
    pub fn stats(&self) -> MmuStats {
        self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = MmuStats::default();
    }

    /// Number of valid TLB entries.
    pub fn tlb_occupancy(&self) -> usize {
        self.tlb.occupancy()
    }

    /// Return to the power-on state: translation off, empty TLB, zeroed counters.
    pub fn reset(&mut self) {
        self.satp = 0;
        self.tlb.flush_all();
        self.stats = MmuStats::default();
    }

    /// Translate a virtual address to a physical address.
    ///
    /// With translation disabled this is the identity. Otherwise the TLB is consulted first and
    /// the page table is walked on a miss; a successful walk fills the TLB.
    pub fn translate(
        &mut self,
        bus: &mut impl MemoryBus,
        vaddr: u32,
        access: AccessType,
        privilege: Privilege,
    ) -> Result<u64, TranslateFault> {
        if !self.enabled() {
            return Ok(u64::from(vaddr));
        }

        let vpn = vaddr >> 12;
        self.stats.lookups = self.stats.lookups.wrapping_add(1);

        if let Some((slot, entry)) = self.tlb.lookup(vpn) {
            self.stats.hits = self.stats.hits.wrapping_add(1);
            let entry = *entry;
            check_perms(
                vaddr,
                access,
                privilege,
                entry.readable(),
                entry.writable(),
                entry.executable(),
                entry.user(),
            )?;

            // Lazily set D on the first write hit.
            if access.is_write() && !entry.dirty() {
                let leaf_addr = entry.leaf_addr;
                let fault = TranslateFault::AccessFault {
                    vaddr,
                    access,
                    pte_addr: leaf_addr,
                };
                let pte = bus.read_u32(leaf_addr).map_err(|_| fault)?;
                bus.write_u32(leaf_addr, pte | PTE_D).map_err(|_| fault)?;
                self.tlb.set_dirty_slot(slot);
            }

            return Ok(entry.translate(vaddr));
        }

        self.stats.misses = self.stats.misses.wrapping_add(1);
        self.stats.page_walks = self.stats.page_walks.wrapping_add(1);

        let entry = self.walk(bus, vaddr, access, privilege)?;
        let paddr = entry.translate(vaddr);
        self.tlb.insert(entry);
        Ok(paddr)
    }

    fn walk(
        &mut self,
        bus: &mut impl MemoryBus,
        vaddr: u32,
        access: AccessType,
        privilege: Privilege,
    ) -> Result<TlbEntry, TranslateFault> {
        let not_present = TranslateFault::PageNotPresent { vaddr, access };
        let vpn1 = u64::from(vaddr >> 22);
        let vpn0 = (vaddr >> 12) & 0x3ff;

        let pde_addr = self.root_table() + vpn1 * 4;
        let pde = read_pte(bus, pde_addr, vaddr, access)?;
        if !pte_valid(pde) {
            return Err(not_present);
        }

        let (leaf_addr, leaf, ppn) = if pte_is_leaf(pde) {
            // Megapage: PPN[0] must be zero.
            if (pde >> PTE_PPN_SHIFT) & 0x3ff != 0 {
                return Err(not_present);
            }
            let ppn1 = pde >> 20;
            (pde_addr, pde, (ppn1 << 10) | vpn0)
        } else {
            let table = u64::from(pde >> PTE_PPN_SHIFT) * PAGE_SIZE;
            let pte_addr = table + u64::from(vpn0) * 4;
            let pte = read_pte(bus, pte_addr, vaddr, access)?;
            if !pte_valid(pte) || !pte_is_leaf(pte) {
                return Err(not_present);
            }
            (pte_addr, pte, pte >> PTE_PPN_SHIFT)
        };

        let readable = leaf & PTE_R != 0;
        let writable = leaf & PTE_W != 0;
        let executable = leaf & PTE_X != 0;
        let user = leaf & PTE_U != 0;
        check_perms(
            vaddr, access, privilege, readable, writable, executable, user,
        )?;

        let mut new_leaf = leaf | PTE_A;
        if access.is_write() {
            new_leaf |= PTE_D;
        }
        if new_leaf != leaf {
            bus.write_u32(leaf_addr, new_leaf)
                .map_err(|_| TranslateFault::AccessFault {
                    vaddr,
                    access,
                    pte_addr: leaf_addr,
                })?;
        }

        Ok(TlbEntry::new(
            vaddr >> 12,
            ppn,
            TlbEntryAttributes {
                readable,
                writable,
                executable,
                user,
                dirty: new_leaf & PTE_D != 0,
                leaf_addr,
            },
        ))
    }
}

#[inline]
fn read_pte(
    bus: &mut impl MemoryBus,
    pte_addr: u64,
    vaddr: u32,
    access: AccessType,
) -> Result<u32, TranslateFault> {
    bus.read_u32(pte_addr)
        .map_err(|_| TranslateFault::AccessFault {
            vaddr,
            access,
            pte_addr,
        })
}

/// `V` set and not the reserved `W && !R` combination.
#[inline]
fn pte_valid(pte: u32) -> bool {
    pte & PTE_V != 0 && !(pte & PTE_W != 0 && pte & PTE_R == 0)
}

#[inline]
fn pte_is_leaf(pte: u32) -> bool {
    pte & (PTE_R | PTE_X) != 0
}

#[inline]
fn check_perms(
    vaddr: u32,
    access: AccessType,
    privilege: Privilege,
    readable: bool,
    writable: bool,
    executable: bool,
    user: bool,
) -> Result<(), TranslateFault> {
    let allowed = match access {
        AccessType::Read => readable,
        AccessType::Write => writable,
        AccessType::Execute => executable,
    };
    let privilege_ok = match privilege {
        Privilege::User => user,
        _ => !(user && access == AccessType::Execute),
    };
    if allowed && privilege_ok {
        Ok(())
    } else {
        Err(TranslateFault::PermissionDenied { vaddr, access })
    }
}
