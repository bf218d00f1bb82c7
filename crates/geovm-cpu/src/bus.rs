use geovm_mem::{Memory, MemoryBus, Width};
use geovm_mmu::{AccessType, Privilege};

use crate::error::ExecError;

/// The engine's view of memory: virtual addresses in, values or faults out.
///
/// [`Memory`] implements this directly (identity translation). [`crate::PagingBus`] wraps any
/// [`MemoryBus`] with Sv32 translation. The notification hooks default to no-ops so buses
/// without translation ignore them.
pub trait CpuBus {
    /// The physical memory behind this bus.
    type Phys: MemoryBus;

    fn phys(&self) -> &Self::Phys;
    fn phys_mut(&mut self) -> &mut Self::Phys;

    fn load(&mut self, vaddr: u32, width: Width, access: AccessType) -> Result<u64, ExecError>;
    fn store(&mut self, vaddr: u32, width: Width, value: u64) -> Result<(), ExecError>;

    #[inline]
    fn fetch(&mut self, vaddr: u32) -> Result<u32, ExecError> {
        Ok(self.load(vaddr, Width::Word, AccessType::Execute)? as u32)
    }

    /// Called for every CSR instruction that names `satp`, with the resulting value.
    fn set_satp(&mut self, _satp: u32) {}

    /// `SFENCE.VMA`.
    fn sfence_vma(&mut self) {}

    /// Called whenever the hart changes privilege.
    fn set_privilege(&mut self, _privilege: Privilege) {}

    /// Drop all translation state (power-on).
    fn reset_translation(&mut self) {}
}

impl CpuBus for Memory {
    type Phys = Memory;

    #[inline]
    fn phys(&self) -> &Memory {
        self
    }

    #[inline]
    fn phys_mut(&mut self) -> &mut Memory {
        self
    }

    #[inline]
    fn load(&mut self, vaddr: u32, width: Width, _access: AccessType) -> Result<u64, ExecError> {
        Ok(MemoryBus::read(self, u64::from(vaddr), width)?)
    }

    #[inline]
    fn store(&mut self, vaddr: u32, width: Width, value: u64) -> Result<(), ExecError> {
        Ok(MemoryBus::write(self, u64::from(vaddr), width, value)?)
    }
}
