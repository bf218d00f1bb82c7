use geovm_mem::{MemoryBus, MemoryError, Width};
use geovm_mmu::{AccessType, Mmu, Privilege, PAGE_SIZE};

use crate::bus::CpuBus;
use crate::error::ExecError;

/// A paging-aware [`CpuBus`] backed by [`geovm_mmu::Mmu`].
///
/// The engine passes *virtual* addresses to [`CpuBus`] methods. This adapter translates them
/// to physical addresses before accessing the underlying physical bus `B`. Accesses that cross
/// a page boundary are translated one byte at a time, and a write is only performed once every
/// byte has translated to a mapped physical address.
#[derive(Debug)]
pub struct PagingBus<B> {
    mmu: Mmu,
    phys: B,
    privilege: Privilege,
}

impl<B> PagingBus<B> {
    pub fn new(phys: B) -> Self {
        Self {
            mmu: Mmu::new(),
            phys,
            privilege: Privilege::Machine,
        }
    }

    #[inline]
    pub fn mmu(&self) -> &Mmu {
        &self.mmu
    }

    #[inline]
    pub fn mmu_mut(&mut self) -> &mut Mmu {
        &mut self.mmu
    }

    #[inline]
    pub fn inner(&self) -> &B {
        &self.phys
    }

    #[inline]
    pub fn inner_mut(&mut self) -> &mut B {
        &mut self.phys
    }

    #[inline]
    pub fn into_inner(self) -> B {
        self.phys
    }

    #[inline]
    pub fn privilege(&self) -> Privilege {
        self.privilege
    }
}

impl<B: MemoryBus> PagingBus<B> {
    #[inline]
    fn translate(&mut self, vaddr: u32, access: AccessType) -> Result<u64, ExecError> {
        Ok(self
            .mmu
            .translate(&mut self.phys, vaddr, access, self.privilege)?)
    }

    #[inline]
    fn crosses_page(vaddr: u32, width: Width) -> bool {
        u64::from(vaddr) % PAGE_SIZE > PAGE_SIZE - width.bytes() as u64
    }
}

impl<B: MemoryBus> CpuBus for PagingBus<B> {
    type Phys = B;

    #[inline]
    fn phys(&self) -> &B {
        &self.phys
    }

    #[inline]
    fn phys_mut(&mut self) -> &mut B {
        &mut self.phys
    }

    fn load(&mut self, vaddr: u32, width: Width, access: AccessType) -> Result<u64, ExecError> {
        if !Self::crosses_page(vaddr, width) {
            let paddr = self.translate(vaddr, access)?;
            return Ok(self.phys.read(paddr, width)?);
        }

        let mut value = 0u64;
        for i in 0..width.bytes() {
            let paddr = self.translate(vaddr.wrapping_add(i as u32), access)?;
            value |= u64::from(self.phys.read_u8(paddr)?) << (i * 8);
        }
        Ok(value)
    }

    fn store(&mut self, vaddr: u32, width: Width, value: u64) -> Result<(), ExecError> {
        if !width.fits(value) {
            return Err(MemoryError::ValueOutOfRange { value, width }.into());
        }
        if !Self::crosses_page(vaddr, width) {
            let paddr = self.translate(vaddr, AccessType::Write)?;
            return Ok(self.phys.write(paddr, width, value)?);
        }

        let mut paddrs = [0u64; 8];
        for (i, slot) in paddrs.iter_mut().take(width.bytes()).enumerate() {
            *slot = self.translate(vaddr.wrapping_add(i as u32), AccessType::Write)?;
        }
        let paddrs = &paddrs[..width.bytes()];
        if let Some(&addr) = paddrs.iter().find(|&&p| !self.phys.is_mapped(p, Width::Byte)) {
            return Err(MemoryError::OutOfBoundsWrite {
                addr,
                width: Width::Byte,
            }
            .into());
        }
        for (i, &paddr) in paddrs.iter().enumerate() {
            self.phys.write_u8(paddr, (value >> (i * 8)) as u8)?;
        }
        Ok(())
    }

    fn set_satp(&mut self, satp: u32) {
        self.mmu.set_satp(satp);
    }

    fn sfence_vma(&mut self) {
        self.mmu.flush_all();
    }

    fn set_privilege(&mut self, privilege: Privilege) {
        self.privilege = privilege;
    }

    fn reset_translation(&mut self) {
        self.mmu.reset();
        self.privilege = Privilege::Machine;
    }
}
