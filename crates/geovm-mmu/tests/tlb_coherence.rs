use geovm_mem::{Memory, MemoryBus, MemoryLayout};
use geovm_mmu::{
    AccessType, Mmu, Privilege, PAGE_SIZE, PTE_R, PTE_U, PTE_V, PTE_W, PTE_X, SATP_MODE,
};
use proptest::prelude::*;

const ROOT: u64 = 0x1_0000;
const L0: u64 = 0x1_1000;
const DATA: u64 = 0x2_0000;
const PAGES: u32 = 40;

fn flags() -> impl Strategy<Value = u32> {
    (
        prop::sample::select(vec![0, PTE_R, PTE_R | PTE_W, PTE_X, PTE_R | PTE_X, PTE_W]),
        any::<bool>(),
        any::<bool>(),
    )
        .prop_map(|(perms, user, valid)| {
            let user = if user { PTE_U } else { 0 };
            let valid = if valid { PTE_V } else { 0 };
            perms | user | valid
        })
}

fn access() -> impl Strategy<Value = (u32, AccessType, Privilege)> {
    (
        0..PAGES,
        0u32..PAGE_SIZE as u32,
        prop::sample::select(vec![AccessType::Read, AccessType::Write, AccessType::Execute]),
        prop::sample::select(vec![Privilege::User, Privilege::Supervisor, Privilege::Machine]),
    )
        .prop_map(|(page, offset, access, privilege)| ((page << 12) | offset, access, privilege))
}

fn build(mappings: &[(u32, u32)]) -> Memory {
    let mut mem = Memory::new(MemoryLayout::default()).unwrap();
    mem.write_u32(ROOT, (((L0 / PAGE_SIZE) as u32) << 10) | PTE_V).unwrap();
    for (vpn, (target, flags)) in mappings.iter().enumerate() {
        let paddr = DATA + u64::from(*target) * PAGE_SIZE;
        let pte = (((paddr / PAGE_SIZE) as u32) << 10) | flags;
        mem.write_u32(L0 + vpn as u64 * 4, pte).unwrap();
    }
    mem
}

proptest! {
    // The cached translation must always agree with a fresh walk of the same tables.
    #[test]
    fn tlb_agrees_with_uncached_walk(
        mappings in prop::collection::vec((0u32..32, flags()), PAGES as usize),
        accesses in prop::collection::vec(access(), 1..200),
    ) {
        let mut mem = build(&mappings);
        let satp = SATP_MODE | (ROOT / PAGE_SIZE) as u32;
        let mut cached = Mmu::new();
        cached.set_satp(satp);
        let mut fresh = Mmu::new();
        fresh.set_satp(satp);

        for (vaddr, access, privilege) in accesses {
            let got = cached.translate(&mut mem, vaddr, access, privilege);
            fresh.flush_all();
            let want = fresh.translate(&mut mem, vaddr, access, privilege);
            prop_assert_eq!(got, want, "vaddr {:#x} {:?} {:?}", vaddr, access, privilege);
        }

        let stats = cached.stats();
        prop_assert_eq!(stats.hits + stats.misses, stats.lookups);
        prop_assert!(cached.tlb_occupancy() <= geovm_mmu::TLB_ENTRIES);
    }
}
