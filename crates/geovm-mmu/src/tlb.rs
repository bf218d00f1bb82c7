/// Number of TLB entries. Lookups index the table with `vpn % TLB_ENTRIES`.
pub const TLB_ENTRIES: usize = 16;

const FLAG_VALID: u8 = 1 << 0;
const FLAG_READ: u8 = 1 << 1;
const FLAG_WRITE: u8 = 1 << 2;
const FLAG_EXEC: u8 = 1 << 3;
const FLAG_USER: u8 = 1 << 4;
const FLAG_DIRTY: u8 = 1 << 5;

/// Permission bits copied from the leaf PTE when an entry is filled.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct TlbEntryAttributes {
    pub(crate) readable: bool,
    pub(crate) writable: bool,
    pub(crate) executable: bool,
    pub(crate) user: bool,
    /// Cached state of the leaf dirty bit. Used to lazily set D on write hits.
    pub(crate) dirty: bool,
    /// Physical address of the leaf PTE (a megapage leaf for 4 MiB mappings).
    pub(crate) leaf_addr: u64,
}

/// One 4 KiB translation. Megapages are cached one 4 KiB slice at a time.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct TlbEntry {
    vpn: u32,
    ppn: u32,
    flags: u8,
    pub(crate) leaf_addr: u64,
}

impl TlbEntry {
    pub(crate) fn new(vpn: u32, ppn: u32, attrs: TlbEntryAttributes) -> Self {
        let TlbEntryAttributes {
            readable,
            writable,
            executable,
            user,
            dirty,
            leaf_addr,
        } = attrs;
        let mut flags = FLAG_VALID;
        if readable {
            flags |= FLAG_READ;
        }
        if writable {
            flags |= FLAG_WRITE;
        }
        if executable {
            flags |= FLAG_EXEC;
        }
        if user {
            flags |= FLAG_USER;
        }
        if dirty {
            flags |= FLAG_DIRTY;
        }
        Self {
            vpn,
            ppn,
            flags,
            leaf_addr,
        }
    }

    #[inline]
    pub(crate) fn valid(&self) -> bool {
        self.flags & FLAG_VALID != 0
    }

    #[inline]
    pub(crate) fn readable(&self) -> bool {
        self.flags & FLAG_READ != 0
    }

    #[inline]
    pub(crate) fn writable(&self) -> bool {
        self.flags & FLAG_WRITE != 0
    }

    #[inline]
    pub(crate) fn executable(&self) -> bool {
        self.flags & FLAG_EXEC != 0
    }

    #[inline]
    pub(crate) fn user(&self) -> bool {
        self.flags & FLAG_USER != 0
    }

    #[inline]
    pub(crate) fn dirty(&self) -> bool {
        self.flags & FLAG_DIRTY != 0
    }

    #[inline]
    pub(crate) fn translate(&self, vaddr: u32) -> u64 {
        (u64::from(self.ppn) << 12) | u64::from(vaddr & 0xfff)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Tlb {
    entries: [TlbEntry; TLB_ENTRIES],
}

impl Default for Tlb {
    fn default() -> Self {
        Self::new()
    }
}

impl Tlb {
    pub(crate) fn new() -> Self {
        Self {
            entries: [TlbEntry::default(); TLB_ENTRIES],
        }
    }

    #[inline]
    fn index(vpn: u32) -> usize {
        vpn as usize % TLB_ENTRIES
    }

    /// Returns the slot index and entry on a hit.
    #[inline]
    pub(crate) fn lookup(&self, vpn: u32) -> Option<(usize, &TlbEntry)> {
        let idx = Self::index(vpn);
        let entry = &self.entries[idx];
        (entry.valid() && entry.vpn == vpn).then_some((idx, entry))
    }

    #[inline]
    pub(crate) fn insert(&mut self, entry: TlbEntry) {
        self.entries[Self::index(entry.vpn)] = entry;
    }

    #[inline]
    pub(crate) fn set_dirty_slot(&mut self, idx: usize) {
        self.entries[idx].flags |= FLAG_DIRTY;
    }

    pub(crate) fn flush_all(&mut self) {
        for entry in &mut self.entries {
            entry.flags = 0;
        }
    }

    pub(crate) fn occupancy(&self) -> usize {
        self.entries.iter().filter(|e| e.valid()).count()
    }
}
