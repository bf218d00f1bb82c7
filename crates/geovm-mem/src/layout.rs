use core::ops::Range;

use serde::{Deserialize, Serialize};

use crate::console::CONSOLE_WINDOW_LEN;
use crate::error::LayoutError;

/// Which backing store an address resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Region {
    Console,
    Framebuffer,
    Ram,
}

/// Named sub-ranges of RAM, laid out in this order starting at `ram_base`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Segment {
    Text,
    Stack,
    Heap,
}

impl Segment {
    pub const ALL: [Segment; 3] = [Segment::Text, Segment::Stack, Segment::Heap];

    pub const fn name(self) -> &'static str {
        match self {
            Segment::Text => "text",
            Segment::Stack => "stack",
            Segment::Heap => "heap",
        }
    }
}

/// Placement of every region of a [`crate::Memory`].
///
/// The heap is the topmost RAM segment so that [`crate::Memory::grow_ram`] only ever extends
/// the heap and never moves the stack top.
/// Size of the guest-visible address space. The CPU addresses memory with 32-bit addresses.
pub const ADDRESS_SPACE: u64 = 1 << 32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryLayout {
    pub ram_base: u64,
    pub text_size: u64,
    pub stack_size: u64,
    pub heap_size: u64,
    pub console_base: u64,
    pub framebuffer_base: u64,
    pub framebuffer_size: u64,
}

impl Default for MemoryLayout {
    fn default() -> Self {
        Self {
            ram_base: 0,
            text_size: 0x1_0000,
            stack_size: 0x1_0000,
            heap_size: 0x3_0000,
            console_base: 0x1000_0000,
            framebuffer_base: 0x2000_0000,
            framebuffer_size: 640 * 480 * 4,
        }
    }
}

impl MemoryLayout {
    #[inline]
    pub fn ram_len(&self) -> u64 {
        self.text_size
            .saturating_add(self.stack_size)
            .saturating_add(self.heap_size)
    }

    #[inline]
    pub fn ram_range(&self) -> Range<u64> {
        self.ram_base..self.ram_base.saturating_add(self.ram_len())
    }

    #[inline]
    pub fn console_range(&self) -> Range<u64> {
        self.console_base..self.console_base.saturating_add(CONSOLE_WINDOW_LEN)
    }

    #[inline]
    pub fn framebuffer_range(&self) -> Range<u64> {
        self.framebuffer_base..self.framebuffer_base.saturating_add(self.framebuffer_size)
    }

    pub fn segment_range(&self, segment: Segment) -> Range<u64> {
        let text_end = self.ram_base.saturating_add(self.text_size);
        let stack_end = text_end.saturating_add(self.stack_size);
        match segment {
            Segment::Text => self.ram_base..text_end,
            Segment::Stack => text_end..stack_end,
            Segment::Heap => stack_end..stack_end.saturating_add(self.heap_size),
        }
    }

    #[inline]
    pub fn text_base(&self) -> u64 {
        self.ram_base
    }

    /// Initial stack pointer: the (16-byte aligned) end of the stack segment.
    #[inline]
    pub fn stack_top(&self) -> u64 {
        self.segment_range(Segment::Stack).end & !0xf
    }

    /// The RAM segment containing `addr`, if any.
    pub fn segment_of(&self, addr: u64) -> Option<Segment> {
        Segment::ALL
            .into_iter()
            .find(|&seg| self.segment_range(seg).contains(&addr))
    }

    /// The region an access of `len` bytes at `addr` lies entirely within.
    ///
    /// Regions are probed console first, then framebuffer, then RAM.
    pub fn region_of(&self, addr: u64, len: u64) -> Option<Region> {
        let end = addr.checked_add(len)?;
        let inside = |r: Range<u64>| addr >= r.start && end <= r.end;
        if inside(self.console_range()) {
            Some(Region::Console)
        } else if inside(self.framebuffer_range()) {
            Some(Region::Framebuffer)
        } else if inside(self.ram_range()) {
            Some(Region::Ram)
        } else {
            None
        }
    }

    /// Checks that every region is non-empty, ends at or below [`ADDRESS_SPACE`] and is
    /// disjoint from the others.
    pub fn validate(&self) -> Result<(), LayoutError> {
        if self.text_size == 0 {
            return Err(LayoutError::EmptyRegion { name: "text" });
        }
        if self.stack_size == 0 {
            return Err(LayoutError::EmptyRegion { name: "stack" });
        }
        if self.framebuffer_size == 0 {
            return Err(LayoutError::EmptyRegion { name: "framebuffer" });
        }

        let ram_len = self
            .text_size
            .checked_add(self.stack_size)
            .and_then(|n| n.checked_add(self.heap_size))
            .ok_or(LayoutError::AddressOverflow {
                name: "ram",
                base: self.ram_base,
                len: u64::MAX,
            })?;
        if ram_len % 4 != 0 {
            return Err(LayoutError::UnalignedRam { len: ram_len });
        }

        let regions = [
            ("ram", self.ram_base, ram_len),
            ("console", self.console_base, CONSOLE_WINDOW_LEN),
            ("framebuffer", self.framebuffer_base, self.framebuffer_size),
        ];
        for &(name, base, len) in &regions {
            match base.checked_add(len) {
                Some(end) if end <= ADDRESS_SPACE => {}
                _ => return Err(LayoutError::AddressOverflow { name, base, len }),
            }
        }
        for (i, &(first, a_base, a_len)) in regions.iter().enumerate() {
            for &(second, b_base, b_len) in &regions[i + 1..] {
                if a_base < b_base + b_len && b_base < a_base + a_len {
                    return Err(LayoutError::Overlap { first, second });
                }
            }
        }
        Ok(())
    }
}
