use tracing::debug;

use crate::console::Console;
use crate::dirty::DirtyRect;
use crate::error::{FramebufferError, LayoutError, MemoryError};
use crate::framebuffer::Framebuffer;
use crate::layout::{MemoryLayout, Region};
use crate::ram::WordStore;
use crate::{MemoryBus, Width};

/// The concrete guest address space: RAM plus the console and framebuffer windows.
#[derive(Debug)]
pub struct Memory {
    layout: MemoryLayout,
    ram: WordStore,
    console: Console,
    framebuffer: Framebuffer,
}

impl Memory {
    pub fn new(layout: MemoryLayout) -> Result<Self, LayoutError> {
        layout.validate()?;
        let ram = WordStore::new(layout.ram_len() as usize);
        let framebuffer = Framebuffer::new(layout.framebuffer_size as usize);
        Ok(Self {
            layout,
            ram,
            console: Console::default(),
            framebuffer,
        })
    }

    #[inline]
    pub fn layout(&self) -> &MemoryLayout {
        &self.layout
    }

    pub fn console(&self) -> &Console {
        &self.console
    }

    pub fn console_mut(&mut self) -> &mut Console {
        &mut self.console
    }

    pub fn framebuffer(&self) -> &Framebuffer {
        &self.framebuffer
    }

    pub fn set_console_output(&mut self, sink: impl FnMut(u8) + 'static) {
        self.console.set_output(sink);
    }

    pub fn set_console_input(&mut self, source: impl FnMut() -> Option<u8> + 'static) {
        self.console.set_input(source);
    }

    pub fn push_console_input(&mut self, bytes: &[u8]) {
        self.console.push_input(bytes);
    }

    pub fn set_resolution(&mut self, width: u32, height: u32) -> Result<(), FramebufferError> {
        self.framebuffer.set_resolution(width, height)
    }

    pub fn dirty_rects(&self) -> &[DirtyRect] {
        self.framebuffer.dirty_rects()
    }

    /// Drain the pending dirty rectangles.
    pub fn take_dirty_rects(&mut self) -> Vec<DirtyRect> {
        self.framebuffer.take_dirty_rects()
    }

    /// Extend the heap segment by `additional` bytes (rounded up to a word).
    ///
    /// Fails, leaving memory unchanged, if the grown RAM would overlap an MMIO window.
    pub fn grow_ram(&mut self, additional: u64) -> Result<(), LayoutError> {
        let additional = additional.div_ceil(4) * 4;
        let mut grown = self.layout.clone();
        grown.heap_size = grown
            .heap_size
            .checked_add(additional)
            .ok_or(LayoutError::AddressOverflow {
                name: "heap",
                base: self.layout.ram_base,
                len: additional,
            })?;
        grown.validate()?;
        self.ram.grow(additional as usize);
        self.layout = grown;
        debug!(
            additional,
            ram_len = self.ram.len_bytes(),
            "grew guest RAM"
        );
        Ok(())
    }

    /// Zero RAM and the framebuffer, drop dirty rectangles and buffered console input.
    pub fn reset(&mut self) {
        self.ram.clear();
        self.framebuffer.reset();
        self.console.reset();
    }

    /// Little-endian copy of all of RAM.
    pub fn ram_bytes(&self) -> Vec<u8> {
        self.ram.to_bytes()
    }
}

impl MemoryBus for Memory {
    fn is_mapped(&self, addr: u64, width: Width) -> bool {
        self.layout.region_of(addr, width.bytes() as u64).is_some()
    }

    fn read(&mut self, addr: u64, width: Width) -> Result<u64, MemoryError> {
        let oob = MemoryError::OutOfBoundsRead { addr, width };
        let len = width.bytes() as u64;
        match self.layout.region_of(addr, len).ok_or(oob)? {
            Region::Console => {
                let base = addr - self.layout.console_base;
                Ok((0..len).fold(0u64, |acc, i| {
                    acc | u64::from(self.console.read_byte(base + i)) << (i * 8)
                }))
            }
            Region::Framebuffer => {
                let base = (addr - self.layout.framebuffer_base) as usize;
                Ok((0..width.bytes()).fold(0u64, |acc, i| {
                    acc | u64::from(self.framebuffer.read_byte(base + i)) << (i * 8)
                }))
            }
            Region::Ram => Ok(self
                .ram
                .read((addr - self.layout.ram_base) as usize, width)),
        }
    }

    fn write(&mut self, addr: u64, width: Width, value: u64) -> Result<(), MemoryError> {
        if !width.fits(value) {
            return Err(MemoryError::ValueOutOfRange { value, width });
        }
        let oob = MemoryError::OutOfBoundsWrite { addr, width };
        let len = width.bytes() as u64;
        match self.layout.region_of(addr, len).ok_or(oob)? {
            Region::Console => {
                let base = addr - self.layout.console_base;
                for i in 0..len {
                    self.console.write_byte(base + i, (value >> (i * 8)) as u8);
                }
            }
            Region::Framebuffer => {
                let base = (addr - self.layout.framebuffer_base) as usize;
                let bytes = value.to_le_bytes();
                self.framebuffer
                    .write_bytes(base, &bytes[..width.bytes()]);
            }
            Region::Ram => {
                self.ram
                    .write((addr - self.layout.ram_base) as usize, width, value);
            }
        }
        Ok(())
    }
}
