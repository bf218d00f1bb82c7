//! Guest memory for geovm.
//!
//! A [`Memory`] is a flat little-endian address space made of three disjoint regions fixed at
//! construction: word-granular RAM (split into text / stack / heap segments), a 4-byte console
//! window and a byte-granular framebuffer window. Accesses that do not fall entirely inside one
//! region fail with [`MemoryError`]; nothing in this crate panics on guest-controlled input.
//!
//! The [`MemoryBus`] trait is the seam used by the CPU and by the page-table walker.

#![forbid(unsafe_code)]

mod console;
mod dirty;
mod error;
mod framebuffer;
mod layout;
mod memory;
mod ram;

use core::fmt;

use serde::{Deserialize, Serialize};

pub use console::{
    Console, CONSOLE_INPUT, CONSOLE_OUTPUT, CONSOLE_STATUS, CONSOLE_WINDOW_LEN,
    STATUS_INPUT_AVAILABLE, STATUS_OUTPUT_READY,
};
pub use dirty::{DirtyRect, DirtyTracker, DIRTY_GRANULE, MAX_DIRTY_RECTS};
pub use error::{FramebufferError, LayoutError, MemoryError};
pub use framebuffer::{Framebuffer, Resolution, BYTES_PER_PIXEL, SUPPORTED_RESOLUTIONS};
pub use layout::{MemoryLayout, Region, Segment, ADDRESS_SPACE};
pub use memory::Memory;

/// Access width of a single bus transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Width {
    Byte,
    Half,
    Word,
    Double,
}

impl Width {
    #[inline]
    pub const fn bytes(self) -> usize {
        match self {
            Width::Byte => 1,
            Width::Half => 2,
            Width::Word => 4,
            Width::Double => 8,
        }
    }

    #[inline]
    pub const fn mask(self) -> u64 {
        match self {
            Width::Byte => 0xff,
            Width::Half => 0xffff,
            Width::Word => 0xffff_ffff,
            Width::Double => u64::MAX,
        }
    }

    /// Whether `value` is representable in this width without truncation.
    #[inline]
    pub const fn fits(self, value: u64) -> bool {
        value & !self.mask() == 0
    }
}

impl fmt::Display for Width {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Width::Byte => "byte",
            Width::Half => "halfword",
            Width::Word => "word",
            Width::Double => "doubleword",
        })
    }
}

/// Byte-addressable little-endian memory.
///
/// Reads take `&mut self` because MMIO reads have side effects (popping console input).
pub trait MemoryBus {
    fn read(&mut self, addr: u64, width: Width) -> Result<u64, MemoryError>;
    fn write(&mut self, addr: u64, width: Width, value: u64) -> Result<(), MemoryError>;

    /// Whether an access of `width` at `addr` would reach backing storage. Buses without a
    /// fixed map report everything as mapped.
    #[inline]
    fn is_mapped(&self, _addr: u64, _width: Width) -> bool {
        true
    }

    #[inline]
    fn read_u8(&mut self, addr: u64) -> Result<u8, MemoryError> {
        Ok(self.read(addr, Width::Byte)? as u8)
    }

    #[inline]
    fn read_u16(&mut self, addr: u64) -> Result<u16, MemoryError> {
        Ok(self.read(addr, Width::Half)? as u16)
    }

    #[inline]
    fn read_u32(&mut self, addr: u64) -> Result<u32, MemoryError> {
        Ok(self.read(addr, Width::Word)? as u32)
    }

    #[inline]
    fn write_u8(&mut self, addr: u64, value: u8) -> Result<(), MemoryError> {
        self.write(addr, Width::Byte, u64::from(value))
    }

    #[inline]
    fn write_u16(&mut self, addr: u64, value: u16) -> Result<(), MemoryError> {
        self.write(addr, Width::Half, u64::from(value))
    }

    #[inline]
    fn write_u32(&mut self, addr: u64, value: u32) -> Result<(), MemoryError> {
        self.write(addr, Width::Word, u64::from(value))
    }

    /// Fill `dst` from consecutive addresses starting at `addr`.
    ///
    /// The default implementation issues one byte read per element and stops at the first
    /// failing address.
    fn load_bytes(&mut self, addr: u64, dst: &mut [u8]) -> Result<(), MemoryError> {
        for (i, slot) in dst.iter_mut().enumerate() {
            let at = addr
                .checked_add(i as u64)
                .ok_or(MemoryError::OutOfBoundsRead {
                    addr,
                    width: Width::Byte,
                })?;
            *slot = self.read_u8(at)?;
        }
        Ok(())
    }

    /// Write `src` to consecutive addresses starting at `addr`.
    fn store_bytes(&mut self, addr: u64, src: &[u8]) -> Result<(), MemoryError> {
        for (i, byte) in src.iter().copied().enumerate() {
            let at = addr
                .checked_add(i as u64)
                .ok_or(MemoryError::OutOfBoundsWrite {
                    addr,
                    width: Width::Byte,
                })?;
            self.write_u8(at, byte)?;
        }
        Ok(())
    }

    /// Read a NUL-terminated string of at most `max_len` bytes (terminator excluded).
    fn read_cstr(&mut self, addr: u64, max_len: usize) -> Result<Vec<u8>, MemoryError> {
        let mut out = Vec::new();
        let mut at = addr;
        while out.len() < max_len {
            let byte = self.read_u8(at)?;
            if byte == 0 {
                break;
            }
            out.push(byte);
            at = at.checked_add(1).ok_or(MemoryError::OutOfBoundsRead {
                addr: at,
                width: Width::Byte,
            })?;
        }
        Ok(out)
    }

    /// Write `bytes` followed by a NUL terminator.
    fn write_cstr(&mut self, addr: u64, bytes: &[u8]) -> Result<(), MemoryError> {
        self.store_bytes(addr, bytes)?;
        let end = addr
            .checked_add(bytes.len() as u64)
            .ok_or(MemoryError::OutOfBoundsWrite {
                addr,
                width: Width::Byte,
            })?;
        self.write_u8(end, 0)
    }
}

impl<T: MemoryBus + ?Sized> MemoryBus for &mut T {
    #[inline]
    fn read(&mut self, addr: u64, width: Width) -> Result<u64, MemoryError> {
        <T as MemoryBus>::read(&mut **self, addr, width)
    }

    #[inline]
    fn write(&mut self, addr: u64, width: Width, value: u64) -> Result<(), MemoryError> {
        <T as MemoryBus>::write(&mut **self, addr, width, value)
    }

    #[inline]
    fn is_mapped(&self, addr: u64, width: Width) -> bool {
        <T as MemoryBus>::is_mapped(&**self, addr, width)
    }

    #[inline]
    fn load_bytes(&mut self, addr: u64, dst: &mut [u8]) -> Result<(), MemoryError> {
        <T as MemoryBus>::load_bytes(&mut **self, addr, dst)
    }

    #[inline]
    fn store_bytes(&mut self, addr: u64, src: &[u8]) -> Result<(), MemoryError> {
        <T as MemoryBus>::store_bytes(&mut **self, addr, src)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn width_fits_rejects_high_bits() {
        assert!(Width::Byte.fits(0xff));
        assert!(!Width::Byte.fits(0x100));
        assert!(Width::Half.fits(0xffff));
        assert!(!Width::Word.fits(0x1_0000_0000));
        assert!(Width::Double.fits(u64::MAX));
    }
}
