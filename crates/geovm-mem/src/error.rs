use thiserror::Error;

use crate::Width;

/// A failed access on a [`crate::MemoryBus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MemoryError {
    #[error("out-of-bounds {width} read at 0x{addr:08x}")]
    OutOfBoundsRead { addr: u64, width: Width },

    #[error("out-of-bounds {width} write at 0x{addr:08x}")]
    OutOfBoundsWrite { addr: u64, width: Width },

    #[error("value 0x{value:x} does not fit in a {width} write")]
    ValueOutOfRange { value: u64, width: Width },
}

/// A [`crate::MemoryLayout`] that cannot back a [`crate::Memory`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LayoutError {
    #[error("region `{name}` is empty")]
    EmptyRegion { name: &'static str },

    #[error("region `{name}` at 0x{base:x} with length 0x{len:x} overflows the address space")]
    AddressOverflow {
        name: &'static str,
        base: u64,
        len: u64,
    },

    #[error("region `{first}` overlaps region `{second}`")]
    Overlap {
        first: &'static str,
        second: &'static str,
    },

    #[error("RAM size 0x{len:x} is not a multiple of 4 bytes")]
    UnalignedRam { len: u64 },
}

/// A rejected framebuffer resolution change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FramebufferError {
    #[error("unsupported resolution {width}x{height}")]
    UnsupportedResolution { width: u32, height: u32 },

    #[error("resolution {width}x{height} needs {needed} bytes but the window holds {available}")]
    WindowTooSmall {
        width: u32,
        height: u32,
        needed: u64,
        available: u64,
    },
}
