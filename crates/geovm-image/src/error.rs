use thiserror::Error;

/// Why an image was rejected. Nothing has been written to guest memory when this is returned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    #[error("bad image magic {found:02x?}")]
    BadMagic { found: [u8; 4] },

    #[error("unsupported image version {0}")]
    UnsupportedVersion(u32),

    #[error("truncated header: {len} bytes, need {needed}")]
    TruncatedHeader { len: usize, needed: usize },

    #[error("image is {actual} bytes but the header describes {expected}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("payload checksum 0x{actual:08x} does not match header checksum 0x{expected:08x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("image holds {instructions} instructions, limit is {limit}")]
    ImageTooLarge { instructions: u64, limit: u64 },

    #[error("entry point 0x{entry_point:x} is not an aligned offset into {instructions} instructions")]
    BadEntryPoint { entry_point: u64, instructions: u64 },
}
