//! The geovm program image format.
//!
//! An image is a 64-byte little-endian header followed by `instruction_count` 32-bit
//! little-endian instruction words:
//!
//! | offset | size | field |
//! |--------|------|-------|
//! | 0      | 4    | magic `GEOV` |
//! | 4      | 4    | version (1 = legacy encoding, 2 = RV32) |
//! | 8      | 8    | creation timestamp (unix seconds) |
//! | 16     | 8    | instruction count |
//! | 24     | 8    | entry point, byte offset into the payload |
//! | 32     | 4    | CRC-32/IEEE of the payload |
//! | 36     | 28   | reserved, zero |

#![forbid(unsafe_code)]

mod checksum;
mod error;

use core::fmt;

use serde::{Deserialize, Serialize};

pub use checksum::{crc32, crc32_update};
pub use error::LoadError;

pub const MAGIC: [u8; 4] = *b"GEOV";
pub const HEADER_LEN: usize = 64;

/// Instruction encoding of the payload, selected by the header version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Isa {
    /// Fixed 4-field `[opcode, dst, src1, src2]` words.
    Legacy,
    /// RV32I subset with M extension and a few privileged instructions.
    Rv32,
}

impl Isa {
    pub const fn version(self) -> u32 {
        match self {
            Isa::Legacy => 1,
            Isa::Rv32 => 2,
        }
    }

    pub const fn from_version(version: u32) -> Option<Self> {
        match version {
            1 => Some(Isa::Legacy),
            2 => Some(Isa::Rv32),
            _ => None,
        }
    }
}

impl fmt::Display for Isa {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Isa::Legacy => "legacy",
            Isa::Rv32 => "rv32",
        })
    }
}

/// Limits applied while parsing untrusted images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderLimits {
    pub max_instructions: u64,
}

impl Default for LoaderLimits {
    fn default() -> Self {
        Self {
            max_instructions: 1 << 20,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageHeader {
    pub isa: Isa,
    pub timestamp: u64,
    pub instruction_count: u64,
    pub entry_point: u64,
    pub checksum: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    header: ImageHeader,
    words: Vec<u32>,
}

impl Image {
    /// Build an image with a zero timestamp and entry point and a correct checksum.
    pub fn new(isa: Isa, words: Vec<u32>) -> Self {
        let checksum = crc32(&payload_bytes(&words));
        Self {
            header: ImageHeader {
                isa,
                timestamp: 0,
                instruction_count: words.len() as u64,
                entry_point: 0,
                checksum,
            },
            words,
        }
    }

    /// Set the entry point (a byte offset into the payload). Not validated until
    /// [`Image::parse`].
    pub fn with_entry_point(mut self, entry_point: u64) -> Self {
        self.header.entry_point = entry_point;
        self
    }

    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.header.timestamp = timestamp;
        self
    }

    #[inline]
    pub fn header(&self) -> &ImageHeader {
        &self.header
    }

    #[inline]
    pub fn isa(&self) -> Isa {
        self.header.isa
    }

    #[inline]
    pub fn entry_point(&self) -> u64 {
        self.header.entry_point
    }

    #[inline]
    pub fn words(&self) -> &[u32] {
        &self.words
    }

    pub fn into_words(self) -> Vec<u32> {
        self.words
    }

    /// Payload size in bytes.
    #[inline]
    pub fn payload_len(&self) -> u64 {
        self.words.len() as u64 * 4
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, LoadError> {
        Self::parse_with_limits(bytes, &LoaderLimits::default())
    }

    pub fn parse_with_limits(bytes: &[u8], limits: &LoaderLimits) -> Result<Self, LoadError> {
        if bytes.len() < 8 {
            return Err(LoadError::TruncatedHeader {
                len: bytes.len(),
                needed: 8,
            });
        }
        let mut found = [0u8; 4];
        found.copy_from_slice(&bytes[0..4]);
        if found != MAGIC {
            return Err(LoadError::BadMagic { found });
        }
        let version = le_u32(bytes, 4);
        let isa = Isa::from_version(version).ok_or(LoadError::UnsupportedVersion(version))?;
        if bytes.len() < HEADER_LEN {
            return Err(LoadError::TruncatedHeader {
                len: bytes.len(),
                needed: HEADER_LEN,
            });
        }

        let timestamp = le_u64(bytes, 8);
        let instruction_count = le_u64(bytes, 16);
        let entry_point = le_u64(bytes, 24);
        let checksum = le_u32(bytes, 32);

        if instruction_count > limits.max_instructions {
            return Err(LoadError::ImageTooLarge {
                instructions: instruction_count,
                limit: limits.max_instructions,
            });
        }

        let payload_len = instruction_count.saturating_mul(4);
        let expected = payload_len.saturating_add(HEADER_LEN as u64);
        if bytes.len() as u64 != expected {
            return Err(LoadError::SizeMismatch {
                expected,
                actual: bytes.len() as u64,
            });
        }

        let payload = &bytes[HEADER_LEN..];
        let actual = crc32(payload);
        if actual != checksum {
            return Err(LoadError::ChecksumMismatch {
                expected: checksum,
                actual,
            });
        }

        let entry_ok = if instruction_count == 0 {
            entry_point == 0
        } else {
            entry_point % 4 == 0 && entry_point < payload_len
        };
        if !entry_ok {
            return Err(LoadError::BadEntryPoint {
                entry_point,
                instructions: instruction_count,
            });
        }

        let words = payload
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        Ok(Self {
            header: ImageHeader {
                isa,
                timestamp,
                instruction_count,
                entry_point,
                checksum,
            },
            words,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.words.len() * 4);
        out.extend_from_slice(&MAGIC);
        out.extend_from_slice(&self.header.isa.version().to_le_bytes());
        out.extend_from_slice(&self.header.timestamp.to_le_bytes());
        out.extend_from_slice(&self.header.instruction_count.to_le_bytes());
        out.extend_from_slice(&self.header.entry_point.to_le_bytes());
        out.extend_from_slice(&self.header.checksum.to_le_bytes());
        out.resize(HEADER_LEN, 0);
        out.extend_from_slice(&payload_bytes(&self.words));
        out
    }
}

fn payload_bytes(words: &[u32]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}

#[inline]
fn le_u32(bytes: &[u8], off: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[off..off + 4]);
    u32::from_le_bytes(buf)
}

#[inline]
fn le_u64(bytes: &[u8], off: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[off..off + 8]);
    u64::from_le_bytes(buf)
}
