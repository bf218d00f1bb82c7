use serde::{Deserialize, Serialize};

use crate::dirty::{DirtyRect, DirtyTracker};
use crate::error::FramebufferError;

/// RGBA8.
pub const BYTES_PER_PIXEL: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    #[inline]
    pub const fn byte_len(self) -> u64 {
        self.width as u64 * self.height as u64 * BYTES_PER_PIXEL as u64
    }
}

/// Resolutions accepted by [`Framebuffer::set_resolution`], smallest first.
pub const SUPPORTED_RESOLUTIONS: &[Resolution] = &[
    Resolution::new(64, 64),
    Resolution::new(128, 128),
    Resolution::new(256, 256),
    Resolution::new(320, 240),
    Resolution::new(640, 480),
];

/// Framebuffer window storage with dirty-rectangle tracking.
///
/// The window may be larger than the visible frame; bytes past `width * height * 4` are stored
/// but never reported dirty.
#[derive(Debug, Clone)]
pub struct Framebuffer {
    data: Vec<u8>,
    resolution: Resolution,
    dirty: DirtyTracker,
}

impl Framebuffer {
    /// A window of `len` bytes showing the largest supported resolution that fits. A window too
    /// small for any supported resolution has an empty (0x0) visible frame.
    pub fn new(len: usize) -> Self {
        let resolution = SUPPORTED_RESOLUTIONS
            .iter()
            .copied()
            .filter(|r| r.byte_len() <= len as u64)
            .max_by_key(|r| r.byte_len())
            .unwrap_or(Resolution::new(0, 0));
        Self {
            data: vec![0; len],
            resolution,
            dirty: DirtyTracker::new(resolution.width, resolution.height),
        }
    }

    #[inline]
    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Switch the visible frame. Pending dirty rectangles are discarded.
    pub fn set_resolution(&mut self, width: u32, height: u32) -> Result<(), FramebufferError> {
        let res = Resolution::new(width, height);
        if !SUPPORTED_RESOLUTIONS.contains(&res) {
            return Err(FramebufferError::UnsupportedResolution { width, height });
        }
        if res.byte_len() > self.data.len() as u64 {
            return Err(FramebufferError::WindowTooSmall {
                width,
                height,
                needed: res.byte_len(),
                available: self.data.len() as u64,
            });
        }
        self.resolution = res;
        self.dirty.resize(width, height);
        Ok(())
    }

    pub fn dirty_rects(&self) -> &[DirtyRect] {
        self.dirty.rects()
    }

    pub fn take_dirty_rects(&mut self) -> Vec<DirtyRect> {
        self.dirty.take()
    }

    pub(crate) fn read_byte(&self, offset: usize) -> u8 {
        self.data[offset]
    }

    /// Store bytes at `offset` (bounds-checked by the caller) and mark every touched pixel.
    pub(crate) fn write_bytes(&mut self, offset: usize, bytes: &[u8]) {
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
        if bytes.is_empty() || self.resolution.width == 0 {
            return;
        }

        let bpp = BYTES_PER_PIXEL as usize;
        let visible = self.resolution.byte_len() as usize;
        let first = offset / bpp;
        let last = (offset + bytes.len() - 1) / bpp;
        for pixel in first..=last {
            if pixel * bpp >= visible {
                break;
            }
            let width = self.resolution.width as usize;
            self.dirty
                .mark_pixel((pixel % width) as u32, (pixel / width) as u32);
        }
    }

    pub(crate) fn reset(&mut self) {
        self.data.fill(0);
        self.dirty.clear();
    }
}
