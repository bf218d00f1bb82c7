use serde::{Deserialize, Serialize};

/// Side of the square pixel granule dirty rectangles are rounded to.
pub const DIRTY_GRANULE: u32 = 4;

/// Upper bound on tracked rectangles before the set collapses to a full-frame rectangle.
pub const MAX_DIRTY_RECTS: usize = 32;

/// A pixel rectangle `[x, x + width) x [y, y + height)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DirtyRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl DirtyRect {
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    #[inline]
    pub const fn right(&self) -> u32 {
        self.x + self.width
    }

    #[inline]
    pub const fn bottom(&self) -> u32 {
        self.y + self.height
    }

    #[inline]
    pub const fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub const fn contains(&self, x: u32, y: u32) -> bool {
        x >= self.x && x < self.right() && y >= self.y && y < self.bottom()
    }

    pub const fn contains_rect(&self, other: &DirtyRect) -> bool {
        other.x >= self.x
            && other.y >= self.y
            && other.right() <= self.right()
            && other.bottom() <= self.bottom()
    }

    /// Overlapping or sharing an edge or a corner.
    pub const fn touches(&self, other: &DirtyRect) -> bool {
        self.x <= other.right()
            && other.x <= self.right()
            && self.y <= other.bottom()
            && other.y <= self.bottom()
    }

    /// Smallest rectangle covering both.
    pub fn union(&self, other: &DirtyRect) -> DirtyRect {
        let x = self.x.min(other.x);
        let y = self.y.min(other.y);
        DirtyRect {
            x,
            y,
            width: self.right().max(other.right()) - x,
            height: self.bottom().max(other.bottom()) - y,
        }
    }
}

/// Set of dirty rectangles for one frame.
///
/// Every pixel is rounded out to its [`DIRTY_GRANULE`]-aligned cell, touching rectangles are
/// merged, and the set never holds more than its cap: past the cap it is replaced by a single
/// full-frame rectangle.
#[derive(Debug, Clone)]
pub struct DirtyTracker {
    width: u32,
    height: u32,
    cap: usize,
    rects: Vec<DirtyRect>,
}

impl DirtyTracker {
    pub fn new(width: u32, height: u32) -> Self {
        Self::with_cap(width, height, MAX_DIRTY_RECTS)
    }

    pub fn with_cap(width: u32, height: u32, cap: usize) -> Self {
        Self {
            width,
            height,
            cap: cap.max(1),
            rects: Vec::new(),
        }
    }

    #[inline]
    pub fn frame(&self) -> DirtyRect {
        DirtyRect::new(0, 0, self.width, self.height)
    }

    pub fn rects(&self) -> &[DirtyRect] {
        &self.rects
    }

    pub fn is_empty(&self) -> bool {
        self.rects.is_empty()
    }

    pub fn take(&mut self) -> Vec<DirtyRect> {
        std::mem::take(&mut self.rects)
    }

    pub fn clear(&mut self) {
        self.rects.clear();
    }

    /// Change the frame size; pending rectangles are discarded.
    pub fn resize(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
        self.rects.clear();
    }

    /// Mark the granule containing pixel `(x, y)`. Pixels outside the frame are ignored.
    pub fn mark_pixel(&mut self, x: u32, y: u32) {
        if x >= self.width || y >= self.height {
            return;
        }
        let gx = x - x % DIRTY_GRANULE;
        let gy = y - y % DIRTY_GRANULE;
        let rect = DirtyRect::new(
            gx,
            gy,
            DIRTY_GRANULE.min(self.width - gx),
            DIRTY_GRANULE.min(self.height - gy),
        );
        self.add(rect);
    }

    /// Add an already clipped rectangle and restore the merge and cap invariants.
    pub fn add(&mut self, rect: DirtyRect) {
        if rect.width == 0 || rect.height == 0 {
            return;
        }
        if self.rects.iter().any(|r| r.contains_rect(&rect)) {
            return;
        }
        self.rects.push(rect);
        self.merge();
        if self.rects.len() > self.cap {
            self.rects.clear();
            self.rects.push(self.frame());
        }
    }

    /// Bubble-merge until no two rectangles touch.
    fn merge(&mut self) {
        loop {
            let mut merged = false;
            'scan: for i in 0..self.rects.len() {
                for j in (i + 1)..self.rects.len() {
                    if self.rects[i].touches(&self.rects[j]) {
                        let other = self.rects.swap_remove(j);
                        self.rects[i] = self.rects[i].union(&other);
                        merged = true;
                        break 'scan;
                    }
                }
            }
            if !merged {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn touches_includes_edges_and_corners() {
        let a = DirtyRect::new(0, 0, 4, 4);
        assert!(a.touches(&DirtyRect::new(2, 2, 4, 4)));
        assert!(a.touches(&DirtyRect::new(4, 0, 4, 4)));
        assert!(a.touches(&DirtyRect::new(4, 4, 4, 4)));
        assert!(!a.touches(&DirtyRect::new(8, 0, 4, 4)));
    }

    #[test]
    fn pixel_rounds_to_granule() {
        let mut t = DirtyTracker::new(64, 64);
        t.mark_pixel(5, 6);
        assert_eq!(t.rects(), &[DirtyRect::new(4, 4, 4, 4)]);
        t.mark_pixel(7, 7);
        assert_eq!(t.rects().len(), 1);
    }

    #[test]
    fn adjacent_granules_merge() {
        let mut t = DirtyTracker::new(64, 64);
        t.mark_pixel(0, 0);
        t.mark_pixel(4, 0);
        t.mark_pixel(8, 4);
        assert_eq!(t.rects(), &[DirtyRect::new(0, 0, 12, 8)]);
    }

    #[test]
    fn merge_cascades_through_bridging_rect() {
        let mut t = DirtyTracker::new(64, 64);
        t.mark_pixel(0, 0);
        t.mark_pixel(16, 0);
        assert_eq!(t.rects().len(), 2);
        t.add(DirtyRect::new(4, 0, 12, 4));
        assert_eq!(t.rects(), &[DirtyRect::new(0, 0, 20, 4)]);
    }

    #[test]
    fn overflow_collapses_to_full_frame() {
        let mut t = DirtyTracker::new(256, 256);
        for i in 0..=MAX_DIRTY_RECTS as u32 {
            t.mark_pixel((i % 16) * 16, (i / 16) * 16);
        }
        assert_eq!(t.rects(), &[DirtyRect::new(0, 0, 256, 256)]);
    }

    #[test]
    fn out_of_frame_pixels_are_ignored() {
        let mut t = DirtyTracker::new(64, 64);
        t.mark_pixel(64, 0);
        t.mark_pixel(0, 100);
        assert!(t.is_empty());
    }

    #[test]
    fn granule_is_clipped_at_frame_edge() {
        let mut t = DirtyTracker::new(66, 64);
        t.mark_pixel(65, 0);
        assert_eq!(t.rects(), &[DirtyRect::new(64, 0, 2, 4)]);
    }
}
