use std::cell::RefCell;
use std::rc::Rc;

use geovm_mem::{
    DirtyTracker, Memory, MemoryBus, MemoryLayout, Width, CONSOLE_OUTPUT, MAX_DIRTY_RECTS,
};
use proptest::prelude::*;

fn layout_with_windows(console_page: u64, fb_page: u64) -> MemoryLayout {
    MemoryLayout {
        ram_base: 0,
        text_size: 0x1000,
        stack_size: 0x1000,
        heap_size: 0x2000,
        console_base: 0x1_0000 + console_page * 0x1000,
        framebuffer_base: 0x100_0000 + fb_page * 0x10_0000,
        framebuffer_size: 64 * 64 * 4,
    }
}

proptest! {
    #[test]
    fn ram_writes_never_reach_mmio(
        console_page in 0u64..64,
        fb_page in 0u64..16,
        writes in prop::collection::vec((0u64..0x4000, any::<u32>()), 1..64),
    ) {
        let layout = layout_with_windows(console_page, fb_page);
        let out = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&out);
        let mut mem = Memory::new(layout).unwrap();
        mem.set_console_output(move |b| sink.borrow_mut().push(b));

        for (addr, value) in writes {
            let addr = addr & !3;
            mem.write_u32(addr, value).unwrap();
            prop_assert_eq!(mem.read_u32(addr).unwrap(), value);
        }

        prop_assert!(out.borrow().is_empty());
        prop_assert!(mem.dirty_rects().is_empty());
        prop_assert!(mem.framebuffer().as_bytes().iter().all(|&b| b == 0));
    }

    #[test]
    fn framebuffer_writes_never_reach_ram(
        fb_page in 0u64..16,
        writes in prop::collection::vec((0u64..(64 * 64 * 4), any::<u8>()), 1..64),
    ) {
        let layout = layout_with_windows(0, fb_page);
        let mut mem = Memory::new(layout.clone()).unwrap();
        let before = mem.ram_bytes();
        for (off, value) in writes {
            mem.write(layout.framebuffer_base + off, Width::Byte, u64::from(value)).unwrap();
        }
        prop_assert_eq!(mem.ram_bytes(), before);
        prop_assert!(!mem.dirty_rects().is_empty());
    }

    #[test]
    fn console_and_framebuffer_windows_are_isolated(
        console_page in 0u64..64,
        fb_page in 0u64..16,
        console_bytes in prop::collection::vec(any::<u8>(), 1..32),
        fb_writes in prop::collection::vec((0u64..(64 * 64 * 4), any::<u8>()), 1..64),
    ) {
        let layout = layout_with_windows(console_page, fb_page);
        let out = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&out);
        let mut mem = Memory::new(layout.clone()).unwrap();
        mem.set_console_output(move |b| sink.borrow_mut().push(b));

        let fb_before = mem.framebuffer().as_bytes().to_vec();
        for &byte in &console_bytes {
            mem.write_u8(layout.console_base + CONSOLE_OUTPUT, byte).unwrap();
        }
        {
            let out_bytes = out.borrow();
            prop_assert_eq!(out_bytes.as_slice(), console_bytes.as_slice());
        }
        prop_assert_eq!(mem.framebuffer().as_bytes(), fb_before.as_slice());
        prop_assert!(mem.dirty_rects().is_empty());

        out.borrow_mut().clear();
        for (off, value) in fb_writes {
            mem.write(layout.framebuffer_base + off, Width::Byte, u64::from(value)).unwrap();
        }
        prop_assert!(out.borrow().is_empty());
    }

    #[test]
    fn accesses_straddling_a_window_fail(
        console_page in 0u64..64,
        below in 1u64..4,
    ) {
        let layout = layout_with_windows(console_page, 0);
        let mut mem = Memory::new(layout.clone()).unwrap();
        let addr = layout.console_base - below;
        prop_assert!(mem.read(addr, Width::Double).is_err());
        prop_assert!(mem.write(addr, Width::Double, 0).is_err());
    }

    #[test]
    fn dirty_rect_count_is_bounded(
        pixels in prop::collection::vec((0u32..320, 0u32..240), 0..512),
    ) {
        let mut tracker = DirtyTracker::new(320, 240);
        for (x, y) in pixels {
            tracker.mark_pixel(x, y);
            prop_assert!(tracker.rects().len() <= MAX_DIRTY_RECTS);
        }
        let rects = tracker.rects();
        for (i, a) in rects.iter().enumerate() {
            prop_assert!(a.right() <= 320 && a.bottom() <= 240);
            for b in &rects[i + 1..] {
                prop_assert!(!a.touches(b));
            }
        }
    }

    #[test]
    fn every_marked_pixel_is_covered(
        pixels in prop::collection::vec((0u32..256, 0u32..256), 1..128),
    ) {
        let mut tracker = DirtyTracker::new(256, 256);
        for &(x, y) in &pixels {
            tracker.mark_pixel(x, y);
        }
        for (x, y) in pixels {
            prop_assert!(tracker.rects().iter().any(|r| r.contains(x, y)));
        }
    }
}
