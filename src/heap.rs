//! Per-thread heap accounting.
//!
//! [`CountingAlloc`] forwards to the system allocator and, on threads that
//! have opened a window with [`start`], keeps a running total of live bytes
//! and its peak. Worker threads open a window around every plugin call so
//! script-held strings, arrays and maps count against the memory ceiling.
//! Bytes freed inside a window that were allocated before it are ignored.

use std::alloc::{GlobalAlloc, Layout, System};
use std::cell::Cell;

pub struct CountingAlloc;

thread_local! {
    static TRACKING: Cell<bool> = const { Cell::new(false) };
    static LIVE: Cell<isize> = const { Cell::new(0) };
    static PEAK: Cell<isize> = const { Cell::new(0) };
}

// must not allocate: runs inside the allocator
fn record(delta: isize) {
    let _ = TRACKING.try_with(|tracking| {
        if !tracking.get() {
            return;
        }
        let _ = LIVE.try_with(|live| {
            let now = live.get().saturating_add(delta);
            live.set(now);
            let _ = PEAK.try_with(|peak| {
                if now > peak.get() {
                    peak.set(now);
                }
            });
        });
    });
}

unsafe impl GlobalAlloc for CountingAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = unsafe { System.alloc(layout) };
        if !ptr.is_null() {
            record(layout.size() as isize);
        }
        ptr
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = unsafe { System.alloc_zeroed(layout) };
        if !ptr.is_null() {
            record(layout.size() as isize);
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        unsafe { System.dealloc(ptr, layout) };
        record(-(layout.size() as isize));
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let new_ptr = unsafe { System.realloc(ptr, layout, new_size) };
        if !new_ptr.is_null() {
            record(new_size as isize - layout.size() as isize);
        }
        new_ptr
    }
}

/// Open a window on this thread, counting from zero.
pub fn start() {
    LIVE.set(0);
    PEAK.set(0);
    TRACKING.set(true);
}

/// Close this thread's window, returning its peak.
pub fn stop() -> usize {
    TRACKING.set(false);
    peak()
}

/// Bytes allocated and still held since [`start`].
pub fn live() -> usize {
    usize::try_from(LIVE.get()).unwrap_or(0)
}

pub fn peak() -> usize {
    usize::try_from(PEAK.get()).unwrap_or(0)
}

#[cfg(all(test, feature = "heap-accounting"))]
mod tests {
    use super::*;

    #[test]
    fn window_sees_held_bytes_and_keeps_the_peak() {
        start();
        let held = std::hint::black_box(vec![0u8; 1 << 20]);
        assert!(live() >= 1 << 20);
        drop(held);
        assert!(live() < 1 << 20);
        assert!(stop() >= 1 << 20);
    }

    #[test]
    fn other_threads_are_not_counted() {
        start();
        std::thread::spawn(|| {
            let held = vec![0u8; 4 << 20];
            std::hint::black_box(&held);
        })
        .join()
        .unwrap();
        assert!(live() < 1 << 20);
        stop();
    }

    #[test]
    fn nothing_is_counted_outside_a_window() {
        stop();
        let held = std::hint::black_box(vec![0u8; 1 << 20]);
        assert_eq!(live(), 0);
        drop(held);
    }
}
