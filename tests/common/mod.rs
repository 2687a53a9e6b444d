#![allow(dead_code)]

use std::alloc::{GlobalAlloc, Layout, System};
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Written over every block before it goes back to the system allocator.
pub const POISON: u8 = 0xDE;

/// A global allocator that poisons freed memory and counts live blocks.
///
/// A node read after it was freed yields poisoned pointers and values, which either
/// crashes the test or fails its checksum.
pub struct Poisoning {
    live: AtomicUsize,
}

impl Poisoning {
    pub const fn new() -> Self {
        Self {
            live: AtomicUsize::new(0),
        }
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

unsafe impl GlobalAlloc for Poisoning {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let block = System.alloc(layout);

        if !block.is_null() {
            self.live.fetch_add(1, Ordering::SeqCst);
        }

        block
    }

    unsafe fn dealloc(&self, block: *mut u8, layout: Layout) {
        ptr::write_bytes(block, POISON, layout.size());
        self.live.fetch_sub(1, Ordering::SeqCst);
        System.dealloc(block, layout);
    }
}

/// Sum of `0..n`, the checksum of every value a scenario hands out exactly once.
pub fn checksum(n: usize) -> u64 {
    let n = n as u64;
    n * (n - 1) / 2
}
