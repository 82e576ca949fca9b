// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Kernel heap for diagnostics (panic messages, formatted errors)
//! OWNERS: @kernel-mm-team
//! PUBLIC API: global allocator (no_std)
//! DEPENDS_ON: linked_list_allocator, spin
//! INVARIANTS: Arena lives in kernel bss, outside every ledger-managed page; initialised
//!             lazily on first allocation

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, NonNull};

use linked_list_allocator::Heap;
use spin::Mutex;

const HEAP_SIZE: usize = 16 * 1024;

#[repr(align(16))]
struct Arena([u8; HEAP_SIZE]);

static mut ARENA: Arena = Arena([0; HEAP_SIZE]);

struct KernelHeap {
    inner: Mutex<Option<Heap>>,
}

impl KernelHeap {
    const fn new() -> Self {
        Self { inner: Mutex::new(None) }
    }
}

unsafe impl GlobalAlloc for KernelHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let mut guard = self.inner.lock();
        let heap = guard.get_or_insert_with(|| {
            // SAFETY: the arena is handed to the allocator exactly once, here.
            unsafe { Heap::new(ptr::addr_of_mut!(ARENA).cast::<u8>(), HEAP_SIZE) }
        });
        heap.allocate_first_fit(layout).map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if let (Some(heap), Some(ptr)) = (self.inner.lock().as_mut(), NonNull::new(ptr)) {
            // SAFETY: `ptr` came from `alloc` with the same layout.
            unsafe { heap.deallocate(ptr, layout) };
        }
    }
}

#[global_allocator]
static GLOBAL: KernelHeap = KernelHeap::new();
