//! Kernel heap allocator.
//!
//! A single in-place doubly-linked free list over a caller-supplied
//! region. Each chunk is a [`MemoryChunk`] header physically followed by
//! its payload; the chunks tile the region contiguously and no two
//! adjacent chunks are ever both free. The one live [`MemoryManager`]
//! also backs Rust's global allocator, the way the original kernel
//! rebound global `new`/`delete`.

use crate::arch::x86;
use core::alloc::{GlobalAlloc, Layout};
use core::mem::size_of;
use core::ptr;
use spin::Mutex;

/// Every pointer handed out by the global allocator is aligned to this;
/// sizes are rounded up to keep it true across splits.
const HEAP_ALIGN: usize = 16;

#[repr(C)]
struct MemoryChunk {
    prev: *mut MemoryChunk,
    next: *mut MemoryChunk,
    allocated: bool,
    size: usize,
}

const HEADER_SIZE: usize = size_of::<MemoryChunk>();

/// Free-list allocator over one contiguous memory region.
pub struct MemoryManager {
    first: *mut MemoryChunk,
}

// The raw chunk pointers never leave the managed region.
unsafe impl Send for MemoryManager {}

impl MemoryManager {
    /// Describe `[start, start + size)` as one free chunk. A region too
    /// small to hold a header yields an empty manager that fails every
    /// allocation.
    ///
    /// # Safety
    /// The region must be unused, writable memory.
    pub unsafe fn new(start: usize, size: usize) -> MemoryManager {
        if size < HEADER_SIZE {
            return MemoryManager {
                first: ptr::null_mut(),
            };
        }

        let first = start as *mut MemoryChunk;
        (*first).allocated = false;
        (*first).prev = ptr::null_mut();
        (*first).next = ptr::null_mut();
        (*first).size = size - HEADER_SIZE;

        MemoryManager { first }
    }

    /// First-fit allocation of `size` bytes. The fit is strict
    /// (`chunk.size > size`) so a split always has at least one spare
    /// byte to give; a chunk of exactly `size` is skipped. Returns null
    /// when nothing fits.
    pub fn allocate(&mut self, size: usize) -> *mut u8 {
        let mut result: *mut MemoryChunk = ptr::null_mut();

        let mut chunk = self.first;
        while !chunk.is_null() && result.is_null() {
            unsafe {
                if (*chunk).size > size && !(*chunk).allocated {
                    result = chunk;
                }
                chunk = (*chunk).next;
            }
        }

        if result.is_null() {
            return ptr::null_mut();
        }

        unsafe {
            // Split when the surplus can host another header plus at
            // least one payload byte.
            if (*result).size >= size + HEADER_SIZE + 1 {
                let remainder = (result as usize + HEADER_SIZE + size) as *mut MemoryChunk;

                (*remainder).allocated = false;
                (*remainder).size = (*result).size - size - HEADER_SIZE;
                (*remainder).prev = result;
                (*remainder).next = (*result).next;
                if !(*remainder).next.is_null() {
                    (*(*remainder).next).prev = remainder;
                }

                (*result).size = size;
                (*result).next = remainder;
            }

            (*result).allocated = true;
            (result as *mut u8).add(HEADER_SIZE)
        }
    }

    /// Release the allocation at `ptr` and coalesce with the previous
    /// and next chunks when they are free.
    ///
    /// # Safety
    /// `ptr` must have come from [`allocate`](MemoryManager::allocate)
    /// on this manager and not have been freed already.
    pub unsafe fn free(&mut self, ptr: *mut u8) {
        let mut chunk = (ptr as usize - HEADER_SIZE) as *mut MemoryChunk;

        (*chunk).allocated = false;

        if !(*chunk).prev.is_null() && !(*(*chunk).prev).allocated {
            let prev = (*chunk).prev;
            (*prev).next = (*chunk).next;
            (*prev).size += (*chunk).size + HEADER_SIZE;
            if !(*chunk).next.is_null() {
                (*(*chunk).next).prev = prev;
            }
            chunk = prev;
        }

        if !(*chunk).next.is_null() && !(*(*chunk).next).allocated {
            let next = (*chunk).next;
            (*chunk).size += (*next).size + HEADER_SIZE;
            (*chunk).next = (*next).next;
            if !(*chunk).next.is_null() {
                (*(*chunk).next).prev = chunk;
            }
        }
    }

    #[cfg(test)]
    fn chunk_census(&self) -> (usize, usize) {
        let mut count = 0;
        let mut bytes = 0;
        let mut chunk = self.first;
        while !chunk.is_null() {
            unsafe {
                count += 1;
                bytes += HEADER_SIZE + (*chunk).size;
                if !(*chunk).next.is_null() {
                    assert_eq!((*(*chunk).next).prev, chunk);
                }
                chunk = (*chunk).next;
            }
        }
        (count, bytes)
    }

    #[cfg(test)]
    fn no_adjacent_free_chunks(&self) -> bool {
        let mut chunk = self.first;
        while !chunk.is_null() {
            unsafe {
                let next = (*chunk).next;
                if !next.is_null() && !(*chunk).allocated && !(*next).allocated {
                    return false;
                }
                chunk = next;
            }
        }
        true
    }
}

struct KernelHeap {
    manager: Mutex<Option<MemoryManager>>,
}

#[global_allocator]
static ALLOCATOR: KernelHeap = KernelHeap {
    manager: Mutex::new(None),
};

unsafe impl GlobalAlloc for KernelHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > HEAP_ALIGN {
            return ptr::null_mut();
        }
        let size = layout.size().max(1).next_multiple_of(HEAP_ALIGN);
        x86::without_interrupts(|| match self.manager.lock().as_mut() {
            Some(manager) => manager.allocate(size),
            None => ptr::null_mut(),
        })
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        x86::without_interrupts(|| {
            if let Some(manager) = self.manager.lock().as_mut() {
                manager.free(ptr);
            }
        });
    }
}

/// Install the active heap region.
///
/// # Safety
/// See [`crate::mm::init`].
pub unsafe fn init(start: usize, size: usize) {
    *ALLOCATOR.manager.lock() = Some(MemoryManager::new(start, size));
}

#[alloc_error_handler]
fn alloc_error_handler(layout: Layout) -> ! {
    panic!("allocation error: {:?}", layout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    const ARENA_SIZE: usize = 0x10000;

    fn with_arena(test: impl FnOnce(&mut MemoryManager, usize)) {
        let mut arena = vec![0u8; ARENA_SIZE + HEAP_ALIGN];
        let start = (arena.as_mut_ptr() as usize).next_multiple_of(HEAP_ALIGN);
        let mut manager = unsafe { MemoryManager::new(start, ARENA_SIZE) };
        test(&mut manager, start);
    }

    #[test_case]
    fn first_fit_reuses_freed_chunk() {
        with_arena(|manager, start| {
            let first = manager.allocate(100);
            let second = manager.allocate(200);
            assert_eq!(first as usize, start + HEADER_SIZE);
            assert_eq!(second as usize, start + 2 * HEADER_SIZE + 100);

            unsafe { manager.free(first) };

            // The freed 100-byte chunk is first-fit for 50 bytes.
            let third = manager.allocate(50);
            assert_eq!(third, first);

            // 80 bytes no longer fit before `second`; the allocation
            // lands after both live chunks.
            let fourth = manager.allocate(80);
            assert_eq!(fourth as usize, second as usize + 200 + HEADER_SIZE);
        });
    }

    #[test_case]
    fn chunks_tile_the_whole_region() {
        with_arena(|manager, _| {
            let a = manager.allocate(128);
            let b = manager.allocate(1);
            let c = manager.allocate(4096);
            assert!(!a.is_null() && !b.is_null() && !c.is_null());

            let (_, bytes) = manager.chunk_census();
            assert_eq!(bytes, ARENA_SIZE);

            unsafe { manager.free(b) };
            let (_, bytes) = manager.chunk_census();
            assert_eq!(bytes, ARENA_SIZE);
        });
    }

    #[test_case]
    fn freeing_coalesces_neighbours() {
        with_arena(|manager, _| {
            let a = manager.allocate(64);
            let b = manager.allocate(64);
            let c = manager.allocate(64);

            unsafe {
                manager.free(b);
                assert!(manager.no_adjacent_free_chunks());
                manager.free(a);
                assert!(manager.no_adjacent_free_chunks());
                manager.free(c);
                assert!(manager.no_adjacent_free_chunks());
            }

            // Everything merged back into the single original chunk.
            let (count, bytes) = manager.chunk_census();
            assert_eq!(count, 1);
            assert_eq!(bytes, ARENA_SIZE);
        });
    }

    #[test_case]
    fn exact_size_chunk_is_not_used() {
        let payload = 256;
        let mut arena = vec![0u8; HEADER_SIZE + payload + HEAP_ALIGN];
        let start = (arena.as_mut_ptr() as usize).next_multiple_of(HEAP_ALIGN);
        let mut manager = unsafe { MemoryManager::new(start, HEADER_SIZE + payload) };

        // The only free chunk holds exactly `payload` bytes; the strict
        // first-fit rule refuses it.
        assert!(manager.allocate(payload).is_null());
        assert!(!manager.allocate(payload - HEADER_SIZE - 1).is_null());
    }

    #[test_case]
    fn allocation_failure_returns_null() {
        with_arena(|manager, _| {
            assert!(manager.allocate(ARENA_SIZE).is_null());
        });
    }
}
