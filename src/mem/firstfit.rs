/*
 * First-Fit Resource
 *
 * An address-ordered free list with coalescing on release, the shape the
 * application heap wants. The hole management is the linked-list heap
 * the rest of the ecosystem uses; this wrapper adapts it to the memory
 * resource capability set.
 */

use core::alloc::Layout;
use core::ptr::NonNull;

use linked_list_allocator::Heap;

use crate::errno::{Errno, Result};

pub struct FirstFit {
    heap: Heap,
}

unsafe impl Send for FirstFit {}

impl FirstFit {
    /// Run the resource over a static buffer.
    pub fn new(region: &'static mut [u8]) -> Self {
        let mut heap = Heap::empty();
        if !region.is_empty() {
            unsafe {
                heap.init(region.as_mut_ptr(), region.len());
            }
        }
        Self { heap }
    }

    /// # Safety
    /// `region` must point to `len` writable bytes that outlive the
    /// resource and are referenced by nothing else.
    pub unsafe fn from_raw(region: NonNull<u8>, len: usize) -> Self {
        let mut heap = Heap::empty();
        unsafe {
            heap.init(region.as_ptr(), len);
        }
        Self { heap }
    }

    pub fn allocate(&mut self, bytes: usize, align: usize) -> Result<NonNull<u8>> {
        let layout = Layout::from_size_align(bytes, align).map_err(|_| Errno::InvalidArgument)?;
        self.heap
            .allocate_first_fit(layout)
            .map_err(|_| Errno::NoMemory)
    }

    pub fn deallocate(&mut self, ptr: NonNull<u8>, bytes: usize, align: usize) {
        if let Ok(layout) = Layout::from_size_align(bytes, align) {
            unsafe {
                self.heap.deallocate(ptr, layout);
            }
        }
    }

    pub fn used(&self) -> usize {
        self.heap.used()
    }

    pub fn free(&self) -> usize {
        self.heap.free()
    }
}
