/*
 * Memory Resources
 *
 * The polymorphic allocator behind every kernel allocation: a tagged
 * variant over the concrete shapes, with the capability set
 * allocate / deallocate / is_equal. Two process-wide cells exist: the
 * application default and the RTOS-object resource, both replaceable.
 * The RTOS cell is selected at `init` from the configuration: the null
 * resource when dynamic memory is excluded, a private first-fit arena
 * when one is configured, otherwise the hosted forwarder.
 */

pub mod firstfit;
pub mod lifo;

use alloc::vec;
use core::alloc::Layout;
use core::ptr::NonNull;

use lazy_static::lazy_static;
use spin::Mutex;

use crate::config::Config;
use crate::errno::{Errno, Result};
use crate::kassert;

pub use firstfit::FirstFit;
pub use lifo::LifoArena;

pub enum MemoryResource {
    /// Monotonic bump arena; frees retract only in LIFO order.
    Lifo(LifoArena),
    /// Address-ordered free list with coalescing.
    FirstFit(FirstFit),
    /// Traps on allocation; installed when dynamic memory is opted out.
    Null,
    /// Forwards to the environment's global allocator.
    NewDelete,
}

impl MemoryResource {
    pub fn allocate(&mut self, bytes: usize, align: usize) -> Result<NonNull<u8>> {
        match self {
            MemoryResource::Lifo(arena) => arena.allocate(bytes, align),
            MemoryResource::FirstFit(heap) => heap.allocate(bytes, align),
            MemoryResource::Null => {
                // Allocation through the null resource is fatal by
                // contract.
                kassert!(false, "allocation through the null memory resource");
                Err(Errno::NoMemory)
            }
            MemoryResource::NewDelete => {
                let layout =
                    Layout::from_size_align(bytes, align).map_err(|_| Errno::InvalidArgument)?;
                // Forwarded to the global allocator; null means exhausted.
                let ptr = unsafe { alloc::alloc::alloc(layout) };
                NonNull::new(ptr).ok_or(Errno::NoMemory)
            }
        }
    }

    pub fn deallocate(&mut self, ptr: NonNull<u8>, bytes: usize, align: usize) {
        match self {
            MemoryResource::Lifo(arena) => arena.deallocate(ptr, bytes, align),
            MemoryResource::FirstFit(heap) => heap.deallocate(ptr, bytes, align),
            MemoryResource::Null => {}
            MemoryResource::NewDelete => {
                if let Ok(layout) = Layout::from_size_align(bytes, align) {
                    unsafe {
                        alloc::alloc::dealloc(ptr.as_ptr(), layout);
                    }
                }
            }
        }
    }

    /// Resource identity, not shape equality: two arenas over different
    /// regions are never equal.
    pub fn is_equal(&self, other: &MemoryResource) -> bool {
        core::ptr::eq(self, other)
    }
}

lazy_static! {
    /// The application-facing default resource.
    static ref DEFAULT_RESOURCE: Mutex<MemoryResource> = Mutex::new(MemoryResource::NewDelete);
    /// The resource backing kernel objects (stacks, queue buffers).
    static ref RTOS_RESOURCE: Mutex<MemoryResource> = Mutex::new(MemoryResource::NewDelete);
}

/// Select the RTOS resource from the configuration. Called by
/// `Kernel::init` before any kernel object exists.
pub(crate) fn init(config: &Config) {
    let resource = if config.exclude_dynamic_memory {
        log::info!("dynamic memory excluded, null resource installed");
        MemoryResource::Null
    } else if config.rtos_memory_size > 0 {
        log::info!("private RTOS arena of {} bytes", config.rtos_memory_size);
        let region = vec![0u8; config.rtos_memory_size].leak();
        MemoryResource::FirstFit(FirstFit::new(region))
    } else {
        MemoryResource::NewDelete
    };
    *RTOS_RESOURCE.lock() = resource;
}

/// Replace the application default resource; returns the previous one.
pub fn set_default_resource(resource: MemoryResource) -> MemoryResource {
    core::mem::replace(&mut *DEFAULT_RESOURCE.lock(), resource)
}

/// Allocate through the application default resource.
pub fn allocate(bytes: usize, align: usize) -> Result<NonNull<u8>> {
    DEFAULT_RESOURCE.lock().allocate(bytes, align)
}

pub fn deallocate(ptr: NonNull<u8>, bytes: usize, align: usize) {
    DEFAULT_RESOURCE.lock().deallocate(ptr, bytes, align)
}

/// Allocate through the RTOS-object resource.
pub(crate) fn rtos_allocate(bytes: usize, align: usize) -> Result<NonNull<u8>> {
    RTOS_RESOURCE.lock().allocate(bytes, align)
}

pub(crate) fn rtos_deallocate(ptr: NonNull<u8>, bytes: usize, align: usize) {
    RTOS_RESOURCE.lock().deallocate(ptr, bytes, align)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_delete_round_trips() {
        let mut r = MemoryResource::NewDelete;
        let p = r.allocate(64, 8).unwrap();
        r.deallocate(p, 64, 8);
    }

    #[test]
    fn identity_equality() {
        let a = MemoryResource::NewDelete;
        let b = MemoryResource::NewDelete;
        assert!(a.is_equal(&a));
        assert!(!a.is_equal(&b));
    }

    #[test]
    #[should_panic]
    fn null_resource_traps() {
        let mut r = MemoryResource::Null;
        let _ = r.allocate(1, 1);
    }
}
