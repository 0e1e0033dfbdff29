/*
 * Memory Pool
 *
 * A pre-carved array of fixed-size blocks with a free-index stack, so
 * allocation and release are O(1). An empty pool blocks allocators;
 * `release` wakes the highest-priority waiter, which retries.
 */

use alloc::vec::Vec;

use core::ptr::NonNull;

use crate::clock::Deadline;
use crate::errno::{Errno, Result};
use crate::sched::thread::RawBuf;
use crate::sched::waitq::{WaitObject, WaitQueue, WakeReason};
use crate::sched::{Kernel, blockable, commit_park, kernel, prepare_park, unpark};
use crate::util::{ObjName, obj_name};

pub(crate) struct PoolObj {
    pub name: ObjName,
    block_size: usize,
    capacity: usize,
    buf: RawBuf,
    free: Vec<u16>,
    pub waiters: WaitQueue,
}

impl PoolObj {
    fn block_ptr(&self, slot: u16) -> NonNull<u8> {
        // Slot index is bounded by capacity at carve time.
        unsafe { NonNull::new_unchecked(self.buf.ptr.as_ptr().add(slot as usize * self.block_size)) }
    }

    /// Reverse-map a block pointer to its slot.
    fn slot_of(&self, ptr: NonNull<u8>) -> Option<u16> {
        let base = self.buf.ptr.as_ptr() as usize;
        let addr = ptr.as_ptr() as usize;
        if addr < base || addr >= base + self.capacity * self.block_size {
            return None;
        }
        let offset = addr - base;
        if offset % self.block_size != 0 {
            return None;
        }
        Some((offset / self.block_size) as u16)
    }
}

/// Memory pool handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryPool {
    id: usize,
}

impl MemoryPool {
    /// Carve `capacity` blocks of `block_size` bytes.
    pub fn create(name: &str, capacity: usize, block_size: usize) -> Result<MemoryPool> {
        kernel()
            .pool_create(name, capacity, block_size)
            .map(|id| MemoryPool { id })
    }

    /// Take a block, waiting for one if the pool is empty.
    pub fn alloc(&self) -> Result<NonNull<u8>> {
        kernel().pool_alloc(self.id, Deadline::Never)
    }

    pub fn try_alloc(&self) -> Result<NonNull<u8>> {
        kernel().pool_alloc(self.id, Deadline::Poll)
    }

    pub fn timed_alloc(&self, ticks: u64) -> Result<NonNull<u8>> {
        kernel().pool_alloc(self.id, Deadline::Ticks(ticks))
    }

    /// Return a block obtained from this pool.
    pub fn free(&self, block: NonNull<u8>) -> Result<()> {
        kernel().pool_free(self.id, block)
    }

    /// Free blocks currently available.
    pub fn available(&self) -> Result<usize> {
        kernel().pool_available(self.id)
    }

    /// Destroy the pool. Outstanding blocks become invalid; blocked
    /// allocators fail with `Destroyed`.
    pub fn destroy(&self) -> Result<()> {
        kernel().pool_destroy(self.id)
    }
}

impl Kernel {
    pub(crate) fn pool_create(&self, name: &str, capacity: usize, block_size: usize) -> Result<usize> {
        if capacity == 0 || capacity > u16::MAX as usize || block_size == 0 {
            return Err(Errno::InvalidArgument);
        }
        let buf = crate::mem::rtos_allocate(capacity * block_size, 8)?;
        self.with_core(|c| {
            let id = c.mempools.insert(PoolObj {
                name: obj_name(name),
                block_size,
                capacity,
                buf: RawBuf {
                    ptr: buf,
                    len: capacity * block_size,
                },
                free: (0..capacity as u16).rev().collect(),
                waiters: WaitQueue::new(),
            });
            log::debug!(
                "memory pool {} '{}' created, {} x {} bytes",
                id,
                name,
                capacity,
                block_size
            );
            Ok(id)
        })
    }

    pub(crate) fn pool_alloc(&self, id: usize, deadline: Deadline) -> Result<NonNull<u8>> {
        let in_isr = self.port().in_isr();
        let deadline = self.pin_deadline(deadline);
        loop {
            let parked = self.with_core(|c| {
                let pool = c.mempools.get_mut(id).ok_or(Errno::InvalidArgument)?;
                if let Some(slot) = pool.free.pop() {
                    return Ok(Err(pool.block_ptr(slot)));
                }
                let expiry = blockable(c, deadline)?;
                let (me, priority, seq) = prepare_park(c, in_isr)?;
                let pool = c.mempools.get_mut(id).ok_or(Errno::InvalidArgument)?;
                pool.waiters.insert(me, priority, seq);
                commit_park(c, me, WaitObject::MemPool(id), expiry);
                Ok(Ok(me))
            })?;

            match parked {
                Err(block) => return Ok(block),
                Ok(me) => match self.wait_for_wake(me) {
                    WakeReason::Signalled => continue,
                    WakeReason::Timeout => return Err(Errno::Timeout),
                    WakeReason::Interrupted => return Err(Errno::Interrupted),
                    WakeReason::Destroyed => return Err(Errno::Destroyed),
                },
            }
        }
    }

    pub(crate) fn pool_free(&self, id: usize, block: NonNull<u8>) -> Result<()> {
        self.with_core(|c| {
            let pool = c.mempools.get_mut(id).ok_or(Errno::InvalidArgument)?;
            let slot = pool.slot_of(block).ok_or(Errno::InvalidArgument)?;
            if pool.free.contains(&slot) {
                return Err(Errno::InvalidState);
            }
            pool.free.push(slot);
            if let Some(waiter) = pool.waiters.pop_head() {
                unpark(c, waiter, WakeReason::Signalled);
            }
            Ok(())
        })?;
        self.maybe_switch();
        Ok(())
    }

    pub(crate) fn pool_available(&self, id: usize) -> Result<usize> {
        self.with_core(|c| {
            Ok(c.mempools
                .get(id)
                .ok_or(Errno::InvalidArgument)?
                .free
                .len())
        })
    }

    pub(crate) fn pool_destroy(&self, id: usize) -> Result<()> {
        self.with_core(|c| {
            let mut pool = c.mempools.remove(id).ok_or(Errno::InvalidArgument)?;
            for waiter in pool.waiters.drain() {
                unpark(c, waiter, WakeReason::Destroyed);
            }
            crate::mem::rtos_deallocate(pool.buf.ptr, pool.buf.len, 8);
            log::debug!("memory pool {} '{}' destroyed", id, pool.name.as_str());
            Ok(())
        })?;
        self.maybe_switch();
        Ok(())
    }
}
