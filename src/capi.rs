/*
 * C Facade
 *
 * A flat, handle-based surface over the kernel for C callers and for
 * port glue written in C. Handles are the kernel's raw object ids
 * (never zero); every function returns 0 on success or the negative
 * code of the corresponding kernel error. Raw POSIX symbol names are
 * deliberately not emitted here so the facade can coexist with a hosted
 * C library; the port's newlib glue owns those aliases.
 */

use alloc::vec::Vec;
use core::ffi::{CStr, c_char};

use lazy_static::lazy_static;
use spin::Mutex as SpinMutex;

use crate::clock::Deadline;
use crate::errno::{Errno, Result};
use crate::sched::thread::{Priority, ThreadId};
use crate::sched::kernel;
use crate::sync::eventflags::FlagsMode;

fn code(result: Result<()>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(e) => e.as_code(),
    }
}

fn name_from(ptr: *const c_char) -> &'static str {
    if ptr.is_null() {
        return "";
    }
    // Caller contract: a valid NUL-terminated string.
    unsafe { CStr::from_ptr(ptr) }.to_str().unwrap_or("")
}

// ============================================================================
// Scheduler and threads
// ============================================================================

/// Entries registered through the C facade, bridged into the kernel's
/// native entry signature by `c_entry_trampoline`.
type CEntry = extern "C" fn(usize);

lazy_static! {
    static ref C_ENTRIES: SpinMutex<Vec<(CEntry, usize)>> = SpinMutex::new(Vec::new());
}

fn c_entry_trampoline(index: usize) {
    let entry = C_ENTRIES.lock().get(index).copied();
    if let Some((entry, arg)) = entry {
        entry(arg);
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn os_sched_yield() {
    crate::sched::yield_now();
}

#[unsafe(no_mangle)]
pub extern "C" fn os_sched_lock() {
    crate::sched::lock();
}

#[unsafe(no_mangle)]
pub extern "C" fn os_sched_unlock() {
    crate::sched::unlock();
}

#[unsafe(no_mangle)]
pub extern "C" fn os_clock_now() -> u64 {
    kernel().now()
}

#[unsafe(no_mangle)]
pub extern "C" fn os_sleep_for(ticks: u64) -> i32 {
    code(kernel().sleep_until_deadline(Deadline::Ticks(ticks)))
}

#[unsafe(no_mangle)]
pub extern "C" fn os_thread_create(
    name: *const c_char,
    priority: u8,
    entry: CEntry,
    arg: usize,
    stack_size: usize,
) -> usize {
    let index = {
        let mut entries = C_ENTRIES.lock();
        entries.push((entry, arg));
        entries.len() - 1
    };
    let stack = if stack_size == 0 {
        None
    } else {
        Some(stack_size)
    };
    kernel()
        .thread_create(
            name_from(name),
            Priority(priority),
            c_entry_trampoline,
            index,
            stack,
        )
        .map(|id| id.0)
        .unwrap_or(0)
}

#[unsafe(no_mangle)]
pub extern "C" fn os_thread_join(thread: usize, exit_code: *mut i32) -> i32 {
    match kernel().thread_join(ThreadId(thread)) {
        Ok(value) => {
            if !exit_code.is_null() {
                unsafe {
                    *exit_code = value;
                }
            }
            0
        }
        Err(e) => e.as_code(),
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn os_thread_exit(code_value: i32) -> ! {
    crate::this_thread::exit(code_value)
}

#[unsafe(no_mangle)]
pub extern "C" fn os_thread_interrupt(thread: usize) -> i32 {
    code(kernel().thread_interrupt(ThreadId(thread)))
}

#[unsafe(no_mangle)]
pub extern "C" fn os_thread_suspend(thread: usize) -> i32 {
    code(kernel().thread_suspend(ThreadId(thread)))
}

#[unsafe(no_mangle)]
pub extern "C" fn os_thread_resume(thread: usize) -> i32 {
    code(kernel().thread_resume(ThreadId(thread)))
}

#[unsafe(no_mangle)]
pub extern "C" fn os_thread_set_priority(thread: usize, priority: u8) -> i32 {
    code(kernel().thread_set_priority(ThreadId(thread), Priority(priority)))
}

// ============================================================================
// Semaphore
// ============================================================================

#[unsafe(no_mangle)]
pub extern "C" fn os_sem_create(name: *const c_char, initial: u32, max: u32) -> usize {
    kernel().sem_create(name_from(name), initial, max).unwrap_or(0)
}

#[unsafe(no_mangle)]
pub extern "C" fn os_sem_post(sem: usize) -> i32 {
    code(kernel().sem_post(sem))
}

#[unsafe(no_mangle)]
pub extern "C" fn os_sem_wait(sem: usize) -> i32 {
    code(kernel().sem_wait(sem, Deadline::Never))
}

#[unsafe(no_mangle)]
pub extern "C" fn os_sem_trywait(sem: usize) -> i32 {
    code(kernel().sem_wait(sem, Deadline::Poll))
}

#[unsafe(no_mangle)]
pub extern "C" fn os_sem_timedwait(sem: usize, ticks: u64) -> i32 {
    code(kernel().sem_wait(sem, Deadline::Ticks(ticks)))
}

#[unsafe(no_mangle)]
pub extern "C" fn os_sem_destroy(sem: usize) -> i32 {
    code(kernel().sem_destroy(sem))
}

// ============================================================================
// Mutex
// ============================================================================

#[unsafe(no_mangle)]
pub extern "C" fn os_mutex_create(name: *const c_char) -> usize {
    kernel()
        .mutex_create(name_from(name), crate::sync::MutexAttributes::default())
        .unwrap_or(0)
}

#[unsafe(no_mangle)]
pub extern "C" fn os_mutex_lock(mutex: usize) -> i32 {
    code(kernel().mutex_lock(mutex, Deadline::Never))
}

#[unsafe(no_mangle)]
pub extern "C" fn os_mutex_trylock(mutex: usize) -> i32 {
    code(kernel().mutex_lock(mutex, Deadline::Poll))
}

#[unsafe(no_mangle)]
pub extern "C" fn os_mutex_timedlock(mutex: usize, ticks: u64) -> i32 {
    code(kernel().mutex_lock(mutex, Deadline::Ticks(ticks)))
}

#[unsafe(no_mangle)]
pub extern "C" fn os_mutex_unlock(mutex: usize) -> i32 {
    code(kernel().mutex_unlock(mutex))
}

#[unsafe(no_mangle)]
pub extern "C" fn os_mutex_consistent(mutex: usize) -> i32 {
    code(kernel().mutex_consistent(mutex))
}

#[unsafe(no_mangle)]
pub extern "C" fn os_mutex_destroy(mutex: usize) -> i32 {
    code(kernel().mutex_destroy(mutex))
}

// ============================================================================
// Message queue
// ============================================================================

#[unsafe(no_mangle)]
pub extern "C" fn os_mq_create(name: *const c_char, capacity: usize, msg_size: usize) -> usize {
    kernel()
        .mq_create(name_from(name), capacity, msg_size)
        .unwrap_or(0)
}

#[unsafe(no_mangle)]
pub extern "C" fn os_mq_send(mq: usize, msg: *const u8, len: usize, priority: u8) -> i32 {
    if msg.is_null() {
        return Errno::InvalidArgument.as_code();
    }
    let data = unsafe { core::slice::from_raw_parts(msg, len) };
    code(kernel().mq_send(mq, data, priority, Deadline::Never))
}

#[unsafe(no_mangle)]
pub extern "C" fn os_mq_receive(
    mq: usize,
    buf: *mut u8,
    buf_len: usize,
    priority: *mut u8,
) -> isize {
    if buf.is_null() {
        return Errno::InvalidArgument.as_code() as isize;
    }
    let out = unsafe { core::slice::from_raw_parts_mut(buf, buf_len) };
    match kernel().mq_receive(mq, out, Deadline::Never) {
        Ok((len, prio)) => {
            if !priority.is_null() {
                unsafe {
                    *priority = prio;
                }
            }
            len as isize
        }
        Err(e) => e.as_code() as isize,
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn os_mq_destroy(mq: usize) -> i32 {
    code(kernel().mq_destroy(mq))
}

// ============================================================================
// Event flags
// ============================================================================

#[unsafe(no_mangle)]
pub extern "C" fn os_evflags_create(name: *const c_char) -> usize {
    kernel().ev_create(name_from(name)).unwrap_or(0)
}

#[unsafe(no_mangle)]
pub extern "C" fn os_evflags_raise(ev: usize, mask: u32) -> i32 {
    match kernel().ev_raise(ev, mask) {
        Ok(_) => 0,
        Err(e) => e.as_code(),
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn os_evflags_wait(ev: usize, mask: u32, mode: u32) -> i32 {
    let mode = FlagsMode::from_bits_truncate(mode);
    match kernel().ev_wait(ev, mask, mode, Deadline::Never) {
        Ok(matched) => matched as i32,
        Err(e) => e.as_code(),
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn os_evflags_destroy(ev: usize) -> i32 {
    code(kernel().ev_destroy(ev))
}
