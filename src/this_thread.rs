/*
 * Operations on the calling thread.
 */

use crate::clock::Deadline;
use crate::errno::Result;
use crate::sched::thread::ThreadId;
use crate::sched::kernel;
use crate::sync::eventflags::FlagsMode;

/// Id of the calling thread.
pub fn id() -> Option<ThreadId> {
    kernel().current()
}

/// Give the processor to the next ready thread of the same priority.
pub fn yield_now() {
    kernel().yield_now();
}

/// Suspend the calling thread for `ticks`.
pub fn sleep_for(ticks: u64) -> Result<()> {
    kernel().sleep_until_deadline(Deadline::Ticks(ticks))
}

/// Suspend the calling thread until the absolute tick `at`.
pub fn sleep_until(at: u64) -> Result<()> {
    kernel().sleep_until_deadline(Deadline::At(at))
}

/// Terminate the calling thread with an exit code. Entry functions that
/// return fall into this with code 0 (the port's initial frame routes
/// the return path here).
pub fn exit(code: i32) -> ! {
    kernel().thread_exit(code);
    // Terminated threads are never picked again; spin until the switch
    // exception takes this stack away.
    loop {
        kernel().port().context_switch_request();
    }
}

/// Wait on the calling thread's private flags word; returns the matched
/// bits.
pub fn flags_wait(mask: u32, mode: FlagsMode) -> Result<u32> {
    kernel().thread_flags_wait(mask, mode, Deadline::Never)
}

pub fn flags_try_wait(mask: u32, mode: FlagsMode) -> Result<u32> {
    kernel().thread_flags_wait(mask, mode, Deadline::Poll)
}

pub fn flags_timed_wait(mask: u32, mode: FlagsMode, ticks: u64) -> Result<u32> {
    kernel().thread_flags_wait(mask, mode, Deadline::Ticks(ticks))
}

/// Read (and optionally clear) the calling thread's flags word without
/// blocking.
pub fn flags_get(mask: u32, clear: bool) -> Result<u32> {
    kernel().thread_flags_get(mask, clear)
}

/// Per-thread user storage slot.
pub fn set_user_storage(value: usize) -> Result<()> {
    kernel().user_storage_set(value)
}

pub fn user_storage() -> Result<usize> {
    kernel().user_storage_get()
}
