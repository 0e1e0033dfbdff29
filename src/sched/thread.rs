/*
 * Thread Records and the Public Thread Handle
 *
 * Threads are records in the kernel registry, addressed by a stable
 * `ThreadId`. The record embeds everything the scheduler and the wait
 * machinery need: the lifecycle state, the priority pair, the wait
 * linkage, the joiner queue and the thread's private flags word. The
 * states `undefined` (before construction) and `destroyed` (after the
 * record is reclaimed) exist only outside the registry.
 */

use alloc::vec::Vec;
use core::fmt;
use core::ptr::NonNull;

use crate::config::PRIORITY_LEVELS;
use crate::errno::Result;
use crate::port::ContextRef;
use crate::sched::waitq::{WaitObject, WaitQueue, WakeReason};
use crate::util::ObjName;

/// Thread identifier. Never zero; never recycled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub usize);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Thread({})", self.0)
    }
}

/// Thread lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Ready,
    Running,
    Suspended,
    Blocked,
    Terminated,
}

/// Scheduling priority, 0 (lowest) to 31 (highest). The two extremes
/// are reserved: level 31 for interrupt-origin work, level 0 for the
/// kernel's idle thread when it is configured to run below
/// `Priority::IDLE`. Applications assign 1..=30.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(pub u8);

impl Priority {
    /// The reserved sub-idle level; never accepted from applications.
    pub const NONE: Priority = Priority(0);
    pub const IDLE: Priority = Priority(1);
    pub const LOW: Priority = Priority(4);
    pub const BELOW_NORMAL: Priority = Priority(8);
    pub const NORMAL: Priority = Priority(12);
    pub const ABOVE_NORMAL: Priority = Priority(16);
    pub const HIGH: Priority = Priority(20);
    pub const REALTIME: Priority = Priority(24);
    pub const MAX: Priority = Priority(PRIORITY_LEVELS as u8 - 2);
    pub const ISR: Priority = Priority(PRIORITY_LEVELS as u8 - 1);

    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// Valid range for an application thread.
    pub fn is_assignable(self) -> bool {
        self < Priority::ISR
    }
}

/// Thread entry point. The argument is the one passed at spawn.
pub type ThreadEntry = fn(usize);

/// Heap buffer obtained from a memory resource; freed manually when the
/// record is reclaimed.
pub(crate) struct RawBuf {
    pub ptr: NonNull<u8>,
    pub len: usize,
}

unsafe impl Send for RawBuf {}

/// Pending wait for a flags word (event flags or the thread's own flags).
#[derive(Debug, Clone, Copy)]
pub(crate) struct FlagsWait {
    pub mask: u32,
    pub mode: crate::sync::eventflags::FlagsMode,
}

/// The thread control record.
pub(crate) struct Tcb {
    pub name: ObjName,
    pub state: ThreadState,

    /// Priority pair: `effective` is the one scheduling uses and is never
    /// below `assigned`; they differ only while priority inheritance or a
    /// ceiling protocol is engaged.
    pub assigned_priority: Priority,
    pub effective_priority: Priority,

    /// Stack descriptor. `None` for the main thread, whose stack predates
    /// the kernel.
    pub stack: Option<RawBuf>,
    pub context: ContextRef,

    /// What the thread is blocked on, if anything, plus the reason stamped
    /// by whoever woke it.
    pub wait: Option<WaitObject>,
    pub wake_reason: Option<WakeReason>,
    /// Sequence of the armed timeout entry, for disarming on early wake.
    pub timeout_seq: Option<u64>,

    /// Armed flags predicate while blocked on event flags or thread flags.
    pub flags_wait: Option<FlagsWait>,
    /// Matched bits delivered by the waker.
    pub flags_result: u32,
    /// The thread's own event flags word.
    pub flags_word: u32,

    /// Set by `interrupt` while the thread is not blocked; consumed at the
    /// next suspension point.
    pub interrupt_pending: bool,

    pub detached: bool,
    pub exit_code: Option<i32>,
    /// Threads blocked in `join` on this thread.
    pub joiners: WaitQueue,
    /// Joiners woken by termination that have not yet read the exit code;
    /// the record is reclaimed when this drains to zero.
    pub pending_joins: usize,

    /// Mutexes currently owned, for effective-priority recomputation and
    /// for robust-mutex cleanup at termination.
    pub owned_mutexes: Vec<usize>,

    /// Per-thread user storage slot.
    pub user_storage: usize,

    /// Statistics, gated by configuration.
    pub run_ticks: u64,
    pub switches: u64,
}

impl Tcb {
    pub fn new(name: ObjName, priority: Priority) -> Self {
        Self {
            name,
            state: ThreadState::Ready,
            assigned_priority: priority,
            effective_priority: priority,
            stack: None,
            context: 0,
            wait: None,
            wake_reason: None,
            timeout_seq: None,
            flags_wait: None,
            flags_result: 0,
            flags_word: 0,
            interrupt_pending: false,
            detached: false,
            exit_code: None,
            joiners: WaitQueue::new(),
            pending_joins: 0,
            owned_mutexes: Vec::new(),
            user_storage: 0,
            run_ticks: 0,
            switches: 0,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.state != ThreadState::Terminated
    }
}

/// Snapshot of one thread for diagnostics.
#[derive(Debug, Clone)]
pub struct ThreadStats {
    pub id: ThreadId,
    pub name: ObjName,
    pub state: ThreadState,
    pub assigned_priority: Priority,
    pub effective_priority: Priority,
    pub run_ticks: u64,
    pub switches: u64,
}

/// Public thread handle.
///
/// Spawning registers the record, allocates the stack through the RTOS
/// memory resource and builds the initial context through the port. The
/// record is reclaimed after the thread terminated and the last joiner
/// read its exit code, or immediately at termination for detached
/// threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thread {
    pub(crate) id: ThreadId,
}

impl Thread {
    /// Create a thread with the default stack size.
    pub fn spawn(name: &str, priority: Priority, entry: ThreadEntry, arg: usize) -> Result<Thread> {
        crate::sched::kernel()
            .thread_create(name, priority, entry, arg, None)
            .map(|id| Thread { id })
    }

    /// Create a thread with an explicit stack size.
    pub fn spawn_with_stack(
        name: &str,
        priority: Priority,
        entry: ThreadEntry,
        arg: usize,
        stack_size: usize,
    ) -> Result<Thread> {
        crate::sched::kernel()
            .thread_create(name, priority, entry, arg, Some(stack_size))
            .map(|id| Thread { id })
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    /// Block until the thread terminates and return its exit code.
    pub fn join(&self) -> Result<i32> {
        crate::sched::kernel().thread_join(self.id)
    }

    /// Mark the thread for automatic reclaim at termination.
    pub fn detach(&self) -> Result<()> {
        crate::sched::kernel().thread_detach(self.id)
    }

    /// Interrupt a pending blocking call, or arm interruption for the
    /// next one if the thread is not currently blocked.
    pub fn interrupt(&self) -> Result<()> {
        crate::sched::kernel().thread_interrupt(self.id)
    }

    pub fn suspend(&self) -> Result<()> {
        crate::sched::kernel().thread_suspend(self.id)
    }

    pub fn resume(&self) -> Result<()> {
        crate::sched::kernel().thread_resume(self.id)
    }

    /// Forcefully terminate the thread.
    pub fn terminate(&self) -> Result<()> {
        crate::sched::kernel().thread_terminate(self.id, -1)
    }

    /// Change the assigned priority; the effective priority follows unless
    /// inheritance keeps it higher.
    pub fn set_priority(&self, priority: Priority) -> Result<()> {
        crate::sched::kernel().thread_set_priority(self.id, priority)
    }

    /// Raise bits in the thread's private flags word, waking it when its
    /// armed predicate becomes satisfied. Callable from interrupt context.
    pub fn flags_raise(&self, mask: u32) -> Result<u32> {
        crate::sched::kernel().thread_flags_raise(self.id, mask)
    }

    pub fn stats(&self) -> Result<ThreadStats> {
        crate::sched::kernel().thread_stats(self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_ordering_matches_levels() {
        assert!(Priority::IDLE < Priority::NORMAL);
        assert!(Priority::NORMAL < Priority::HIGH);
        assert!(Priority::MAX < Priority::ISR);
        assert!(Priority::MAX.is_assignable());
        assert!(!Priority::ISR.is_assignable());
    }
}
