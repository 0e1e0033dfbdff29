/*
 * Scheduler Core
 *
 * Owns the thread registry, the ready queue, the clock and every
 * primitive's record. All of it sits behind one lock taken inside an
 * interrupt-critical section, so thread context and ISRs see a
 * consistent kernel.
 *
 * Context switches are decided here but performed by the port: the
 * kernel marks `need_resched`, asks the port to pend its switch
 * exception, and the exception calls back into `switch_context` for the
 * actual bookkeeping. Blocking primitives follow one protocol:
 *
 * 1. take the core, re-check the guard condition;
 * 2. enqueue the current thread on the primitive's wait queue, arm the
 *    timeout, mark it blocked;
 * 3. release the core and request a switch;
 * 4. on wake, consume the reason stamped by the waker and map it to the
 *    operation's result.
 */

pub mod readyq;
pub mod thread;
pub mod waitq;

use alloc::vec::Vec;

use lazy_static::lazy_static;
use spin::{Mutex, Once};

use crate::clock::{Deadline, Expiry, TimeoutQueue, TimeoutTarget};
use crate::config::Config;
use crate::errno::{Errno, Result};
use crate::kassert;
use crate::port::{ContextRef, IrqState, Port};
use crate::registry::Registry;
use crate::sched::readyq::ReadyQueue;
use crate::sched::thread::{RawBuf, Tcb, ThreadEntry};
use crate::sched::waitq::{WaitObject, WakeReason};
use crate::sync::condvar::CondvarObj;
use crate::sync::eventflags::EventFlagsObj;
use crate::sync::mempool::PoolObj;
use crate::sync::mqueue::MqObj;
use crate::sync::mutex::MutexObj;
use crate::sync::semaphore::SemObj;
use crate::sync::timer::TimerObj;
use crate::util::{ObjName, obj_name};

/// Everything the kernel owns, guarded by one lock.
pub(crate) struct Core {
    pub config: Config,
    pub started: bool,

    /// Preemption flag: when false, wakeups of higher-priority threads
    /// only record `need_resched`; the switch waits for the flag to come
    /// back on or for an explicit yield.
    pub preemptive: bool,
    /// Scheduler-lock nesting. While non-zero, interrupts run but no
    /// context switch is issued.
    pub lock_nest: u32,
    pub need_resched: bool,

    pub current: Option<ThreadId>,
    pub ready: ReadyQueue,
    pub threads: Registry<Tcb>,

    pub ticks: u64,
    pub timeouts: TimeoutQueue,
    /// Source for wait-queue FIFO tiebreaks.
    pub wait_seq: u64,

    pub semaphores: Registry<SemObj>,
    pub mutexes: Registry<MutexObj>,
    pub condvars: Registry<CondvarObj>,
    pub eventflags: Registry<EventFlagsObj>,
    pub mqueues: Registry<MqObj>,
    pub mempools: Registry<PoolObj>,
    pub timers: Registry<TimerObj>,

    /// Timers that expired with thread-context dispatch, waiting for the
    /// timer service thread.
    pub timer_fired: Vec<usize>,
    pub timer_thread: Option<ThreadId>,
    pub idle_thread: Option<ThreadId>,

    pub context_switches: u64,
}

impl Core {
    fn new() -> Self {
        Self {
            config: Config::default(),
            started: false,
            preemptive: true,
            lock_nest: 0,
            need_resched: false,
            current: None,
            ready: ReadyQueue::new(),
            threads: Registry::new(),
            ticks: 0,
            timeouts: TimeoutQueue::new(),
            wait_seq: 0,
            semaphores: Registry::new(),
            mutexes: Registry::new(),
            condvars: Registry::new(),
            eventflags: Registry::new(),
            mqueues: Registry::new(),
            mempools: Registry::new(),
            timers: Registry::new(),
            timer_fired: Vec::new(),
            timer_thread: None,
            idle_thread: None,
            context_switches: 0,
        }
    }

    pub fn current_tcb(&self) -> Option<&Tcb> {
        self.current.and_then(|id| self.threads.get(id.0))
    }

    pub fn next_wait_seq(&mut self) -> u64 {
        self.wait_seq += 1;
        self.wait_seq
    }
}

pub struct Kernel {
    core: Mutex<Core>,
    port: Once<&'static dyn Port>,
}

lazy_static! {
    static ref KERNEL: Kernel = Kernel::new();
}

/// The process-wide kernel instance.
pub(crate) fn kernel() -> &'static Kernel {
    &KERNEL
}

// ============================================================================
// Core access and the switch protocol
// ============================================================================

impl Kernel {
    pub(crate) fn new() -> Self {
        Self {
            core: Mutex::new(Core::new()),
            port: Once::new(),
        }
    }

    /// Install the port, select the memory resources and capture the
    /// configuration. Must run before any other kernel call.
    pub fn init(&self, config: Config, port: &'static dyn Port) {
        self.port.call_once(|| port);
        crate::mem::init(&config);
        let mut core = self.core.lock();
        core.preemptive = config.scheduler_preemptive;
        core.config = config;
        log::info!("kernel configured, tick {} Hz", core.config.systick_frequency_hz);
    }

    pub(crate) fn port(&self) -> &'static dyn Port {
        *self.port.get().expect("kernel not initialized")
    }

    /// Run `f` with the core locked, inside an interrupt-critical
    /// section.
    pub(crate) fn with_core<R>(&self, f: impl FnOnce(&mut Core) -> R) -> R {
        let port = self.port.get().copied();
        let irq: Option<IrqState> = port.map(|p| p.irq_critical_enter());
        let result = {
            let mut core = self.core.lock();
            f(&mut core)
        };
        if let (Some(p), Some(state)) = (port, irq) {
            p.irq_critical_exit(state);
        }
        result
    }

    /// Register the service threads, start the tick source and hand the
    /// calling context to the scheduler as the main thread.
    pub fn start(&self) -> Result<ThreadId> {
        let main_id = self.with_core(|c| {
            kassert!(!c.started);
            let mut tcb = Tcb::new(obj_name("main"), Priority::NORMAL);
            tcb.state = ThreadState::Running;
            let id = ThreadId(c.threads.insert(tcb));
            c.current = Some(id);
            c.started = true;
            id
        });

        // With the below-idle option, the idle thread takes the reserved
        // sub-idle level so application threads at `Priority::IDLE`
        // still preempt it. Only this create path may use that level.
        let idle_priority = self.with_core(|c| {
            if c.config.idle_priority_below_idle {
                Priority::NONE
            } else {
                Priority::IDLE
            }
        });
        let idle_stack = self.with_core(|c| c.config.idle_stack_size);
        let idle = self.create_thread("idle", idle_priority, idle_main, 0, Some(idle_stack))?;
        self.with_core(|c| c.idle_thread = Some(idle));

        let timer_enabled = self.with_core(|c| c.config.timer_thread_enabled);
        if timer_enabled {
            let timer_stack = self.with_core(|c| c.config.timer_stack_size);
            let timer = self.thread_create("timer", Priority::HIGH, timer_main, 0, Some(timer_stack))?;
            self.with_core(|c| c.timer_thread = Some(timer));
        }

        let hz = self.with_core(|c| c.config.systick_frequency_hz);
        self.port().tick_source_start(hz);
        log::info!("scheduler started, main thread {}", main_id);
        Ok(main_id)
    }

    /// Ask the port for a switch if one is due and allowed right now.
    pub(crate) fn maybe_switch(&self) {
        let due = self.with_core(|c| {
            c.started && c.need_resched && c.preemptive && c.lock_nest == 0
        });
        if due && !self.port().in_isr() {
            self.port().context_switch_request();
        }
    }

    /// The switch exception's entry point: move the previous thread back
    /// to its ready tail if it still runs, pick the highest-priority
    /// ready thread, update statistics. Returns the pair the port must
    /// swap registers for, or `None` when no swap is needed.
    pub fn switch_context(&self) -> Option<(Option<ThreadId>, ThreadId)> {
        self.with_core(|c| {
            if !c.started || c.lock_nest > 0 {
                return None;
            }
            c.need_resched = false;

            let prev = c.current;
            let mut reap_prev = false;
            if let Some(p) = prev {
                if let Some(t) = c.threads.get_mut(p.0) {
                    match t.state {
                        ThreadState::Running => {
                            t.state = ThreadState::Ready;
                            let eff = t.effective_priority;
                            c.ready.push_back(eff, p);
                        }
                        ThreadState::Terminated => {
                            reap_prev = t.detached && t.pending_joins == 0;
                        }
                        _ => {}
                    }
                }
            }

            let next = match c.ready.pop_highest() {
                Some(n) => n,
                None => {
                    c.current = None;
                    return None;
                }
            };
            if let Some(t) = c.threads.get_mut(next.0) {
                t.state = ThreadState::Running;
            }
            c.current = Some(next);

            if prev == Some(next) {
                return None;
            }
            if reap_prev {
                if let Some(p) = prev {
                    reap(c, p);
                }
            }
            c.context_switches += 1;
            if c.config.statistics_context_switches {
                if let Some(t) = c.threads.get_mut(next.0) {
                    t.switches += 1;
                }
            }
            Some((prev, next))
        })
    }

    /// The tick interrupt's entry point. Advances the clock, delivers
    /// expired timeouts and timers, applies round-robin at equal
    /// priority. Returns true when the port should pend a switch.
    pub fn tick(&self) -> bool {
        let (callbacks, reschedule) = self.with_core(|c| {
            c.ticks += 1;
            if c.config.statistics_thread_cpu {
                if let Some(cur) = c.current {
                    if let Some(t) = c.threads.get_mut(cur.0) {
                        t.run_ticks += 1;
                    }
                }
            }

            let due = c.timeouts.pop_due(c.ticks);
            let mut isr_callbacks: Vec<(fn(usize), usize)> = Vec::new();
            for entry in due {
                match entry.target {
                    TimeoutTarget::Thread(tid) => {
                        cancel_wait(c, tid);
                        unpark(c, tid, WakeReason::Timeout);
                    }
                    TimeoutTarget::Timer(id) => {
                        crate::sync::timer::fire(c, id, &mut isr_callbacks);
                    }
                }
            }

            // Round-robin: an equal-priority peer on the ready queue takes
            // over at the next tick boundary.
            let cur_eff = c.current_tcb().map(|t| t.effective_priority);
            if let (Some(eff), Some(highest)) = (cur_eff, c.ready.highest()) {
                if highest >= eff {
                    c.need_resched = true;
                }
            }

            let reschedule = c.need_resched && c.preemptive && c.lock_nest == 0 && c.started;
            (isr_callbacks, reschedule)
        });

        // Timer callbacks with ISR dispatch run here, outside the core
        // lock, still in interrupt context.
        for (callback, arg) in callbacks {
            callback(arg);
        }
        reschedule
    }

    pub fn now(&self) -> u64 {
        self.with_core(|c| c.ticks)
    }

    pub fn tick_frequency(&self) -> u32 {
        self.with_core(|c| c.config.systick_frequency_hz)
    }

    /// Park the calling thread until a waker stamps a reason. Also the
    /// spin point for ports whose switch exception is deferred.
    pub(crate) fn wait_for_wake(&self, me: ThreadId) -> WakeReason {
        loop {
            self.port().context_switch_request();
            let reason = self.with_core(|c| {
                c.threads
                    .get_mut(me.0)
                    .and_then(|t| t.wake_reason.take())
            });
            if let Some(reason) = reason {
                return reason;
            }
        }
    }

    /// Current thread id, if the scheduler runs.
    pub fn current(&self) -> Option<ThreadId> {
        self.with_core(|c| c.current)
    }

    /// Saved frame handle of a thread, for the port's switch exception.
    pub fn thread_context(&self, tid: ThreadId) -> Option<ContextRef> {
        self.with_core(|c| c.threads.get(tid.0).map(|t| t.context))
    }

    /// Store the frame handle the port just saved for a thread.
    pub fn set_thread_context(&self, tid: ThreadId, context: ContextRef) {
        self.with_core(|c| {
            if let Some(t) = c.threads.get_mut(tid.0) {
                t.context = context;
            }
        });
    }

    /// Earliest armed deadline, if any. A tickless port can use this to
    /// program its next wakeup.
    pub fn next_deadline(&self) -> Option<u64> {
        self.with_core(|c| c.timeouts.next_due())
    }
}

// ============================================================================
// Park / unpark
// ============================================================================

/// Resolve a deadline against the clock; refuses to park for try-calls
/// and already-expired deadlines.
pub(crate) fn blockable(c: &Core, deadline: Deadline) -> Result<Expiry> {
    match deadline.resolve(c.ticks) {
        Expiry::Try => Err(Errno::WouldBlock),
        Expiry::Until(at) if at <= c.ticks => Err(Errno::Timeout),
        expiry => Ok(expiry),
    }
}

/// First phase of parking: contract checks and pending-interrupt
/// consumption. Returns the (priority, sequence) pair the caller inserts
/// into its wait queue.
pub(crate) fn prepare_park(c: &mut Core, in_isr: bool) -> Result<(ThreadId, Priority, u64)> {
    kassert!(!in_isr, "blocking call from interrupt context");
    kassert!(c.lock_nest == 0, "blocking call under scheduler lock");
    kassert!(c.started);
    let tid = c.current.expect("no current thread");
    let seq = c.next_wait_seq();
    let t = c.threads.get_mut(tid.0).expect("current thread has no record");
    if t.interrupt_pending {
        t.interrupt_pending = false;
        return Err(Errno::Interrupted);
    }
    Ok((tid, t.effective_priority, seq))
}

/// Second phase: mark the thread blocked and arm its timeout. The caller
/// already queued it on the primitive.
pub(crate) fn commit_park(c: &mut Core, tid: ThreadId, object: WaitObject, expiry: Expiry) {
    if let Expiry::Until(at) = expiry {
        let seq = c.timeouts.arm(at, TimeoutTarget::Thread(tid));
        if let Some(t) = c.threads.get_mut(tid.0) {
            t.timeout_seq = Some(seq);
        }
    }
    if let Some(t) = c.threads.get_mut(tid.0) {
        t.state = ThreadState::Blocked;
        t.wait = Some(object);
        t.wake_reason = None;
    }
    c.need_resched = true;
}

/// Make a blocked thread ready and stamp its wake reason. The caller has
/// already removed it from the primitive's wait queue.
pub(crate) fn unpark(c: &mut Core, tid: ThreadId, reason: WakeReason) {
    let Some(t) = c.threads.get_mut(tid.0) else {
        return;
    };
    if t.state != ThreadState::Blocked {
        return;
    }
    if let Some(seq) = t.timeout_seq.take() {
        c.timeouts.cancel(seq);
    }
    let t = c.threads.get_mut(tid.0).expect("checked above");
    t.wait = None;
    t.flags_wait = None;
    t.wake_reason = Some(reason);
    t.state = ThreadState::Ready;
    let eff = t.effective_priority;
    c.ready.push_back(eff, tid);

    let preempts = match c.current_tcb() {
        Some(cur) => eff > cur.effective_priority,
        None => true,
    };
    if preempts {
        c.need_resched = true;
    }
}

/// Detach a blocked thread from whatever it waits on. Shared by timeout
/// delivery, interruption and forced termination.
pub(crate) fn cancel_wait(c: &mut Core, tid: ThreadId) {
    let Some(object) = c.threads.get(tid.0).and_then(|t| t.wait) else {
        return;
    };
    match object {
        WaitObject::Sleep | WaitObject::ThreadFlags => {}
        WaitObject::Join(target) => {
            if let Some(t) = c.threads.get_mut(target.0) {
                t.joiners.remove(tid);
            }
        }
        WaitObject::Semaphore(id) => {
            if let Some(s) = c.semaphores.get_mut(id) {
                s.waiters.remove(tid);
            }
        }
        WaitObject::Mutex(id) => {
            let owner = if let Some(m) = c.mutexes.get_mut(id) {
                m.waiters.remove(tid);
                m.owner
            } else {
                None
            };
            // A departing waiter may have been the boost source.
            if let Some(owner) = owner {
                recompute_effective(c, owner, 0);
            }
        }
        WaitObject::Condvar(id) => {
            if let Some(cv) = c.condvars.get_mut(id) {
                cv.waiters.remove(tid);
            }
        }
        WaitObject::EventFlags(id) => {
            if let Some(ev) = c.eventflags.get_mut(id) {
                ev.waiters.remove(tid);
            }
        }
        WaitObject::MqSend(id) => {
            if let Some(q) = c.mqueues.get_mut(id) {
                q.senders.remove(tid);
            }
        }
        WaitObject::MqRecv(id) => {
            if let Some(q) = c.mqueues.get_mut(id) {
                q.receivers.remove(tid);
            }
        }
        WaitObject::MemPool(id) => {
            if let Some(p) = c.mempools.get_mut(id) {
                p.waiters.remove(tid);
            }
        }
    }
}

// ============================================================================
// Effective priority maintenance
// ============================================================================

/// Apply a new effective priority, fixing whichever queue the thread
/// sits in and propagating through a blocked-on mutex chain (bounded by
/// the configured depth).
pub(crate) fn set_effective_priority(c: &mut Core, tid: ThreadId, new: Priority, depth: usize) {
    let Some(t) = c.threads.get_mut(tid.0) else {
        return;
    };
    let old = t.effective_priority;
    if old == new {
        return;
    }
    t.effective_priority = new;
    let state = t.state;
    let wait = t.wait;

    match state {
        ThreadState::Ready => {
            c.ready.remove(old, tid);
            c.ready.push_back(new, tid);
            let preempts = match c.current_tcb() {
                Some(cur) => new > cur.effective_priority,
                None => true,
            };
            if preempts {
                c.need_resched = true;
            }
        }
        ThreadState::Running => {
            if let Some(highest) = c.ready.highest() {
                if highest > new {
                    c.need_resched = true;
                }
            }
        }
        ThreadState::Blocked => {
            match wait {
                Some(WaitObject::Semaphore(id)) => {
                    if let Some(s) = c.semaphores.get_mut(id) {
                        s.waiters.reposition(tid, new);
                    }
                }
                Some(WaitObject::Mutex(id)) => {
                    let owner = if let Some(m) = c.mutexes.get_mut(id) {
                        m.waiters.reposition(tid, new);
                        m.owner
                    } else {
                        None
                    };
                    // Transitive inheritance: the owner of the mutex this
                    // thread blocks on may need the boost as well.
                    let limit = c.config.inheritance_chain_limit;
                    if depth < limit {
                        if let Some(owner) = owner {
                            recompute_effective(c, owner, depth + 1);
                        }
                    }
                }
                Some(WaitObject::Condvar(id)) => {
                    if let Some(cv) = c.condvars.get_mut(id) {
                        cv.waiters.reposition(tid, new);
                    }
                }
                Some(WaitObject::EventFlags(id)) => {
                    if let Some(ev) = c.eventflags.get_mut(id) {
                        ev.waiters.reposition(tid, new);
                    }
                }
                Some(WaitObject::MqSend(id)) => {
                    if let Some(q) = c.mqueues.get_mut(id) {
                        q.senders.reposition(tid, new);
                    }
                }
                Some(WaitObject::MqRecv(id)) => {
                    if let Some(q) = c.mqueues.get_mut(id) {
                        q.receivers.reposition(tid, new);
                    }
                }
                Some(WaitObject::MemPool(id)) => {
                    if let Some(p) = c.mempools.get_mut(id) {
                        p.waiters.reposition(tid, new);
                    }
                }
                Some(WaitObject::Join(target)) => {
                    if let Some(t) = c.threads.get_mut(target.0) {
                        t.joiners.reposition(tid, new);
                    }
                }
                _ => {}
            }
        }
        _ => {}
    }
}

/// Recompute a thread's effective priority from its assigned priority
/// plus the contributions of every mutex it holds.
pub(crate) fn recompute_effective(c: &mut Core, tid: ThreadId, depth: usize) {
    let Some(t) = c.threads.get(tid.0) else {
        return;
    };
    let mut target = t.assigned_priority;
    for &mid in &t.owned_mutexes {
        if let Some(m) = c.mutexes.get(mid) {
            if let Some(boost) = m.priority_contribution() {
                target = target.max(boost);
            }
        }
    }
    set_effective_priority(c, tid, target, depth);
}

/// Reclaim a terminated thread's record and stack.
pub(crate) fn reap(c: &mut Core, tid: ThreadId) {
    if let Some(t) = c.threads.remove(tid.0) {
        if let Some(stack) = t.stack {
            crate::mem::rtos_deallocate(stack.ptr, stack.len, 8);
        }
        log::debug!("thread {} reclaimed", tid.0);
    }
}

// ============================================================================
// Thread operations
// ============================================================================

impl Kernel {
    pub(crate) fn thread_create(
        &self,
        name: &str,
        priority: Priority,
        entry: ThreadEntry,
        arg: usize,
        stack_size: Option<usize>,
    ) -> Result<ThreadId> {
        if !priority.is_assignable() || priority == Priority::NONE {
            return Err(Errno::InvalidArgument);
        }
        self.create_thread(name, priority, entry, arg, stack_size)
    }

    /// Unvalidated create path. The reserved sub-idle level is only
    /// reachable from here, for the idle thread `start` registers.
    fn create_thread(
        &self,
        name: &str,
        priority: Priority,
        entry: ThreadEntry,
        arg: usize,
        stack_size: Option<usize>,
    ) -> Result<ThreadId> {
        let size = self.with_core(|c| stack_size.unwrap_or(c.config.default_stack_size));
        if size == 0 {
            return Err(Errno::InvalidArgument);
        }
        let stack = crate::mem::rtos_allocate(size, 8)?;
        let context = self.port().context_create(stack.as_ptr(), size, entry, arg);

        let tid = self.with_core(|c| {
            let mut tcb = Tcb::new(obj_name(name), priority);
            tcb.stack = Some(RawBuf {
                ptr: stack,
                len: size,
            });
            tcb.context = context;
            let id = ThreadId(c.threads.insert(tcb));
            c.ready.push_back(priority, id);
            let preempts = match c.current_tcb() {
                Some(cur) => priority > cur.effective_priority,
                None => false,
            };
            if preempts {
                c.need_resched = true;
            }
            log::info!("thread {} '{}' created, priority {}", id.0, name, priority.0);
            id
        });
        self.maybe_switch();
        Ok(tid)
    }

    /// Mark a thread terminated: release its mutexes, wake its joiners,
    /// pull it off whatever queue it occupies.
    fn finish_thread(&self, c: &mut Core, tid: ThreadId, code: i32) {
        let Some(t) = c.threads.get(tid.0) else {
            return;
        };
        let state = t.state;
        if state == ThreadState::Terminated {
            return;
        }
        match state {
            ThreadState::Ready => {
                let eff = t.effective_priority;
                c.ready.remove(eff, tid);
            }
            ThreadState::Blocked => {
                cancel_wait(c, tid);
                if let Some(t) = c.threads.get_mut(tid.0) {
                    if let Some(seq) = t.timeout_seq.take() {
                        c.timeouts.cancel(seq);
                    }
                }
            }
            _ => {}
        }

        crate::sync::mutex::release_all_on_death(c, tid);

        let t = c.threads.get_mut(tid.0).expect("checked above");
        t.state = ThreadState::Terminated;
        t.exit_code = Some(code);
        let joiners = t.joiners.drain();
        t.pending_joins = joiners.len();
        let detached = t.detached;
        for j in &joiners {
            unpark(c, *j, WakeReason::Signalled);
        }
        log::info!("thread {} terminated, code {}", tid.0, code);

        if c.current == Some(tid) {
            // The record survives until the switch exception moves away
            // from this stack; reclaim happens there for detached
            // threads.
            c.need_resched = true;
        } else if detached && joiners.is_empty() {
            reap(c, tid);
        }
    }

    /// Terminate the calling thread. The public wrapper never returns;
    /// this internal part does, so the hosted suite can drive it.
    pub(crate) fn thread_exit(&self, code: i32) {
        self.with_core(|c| {
            let Some(tid) = c.current else {
                return;
            };
            self.finish_thread(c, tid, code);
        });
        self.port().context_switch_request();
    }

    pub(crate) fn thread_terminate(&self, tid: ThreadId, code: i32) -> Result<()> {
        self.with_core(|c| {
            if !c.threads.contains(tid.0) {
                return Err(Errno::InvalidArgument);
            }
            // The idle thread must always exist.
            if c.idle_thread == Some(tid) {
                return Err(Errno::InvalidArgument);
            }
            self.finish_thread(c, tid, code);
            Ok(())
        })?;
        self.maybe_switch();
        Ok(())
    }

    pub(crate) fn thread_join(&self, tid: ThreadId) -> Result<i32> {
        let in_isr = self.port().in_isr();
        let parked = self.with_core(|c| {
            let me = c.current.ok_or(Errno::InvalidState)?;
            if me == tid {
                return Err(Errno::WouldDeadlock);
            }
            let target = c.threads.get(tid.0).ok_or(Errno::InvalidArgument)?;
            if target.detached {
                return Err(Errno::InvalidState);
            }
            if target.state == ThreadState::Terminated {
                return Ok(None);
            }
            let (me, eff, seq) = prepare_park(c, in_isr)?;
            let target = c.threads.get_mut(tid.0).expect("checked above");
            target.joiners.insert(me, eff, seq);
            commit_park(c, me, WaitObject::Join(tid), Expiry::Forever);
            Ok(Some(me))
        })?;

        if let Some(me) = parked {
            match self.wait_for_wake(me) {
                WakeReason::Signalled => {}
                WakeReason::Interrupted => return Err(Errno::Interrupted),
                WakeReason::Destroyed => return Err(Errno::Destroyed),
                WakeReason::Timeout => return Err(Errno::Timeout),
            }
        }

        self.with_core(|c| {
            let target = c.threads.get_mut(tid.0).ok_or(Errno::Destroyed)?;
            kassert!(target.state == ThreadState::Terminated);
            let code = target.exit_code.unwrap_or(0);
            if parked.is_some() {
                target.pending_joins = target.pending_joins.saturating_sub(1);
            }
            if target.pending_joins == 0 {
                reap(c, tid);
            }
            Ok(code)
        })
    }

    pub(crate) fn thread_detach(&self, tid: ThreadId) -> Result<()> {
        self.with_core(|c| {
            let t = c.threads.get_mut(tid.0).ok_or(Errno::InvalidArgument)?;
            t.detached = true;
            let reap_now =
                t.state == ThreadState::Terminated && t.pending_joins == 0 && c.current != Some(tid);
            if reap_now {
                reap(c, tid);
            }
            Ok(())
        })
    }

    pub(crate) fn thread_interrupt(&self, tid: ThreadId) -> Result<()> {
        self.with_core(|c| {
            let t = c.threads.get_mut(tid.0).ok_or(Errno::InvalidArgument)?;
            match t.state {
                ThreadState::Blocked => {
                    cancel_wait(c, tid);
                    unpark(c, tid, WakeReason::Interrupted);
                }
                ThreadState::Terminated => return Err(Errno::InvalidState),
                _ => t.interrupt_pending = true,
            }
            Ok(())
        })?;
        self.maybe_switch();
        Ok(())
    }

    pub(crate) fn thread_suspend(&self, tid: ThreadId) -> Result<()> {
        let is_self = self.with_core(|c| {
            let t = c.threads.get(tid.0).ok_or(Errno::InvalidArgument)?;
            match t.state {
                ThreadState::Running => {
                    kassert!(c.current == Some(tid));
                    let t = c.threads.get_mut(tid.0).expect("checked above");
                    t.state = ThreadState::Suspended;
                    c.need_resched = true;
                    Ok(true)
                }
                ThreadState::Ready => {
                    let eff = t.effective_priority;
                    let t = c.threads.get_mut(tid.0).expect("checked above");
                    t.state = ThreadState::Suspended;
                    c.ready.remove(eff, tid);
                    Ok(false)
                }
                _ => Err(Errno::InvalidState),
            }
        })?;

        if is_self && !self.port().in_isr() {
            // Suspension point: spin on the switch request until someone
            // resumes us.
            loop {
                self.port().context_switch_request();
                let resumed = self.with_core(|c| {
                    c.threads
                        .get(tid.0)
                        .map(|t| t.state != ThreadState::Suspended)
                        .unwrap_or(true)
                });
                if resumed {
                    break;
                }
            }
        }
        Ok(())
    }

    pub(crate) fn thread_resume(&self, tid: ThreadId) -> Result<()> {
        self.with_core(|c| {
            let t = c.threads.get_mut(tid.0).ok_or(Errno::InvalidArgument)?;
            if t.state != ThreadState::Suspended {
                return Err(Errno::InvalidState);
            }
            t.state = ThreadState::Ready;
            let eff = t.effective_priority;
            c.ready.push_back(eff, tid);
            let preempts = match c.current_tcb() {
                Some(cur) => eff > cur.effective_priority,
                None => true,
            };
            if preempts {
                c.need_resched = true;
            }
            Ok(())
        })?;
        self.maybe_switch();
        Ok(())
    }

    pub(crate) fn thread_set_priority(&self, tid: ThreadId, priority: Priority) -> Result<()> {
        if !priority.is_assignable() || priority == Priority::NONE {
            return Err(Errno::InvalidArgument);
        }
        self.with_core(|c| {
            let t = c.threads.get_mut(tid.0).ok_or(Errno::InvalidArgument)?;
            if t.state == ThreadState::Terminated {
                return Err(Errno::InvalidState);
            }
            t.assigned_priority = priority;
            recompute_effective(c, tid, 0);
            Ok(())
        })?;
        self.maybe_switch();
        Ok(())
    }

    pub(crate) fn sleep_until_deadline(&self, deadline: Deadline) -> Result<()> {
        let in_isr = self.port().in_isr();
        let parked = self.with_core(|c| {
            let expiry = match blockable(c, deadline) {
                Ok(e) => e,
                // A zero or past deadline: the sleep is already over.
                Err(Errno::Timeout) => return Ok(None),
                Err(e) => return Err(e),
            };
            let (me, _, _) = prepare_park(c, in_isr)?;
            commit_park(c, me, WaitObject::Sleep, expiry);
            Ok(Some(me))
        })?;

        let Some(me) = parked else {
            return Ok(());
        };
        match self.wait_for_wake(me) {
            WakeReason::Timeout | WakeReason::Signalled => Ok(()),
            WakeReason::Interrupted => Err(Errno::Interrupted),
            WakeReason::Destroyed => Err(Errno::Destroyed),
        }
    }

    pub(crate) fn yield_now(&self) {
        let due = self.with_core(|c| {
            if !c.started || c.lock_nest > 0 {
                return false;
            }
            c.need_resched = true;
            true
        });
        if due && !self.port().in_isr() {
            self.port().context_switch_request();
        }
    }

    pub(crate) fn sched_lock(&self) {
        self.with_core(|c| {
            c.lock_nest += 1;
        });
    }

    pub(crate) fn sched_unlock(&self) {
        self.with_core(|c| {
            kassert!(c.lock_nest > 0, "unbalanced scheduler unlock");
            c.lock_nest -= 1;
        });
        self.maybe_switch();
    }

    pub(crate) fn set_preemptive(&self, on: bool) {
        self.with_core(|c| {
            c.preemptive = on;
        });
        if on {
            self.maybe_switch();
        }
    }

    pub(crate) fn is_preemptive(&self) -> bool {
        self.with_core(|c| c.preemptive)
    }

    pub(crate) fn thread_stats(&self, tid: ThreadId) -> Result<ThreadStats> {
        self.with_core(|c| {
            let t = c.threads.get(tid.0).ok_or(Errno::InvalidArgument)?;
            Ok(ThreadStats {
                id: tid,
                name: t.name.clone(),
                state: t.state,
                assigned_priority: t.assigned_priority,
                effective_priority: t.effective_priority,
                run_ticks: t.run_ticks,
                switches: t.switches,
            })
        })
    }

    pub(crate) fn all_thread_stats(&self) -> Vec<ThreadStats> {
        self.with_core(|c| {
            c.threads
                .iter()
                .map(|(id, t)| ThreadStats {
                    id: ThreadId(id),
                    name: t.name.clone(),
                    state: t.state,
                    assigned_priority: t.assigned_priority,
                    effective_priority: t.effective_priority,
                    run_ticks: t.run_ticks,
                    switches: t.switches,
                })
                .collect()
        })
    }

    pub(crate) fn context_switch_count(&self) -> u64 {
        self.with_core(|c| c.context_switches)
    }
}

// ============================================================================
// Thread flags (the thread's own event flags word)
// ============================================================================

/// Raise bits in a thread's flags word with the core already held;
/// wakes the thread when its armed predicate is now satisfied. Shared by
/// the public raise path and the timer expiry path.
pub(crate) fn raise_flags_locked(c: &mut Core, tid: ThreadId, mask: u32) -> Result<u32> {
    let t = c.threads.get_mut(tid.0).ok_or(Errno::InvalidArgument)?;
    if !t.is_alive() {
        return Err(Errno::InvalidState);
    }
    t.flags_word |= mask;
    let word = t.flags_word;
    if t.state == ThreadState::Blocked && t.wait == Some(WaitObject::ThreadFlags) {
        if let Some(armed) = t.flags_wait {
            if let Some(matched) = crate::sync::eventflags::flags_satisfied(word, armed) {
                t.flags_result = matched;
                if armed.mode.contains(crate::sync::eventflags::FlagsMode::CLEAR) {
                    t.flags_word &= !matched;
                }
                unpark(c, tid, WakeReason::Signalled);
            }
        }
    }
    Ok(word)
}

impl Kernel {
    /// Raise bits in a thread's private flags word. ISR-safe.
    pub(crate) fn thread_flags_raise(&self, tid: ThreadId, mask: u32) -> Result<u32> {
        if mask == 0 {
            return Err(Errno::InvalidArgument);
        }
        let result = self.with_core(|c| raise_flags_locked(c, tid, mask))?;
        self.maybe_switch();
        Ok(result)
    }

    /// Wait on the calling thread's own flags word.
    pub(crate) fn thread_flags_wait(
        &self,
        mask: u32,
        mode: crate::sync::eventflags::FlagsMode,
        deadline: Deadline,
    ) -> Result<u32> {
        if mask == 0 {
            return Err(Errno::InvalidArgument);
        }
        let in_isr = self.port().in_isr();
        let armed = crate::sched::thread::FlagsWait {
            mask,
            mode,
        };
        let parked = self.with_core(|c| {
            let me = c.current.ok_or(Errno::InvalidState)?;
            let t = c.threads.get_mut(me.0).ok_or(Errno::InvalidState)?;
            if let Some(matched) = crate::sync::eventflags::flags_satisfied(t.flags_word, armed) {
                if mode.contains(crate::sync::eventflags::FlagsMode::CLEAR) {
                    t.flags_word &= !matched;
                }
                return Ok((me, Some(matched)));
            }
            let expiry = blockable(c, deadline)?;
            let (me, _, _) = prepare_park(c, in_isr)?;
            let t = c.threads.get_mut(me.0).expect("current thread has no record");
            t.flags_wait = Some(armed);
            commit_park(c, me, WaitObject::ThreadFlags, expiry);
            Ok((me, None))
        });
        let (me, immediate) = parked?;
        if let Some(matched) = immediate {
            return Ok(matched);
        }
        match self.wait_for_wake(me) {
            WakeReason::Signalled => self.with_core(|c| {
                Ok(c.threads
                    .get(me.0)
                    .map(|t| t.flags_result)
                    .unwrap_or(0))
            }),
            WakeReason::Timeout => Err(Errno::Timeout),
            WakeReason::Interrupted => Err(Errno::Interrupted),
            WakeReason::Destroyed => Err(Errno::Destroyed),
        }
    }

    /// Read (and optionally clear) the calling thread's flags word
    /// without blocking.
    pub(crate) fn thread_flags_get(&self, mask: u32, clear: bool) -> Result<u32> {
        self.with_core(|c| {
            let me = c.current.ok_or(Errno::InvalidState)?;
            let t = c.threads.get_mut(me.0).ok_or(Errno::InvalidState)?;
            let matched = t.flags_word & mask;
            if clear {
                t.flags_word &= !matched;
            }
            Ok(matched)
        })
    }

    pub(crate) fn user_storage_set(&self, value: usize) -> Result<()> {
        self.with_core(|c| {
            let me = c.current.ok_or(Errno::InvalidState)?;
            let t = c.threads.get_mut(me.0).ok_or(Errno::InvalidState)?;
            t.user_storage = value;
            Ok(())
        })
    }

    pub(crate) fn user_storage_get(&self) -> Result<usize> {
        self.with_core(|c| {
            let me = c.current.ok_or(Errno::InvalidState)?;
            Ok(c.threads.get(me.0).ok_or(Errno::InvalidState)?.user_storage)
        })
    }
}

// ============================================================================
// Test hooks: the suites drive scheduling decisions directly instead of
// going through real context switches.
// ============================================================================

#[cfg(test)]
impl Kernel {
    /// Force a thread to be the running one, as if the switch exception
    /// had picked it.
    pub(crate) fn test_set_current(&self, tid: ThreadId) {
        self.with_core(|c| {
            if let Some(cur) = c.current {
                if let Some(t) = c.threads.get_mut(cur.0) {
                    if t.state == ThreadState::Running {
                        t.state = ThreadState::Ready;
                        let eff = t.effective_priority;
                        c.ready.push_back(eff, cur);
                    }
                }
            }
            if let Some(t) = c.threads.get_mut(tid.0) {
                if t.state == ThreadState::Ready {
                    let eff = t.effective_priority;
                    c.ready.remove(eff, tid);
                }
                t.state = ThreadState::Running;
            }
            c.current = Some(tid);
        });
    }

    /// Designate the timer service thread without spawning the real one.
    pub(crate) fn test_set_timer_thread(&self, tid: ThreadId) {
        self.with_core(|c| c.timer_thread = Some(tid));
    }

    pub(crate) fn test_dispatch_fired(&self) {
        crate::sync::timer::dispatch_fired(self);
    }
}

// ============================================================================
// Service threads
// ============================================================================

fn idle_main(_arg: usize) {
    loop {
        kernel().port().sleep_idle();
    }
}

/// Flag the tick handler raises when thread-dispatch timers expire.
pub(crate) const TIMER_THREAD_FLAG: u32 = 1;

fn timer_main(_arg: usize) {
    loop {
        let _ = kernel().thread_flags_wait(
            TIMER_THREAD_FLAG,
            crate::sync::eventflags::FlagsMode::ANY | crate::sync::eventflags::FlagsMode::CLEAR,
            Deadline::Never,
        );
        crate::sync::timer::dispatch_fired(kernel());
    }
}

// ============================================================================
// Public scheduler surface
// ============================================================================

/// Initialize the kernel: install the port, set up the memory
/// resources, capture the configuration.
pub fn init(config: Config, port: &'static dyn Port) {
    kernel().init(config, port);
}

/// Adopt the calling context as the main thread, create the service
/// threads and start the tick source.
pub fn start() -> Result<ThreadId> {
    kernel().start()
}

/// Yield the processor to the next ready thread of the same priority.
pub fn yield_now() {
    kernel().yield_now();
}

/// Disable rescheduling without disabling interrupts. Nestable; pair
/// with `unlock`.
pub fn lock() {
    kernel().sched_lock();
}

pub fn unlock() {
    kernel().sched_unlock();
}

/// Toggle preemption. While off, wakeups only mark the pending switch.
pub fn set_preemptive(on: bool) {
    kernel().set_preemptive(on);
}

pub fn is_preemptive() -> bool {
    kernel().is_preemptive()
}

pub fn current() -> Option<ThreadId> {
    kernel().current()
}

/// Snapshot of every live thread.
pub fn stats() -> Vec<ThreadStats> {
    kernel().all_thread_stats()
}

/// Total context switches since start.
pub fn context_switches() -> u64 {
    kernel().context_switch_count()
}

/// Tick interrupt entry point for ports.
pub fn tick_handler() -> bool {
    kernel().tick()
}

/// Switch exception entry point for ports.
pub fn switch_handler() -> Option<(Option<ThreadId>, ThreadId)> {
    kernel().switch_context()
}

/// Name and id of the current thread, for diagnostics. Never blocks on
/// the core lock, so it is safe from the assertion path.
pub fn current_thread_name() -> Option<(ThreadId, ObjName)> {
    let core = KERNEL.core.try_lock()?;
    let tid = core.current?;
    let name = core.threads.get(tid.0)?.name.clone();
    Some((tid, name))
}

pub use self::thread::{Priority, Thread, ThreadId, ThreadState, ThreadStats};
