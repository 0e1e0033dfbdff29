/*
 * Port Layer Contract
 *
 * The single interface through which the kernel touches the CPU. A port
 * implements critical sections, builds the initial register frame for a
 * new thread stack, pends the context-switch exception and drives the
 * periodic tick.
 *
 * The protocol around a context switch:
 *
 * 1. The kernel decides a switch is needed and calls
 *    `context_switch_request`.
 * 2. The port arranges for its lowest-priority exception to run (so that
 *    interrupts stay serviceable) and from that exception calls
 *    `kernel().switch_context()`.
 * 3. `switch_context` returns the previous and next thread; the port
 *    saves the live registers into the previous thread's frame slot and
 *    restores the next thread's.
 *
 * The tick interrupt calls `kernel().tick()` once per period and pends
 * the switch exception when it returns true.
 */

/// Saved interrupt state returned by `irq_critical_enter`. Opaque to the
/// kernel; the port decides whether it encodes a full disable or a
/// masked-priority threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IrqState(pub usize);

/// Opaque handle to a thread's saved register frame. Created by
/// `context_create`, stored in the thread record, exchanged at every
/// switch.
pub type ContextRef = usize;

pub trait Port: Send + Sync {
    /// Enter an interrupt-critical section. Nestable: the returned state
    /// must be passed back to the matching `irq_critical_exit`.
    fn irq_critical_enter(&self) -> IrqState;

    /// Leave an interrupt-critical section.
    fn irq_critical_exit(&self, state: IrqState);

    /// True while executing in interrupt context. Blocking kernel calls
    /// are forbidden there and trap through the assertion path.
    fn in_isr(&self) -> bool;

    /// Build an initial register frame on the given stack such that the
    /// first restore branches to `entry(arg)`. Returns the frame handle
    /// the kernel stores in the thread record.
    fn context_create(&self, stack_base: *mut u8, stack_size: usize, entry: fn(usize), arg: usize)
    -> ContextRef;

    /// Pend the context-switch exception. Must be callable from both
    /// thread and interrupt context; the actual register swap happens
    /// later, in the lowest-priority exception.
    fn context_switch_request(&self);

    /// Called by the idle thread between scheduling rounds; typically a
    /// wait-for-interrupt instruction.
    fn sleep_idle(&self);

    /// Configure and start the periodic tick source.
    fn tick_source_start(&self, hz: u32);
}
