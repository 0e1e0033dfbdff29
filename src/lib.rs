/*
 * mikros - preemptive real-time kernel core
 *
 * A priority scheduler with round-robin within one level, the classical
 * synchronization primitives built over one wait-list protocol, software
 * timers and a polymorphic memory resource. The CPU lives behind the
 * `port` trait: critical sections, context frames and the switch
 * exception are the port's, everything else is here and runs hosted
 * under `cargo test`.
 *
 * The usual shape of an application:
 *
 * ```ignore
 * mikros::init(Config::default(), &PORT);
 * let worker = Thread::spawn("worker", Priority::NORMAL, worker_main, 0)?;
 * mikros::start()?;            // the caller becomes the main thread
 * ```
 */

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod capi;
pub mod clock;
pub mod config;
pub mod errno;
pub mod mem;
pub mod port;
pub mod registry;
pub mod sched;
pub mod sync;
pub mod this_thread;
pub mod util;

#[cfg(test)]
mod tests;

pub use clock::Deadline;
pub use config::Config;
pub use errno::{Errno, Result};
pub use port::{ContextRef, IrqState, Port};
pub use sched::{
    Priority, Thread, ThreadId, ThreadState, ThreadStats, current, init, is_preemptive, lock,
    set_preemptive, start, stats, switch_handler, tick_handler, unlock, yield_now,
};
pub use sync::{
    Condvar, EventFlags, FlagsMode, MemoryPool, MessageQueue, Mutex, MutexAttributes,
    MutexOptions, MutexProtocol, MutexType, Semaphore, Timer, TimerDispatch, TimerState,
};
