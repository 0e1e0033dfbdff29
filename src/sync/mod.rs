/*
 * Synchronization Primitives
 *
 * Each primitive is a small state machine over the scheduler's wait
 * queues: create/destroy plus its natural verbs, every blocking verb in
 * plain, try and timed variants. Destroying a primitive with waiters
 * wakes them all with the `Destroyed` reason.
 */

pub mod condvar;
pub mod eventflags;
pub mod mempool;
pub mod mqueue;
pub mod mutex;
pub mod semaphore;
pub mod timer;

pub use condvar::Condvar;
pub use eventflags::{EventFlags, FlagsMode};
pub use mempool::MemoryPool;
pub use mqueue::MessageQueue;
pub use mutex::{Mutex, MutexAttributes, MutexOptions, MutexProtocol, MutexType};
pub use semaphore::Semaphore;
pub use timer::{Timer, TimerDispatch, TimerState};
