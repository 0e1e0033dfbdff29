/*
 * Condition Variable
 *
 * Not bound to any particular mutex: each wait names the mutex it
 * releases. The release and the enqueue happen under the same core
 * critical section, so a signal issued after the wait entered the queue
 * can never be lost. Woken waiters re-acquire the mutex before
 * returning, restoring the recursion depth they held.
 */

use crate::clock::Deadline;
use crate::errno::{Errno, Result};
use crate::sched::waitq::{WaitObject, WaitQueue, WakeReason};
use crate::sched::{Kernel, blockable, commit_park, kernel, prepare_park, unpark};
use crate::sync::mutex::Mutex;
use crate::util::{ObjName, obj_name};

pub(crate) struct CondvarObj {
    pub name: ObjName,
    pub waiters: WaitQueue,
}

/// Condition variable handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Condvar {
    id: usize,
}

impl Condvar {
    pub fn create(name: &str) -> Result<Condvar> {
        kernel().cv_create(name).map(|id| Condvar { id })
    }

    /// Atomically release `mutex` and wait; re-acquires before returning.
    pub fn wait(&self, mutex: &Mutex) -> Result<()> {
        kernel().cv_wait(self.id, mutex.raw_id(), Deadline::Never)
    }

    /// Like `wait` with a deadline on the condition (the re-acquire is
    /// not bounded).
    pub fn timed_wait(&self, mutex: &Mutex, ticks: u64) -> Result<()> {
        kernel().cv_wait(self.id, mutex.raw_id(), Deadline::Ticks(ticks))
    }

    /// Wake the highest-priority waiter.
    pub fn signal(&self) -> Result<()> {
        kernel().cv_wake(self.id, false)
    }

    /// Wake every waiter; they re-contend for their mutexes.
    pub fn broadcast(&self) -> Result<()> {
        kernel().cv_wake(self.id, true)
    }

    pub fn destroy(&self) -> Result<()> {
        kernel().cv_destroy(self.id)
    }
}

impl Kernel {
    pub(crate) fn cv_create(&self, name: &str) -> Result<usize> {
        self.with_core(|c| {
            let id = c.condvars.insert(CondvarObj {
                name: obj_name(name),
                waiters: WaitQueue::new(),
            });
            log::debug!("condvar {} '{}' created", id, name);
            Ok(id)
        })
    }

    pub(crate) fn cv_wait(&self, id: usize, mutex_id: usize, deadline: Deadline) -> Result<()> {
        let in_isr = self.port().in_isr();
        // Enqueue and full-release the mutex in one critical section;
        // remember the recursion depth to restore on the way out.
        let (me, saved_count) = self.with_core(|c| {
            let me = c.current.ok_or(Errno::InvalidState)?;
            let m = c.mutexes.get(mutex_id).ok_or(Errno::InvalidArgument)?;
            if m.owner != Some(me) {
                return Err(Errno::NotOwner);
            }
            let saved_count = m.count;
            if !c.condvars.contains(id) {
                return Err(Errno::InvalidArgument);
            }

            let expiry = blockable(c, deadline)?;
            let (me, priority, seq) = prepare_park(c, in_isr)?;
            let cv = c.condvars.get_mut(id).ok_or(Errno::InvalidArgument)?;
            cv.waiters.insert(me, priority, seq);
            commit_park(c, me, WaitObject::Condvar(id), expiry);
            crate::sync::mutex::full_release(c, mutex_id, me);
            Ok((me, saved_count))
        })?;

        let outcome = match self.wait_for_wake(me) {
            WakeReason::Signalled => Ok(()),
            WakeReason::Timeout => Err(Errno::Timeout),
            WakeReason::Interrupted => Err(Errno::Interrupted),
            WakeReason::Destroyed => Err(Errno::Destroyed),
        };

        // Whatever woke us, the caller expects to hold the mutex again.
        let reacquire = reacquire_mutex(self, mutex_id, saved_count);
        outcome.and(reacquire)
    }

    pub(crate) fn cv_wake(&self, id: usize, all: bool) -> Result<()> {
        self.with_core(|c| {
            let cv = c.condvars.get_mut(id).ok_or(Errno::InvalidArgument)?;
            if all {
                for waiter in cv.waiters.drain() {
                    unpark(c, waiter, WakeReason::Signalled);
                }
            } else if let Some(waiter) = cv.waiters.pop_head() {
                unpark(c, waiter, WakeReason::Signalled);
            }
            Ok(())
        })?;
        self.maybe_switch();
        Ok(())
    }

    pub(crate) fn cv_destroy(&self, id: usize) -> Result<()> {
        self.with_core(|c| {
            let mut cv = c.condvars.remove(id).ok_or(Errno::InvalidArgument)?;
            for waiter in cv.waiters.drain() {
                unpark(c, waiter, WakeReason::Destroyed);
            }
            log::debug!("condvar {} '{}' destroyed", id, cv.name.as_str());
            Ok(())
        })?;
        self.maybe_switch();
        Ok(())
    }
}

/// Re-acquire the mutex after a condition wait and restore the saved
/// recursion depth.
fn reacquire_mutex(k: &Kernel, mutex_id: usize, saved_count: u32) -> Result<()> {
    k.mutex_lock(mutex_id, Deadline::Never)?;
    if saved_count > 1 {
        k.with_core(|c| {
            if let Some(m) = c.mutexes.get_mut(mutex_id) {
                m.count = saved_count;
            }
        });
    }
    Ok(())
}
