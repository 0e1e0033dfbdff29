/*
 * Counting Semaphore
 *
 * `post` is ISR-safe. When a waiter is queued, `post` hands the token
 * straight to the highest-priority waiter instead of bumping the count,
 * so a post issued after a wait entered the queue always wakes that
 * wait.
 */

use crate::clock::Deadline;
use crate::errno::{Errno, Result};
use crate::sched::waitq::{WaitObject, WaitQueue, WakeReason};
use crate::sched::{Kernel, blockable, commit_park, kernel, prepare_park, unpark};
use crate::util::{ObjName, obj_name};

pub(crate) struct SemObj {
    pub name: ObjName,
    pub count: u32,
    pub max: u32,
    pub waiters: WaitQueue,
}

/// Semaphore handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Semaphore {
    id: usize,
}

impl Semaphore {
    /// Counting semaphore with the given initial value and ceiling.
    pub fn create(name: &str, initial: u32, max: u32) -> Result<Semaphore> {
        kernel().sem_create(name, initial, max).map(|id| Semaphore { id })
    }

    /// Binary semaphore, initially not available.
    pub fn binary(name: &str) -> Result<Semaphore> {
        Self::create(name, 0, 1)
    }

    pub fn post(&self) -> Result<()> {
        kernel().sem_post(self.id)
    }

    pub fn wait(&self) -> Result<()> {
        kernel().sem_wait(self.id, Deadline::Never)
    }

    pub fn try_wait(&self) -> Result<()> {
        kernel().sem_wait(self.id, Deadline::Poll)
    }

    pub fn timed_wait(&self, ticks: u64) -> Result<()> {
        kernel().sem_wait(self.id, Deadline::Ticks(ticks))
    }

    pub fn value(&self) -> Result<u32> {
        kernel().sem_value(self.id)
    }

    /// Destroy the semaphore; queued waiters fail with `Destroyed`.
    pub fn destroy(&self) -> Result<()> {
        kernel().sem_destroy(self.id)
    }
}

impl Kernel {
    pub(crate) fn sem_create(&self, name: &str, initial: u32, max: u32) -> Result<usize> {
        if max == 0 || initial > max {
            return Err(Errno::InvalidArgument);
        }
        self.with_core(|c| {
            let id = c.semaphores.insert(SemObj {
                name: obj_name(name),
                count: initial,
                max,
                waiters: WaitQueue::new(),
            });
            log::debug!("semaphore {} '{}' created ({}/{})", id, name, initial, max);
            Ok(id)
        })
    }

    pub(crate) fn sem_post(&self, id: usize) -> Result<()> {
        self.with_core(|c| {
            let sem = c.semaphores.get_mut(id).ok_or(Errno::InvalidArgument)?;
            match sem.waiters.pop_head() {
                Some(waiter) => {
                    // Direct handoff: the count never goes up, the head
                    // waiter owns the token on wake.
                    unpark(c, waiter, WakeReason::Signalled);
                    Ok(())
                }
                None if sem.count < sem.max => {
                    sem.count += 1;
                    Ok(())
                }
                None => Err(Errno::Overflow),
            }
        })?;
        self.maybe_switch();
        Ok(())
    }

    pub(crate) fn sem_wait(&self, id: usize, deadline: Deadline) -> Result<()> {
        let in_isr = self.port().in_isr();
        let parked = self.with_core(|c| {
            let sem = c.semaphores.get_mut(id).ok_or(Errno::InvalidArgument)?;
            if sem.count > 0 {
                sem.count -= 1;
                return Ok(None);
            }
            let expiry = blockable(c, deadline)?;
            let (me, priority, seq) = prepare_park(c, in_isr)?;
            let sem = c.semaphores.get_mut(id).ok_or(Errno::InvalidArgument)?;
            sem.waiters.insert(me, priority, seq);
            commit_park(c, me, WaitObject::Semaphore(id), expiry);
            Ok(Some(me))
        })?;

        let Some(me) = parked else {
            return Ok(());
        };
        match self.wait_for_wake(me) {
            WakeReason::Signalled => Ok(()),
            WakeReason::Timeout => Err(Errno::Timeout),
            WakeReason::Interrupted => Err(Errno::Interrupted),
            WakeReason::Destroyed => Err(Errno::Destroyed),
        }
    }

    pub(crate) fn sem_value(&self, id: usize) -> Result<u32> {
        self.with_core(|c| {
            Ok(c.semaphores.get(id).ok_or(Errno::InvalidArgument)?.count)
        })
    }

    pub(crate) fn sem_destroy(&self, id: usize) -> Result<()> {
        self.with_core(|c| {
            let mut sem = c.semaphores.remove(id).ok_or(Errno::InvalidArgument)?;
            for waiter in sem.waiters.drain() {
                unpark(c, waiter, WakeReason::Destroyed);
            }
            log::debug!("semaphore {} '{}' destroyed", id, sem.name.as_str());
            Ok(())
        })?;
        self.maybe_switch();
        Ok(())
    }
}
