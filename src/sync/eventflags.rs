/*
 * Event Flags
 *
 * A 32-bit word of raised bits plus a priority-ordered wait queue. Each
 * waiter arms a mask and a match mode; `raise` wakes every waiter whose
 * predicate just became true, in queue order, clearing matched bits for
 * waiters that asked for it before evaluating the next one.
 */

use bitflags::bitflags;

use crate::clock::Deadline;
use crate::errno::{Errno, Result};
use crate::sched::thread::FlagsWait;
use crate::sched::waitq::{WaitObject, WaitQueue, WakeReason};
use crate::sched::{Kernel, blockable, commit_park, kernel, prepare_park, unpark};
use crate::util::{ObjName, obj_name};

bitflags! {
    /// Wait-mode bits: exactly one of `ALL`/`ANY`, optionally `CLEAR`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FlagsMode: u32 {
        /// Wake when every masked bit is raised.
        const ALL = 1 << 0;
        /// Wake when any masked bit is raised.
        const ANY = 1 << 1;
        /// Atomically clear the matched bits on success.
        const CLEAR = 1 << 2;
    }
}

/// Evaluate a waiter predicate against the current word; returns the
/// matched bits on success.
pub(crate) fn flags_satisfied(word: u32, armed: FlagsWait) -> Option<u32> {
    let matched = word & armed.mask;
    if armed.mode.contains(FlagsMode::ALL) {
        (matched == armed.mask).then_some(matched)
    } else {
        (matched != 0).then_some(matched)
    }
}

pub(crate) struct EventFlagsObj {
    pub name: ObjName,
    pub flags: u32,
    pub waiters: WaitQueue,
}

/// Event-flags handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventFlags {
    id: usize,
}

impl EventFlags {
    pub fn create(name: &str) -> Result<EventFlags> {
        kernel().ev_create(name).map(|id| EventFlags { id })
    }

    /// Raise bits and wake every waiter whose predicate now holds.
    /// ISR-safe.
    pub fn raise(&self, mask: u32) -> Result<u32> {
        kernel().ev_raise(self.id, mask)
    }

    /// Block until the masked bits satisfy `mode`; returns the matched
    /// bits.
    pub fn wait(&self, mask: u32, mode: FlagsMode) -> Result<u32> {
        kernel().ev_wait(self.id, mask, mode, Deadline::Never)
    }

    pub fn try_wait(&self, mask: u32, mode: FlagsMode) -> Result<u32> {
        kernel().ev_wait(self.id, mask, mode, Deadline::Poll)
    }

    pub fn timed_wait(&self, mask: u32, mode: FlagsMode, ticks: u64) -> Result<u32> {
        kernel().ev_wait(self.id, mask, mode, Deadline::Ticks(ticks))
    }

    /// Read the masked bits without blocking, optionally clearing them.
    pub fn get(&self, mask: u32, clear: bool) -> Result<u32> {
        kernel().ev_get(self.id, mask, clear)
    }

    pub fn destroy(&self) -> Result<()> {
        kernel().ev_destroy(self.id)
    }
}

impl Kernel {
    pub(crate) fn ev_create(&self, name: &str) -> Result<usize> {
        self.with_core(|c| {
            let id = c.eventflags.insert(EventFlagsObj {
                name: obj_name(name),
                flags: 0,
                waiters: WaitQueue::new(),
            });
            log::debug!("event flags {} '{}' created", id, name);
            Ok(id)
        })
    }

    pub(crate) fn ev_raise(&self, id: usize, mask: u32) -> Result<u32> {
        if mask == 0 {
            return Err(Errno::InvalidArgument);
        }
        let word = self.with_core(|c| {
            let ev = c.eventflags.get_mut(id).ok_or(Errno::InvalidArgument)?;
            ev.flags |= mask;

            // Walk waiters in priority order; each satisfied one may
            // consume bits before the next is evaluated.
            let queued: alloc::vec::Vec<_> = ev.waiters.iter().collect();
            for tid in queued {
                let Some(armed) = c.threads.get(tid.0).and_then(|t| t.flags_wait) else {
                    continue;
                };
                let Some(ev) = c.eventflags.get_mut(id) else {
                    break;
                };
                let Some(matched) = flags_satisfied(ev.flags, armed) else {
                    continue;
                };
                if armed.mode.contains(FlagsMode::CLEAR) {
                    ev.flags &= !matched;
                }
                ev.waiters.remove(tid);
                if let Some(t) = c.threads.get_mut(tid.0) {
                    t.flags_result = matched;
                }
                unpark(c, tid, WakeReason::Signalled);
            }
            Ok(c.eventflags
                .get(id)
                .map(|ev| ev.flags)
                .unwrap_or(0))
        })?;
        self.maybe_switch();
        Ok(word)
    }

    pub(crate) fn ev_wait(
        &self,
        id: usize,
        mask: u32,
        mode: FlagsMode,
        deadline: Deadline,
    ) -> Result<u32> {
        if mask == 0 || mode.contains(FlagsMode::ALL) == mode.contains(FlagsMode::ANY) {
            return Err(Errno::InvalidArgument);
        }
        let in_isr = self.port().in_isr();
        let armed = FlagsWait {
            mask,
            mode,
        };
        let parked = self.with_core(|c| {
            let ev = c.eventflags.get_mut(id).ok_or(Errno::InvalidArgument)?;
            if let Some(matched) = flags_satisfied(ev.flags, armed) {
                if mode.contains(FlagsMode::CLEAR) {
                    ev.flags &= !matched;
                }
                return Ok((None, matched));
            }
            let expiry = blockable(c, deadline)?;
            let (me, priority, seq) = prepare_park(c, in_isr)?;
            let ev = c.eventflags.get_mut(id).ok_or(Errno::InvalidArgument)?;
            ev.waiters.insert(me, priority, seq);
            if let Some(t) = c.threads.get_mut(me.0) {
                t.flags_wait = Some(armed);
            }
            commit_park(c, me, WaitObject::EventFlags(id), expiry);
            Ok((Some(me), 0))
        })?;

        let (parked, immediate) = parked;
        let Some(me) = parked else {
            return Ok(immediate);
        };
        match self.wait_for_wake(me) {
            WakeReason::Signalled => {
                self.with_core(|c| Ok(c.threads.get(me.0).map(|t| t.flags_result).unwrap_or(0)))
            }
            WakeReason::Timeout => Err(Errno::Timeout),
            WakeReason::Interrupted => Err(Errno::Interrupted),
            WakeReason::Destroyed => Err(Errno::Destroyed),
        }
    }

    pub(crate) fn ev_get(&self, id: usize, mask: u32, clear: bool) -> Result<u32> {
        self.with_core(|c| {
            let ev = c.eventflags.get_mut(id).ok_or(Errno::InvalidArgument)?;
            let matched = ev.flags & mask;
            if clear {
                ev.flags &= !matched;
            }
            Ok(matched)
        })
    }

    pub(crate) fn ev_destroy(&self, id: usize) -> Result<()> {
        self.with_core(|c| {
            let mut ev = c.eventflags.remove(id).ok_or(Errno::InvalidArgument)?;
            for waiter in ev.waiters.drain() {
                unpark(c, waiter, WakeReason::Destroyed);
            }
            log::debug!("event flags {} '{}' destroyed", id, ev.name.as_str());
            Ok(())
        })?;
        self.maybe_switch();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predicate_all_requires_every_bit() {
        let armed = FlagsWait {
            mask: 0b1010,
            mode: FlagsMode::ALL,
        };
        assert_eq!(flags_satisfied(0b0010, armed), None);
        assert_eq!(flags_satisfied(0b1010, armed), Some(0b1010));
        assert_eq!(flags_satisfied(0b1110, armed), Some(0b1010));
    }

    #[test]
    fn predicate_any_takes_the_subset() {
        let armed = FlagsWait {
            mask: 0b1010,
            mode: FlagsMode::ANY,
        };
        assert_eq!(flags_satisfied(0b0001, armed), None);
        assert_eq!(flags_satisfied(0b0010, armed), Some(0b0010));
    }
}
