/*
 * Mutex
 *
 * Ownership is handed to the highest-priority waiter at unlock, never
 * re-contested. Three attribute axes:
 *
 * - type: normal, error-check (relock fails) or recursive (count);
 * - protocol: none, priority inheritance or priority ceiling;
 * - robustness: a robust mutex survives its owner's death through the
 *   owner-dead / consistent handshake.
 *
 * Inheritance propagates transitively when the boosted owner itself
 * blocks on another inheritance mutex, bounded by the configured chain
 * limit.
 */

use bitflags::bitflags;

use crate::clock::Deadline;
use crate::errno::{Errno, Result};
use crate::kassert;
use crate::sched::thread::{Priority, ThreadId};
use crate::sched::waitq::{WaitObject, WaitQueue, WakeReason};
use crate::sched::{
    Core, Kernel, blockable, commit_park, kernel, prepare_park, recompute_effective, unpark,
};
use crate::util::{ObjName, obj_name};

/// Lock-type attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexType {
    /// Relocking by the owner deadlocks (and is trapped as such).
    Normal,
    /// Relocking by the owner fails with `WouldDeadlock`.
    ErrorCheck,
    /// Relocking by the owner increments a count.
    Recursive,
}

/// Priority protocol attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexProtocol {
    None,
    /// Contention raises the owner to the highest waiter priority.
    Inherit,
    /// Acquisition raises the owner to the configured ceiling.
    Protect,
}

bitflags! {
    /// Extra attribute bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MutexOptions: u32 {
        /// Owner death is recoverable through `consistent`.
        const ROBUST = 1 << 0;
    }
}

/// Construction attributes; `Default` is a plain inheriting mutex, the
/// common case on a priority scheduler.
#[derive(Debug, Clone, Copy)]
pub struct MutexAttributes {
    pub mutex_type: MutexType,
    pub protocol: MutexProtocol,
    pub ceiling: Priority,
    pub options: MutexOptions,
}

impl Default for MutexAttributes {
    fn default() -> Self {
        Self {
            mutex_type: MutexType::Normal,
            protocol: MutexProtocol::Inherit,
            ceiling: Priority::MAX,
            options: MutexOptions::empty(),
        }
    }
}

/// Robustness state of the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RobustState {
    Consistent,
    /// Owner died holding the lock; next acquirer sees `OwnerDead`.
    Inconsistent,
    /// Owner died and the inheritor unlocked without `consistent`.
    NotRecoverable,
}

pub(crate) struct MutexObj {
    pub name: ObjName,
    pub owner: Option<ThreadId>,
    pub count: u32,
    pub mutex_type: MutexType,
    pub protocol: MutexProtocol,
    pub ceiling: Priority,
    pub robust: bool,
    pub robust_state: RobustState,
    pub waiters: WaitQueue,
}

impl MutexObj {
    /// Priority this mutex currently adds to its owner: the ceiling for
    /// the protect protocol, the top waiter for inheritance.
    pub fn priority_contribution(&self) -> Option<Priority> {
        match self.protocol {
            MutexProtocol::None => None,
            MutexProtocol::Protect => Some(self.ceiling),
            MutexProtocol::Inherit => self.waiters.max_priority(),
        }
    }
}

/// Mutex handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mutex {
    id: usize,
}

impl Mutex {
    pub fn create(name: &str, attributes: MutexAttributes) -> Result<Mutex> {
        kernel().mutex_create(name, attributes).map(|id| Mutex { id })
    }

    /// Plain inheriting mutex.
    pub fn new(name: &str) -> Result<Mutex> {
        Self::create(name, MutexAttributes::default())
    }

    pub fn lock(&self) -> Result<()> {
        kernel().mutex_lock(self.id, Deadline::Never)
    }

    pub fn try_lock(&self) -> Result<()> {
        kernel().mutex_lock(self.id, Deadline::Poll)
    }

    pub fn timed_lock(&self, ticks: u64) -> Result<()> {
        kernel().mutex_lock(self.id, Deadline::Ticks(ticks))
    }

    pub fn unlock(&self) -> Result<()> {
        kernel().mutex_unlock(self.id)
    }

    /// Mark a robust mutex usable again after an `OwnerDead` acquisition.
    pub fn consistent(&self) -> Result<()> {
        kernel().mutex_consistent(self.id)
    }

    pub fn owner(&self) -> Result<Option<ThreadId>> {
        kernel().mutex_owner(self.id)
    }

    pub fn destroy(&self) -> Result<()> {
        kernel().mutex_destroy(self.id)
    }

    pub(crate) fn raw_id(&self) -> usize {
        self.id
    }
}

impl Kernel {
    pub(crate) fn mutex_create(&self, name: &str, attributes: MutexAttributes) -> Result<usize> {
        if attributes.protocol == MutexProtocol::Protect && !attributes.ceiling.is_assignable() {
            return Err(Errno::InvalidArgument);
        }
        self.with_core(|c| {
            let id = c.mutexes.insert(MutexObj {
                name: obj_name(name),
                owner: None,
                count: 0,
                mutex_type: attributes.mutex_type,
                protocol: attributes.protocol,
                ceiling: attributes.ceiling,
                robust: attributes.options.contains(MutexOptions::ROBUST),
                robust_state: RobustState::Consistent,
                waiters: WaitQueue::new(),
            });
            log::debug!("mutex {} '{}' created", id, name);
            Ok(id)
        })
    }

    pub(crate) fn mutex_lock(&self, id: usize, deadline: Deadline) -> Result<()> {
        let in_isr = self.port().in_isr();
        kassert!(!in_isr, "mutex lock from interrupt context");
        let parked = self.with_core(|c| {
            let me = c.current.ok_or(Errno::InvalidState)?;
            let m = c.mutexes.get_mut(id).ok_or(Errno::InvalidArgument)?;

            if m.robust_state == RobustState::NotRecoverable {
                return Err(Errno::NotRecoverable);
            }

            match m.owner {
                None => {
                    take_ownership(c, id, me);
                    Ok(None)
                }
                Some(owner) if owner == me => match m.mutex_type {
                    MutexType::Recursive => {
                        m.count += 1;
                        Ok(None)
                    }
                    MutexType::ErrorCheck => Err(Errno::WouldDeadlock),
                    MutexType::Normal => {
                        // Self-deadlock on a normal mutex is a
                        // programming error; trap instead of hanging
                        // forever.
                        kassert!(false, "normal mutex relocked by its owner");
                        Err(Errno::WouldDeadlock)
                    }
                },
                Some(owner) => {
                    let expiry = blockable(c, deadline)?;
                    let (me, priority, seq) = prepare_park(c, in_isr)?;
                    let m = c.mutexes.get_mut(id).ok_or(Errno::InvalidArgument)?;
                    m.waiters.insert(me, priority, seq);
                    commit_park(c, me, WaitObject::Mutex(id), expiry);
                    // Contention engages inheritance on the owner, and
                    // transitively down the chain it blocks on.
                    if c.mutexes.get(id).map(|m| m.protocol) == Some(MutexProtocol::Inherit) {
                        recompute_effective(c, owner, 0);
                    }
                    Ok(Some(me))
                }
            }
        })?;

        let Some(me) = parked else {
            // Acquired on the fast path; a robust mutex may still report
            // its previous owner's death.
            return self.robust_acquire_result(id);
        };
        match self.wait_for_wake(me) {
            // Ownership was handed over at unlock (or at the old owner's
            // death).
            WakeReason::Signalled => self.robust_acquire_result(id),
            WakeReason::Timeout => Err(Errno::Timeout),
            WakeReason::Interrupted => Err(Errno::Interrupted),
            WakeReason::Destroyed => Err(Errno::Destroyed),
        }
    }

    fn robust_acquire_result(&self, id: usize) -> Result<()> {
        self.with_core(|c| {
            let m = c.mutexes.get(id).ok_or(Errno::Destroyed)?;
            if m.robust && m.robust_state == RobustState::Inconsistent {
                Err(Errno::OwnerDead)
            } else {
                Ok(())
            }
        })
    }

    pub(crate) fn mutex_unlock(&self, id: usize) -> Result<()> {
        self.with_core(|c| {
            let me = c.current.ok_or(Errno::InvalidState)?;
            let m = c.mutexes.get_mut(id).ok_or(Errno::InvalidArgument)?;
            if m.owner != Some(me) {
                return Err(Errno::NotOwner);
            }
            if m.count > 1 {
                m.count -= 1;
                return Ok(());
            }

            // Unlocking an inconsistent robust mutex without the
            // `consistent` handshake poisons it for good.
            if m.robust && m.robust_state == RobustState::Inconsistent {
                m.robust_state = RobustState::NotRecoverable;
                release_and_handoff(c, id, me);
                return Ok(());
            }

            release_and_handoff(c, id, me);
            Ok(())
        })?;
        self.maybe_switch();
        Ok(())
    }

    pub(crate) fn mutex_consistent(&self, id: usize) -> Result<()> {
        self.with_core(|c| {
            let me = c.current.ok_or(Errno::InvalidState)?;
            let m = c.mutexes.get_mut(id).ok_or(Errno::InvalidArgument)?;
            if !m.robust {
                return Err(Errno::InvalidState);
            }
            if m.owner != Some(me) {
                return Err(Errno::NotOwner);
            }
            if m.robust_state != RobustState::Inconsistent {
                return Err(Errno::InvalidState);
            }
            m.robust_state = RobustState::Consistent;
            Ok(())
        })
    }

    pub(crate) fn mutex_owner(&self, id: usize) -> Result<Option<ThreadId>> {
        self.with_core(|c| Ok(c.mutexes.get(id).ok_or(Errno::InvalidArgument)?.owner))
    }

    pub(crate) fn mutex_destroy(&self, id: usize) -> Result<()> {
        self.with_core(|c| {
            let mut m = c.mutexes.remove(id).ok_or(Errno::InvalidArgument)?;
            if let Some(owner) = m.owner {
                if let Some(t) = c.threads.get_mut(owner.0) {
                    t.owned_mutexes.retain(|&mid| mid != id);
                }
                recompute_effective(c, owner, 0);
            }
            for waiter in m.waiters.drain() {
                unpark(c, waiter, WakeReason::Destroyed);
            }
            log::debug!("mutex {} '{}' destroyed", id, m.name.as_str());
            Ok(())
        })?;
        self.maybe_switch();
        Ok(())
    }
}

/// Record ownership and apply the ceiling protocol.
fn take_ownership(c: &mut Core, id: usize, tid: ThreadId) {
    let Some(m) = c.mutexes.get_mut(id) else {
        return;
    };
    m.owner = Some(tid);
    m.count = 1;
    let protocol = m.protocol;
    if let Some(t) = c.threads.get_mut(tid.0) {
        t.owned_mutexes.push(id);
    }
    if protocol == MutexProtocol::Protect {
        recompute_effective(c, tid, 0);
    }
}

/// Drop ownership, restore the releaser's priority and hand the record
/// to the highest-priority waiter, if any.
fn release_and_handoff(c: &mut Core, id: usize, releaser: ThreadId) {
    let next = {
        let Some(m) = c.mutexes.get_mut(id) else {
            return;
        };
        m.owner = None;
        m.count = 0;
        m.waiters.pop_head()
    };
    if let Some(t) = c.threads.get_mut(releaser.0) {
        t.owned_mutexes.retain(|&mid| mid != id);
    }
    // Inheritance disengages: back to assigned plus whatever other held
    // mutexes still contribute.
    recompute_effective(c, releaser, 0);

    if let Some(next) = next {
        take_ownership(c, id, next);
        unpark(c, next, WakeReason::Signalled);
        // The new owner may still have waiters boosting it.
        recompute_effective(c, next, 0);
    }
}

/// Release a mutex regardless of its recursion depth. The condition
/// variable's wait path uses this after it verified ownership.
pub(crate) fn full_release(c: &mut Core, id: usize, owner: ThreadId) {
    if let Some(m) = c.mutexes.get(id) {
        if m.owner == Some(owner) {
            release_and_handoff(c, id, owner);
        }
    }
}

/// Called when a thread terminates: release everything it holds. Robust
/// mutexes flip to the inconsistent state so the next acquirer learns of
/// the death; others are force-released.
pub(crate) fn release_all_on_death(c: &mut Core, tid: ThreadId) {
    let held: alloc::vec::Vec<usize> = c
        .threads
        .get(tid.0)
        .map(|t| t.owned_mutexes.clone())
        .unwrap_or_default();
    for id in held {
        let robust = match c.mutexes.get_mut(id) {
            Some(m) => {
                kassert!(m.owner == Some(tid));
                m.robust
            }
            None => continue,
        };
        if robust {
            if let Some(m) = c.mutexes.get_mut(id) {
                m.robust_state = RobustState::Inconsistent;
            }
        } else {
            log::warn!("thread {} died holding non-robust mutex {}", tid.0, id);
        }
        release_and_handoff(c, id, tid);
    }
}
