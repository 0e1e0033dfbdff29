/*
 * Message Queue
 *
 * A ring of fixed-size slots. Messages carry a priority: receive always
 * returns the highest priority present, FIFO within one priority. Full
 * queues block senders, empty queues block receivers; both sides retry
 * after a wake, with the deadline pinned to its original absolute tick.
 */

use alloc::vec::Vec;

use crate::clock::Deadline;
use crate::errno::{Errno, Result};
use crate::sched::thread::RawBuf;
use crate::sched::waitq::{WaitObject, WaitQueue, WakeReason};
use crate::sched::{Kernel, blockable, commit_park, kernel, prepare_park, unpark};
use crate::util::{ObjName, obj_name};

/// One queued message: ordering key plus the slot holding the payload.
#[derive(Debug, Clone, Copy)]
struct SlotRef {
    priority: u8,
    seq: u64,
    slot: u16,
}

pub(crate) struct MqObj {
    pub name: ObjName,
    msg_size: usize,
    capacity: usize,
    buf: RawBuf,
    /// Stored length per slot.
    lens: Vec<u16>,
    /// Free-slot stack.
    free: Vec<u16>,
    /// Occupied slots ordered by (priority descending, send order).
    order: Vec<SlotRef>,
    next_seq: u64,
    pub senders: WaitQueue,
    pub receivers: WaitQueue,
}

impl MqObj {
    fn enqueue(&mut self, slot: u16, priority: u8) {
        let seq = self.next_seq;
        self.next_seq += 1;
        let entry = SlotRef {
            priority,
            seq,
            slot,
        };
        let pos = self
            .order
            .iter()
            .position(|e| (e.priority, core::cmp::Reverse(e.seq)) < (priority, core::cmp::Reverse(seq)))
            .unwrap_or(self.order.len());
        self.order.insert(pos, entry);
    }

    fn slot_ptr(&self, slot: u16) -> *mut u8 {
        // Slot index is bounded by capacity at insertion.
        unsafe { self.buf.ptr.as_ptr().add(slot as usize * self.msg_size) }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }
}

/// Message queue handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageQueue {
    id: usize,
}

impl MessageQueue {
    /// A queue of `capacity` messages of at most `msg_size` bytes each.
    pub fn create(name: &str, capacity: usize, msg_size: usize) -> Result<MessageQueue> {
        kernel()
            .mq_create(name, capacity, msg_size)
            .map(|id| MessageQueue { id })
    }

    pub fn send(&self, msg: &[u8], priority: u8) -> Result<()> {
        kernel().mq_send(self.id, msg, priority, Deadline::Never)
    }

    pub fn try_send(&self, msg: &[u8], priority: u8) -> Result<()> {
        kernel().mq_send(self.id, msg, priority, Deadline::Poll)
    }

    pub fn timed_send(&self, msg: &[u8], priority: u8, ticks: u64) -> Result<()> {
        kernel().mq_send(self.id, msg, priority, Deadline::Ticks(ticks))
    }

    /// Receive into `buf`; returns the message length and priority.
    pub fn receive(&self, buf: &mut [u8]) -> Result<(usize, u8)> {
        kernel().mq_receive(self.id, buf, Deadline::Never)
    }

    pub fn try_receive(&self, buf: &mut [u8]) -> Result<(usize, u8)> {
        kernel().mq_receive(self.id, buf, Deadline::Poll)
    }

    pub fn timed_receive(&self, buf: &mut [u8], ticks: u64) -> Result<(usize, u8)> {
        kernel().mq_receive(self.id, buf, Deadline::Ticks(ticks))
    }

    /// Messages currently queued.
    pub fn len(&self) -> Result<usize> {
        kernel().mq_len(self.id)
    }

    /// Destroy the queue; blocked senders and receivers fail with
    /// `Destroyed`.
    pub fn destroy(&self) -> Result<()> {
        kernel().mq_destroy(self.id)
    }
}

impl Kernel {
    pub(crate) fn mq_create(&self, name: &str, capacity: usize, msg_size: usize) -> Result<usize> {
        let max_size = self.with_core(|c| c.config.max_message_size());
        if capacity == 0 || msg_size == 0 || msg_size > max_size {
            return Err(Errno::InvalidArgument);
        }
        if capacity > u16::MAX as usize {
            return Err(Errno::InvalidArgument);
        }
        let buf = crate::mem::rtos_allocate(capacity * msg_size, 8)?;
        self.with_core(|c| {
            let id = c.mqueues.insert(MqObj {
                name: obj_name(name),
                msg_size,
                capacity,
                buf: RawBuf {
                    ptr: buf,
                    len: capacity * msg_size,
                },
                lens: alloc::vec![0; capacity],
                free: (0..capacity as u16).rev().collect(),
                order: Vec::new(),
                next_seq: 0,
                senders: WaitQueue::new(),
                receivers: WaitQueue::new(),
            });
            log::debug!(
                "message queue {} '{}' created, {} x {} bytes",
                id,
                name,
                capacity,
                msg_size
            );
            Ok(id)
        })
    }

    pub(crate) fn mq_send(
        &self,
        id: usize,
        msg: &[u8],
        priority: u8,
        deadline: Deadline,
    ) -> Result<()> {
        let in_isr = self.port().in_isr();
        let deadline = self.pin_deadline(deadline);
        loop {
            let parked = self.with_core(|c| {
                let q = c.mqueues.get_mut(id).ok_or(Errno::InvalidArgument)?;
                if msg.len() > q.msg_size {
                    return Err(Errno::InvalidArgument);
                }
                if let Some(slot) = q.free.pop() {
                    unsafe {
                        core::ptr::copy_nonoverlapping(msg.as_ptr(), q.slot_ptr(slot), msg.len());
                    }
                    q.lens[slot as usize] = msg.len() as u16;
                    q.enqueue(slot, priority);
                    if let Some(receiver) = q.receivers.pop_head() {
                        unpark(c, receiver, WakeReason::Signalled);
                    }
                    return Ok(None);
                }
                let expiry = blockable(c, deadline)?;
                let (me, prio, seq) = prepare_park(c, in_isr)?;
                let q = c.mqueues.get_mut(id).ok_or(Errno::InvalidArgument)?;
                q.senders.insert(me, prio, seq);
                commit_park(c, me, WaitObject::MqSend(id), expiry);
                Ok(Some(me))
            })?;

            let Some(me) = parked else {
                self.maybe_switch();
                return Ok(());
            };
            match self.wait_for_wake(me) {
                WakeReason::Signalled => continue,
                WakeReason::Timeout => return Err(Errno::Timeout),
                WakeReason::Interrupted => return Err(Errno::Interrupted),
                WakeReason::Destroyed => return Err(Errno::Destroyed),
            }
        }
    }

    pub(crate) fn mq_receive(
        &self,
        id: usize,
        buf: &mut [u8],
        deadline: Deadline,
    ) -> Result<(usize, u8)> {
        let in_isr = self.port().in_isr();
        let deadline = self.pin_deadline(deadline);
        loop {
            let parked = self.with_core(|c| {
                let q = c.mqueues.get_mut(id).ok_or(Errno::InvalidArgument)?;
                if buf.len() < q.msg_size {
                    return Err(Errno::InvalidArgument);
                }
                if !q.order.is_empty() {
                    let entry = q.order.remove(0);
                    let len = q.lens[entry.slot as usize] as usize;
                    unsafe {
                        core::ptr::copy_nonoverlapping(
                            q.slot_ptr(entry.slot),
                            buf.as_mut_ptr(),
                            len,
                        );
                    }
                    q.free.push(entry.slot);
                    if let Some(sender) = q.senders.pop_head() {
                        unpark(c, sender, WakeReason::Signalled);
                    }
                    return Ok(Err((len, entry.priority)));
                }
                let expiry = blockable(c, deadline)?;
                let (me, prio, seq) = prepare_park(c, in_isr)?;
                let q = c.mqueues.get_mut(id).ok_or(Errno::InvalidArgument)?;
                q.receivers.insert(me, prio, seq);
                commit_park(c, me, WaitObject::MqRecv(id), expiry);
                Ok(Ok(me))
            })?;

            match parked {
                Err(received) => {
                    self.maybe_switch();
                    return Ok(received);
                }
                Ok(me) => match self.wait_for_wake(me) {
                    WakeReason::Signalled => continue,
                    WakeReason::Timeout => return Err(Errno::Timeout),
                    WakeReason::Interrupted => return Err(Errno::Interrupted),
                    WakeReason::Destroyed => return Err(Errno::Destroyed),
                },
            }
        }
    }

    pub(crate) fn mq_len(&self, id: usize) -> Result<usize> {
        self.with_core(|c| Ok(c.mqueues.get(id).ok_or(Errno::InvalidArgument)?.len()))
    }

    pub(crate) fn mq_destroy(&self, id: usize) -> Result<()> {
        self.with_core(|c| {
            let mut q = c.mqueues.remove(id).ok_or(Errno::InvalidArgument)?;
            for waiter in q.senders.drain() {
                unpark(c, waiter, WakeReason::Destroyed);
            }
            for waiter in q.receivers.drain() {
                unpark(c, waiter, WakeReason::Destroyed);
            }
            crate::mem::rtos_deallocate(q.buf.ptr, q.buf.len, 8);
            log::debug!("message queue {} '{}' destroyed", id, q.name.as_str());
            Ok(())
        })?;
        self.maybe_switch();
        Ok(())
    }

    /// Convert a relative deadline to an absolute one so retry loops do
    /// not extend it.
    pub(crate) fn pin_deadline(&self, deadline: Deadline) -> Deadline {
        match deadline {
            Deadline::Ticks(n) => {
                let now = self.with_core(|c| c.ticks);
                Deadline::At(now.saturating_add(n))
            }
            other => other,
        }
    }
}
