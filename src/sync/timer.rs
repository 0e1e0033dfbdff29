/*
 * Software Timers
 *
 * One-shot or periodic deadlines on the shared timeout queue. The tick
 * handler pops expired timers and either runs the callback right there
 * (ISR dispatch) or queues it for the timer service thread (the default,
 * for callbacks that may block). Periodic timers re-arm from their old
 * deadline, so they do not drift against the tick.
 */

use alloc::vec::Vec;

use crate::clock::TimeoutTarget;
use crate::errno::{Errno, Result};
use crate::sched::{Core, Kernel, kernel, raise_flags_locked, TIMER_THREAD_FLAG};
use crate::util::{ObjName, obj_name};

/// Where the expiry callback runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerDispatch {
    /// Directly from the tick interrupt. The callback must not block.
    Isr,
    /// From the timer service thread; the callback may block.
    Thread,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    Stopped,
    Running,
}

pub type TimerCallback = fn(usize);

pub(crate) struct TimerObj {
    pub name: ObjName,
    pub callback: TimerCallback,
    pub arg: usize,
    pub dispatch: TimerDispatch,
    pub state: TimerState,
    /// Zero for one-shot timers.
    pub period: u64,
    /// Armed timeout-queue entry while running.
    pub timeout_seq: Option<u64>,
    /// Absolute deadline of the armed entry; periodic re-arm adds the
    /// period to this, not to the current tick.
    pub next_at: u64,
}

/// Software timer handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timer {
    id: usize,
}

impl Timer {
    /// Thread-dispatch timer, the safe default.
    pub fn create(name: &str, callback: TimerCallback, arg: usize) -> Result<Timer> {
        Self::create_with_dispatch(name, callback, arg, TimerDispatch::Thread)
    }

    pub fn create_with_dispatch(
        name: &str,
        callback: TimerCallback,
        arg: usize,
        dispatch: TimerDispatch,
    ) -> Result<Timer> {
        kernel()
            .timer_create(name, callback, arg, dispatch)
            .map(|id| Timer { id })
    }

    /// Fire once after `ticks`.
    pub fn start(&self, ticks: u64) -> Result<()> {
        kernel().timer_start(self.id, ticks, 0)
    }

    /// Fire every `period` ticks until stopped.
    pub fn start_periodic(&self, period: u64) -> Result<()> {
        kernel().timer_start(self.id, period, period)
    }

    pub fn stop(&self) -> Result<()> {
        kernel().timer_stop(self.id)
    }

    pub fn state(&self) -> Result<TimerState> {
        kernel().timer_state(self.id)
    }

    pub fn destroy(&self) -> Result<()> {
        kernel().timer_destroy(self.id)
    }
}

impl Kernel {
    pub(crate) fn timer_create(
        &self,
        name: &str,
        callback: TimerCallback,
        arg: usize,
        dispatch: TimerDispatch,
    ) -> Result<usize> {
        self.with_core(|c| {
            if dispatch == TimerDispatch::Thread && c.timer_thread.is_none() && c.started {
                return Err(Errno::InvalidState);
            }
            let id = c.timers.insert(TimerObj {
                name: obj_name(name),
                callback,
                arg,
                dispatch,
                state: TimerState::Stopped,
                period: 0,
                timeout_seq: None,
                next_at: 0,
            });
            log::debug!("timer {} '{}' created", id, name);
            Ok(id)
        })
    }

    pub(crate) fn timer_start(&self, id: usize, ticks: u64, period: u64) -> Result<()> {
        if ticks == 0 {
            return Err(Errno::InvalidArgument);
        }
        self.with_core(|c| {
            let now = c.ticks;
            let timer = c.timers.get_mut(id).ok_or(Errno::InvalidArgument)?;
            // Restarting a running timer re-arms it from now.
            if let Some(seq) = timer.timeout_seq.take() {
                c.timeouts.cancel(seq);
            }
            let timer = c.timers.get_mut(id).ok_or(Errno::InvalidArgument)?;
            timer.period = period;
            timer.next_at = now.saturating_add(ticks);
            timer.state = TimerState::Running;
            let at = timer.next_at;
            let seq = c.timeouts.arm(at, TimeoutTarget::Timer(id));
            if let Some(timer) = c.timers.get_mut(id) {
                timer.timeout_seq = Some(seq);
            }
            Ok(())
        })
    }

    pub(crate) fn timer_stop(&self, id: usize) -> Result<()> {
        self.with_core(|c| {
            let timer = c.timers.get_mut(id).ok_or(Errno::InvalidArgument)?;
            if timer.state != TimerState::Running {
                return Err(Errno::InvalidState);
            }
            timer.state = TimerState::Stopped;
            if let Some(seq) = timer.timeout_seq.take() {
                c.timeouts.cancel(seq);
            }
            Ok(())
        })
    }

    pub(crate) fn timer_state(&self, id: usize) -> Result<TimerState> {
        self.with_core(|c| Ok(c.timers.get(id).ok_or(Errno::InvalidArgument)?.state))
    }

    pub(crate) fn timer_destroy(&self, id: usize) -> Result<()> {
        self.with_core(|c| {
            let timer = c.timers.remove(id).ok_or(Errno::InvalidArgument)?;
            if let Some(seq) = timer.timeout_seq {
                c.timeouts.cancel(seq);
            }
            c.timer_fired.retain(|&t| t != id);
            log::debug!("timer {} '{}' destroyed", id, timer.name.as_str());
            Ok(())
        })
    }
}

/// Expiry path, called by the tick handler with the core held. Re-arms
/// periodic timers before dispatching so the period stays drift-free.
pub(crate) fn fire(c: &mut Core, id: usize, isr_callbacks: &mut Vec<(TimerCallback, usize)>) {
    let Some(timer) = c.timers.get_mut(id) else {
        return;
    };
    timer.timeout_seq = None;
    let dispatch = timer.dispatch;
    let callback = timer.callback;
    let arg = timer.arg;

    if timer.period > 0 {
        timer.next_at = timer.next_at.saturating_add(timer.period);
        let at = timer.next_at;
        let seq = c.timeouts.arm(at, TimeoutTarget::Timer(id));
        if let Some(timer) = c.timers.get_mut(id) {
            timer.timeout_seq = Some(seq);
        }
    } else {
        timer.state = TimerState::Stopped;
    }

    match dispatch {
        TimerDispatch::Isr => isr_callbacks.push((callback, arg)),
        TimerDispatch::Thread => {
            c.timer_fired.push(id);
            if let Some(service) = c.timer_thread {
                raise_flags_locked(c, service, TIMER_THREAD_FLAG);
            }
        }
    }
}

/// Drain the fired list from the timer service thread, running each
/// callback outside the core lock.
pub(crate) fn dispatch_fired(k: &Kernel) {
    loop {
        let batch: Vec<(TimerCallback, usize)> = k.with_core(|c| {
            let fired = core::mem::take(&mut c.timer_fired);
            fired
                .into_iter()
                .filter_map(|id| c.timers.get(id).map(|t| (t.callback, t.arg)))
                .collect()
        });
        if batch.is_empty() {
            return;
        }
        for (callback, arg) in batch {
            callback(arg);
        }
    }
}
