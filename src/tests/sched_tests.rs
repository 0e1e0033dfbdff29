/*
 * Scheduler behaviour: lifecycle, preemption, round-robin, suspension,
 * joining, interruption, statistics.
 */

use crate::clock::Deadline;
use crate::errno::Errno;
use crate::sched::thread::{Priority, ThreadState};
use crate::sync::eventflags::FlagsMode;
use crate::tests::support::{TestKernel, tick_n};

#[test]
fn start_adopts_the_caller_as_main() {
    let t = TestKernel::new();
    let main = t.start();
    assert_eq!(t.current(), Some(main));
    assert_eq!(t.state(main), ThreadState::Running);
    // Main plus the idle thread.
    assert_eq!(t.k.all_thread_stats().len(), 2);
}

#[test]
fn below_idle_configuration_boots_with_a_sub_idle_thread() {
    let mut config = TestKernel::config();
    config.idle_priority_below_idle = true;
    let t = TestKernel::with_config(config);
    let main = t.start();
    assert_eq!(t.current(), Some(main));

    let idle = t
        .k
        .all_thread_stats()
        .into_iter()
        .find(|s| s.name.as_str() == "idle")
        .expect("idle thread exists");
    assert_eq!(idle.assigned_priority, Priority::NONE);
    assert_eq!(idle.effective_priority, Priority::NONE);

    // The reserved level stays off limits for applications.
    fn noop(_arg: usize) {}
    assert_eq!(
        t.k.thread_create("bad", Priority::NONE, noop, 0, None),
        Err(Errno::InvalidArgument)
    );

    // An application thread at the idle level still outranks the idle
    // thread once main blocks.
    let background = t.spawn("background", Priority::IDLE);
    let (k, port) = (t.k, t.port);
    t.port.push_action(move || {
        assert_eq!(k.current(), Some(background));
        tick_n(k, port, 2);
    });
    t.k.sleep_until_deadline(Deadline::Ticks(2)).unwrap();
}

#[test]
fn higher_priority_spawn_preempts_immediately() {
    let t = TestKernel::new();
    let main = t.start();
    let before = t.k.context_switch_count();
    let high = t.spawn("high", Priority::HIGH);
    assert_eq!(t.current(), Some(high));
    assert_eq!(t.state(main), ThreadState::Ready);
    assert_eq!(t.k.context_switch_count(), before + 1);
}

#[test]
fn lower_priority_spawn_does_not_preempt() {
    let t = TestKernel::new();
    let main = t.start();
    let low = t.spawn("low", Priority::LOW);
    assert_eq!(t.current(), Some(main));
    assert_eq!(t.state(low), ThreadState::Ready);
}

#[test]
fn equal_priority_rotates_on_tick() {
    let t = TestKernel::new();
    let main = t.start();
    let peer = t.spawn("peer", Priority::NORMAL);
    assert_eq!(t.current(), Some(main));
    t.run_ticks(1);
    assert_eq!(t.current(), Some(peer));
    t.run_ticks(1);
    assert_eq!(t.current(), Some(main));
}

#[test]
fn yield_rotates_within_one_priority() {
    let t = TestKernel::new();
    let main = t.start();
    let peer = t.spawn("peer", Priority::NORMAL);
    t.k.yield_now();
    assert_eq!(t.current(), Some(peer));
    t.k.yield_now();
    assert_eq!(t.current(), Some(main));
}

#[test]
fn sleep_expires_on_the_right_tick() {
    let t = TestKernel::new();
    t.start();
    let (k, port) = (t.k, t.port);
    t.port.push_action(move || tick_n(k, port, 3));
    let before = t.k.now();
    t.k.sleep_until_deadline(Deadline::Ticks(3)).unwrap();
    assert_eq!(t.k.now() - before, 3);
}

#[test]
fn zero_sleep_returns_without_blocking() {
    let t = TestKernel::new();
    t.start();
    t.k.sleep_until_deadline(Deadline::Ticks(0)).unwrap();
    // Absolute deadline already in the past behaves the same.
    t.k.sleep_until_deadline(Deadline::At(0)).unwrap();
}

#[test]
fn join_returns_the_exit_code_and_reaps() {
    let t = TestKernel::new();
    t.start();
    let worker = t.spawn("worker", Priority::NORMAL);
    let k = t.k;
    t.port.push_action(move || {
        // Runs as the worker once the joiner blocks.
        k.thread_exit(7);
    });
    assert_eq!(t.k.thread_join(worker), Ok(7));
    // The record is gone after the join.
    assert!(t.k.thread_stats(worker).is_err());
}

#[test]
fn join_of_terminated_thread_returns_immediately() {
    let t = TestKernel::new();
    t.start();
    let worker = t.spawn("worker", Priority::NORMAL);
    t.k.thread_terminate(worker, 3).unwrap();
    assert_eq!(t.k.thread_join(worker), Ok(3));
}

#[test]
fn join_self_would_deadlock() {
    let t = TestKernel::new();
    let main = t.start();
    assert_eq!(t.k.thread_join(main), Err(Errno::WouldDeadlock));
}

#[test]
fn detached_thread_cannot_be_joined_and_reaps_itself() {
    let t = TestKernel::new();
    t.start();
    let worker = t.spawn("worker", Priority::NORMAL);
    t.k.thread_detach(worker).unwrap();
    assert_eq!(t.k.thread_join(worker), Err(Errno::InvalidState));
    t.k.thread_terminate(worker, 0).unwrap();
    assert!(t.k.thread_stats(worker).is_err());
}

#[test]
fn interrupt_unblocks_a_waiter() {
    let t = TestKernel::new();
    let main = t.start();
    let sem = t.k.sem_create("s", 0, 1).unwrap();
    let k = t.k;
    t.port.push_action(move || {
        // Runs once main is blocked on the semaphore.
        k.thread_interrupt(main).unwrap();
    });
    assert_eq!(t.k.sem_wait(sem, Deadline::Never), Err(Errno::Interrupted));
}

#[test]
fn interrupt_of_a_running_thread_is_consumed_at_the_next_block() {
    let t = TestKernel::new();
    let main = t.start();
    let sem = t.k.sem_create("s", 0, 1).unwrap();
    t.k.thread_interrupt(main).unwrap();
    // A try call is not a suspension point and leaves the flag armed.
    assert_eq!(t.k.sem_wait(sem, Deadline::Poll), Err(Errno::WouldBlock));
    assert_eq!(t.k.sem_wait(sem, Deadline::Never), Err(Errno::Interrupted));
    // Delivered exactly once.
    let (k, port) = (t.k, t.port);
    t.port.push_action(move || {
        port.enter_isr();
        k.sem_post(sem).unwrap();
        port.exit_isr();
    });
    assert_eq!(t.k.sem_wait(sem, Deadline::Never), Ok(()));
}

#[test]
fn suspend_and_resume_a_ready_thread() {
    let t = TestKernel::new();
    t.start();
    let worker = t.spawn("worker", Priority::NORMAL);
    t.k.thread_suspend(worker).unwrap();
    assert_eq!(t.state(worker), ThreadState::Suspended);
    t.k.thread_resume(worker).unwrap();
    assert_eq!(t.state(worker), ThreadState::Ready);
    assert_eq!(
        t.k.thread_resume(worker),
        Err(Errno::InvalidState),
        "resume of a non-suspended thread is refused"
    );
}

#[test]
fn suspend_self_parks_until_resumed() {
    let t = TestKernel::new();
    let main = t.start();
    let helper = t.spawn("helper", Priority::NORMAL);
    let k = t.k;
    t.port.push_action(move || {
        // Runs as the helper while main sits suspended.
        k.thread_resume(main).unwrap();
    });
    t.k.thread_suspend(main).unwrap();
    assert_eq!(t.state(main), ThreadState::Running);
    assert_eq!(t.state(helper), ThreadState::Ready);
}

#[test]
fn suspending_a_blocked_thread_is_refused() {
    let t = TestKernel::new();
    t.start();
    let worker = t.spawn("worker", Priority::NORMAL);
    let sem = t.k.sem_create("s", 0, 1).unwrap();
    t.k.test_set_current(worker);
    let k = t.k;
    t.port.push_action(move || {
        assert_eq!(k.thread_suspend(worker), Err(Errno::InvalidState));
        k.thread_interrupt(worker).unwrap();
    });
    assert_eq!(t.k.sem_wait(sem, Deadline::Never), Err(Errno::Interrupted));
}

#[test]
fn set_priority_repositions_and_preempts() {
    let t = TestKernel::new();
    let main = t.start();
    let worker = t.spawn("worker", Priority::LOW);
    t.k.thread_set_priority(worker, Priority::HIGH).unwrap();
    assert_eq!(t.current(), Some(worker));
    assert_eq!(t.effective(worker), Priority::HIGH);
    assert_eq!(t.state(main), ThreadState::Ready);
}

#[test]
fn disabled_preemption_defers_the_switch() {
    let t = TestKernel::new();
    let main = t.start();
    t.k.set_preemptive(false);
    let high = t.spawn("high", Priority::HIGH);
    assert_eq!(t.current(), Some(main), "wakeup only marked");
    t.k.set_preemptive(true);
    assert_eq!(t.current(), Some(high), "deferred switch happens on enable");
}

#[test]
fn scheduler_lock_defers_the_switch() {
    let t = TestKernel::new();
    let main = t.start();
    t.k.sched_lock();
    let high = t.spawn("high", Priority::HIGH);
    assert_eq!(t.current(), Some(main));
    // Even an explicit switch request is refused while locked.
    assert!(t.k.switch_context().is_none());
    t.k.sched_unlock();
    assert_eq!(t.current(), Some(high));
}

#[test]
fn run_ticks_accumulate_on_the_running_thread() {
    let t = TestKernel::new();
    let main = t.start();
    let before = t.k.thread_stats(main).unwrap().run_ticks;
    // Main has no equal-priority peer, so it keeps running.
    t.run_ticks(5);
    assert_eq!(t.k.thread_stats(main).unwrap().run_ticks, before + 5);
}

#[test]
fn thread_flags_wake_their_owner_only() {
    let t = TestKernel::new();
    let main = t.start();
    // Immediate path.
    t.k.thread_flags_raise(main, 0b01).unwrap();
    assert_eq!(
        t.k.thread_flags_wait(0b01, FlagsMode::ANY | FlagsMode::CLEAR, Deadline::Never),
        Ok(0b01)
    );
    assert_eq!(t.k.thread_flags_get(0b01, false), Ok(0));

    // Blocking path, raised from interrupt context.
    let (k, port) = (t.k, t.port);
    t.port.push_action(move || {
        port.enter_isr();
        k.thread_flags_raise(main, 0b10).unwrap();
        port.exit_isr();
    });
    assert_eq!(
        t.k.thread_flags_wait(0b10, FlagsMode::ANY, Deadline::Never),
        Ok(0b10)
    );
}

#[test]
fn user_storage_round_trips() {
    let t = TestKernel::new();
    t.start();
    t.k.user_storage_set(0xdead).unwrap();
    assert_eq!(t.k.user_storage_get(), Ok(0xdead));
}

#[test]
fn terminated_thread_releases_waiting_joiners_before_reap() {
    let t = TestKernel::new();
    t.start();
    let worker = t.spawn("worker", Priority::NORMAL);
    let k = t.k;
    t.port.push_action(move || {
        k.thread_terminate(worker, 42).unwrap();
    });
    assert_eq!(t.k.thread_join(worker), Ok(42));
}
