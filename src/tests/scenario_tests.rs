/*
 * Interleaving scenarios: priority preemption, the inheritance chain,
 * timed expiry, queue fill/drain, condvar broadcast and robust-mutex
 * recovery, plus wake-ordering checks. Each scenario drives a private
 * kernel through the scripted port; one queued action runs per blocking
 * event, in the context the scheduler picked.
 */

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::clock::Deadline;
use crate::errno::Errno;
use crate::sched::thread::{Priority, ThreadState};
use crate::sync::mutex::{MutexAttributes, MutexOptions};
use crate::tests::support::{TestKernel, tick_n};

/// Scenario: a low-priority thread runs, an ISR posts the semaphore a
/// high-priority thread waits on; the high thread takes over within one
/// context switch and the low one resumes only once it blocks again.
#[test]
fn isr_post_preempts_into_the_high_priority_waiter() {
    let t = TestKernel::new();
    let main = t.start();
    t.k.thread_set_priority(main, Priority::LOW).unwrap();
    let sem = t.k.sem_create("signal", 0, 1).unwrap();
    let high = t.spawn("high", Priority::HIGH);
    assert_eq!(t.current(), Some(high), "high preempts at spawn");

    let (k, port) = (t.k, t.port);
    t.port.push_action(move || {
        // The interrupt arrives while the low thread runs.
        assert_eq!(k.current(), Some(main));
        let before = k.context_switch_count();
        port.enter_isr();
        k.sem_post(sem).unwrap();
        port.exit_isr();
        // The wakeup is pended, not switched, inside the handler.
        assert_eq!(k.context_switch_count(), before);
    });

    // Runs as `high`: block, get woken by the scripted ISR.
    assert_eq!(t.k.sem_wait(sem, Deadline::Never), Ok(()));
    assert_eq!(t.current(), Some(high), "woken within one switch of the ISR");

    // When high blocks again, the low thread resumes.
    let k = t.k;
    t.port.push_action(move || {
        assert_eq!(k.current(), Some(main));
        k.thread_interrupt(high).unwrap();
    });
    let _ = t.k.sem_wait(sem, Deadline::Never);
}

/// Scenario: the transitive inheritance chain. T_low (2) holds m1,
/// T_mid (5) holds m2 and blocks on m1, T_high (9) blocks on m2; all
/// three run at 9 until the chain unwinds release by release.
#[test]
fn priority_inheritance_propagates_through_the_chain() {
    let t = TestKernel::new();
    t.start();
    let m1 = t.k.mutex_create("m1", MutexAttributes::default()).unwrap();
    let m2 = t.k.mutex_create("m2", MutexAttributes::default()).unwrap();
    let t_low = t.spawn("t-low", Priority(2));
    let t_mid = t.spawn("t-mid", Priority(5));
    let t_high = t.spawn("t-high", Priority(9));

    // T_low takes m1; T_mid takes m2.
    t.k.test_set_current(t_low);
    t.k.mutex_lock(m1, Deadline::Never).unwrap();
    t.k.test_set_current(t_mid);
    t.k.mutex_lock(m2, Deadline::Never).unwrap();

    let k = t.k;
    t.port.push_action(move || {
        // T_high contends on m2 while T_mid is blocked on m1: the boost
        // must flow m2 -> T_mid -> m1 -> T_low.
        k.test_set_current(t_high);
        let lock = k.mutex_lock(m2, Deadline::Never);
        // ...this returns only near the end of the scenario.
        assert_eq!(lock, Ok(()));
        k.test_set_current(t_high);
        assert_eq!(k.mutex_owner(m2), Ok(Some(t_high)));
        assert_eq!(k.thread_stats(t_high).unwrap().effective_priority, Priority(9));
        assert_eq!(k.thread_stats(t_mid).unwrap().effective_priority, Priority(5));
        assert_eq!(k.thread_stats(t_low).unwrap().effective_priority, Priority(2));
        k.mutex_unlock(m2).unwrap();
        k.thread_terminate(t_high, 0).unwrap();
    });
    t.port.push_action(move || {
        // Everyone is boosted to 9 now.
        assert_eq!(k.thread_stats(t_low).unwrap().effective_priority, Priority(9));
        assert_eq!(k.thread_stats(t_mid).unwrap().effective_priority, Priority(9));
        assert_eq!(k.thread_stats(t_high).unwrap().effective_priority, Priority(9));
        // T_low releases m1: ownership moves to T_mid, T_low drops
        // back. The release reschedules, so the next action runs before
        // the unlock call returns here.
        k.test_set_current(t_low);
        k.mutex_unlock(m1).unwrap();
    });
    t.port.push_action(move || {
        // Observed right after T_low's release: T_low is back at its
        // assigned priority, T_mid still carries T_high's boost.
        assert_eq!(k.thread_stats(t_low).unwrap().effective_priority, Priority(2));
        assert_eq!(k.thread_stats(t_mid).unwrap().effective_priority, Priority(9));
        // T_mid releases m2: T_high takes it, T_mid drops to assigned.
        k.test_set_current(t_mid);
        k.mutex_unlock(m2).unwrap();
        assert_eq!(k.thread_stats(t_mid).unwrap().effective_priority, Priority(5));
    });

    // Runs as T_mid: block on m1, carried through the whole scenario.
    t.k.test_set_current(t_mid);
    assert_eq!(t.k.mutex_lock(m1, Deadline::Never), Ok(()));
    assert_eq!(t.k.mutex_owner(m1), Ok(Some(t_mid)));
    t.k.test_set_current(t_mid);
    t.k.mutex_unlock(m1).unwrap();
}

/// Scenario: a timed wait with no post expires at or after its deadline
/// with the semaphore untouched.
#[test]
fn timed_wait_expires_without_a_post() {
    let t = TestKernel::new();
    let main = t.start();
    let sem = t.k.sem_create("s", 0, 1).unwrap();
    let (k, port) = (t.k, t.port);
    t.port.push_action(move || tick_n(k, port, 120));

    let before = t.k.now();
    assert_eq!(t.k.sem_wait(sem, Deadline::Ticks(100)), Err(Errno::Timeout));
    assert!(t.k.now() >= before + 100, "timeout fires no earlier than the deadline");
    assert_eq!(t.k.sem_value(sem), Ok(0));
    assert_eq!(t.state(main), ThreadState::Running);
}

/// A post racing the deadline wins when it lands first.
#[test]
fn timed_wait_completes_before_the_deadline() {
    let t = TestKernel::new();
    t.start();
    let sem = t.k.sem_create("s", 0, 1).unwrap();
    let (k, port) = (t.k, t.port);
    t.port.push_action(move || {
        tick_n(k, port, 10);
        port.enter_isr();
        k.sem_post(sem).unwrap();
        port.exit_isr();
    });
    let before = t.k.now();
    assert_eq!(t.k.sem_wait(sem, Deadline::Ticks(100)), Ok(()));
    assert!(t.k.now() - before <= 100);
}

/// Scenario: capacity-4 queue, ten messages through it, one sender and
/// one receiver. The receiver sees them in order and the sender blocks
/// exactly six times.
#[test]
fn mqueue_fill_and_drain_counts_sender_blocks() {
    let t = TestKernel::new();
    t.start();
    let mq = t.k.mq_create("q", 4, 1).unwrap();
    let receiver = t.spawn("receiver", Priority::NORMAL);
    let received: Arc<StdMutex<Vec<u8>>> = Arc::new(StdMutex::new(Vec::new()));

    // One action per sender block: the receiver drains one message.
    let k = t.k;
    for _ in 0..6 {
        let received = Arc::clone(&received);
        t.port.push_action(move || {
            k.test_set_current(receiver);
            let mut buf = [0u8; 1];
            let (len, _) = k.mq_receive(mq, &mut buf, Deadline::Poll).unwrap();
            assert_eq!(len, 1);
            received.lock().unwrap().push(buf[0]);
        });
    }

    for byte in b'0'..=b'9' {
        t.k.mq_send(mq, &[byte], 0, Deadline::Never).unwrap();
    }
    // Exactly the six drain actions were consumed.
    assert_eq!(received.lock().unwrap().len(), 6);

    // Drain the remaining four directly.
    t.k.test_set_current(receiver);
    let mut buf = [0u8; 1];
    while let Ok((_, _)) = t.k.mq_receive(mq, &mut buf, Deadline::Poll) {
        received.lock().unwrap().push(buf[0]);
    }
    assert_eq!(&*received.lock().unwrap(), b"0123456789");
}

/// Scenario: five waiters on a condition variable; a sixth thread sets
/// the predicate under the mutex and broadcasts. Every waiter observes
/// the predicate while holding the mutex, one at a time.
#[test]
fn condvar_broadcast_releases_every_waiter() {
    let t = TestKernel::new();
    let main = t.start();
    let guard = t.k.mutex_create("guard", MutexAttributes::default()).unwrap();
    let cv = t.k.cv_create("cv").unwrap();
    let predicate = Arc::new(AtomicBool::new(false));
    let observed: Arc<StdMutex<Vec<usize>>> = Arc::new(StdMutex::new(Vec::new()));

    // Waiter priorities ascend with nesting depth: after the broadcast
    // the scheduler picks the deepest-parked waiter first, which is
    // also the next call frame to resume.
    let waiters: Vec<_> = (0..5)
        .map(|i| t.spawn("waiter", Priority((16 + i) as u8)))
        .collect();

    let k = t.k;
    // Four actions park the remaining waiters; the last one sets the
    // predicate and broadcasts under the scheduler lock.
    for &w in &waiters[1..] {
        let predicate = Arc::clone(&predicate);
        let observed = Arc::clone(&observed);
        t.port.push_action(move || {
            k.test_set_current(w);
            k.mutex_lock(guard, Deadline::Never).unwrap();
            while !predicate.load(Ordering::SeqCst) {
                k.cv_wait(cv, guard, Deadline::Never).unwrap();
            }
            assert_eq!(k.mutex_owner(guard), Ok(Some(w)), "woken waiter holds the mutex");
            observed.lock().unwrap().push(w.0);
            k.mutex_unlock(guard).unwrap();
            k.thread_exit(0);
        });
    }
    {
        let predicate = Arc::clone(&predicate);
        t.port.push_action(move || {
            k.test_set_current(main);
            k.mutex_lock(guard, Deadline::Never).unwrap();
            predicate.store(true, Ordering::SeqCst);
            // Defer the switch until the mutex is out of our hands.
            k.sched_lock();
            k.cv_wake(cv, true).unwrap();
            k.mutex_unlock(guard).unwrap();
            k.sched_unlock();
        });
    }

    // The first waiter runs on the test stack.
    let w0 = waiters[0];
    t.k.test_set_current(w0);
    t.k.mutex_lock(guard, Deadline::Never).unwrap();
    while !predicate.load(Ordering::SeqCst) {
        t.k.cv_wait(cv, guard, Deadline::Never).unwrap();
    }
    assert_eq!(t.k.mutex_owner(guard), Ok(Some(w0)));
    observed.lock().unwrap().push(w0.0);
    t.k.mutex_unlock(guard).unwrap();

    assert_eq!(observed.lock().unwrap().len(), 5, "all five observed the predicate");
}

/// Scenario: robust mutex recovery after its owner dies, both with and
/// without the `consistent` handshake.
#[test]
fn robust_mutex_owner_death_recovery() {
    let t = TestKernel::new();
    let main = t.start();
    let attrs = MutexAttributes {
        options: MutexOptions::ROBUST,
        ..MutexAttributes::default()
    };
    let m = t.k.mutex_create("robust", attrs).unwrap();

    let t1 = t.spawn("t1", Priority::NORMAL);
    t.k.test_set_current(t1);
    t.k.mutex_lock(m, Deadline::Never).unwrap();
    t.k.test_set_current(main);
    t.k.thread_terminate(t1, 0).unwrap();

    // T2 learns of the death but owns the mutex.
    assert_eq!(t.k.mutex_lock(m, Deadline::Never), Err(Errno::OwnerDead));
    assert_eq!(t.k.mutex_owner(m), Ok(Some(main)));
    t.k.mutex_consistent(m).unwrap();
    t.k.mutex_unlock(m).unwrap();

    // After the handshake the mutex is ordinary again.
    assert_eq!(t.k.mutex_lock(m, Deadline::Never), Ok(()));
    t.k.mutex_unlock(m).unwrap();
}

#[test]
fn robust_mutex_without_consistent_poisons() {
    let t = TestKernel::new();
    let main = t.start();
    let attrs = MutexAttributes {
        options: MutexOptions::ROBUST,
        ..MutexAttributes::default()
    };
    let m = t.k.mutex_create("robust", attrs).unwrap();

    let t1 = t.spawn("t1", Priority::NORMAL);
    t.k.test_set_current(t1);
    t.k.mutex_lock(m, Deadline::Never).unwrap();
    t.k.test_set_current(main);
    t.k.thread_terminate(t1, 0).unwrap();

    assert_eq!(t.k.mutex_lock(m, Deadline::Never), Err(Errno::OwnerDead));
    // Unlocking without `consistent` poisons the record for good.
    t.k.mutex_unlock(m).unwrap();
    assert_eq!(t.k.mutex_lock(m, Deadline::Never), Err(Errno::NotRecoverable));
}

/// Wake ordering: of two queued semaphore waiters, one post releases
/// the higher-priority one and leaves the lower one blocked.
#[test]
fn single_post_wakes_the_highest_priority_waiter() {
    let t = TestKernel::new();
    let main = t.start();
    let sem = t.k.sem_create("s", 0, 2).unwrap();
    let w_low = t.spawn("w-low", Priority::LOW);
    let w_high = t.spawn("w-high", Priority::HIGH);

    let k = t.k;
    t.port.push_action(move || {
        // Runs once w_low is parked; park the high-priority waiter too.
        k.test_set_current(w_high);
        assert_eq!(k.sem_wait(sem, Deadline::Never), Ok(()));
        // Reached only after the post below: the high waiter won.
        k.test_set_current(w_high);
        assert_eq!(
            k.thread_stats(w_low).unwrap().state,
            ThreadState::Blocked,
            "single post must not wake the low-priority waiter"
        );
        k.sem_post(sem).unwrap();
        k.thread_exit(0);
    });
    t.port.push_action(move || {
        k.test_set_current(main);
        k.sem_post(sem).unwrap();
    });

    // Runs as w_low: parks first, woken by the second post issued by
    // the already-released high waiter.
    t.k.test_set_current(w_low);
    assert_eq!(t.k.sem_wait(sem, Deadline::Never), Ok(()));
}
