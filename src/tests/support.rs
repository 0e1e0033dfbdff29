/*
 * Hosted Test Harness
 *
 * A scripted port: the switch exception is simulated synchronously, and
 * "the rest of the system" (other threads, ISRs, the passage of time)
 * runs as queued actions. Whenever the kernel requests a context
 * switch, the port performs the bookkeeping, pops one action and runs
 * it, then performs the bookkeeping again. A blocked wait therefore
 * consumes exactly one action per park, which the scenario tests use to
 * count blocking events.
 */

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use spin::{Mutex, Once};

use crate::config::Config;
use crate::port::{ContextRef, IrqState, Port};
use crate::sched::thread::{Priority, ThreadId, ThreadState};
use crate::sched::Kernel;

type Action = Box<dyn FnOnce() + Send>;

/// Consecutive empty-script switch requests tolerated before the
/// harness declares the test deadlocked.
const SCRIPT_DRY_LIMIT: usize = 64;

pub struct StubPort {
    kernel: Once<&'static Kernel>,
    script: Mutex<VecDeque<Action>>,
    isr_depth: AtomicUsize,
    irq_nest: AtomicUsize,
    dry_requests: AtomicUsize,
}

impl StubPort {
    pub fn new() -> Self {
        Self {
            kernel: Once::new(),
            script: Mutex::new(VecDeque::new()),
            isr_depth: AtomicUsize::new(0),
            irq_nest: AtomicUsize::new(0),
            dry_requests: AtomicUsize::new(0),
        }
    }

    pub fn attach(&self, kernel: &'static Kernel) {
        self.kernel.call_once(|| kernel);
    }

    fn kernel(&self) -> &'static Kernel {
        self.kernel.get().expect("port not attached")
    }

    /// Queue work that runs at the next switch request, in the context
    /// the scheduler then picks.
    pub fn push_action(&self, action: impl FnOnce() + Send + 'static) {
        self.script.lock().push_back(Box::new(action));
    }

    pub fn enter_isr(&self) {
        self.isr_depth.fetch_add(1, Ordering::SeqCst);
    }

    pub fn exit_isr(&self) {
        self.isr_depth.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Port for StubPort {
    fn irq_critical_enter(&self) -> IrqState {
        IrqState(self.irq_nest.fetch_add(1, Ordering::SeqCst))
    }

    fn irq_critical_exit(&self, _state: IrqState) {
        self.irq_nest.fetch_sub(1, Ordering::SeqCst);
    }

    fn in_isr(&self) -> bool {
        self.isr_depth.load(Ordering::SeqCst) > 0
    }

    fn context_create(
        &self,
        stack_base: *mut u8,
        _stack_size: usize,
        _entry: fn(usize),
        _arg: usize,
    ) -> ContextRef {
        stack_base as ContextRef
    }

    fn context_switch_request(&self) {
        let kernel = self.kernel();
        kernel.switch_context();
        let action = self.script.lock().pop_front();
        match action {
            Some(action) => {
                self.dry_requests.store(0, Ordering::SeqCst);
                action();
                kernel.switch_context();
            }
            None => {
                let dry = self.dry_requests.fetch_add(1, Ordering::SeqCst) + 1;
                assert!(
                    dry < SCRIPT_DRY_LIMIT,
                    "test script exhausted while the kernel keeps rescheduling"
                );
            }
        }
    }

    fn sleep_idle(&self) {}

    fn tick_source_start(&self, _hz: u32) {}
}

/// Deliver `n` tick interrupts against `kernel`; usable from inside
/// scripted actions, where the harness struct itself is out of reach.
pub fn tick_n(kernel: &'static Kernel, port: &'static StubPort, n: u64) {
    for _ in 0..n {
        port.enter_isr();
        let reschedule = kernel.tick();
        port.exit_isr();
        if reschedule {
            kernel.switch_context();
        }
    }
}

/// A private kernel instance wired to a scripted port.
pub struct TestKernel {
    pub k: &'static Kernel,
    pub port: &'static StubPort,
}

fn noop_entry(_arg: usize) {}

impl TestKernel {
    /// Default harness configuration: no timer service thread, so the
    /// suites fully control which thread the scheduler picks.
    pub fn config() -> Config {
        Config {
            timer_thread_enabled: false,
            ..Config::default()
        }
    }

    pub fn new() -> Self {
        Self::with_config(Self::config())
    }

    pub fn with_config(config: Config) -> Self {
        let port: &'static StubPort = Box::leak(Box::new(StubPort::new()));
        let kernel: &'static Kernel = Box::leak(Box::new(Kernel::new()));
        port.attach(kernel);
        kernel.init(config, port);
        Self {
            k: kernel,
            port,
        }
    }

    /// Start the scheduler; the test itself becomes the main thread.
    pub fn start(&self) -> ThreadId {
        self.k.start().expect("start failed")
    }

    pub fn spawn(&self, name: &str, priority: Priority) -> ThreadId {
        self.k
            .thread_create(name, priority, noop_entry, 0, None)
            .expect("spawn failed")
    }

    /// Deliver `n` tick interrupts, switching when the kernel asks.
    pub fn run_ticks(&self, n: u64) {
        for _ in 0..n {
            self.port.enter_isr();
            let reschedule = self.k.tick();
            self.port.exit_isr();
            if reschedule {
                self.k.switch_context();
            }
        }
    }

    pub fn state(&self, tid: ThreadId) -> ThreadState {
        self.k.thread_stats(tid).expect("no such thread").state
    }

    pub fn effective(&self, tid: ThreadId) -> Priority {
        self.k
            .thread_stats(tid)
            .expect("no such thread")
            .effective_priority
    }

    pub fn current(&self) -> Option<ThreadId> {
        self.k.current()
    }
}
