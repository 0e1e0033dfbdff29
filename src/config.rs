/*
 * Kernel Configuration
 *
 * Runtime configuration captured once at `init` and never changed
 * afterwards. Defaults match the common small-MCU setup: 1 kHz tick,
 * preemptive scheduling, modest stacks.
 */

/// Number of scheduling priority levels. Level 0 is reserved for the
/// idle thread when it runs below the idle level, the top level for
/// interrupt-origin work.
pub const PRIORITY_LEVELS: usize = 32;

/// Maximum stored length of a kernel object name; longer names are
/// truncated, never rejected.
pub const NAME_LEN: usize = 16;

#[derive(Debug, Clone)]
pub struct Config {
    /// Tick rate handed to the port's tick source.
    pub systick_frequency_hz: u32,

    /// Initial state of the preemption flag.
    pub scheduler_preemptive: bool,

    /// Stack size for threads created without an explicit stack buffer.
    pub default_stack_size: usize,

    /// Stack sizes for the service threads created at `start`.
    pub main_stack_size: usize,
    pub idle_stack_size: usize,
    pub timer_stack_size: usize,

    /// Install the null memory resource as the RTOS default; every dynamic
    /// allocation made by the kernel then traps.
    pub exclude_dynamic_memory: bool,

    /// When non-zero, carve a private first-fit arena of this many bytes
    /// for RTOS objects instead of sharing the application resource.
    pub rtos_memory_size: usize,

    /// Message length field is `u16` (messages up to 65535 bytes) instead
    /// of the default `u8` (up to 255 bytes).
    pub message_queue_size_16bit: bool,

    /// Run the idle thread one level below `Priority::IDLE` so that
    /// application threads at the idle level still preempt it.
    pub idle_priority_below_idle: bool,

    /// Per-thread run-tick accumulation.
    pub statistics_thread_cpu: bool,

    /// Per-thread and global context-switch counters.
    pub statistics_context_switches: bool,

    /// Bound on transitive priority-inheritance propagation through a
    /// chain of blocked mutex owners.
    pub inheritance_chain_limit: usize,

    /// Create the timer service thread at `start`. Without it, timers
    /// with thread-context dispatch never fire.
    pub timer_thread_enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            systick_frequency_hz: 1000,
            scheduler_preemptive: true,
            default_stack_size: 2048,
            main_stack_size: 4096,
            idle_stack_size: 1024,
            timer_stack_size: 2048,
            exclude_dynamic_memory: false,
            rtos_memory_size: 0,
            message_queue_size_16bit: false,
            idle_priority_below_idle: false,
            statistics_thread_cpu: true,
            statistics_context_switches: true,
            inheritance_chain_limit: 8,
            timer_thread_enabled: true,
        }
    }
}

impl Config {
    /// Largest payload a message queue accepts under this configuration.
    pub fn max_message_size(&self) -> usize {
        if self.message_queue_size_16bit {
            u16::MAX as usize
        } else {
            u8::MAX as usize
        }
    }
}
