/*
 * Kernel Result Codes
 *
 * Every fallible kernel operation reports one of the codes below. There is
 * no global error state: codes travel through return values only. Contract
 * violations (null handles, blocking calls from interrupt context,
 * unbalanced critical sections) do not produce a code - they go through
 * the assertion path and abort.
 */

use core::fmt;

/// Kernel error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Errno {
    /// A timed operation reached its deadline before completing.
    Timeout,
    /// A try-variant would have had to block.
    WouldBlock,
    /// The blocked thread was interrupted with `Thread::interrupt`.
    Interrupted,
    /// An argument is out of range or malformed.
    InvalidArgument,
    /// The object is not in a state that allows the operation.
    InvalidState,
    /// Allocation through the active memory resource failed.
    NoMemory,
    /// Acquiring would deadlock the caller (error-check mutex).
    WouldDeadlock,
    /// The previous owner of a robust mutex terminated while holding it.
    OwnerDead,
    /// A robust mutex was left inconsistent and can no longer be acquired.
    NotRecoverable,
    /// A counter or queue reached its configured maximum.
    Overflow,
    /// The caller does not own the object it tried to release.
    NotOwner,
    /// The object was destroyed while the caller was waiting on it.
    Destroyed,
}

impl Errno {
    /// Stable negative code for the C facade.
    pub fn as_code(self) -> i32 {
        match self {
            Errno::Timeout => -1,
            Errno::WouldBlock => -2,
            Errno::Interrupted => -3,
            Errno::InvalidArgument => -4,
            Errno::InvalidState => -5,
            Errno::NoMemory => -6,
            Errno::WouldDeadlock => -7,
            Errno::OwnerDead => -8,
            Errno::NotRecoverable => -9,
            Errno::Overflow => -10,
            Errno::NotOwner => -11,
            Errno::Destroyed => -12,
        }
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Errno::Timeout => write!(f, "deadline expired"),
            Errno::WouldBlock => write!(f, "operation would block"),
            Errno::Interrupted => write!(f, "wait interrupted"),
            Errno::InvalidArgument => write!(f, "invalid argument"),
            Errno::InvalidState => write!(f, "invalid state"),
            Errno::NoMemory => write!(f, "out of memory"),
            Errno::WouldDeadlock => write!(f, "would deadlock"),
            Errno::OwnerDead => write!(f, "previous owner died"),
            Errno::NotRecoverable => write!(f, "mutex not recoverable"),
            Errno::Overflow => write!(f, "counter overflow"),
            Errno::NotOwner => write!(f, "caller is not the owner"),
            Errno::Destroyed => write!(f, "object destroyed while waiting"),
        }
    }
}

/// Shorthand used by every kernel module.
pub type Result<T> = core::result::Result<T, Errno>;

/// Assertion path for programming contract violations.
///
/// Prints the failed expression with its location and, when available, the
/// current thread, then panics. Deliberately loud: in an embedded kernel a
/// silent inconsistency is the worst possible outcome.
#[macro_export]
macro_rules! kassert {
    ($cond:expr) => {
        if !$cond {
            $crate::errno::assert_failed(stringify!($cond), file!(), line!());
        }
    };
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            ::log::error!($($arg)+);
            $crate::errno::assert_failed(stringify!($cond), file!(), line!());
        }
    };
}

#[doc(hidden)]
pub fn assert_failed(expr: &str, file: &str, line: u32) -> ! {
    match crate::sched::current_thread_name() {
        Some((id, name)) => {
            log::error!(
                "kernel assertion '{}' failed at {}:{} in thread {} '{}'",
                expr,
                file,
                line,
                id.0,
                name.as_str()
            );
        }
        None => {
            log::error!("kernel assertion '{}' failed at {}:{}", expr, file, line);
        }
    }
    panic!("kernel assertion failed: {expr}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_unique_and_negative() {
        let all = [
            Errno::Timeout,
            Errno::WouldBlock,
            Errno::Interrupted,
            Errno::InvalidArgument,
            Errno::InvalidState,
            Errno::NoMemory,
            Errno::WouldDeadlock,
            Errno::OwnerDead,
            Errno::NotRecoverable,
            Errno::Overflow,
            Errno::NotOwner,
            Errno::Destroyed,
        ];
        for (i, a) in all.iter().enumerate() {
            assert!(a.as_code() < 0);
            for b in &all[i + 1..] {
                assert_ne!(a.as_code(), b.as_code());
            }
        }
    }
}
